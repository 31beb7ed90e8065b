//! Generic scanning engine. A [Lexer] owns no grammar of its own:
//! callers register fixed lexemes with [Lexer::add_token] (matched
//! longest-first through a lookup table), scanning closures with
//! [Lexer::add_lexer] for anything shaped (numbers, names, strings),
//! and skippers with [Lexer::add_ignorer] (whitespace, comments).
//! [Lexer::lex] then streams labeled source slices.

use super::token::Token;
use crate::FastHashMap;
use std::borrow::Cow;

type SubLexer<Label> = Box<dyn Fn(&Lexer<Label>, &str, usize) -> Option<(Label, usize)>>;
type Ignorer = Box<dyn Fn(&str, usize) -> usize>;

/// A scanning failure, positioned by byte offset into the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub offset: usize,
    pub message: String,
}

impl LexError {
    fn new(offset: usize, message: impl Into<String>) -> LexError {
        LexError {
            offset,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub struct Lexer<Label> {
    lexers: Vec<SubLexer<Label>>,
    ignorers: Vec<Ignorer>,
    token_lexer: SubLexer<Label>,
    tokens: FastHashMap<Cow<'static, str>, Label>,
    longest_token: usize,
}

impl<Label: Copy> Default for Lexer<Label> {
    fn default() -> Self {
        Self {
            lexers: Vec::new(),
            ignorers: Vec::new(),
            token_lexer: Box::new(|lexer, source, start| Self::lex_token(lexer, source, start)),
            tokens: Default::default(),
            longest_token: 0,
        }
    }
}

impl<Label: Copy> Lexer<Label> {
    /// Takes the source and a start index, returns the length to skip.
    pub fn add_ignorer<F>(&mut self, ignorer: F)
    where
        F: 'static + Fn(&str, usize) -> usize,
    {
        self.ignorers.push(Box::new(ignorer));
    }

    /// Takes the source and a start index, returns the label and length
    /// of the matched token.
    pub fn add_lexer<F>(&mut self, lexer: F)
    where
        F: 'static + Fn(&Lexer<Label>, &str, usize) -> Option<(Label, usize)>,
    {
        self.lexers.push(Box::new(lexer));
    }

    /// Registers a fixed lexeme. Lowest priority: tried after every
    /// registered lexer, longest spelling first.
    pub fn add_token(&mut self, label: Label, value: Cow<'static, str>) {
        self.longest_token = self.longest_token.max(value.len());
        self.tokens.insert(value, label);
    }

    fn lex_token(&self, source: &str, start: usize) -> Option<(Label, usize)> {
        let max_test_len = self.longest_token.min(source.len() - start);
        for len in (1..=max_test_len).rev() {
            if let Some(slice) = source.get(start..start + len) {
                if let Some(label) = self.tokens.get(slice) {
                    return Some((*label, len));
                }
            }
        }

        None
    }

    pub fn lex<'lexer: 'iter, 'source: 'iter, 'iter>(
        &'lexer self,
        source: &'source str,
    ) -> impl Iterator<Item = Result<Token<'source, Label>, LexError>> + 'iter {
        let mut skip = 0;

        std::iter::from_fn(move || loop {
            if skip >= source.len() {
                return None;
            }

            let length = self
                .ignorers
                .iter()
                .map(|ignorer| ignorer(source, skip))
                .find(|length| *length > 0);

            if let Some(length) = length {
                if length + skip > source.len() {
                    return Some(Err(LexError::new(
                        skip,
                        "ignored span extends past the end of the source",
                    )));
                }

                skip += length;
                continue;
            }

            let lexer_result = self
                .lexers
                .iter()
                .chain(std::iter::once(&self.token_lexer))
                .flat_map(|sub_lexer| sub_lexer(self, source, skip))
                .next();

            if let Some((label, length)) = lexer_result {
                if length == 0 || length + skip > source.len() {
                    return Some(Err(LexError::new(
                        skip,
                        "token extends past the end of the source",
                    )));
                }

                let offset = skip;
                skip += length;

                return Some(Ok(Token {
                    label,
                    content: &source[offset..offset + length],
                    offset,
                }));
            }

            let found = source[skip..].chars().next().unwrap_or('\0');
            return Some(Err(LexError::new(
                skip,
                format!("unexpected symbol near '{}'", found.escape_default()),
            )));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_tokens_and_lexers() {
        let mut lexer = Lexer::default();

        let lexemes = ["<", "<=", ">", ">=", "=="];

        for lexeme in lexemes {
            lexer.add_token(lexeme, lexeme.into());
        }

        // numbers
        lexer.add_lexer(|_, source, start| {
            let len = source[start..]
                .bytes()
                .take_while(|b| b.is_ascii_digit())
                .count();

            if len == 0 {
                return None;
            }

            Some(("number", len))
        });

        // whitespace
        lexer.add_ignorer(|source, start| {
            source[start..]
                .bytes()
                .take_while(|b| b.is_ascii_whitespace())
                .count()
        });

        assert_eq!(
            &lexer
                .lex("12 >= 3")
                .collect::<Result<Vec<_>, LexError>>()
                .unwrap(),
            &[
                Token {
                    label: "number",
                    content: "12",
                    offset: 0
                },
                Token {
                    label: ">=",
                    content: ">=",
                    offset: 3
                },
                Token {
                    label: "number",
                    content: "3",
                    offset: 6
                }
            ]
        );
    }

    #[test]
    fn longest_spelling_wins() {
        let mut lexer = Lexer::default();
        lexer.add_token("lt", "<".into());
        lexer.add_token("le", "<=".into());

        let tokens = lexer
            .lex("<=<")
            .collect::<Result<Vec<_>, LexError>>()
            .unwrap();
        assert_eq!(tokens[0].label, "le");
        assert_eq!(tokens[1].label, "lt");
    }

    #[test]
    fn bad_lexer_lengths_are_reported() {
        let mut lexer = Lexer::default();

        lexer.add_lexer(|_, _source, _start| Some(("faulty", 1000)));

        let err = lexer
            .lex("12 >= 3")
            .collect::<Result<Vec<_>, LexError>>()
            .unwrap_err();
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn unregistered_input_errors() {
        let lexer: Lexer<&'static str> = Lexer::default();
        let err = lexer
            .lex("?")
            .collect::<Result<Vec<_>, LexError>>()
            .unwrap_err();
        assert!(err.message.contains("unexpected symbol"));
    }
}
