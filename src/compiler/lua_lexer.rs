//! Lua 5.1 registration over the generic [Lexer] engine: the token
//! table carries every fixed lexeme, and scanning closures handle
//! numerals, names, strings and long brackets. Tokens stay raw source
//! slices; the parser decodes literal contents.

use super::lexer::Lexer;
use super::token::Token;
use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TokenLabel {
    And,
    Break,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,
    CmpEqual,
    CmpNotEqual,
    CmpLessThanEqual,
    CmpGreaterThanEqual,
    CmpLessThan,
    CmpGreaterThan,
    Assign,
    OpenParen,
    CloseParen,
    OpenCurly,
    CloseCurly,
    OpenBracket,
    CloseBracket,
    SemiColon,
    Colon,
    Comma,
    Dot,
    DoubleDot,
    TripleDot,

    Numeral,
    StringLiteral,
    Name,

    /// Synthesized past the last token; never produced by the lexer.
    Eof,
}

impl TokenLabel {
    /// Rendering used in "x expected near y" diagnostics.
    pub fn describe(self, content: &str) -> String {
        match self {
            TokenLabel::Numeral => format!("number '{content}'"),
            TokenLabel::StringLiteral => "string".to_string(),
            TokenLabel::Name => format!("'{content}'"),
            TokenLabel::Eof => "<eof>".to_string(),
            _ => format!("'{content}'"),
        }
    }
}

pub type LuaToken<'source> = Token<'source, TokenLabel>;

pub struct LuaLexer {
    lexer: Lexer<TokenLabel>,
}

impl Default for LuaLexer {
    fn default() -> Self {
        let reserved_words = HashMap::from([
            ("and", TokenLabel::And),
            ("break", TokenLabel::Break),
            ("do", TokenLabel::Do),
            ("else", TokenLabel::Else),
            ("elseif", TokenLabel::ElseIf),
            ("end", TokenLabel::End),
            ("false", TokenLabel::False),
            ("for", TokenLabel::For),
            ("function", TokenLabel::Function),
            ("if", TokenLabel::If),
            ("in", TokenLabel::In),
            ("local", TokenLabel::Local),
            ("nil", TokenLabel::Nil),
            ("not", TokenLabel::Not),
            ("or", TokenLabel::Or),
            ("repeat", TokenLabel::Repeat),
            ("return", TokenLabel::Return),
            ("then", TokenLabel::Then),
            ("true", TokenLabel::True),
            ("until", TokenLabel::Until),
            ("while", TokenLabel::While),
        ]);

        let other_tokens = [
            ("+", TokenLabel::Plus),
            ("-", TokenLabel::Minus),
            ("*", TokenLabel::Star),
            ("/", TokenLabel::Slash),
            ("%", TokenLabel::Percent),
            ("^", TokenLabel::Caret),
            ("#", TokenLabel::Hash),
            ("==", TokenLabel::CmpEqual),
            ("~=", TokenLabel::CmpNotEqual),
            ("<=", TokenLabel::CmpLessThanEqual),
            (">=", TokenLabel::CmpGreaterThanEqual),
            ("<", TokenLabel::CmpLessThan),
            (">", TokenLabel::CmpGreaterThan),
            ("=", TokenLabel::Assign),
            ("(", TokenLabel::OpenParen),
            (")", TokenLabel::CloseParen),
            ("{", TokenLabel::OpenCurly),
            ("}", TokenLabel::CloseCurly),
            ("[", TokenLabel::OpenBracket),
            ("]", TokenLabel::CloseBracket),
            (";", TokenLabel::SemiColon),
            (":", TokenLabel::Colon),
            (",", TokenLabel::Comma),
            (".", TokenLabel::Dot),
            ("..", TokenLabel::DoubleDot),
            ("...", TokenLabel::TripleDot),
        ];

        let mut lexer = Lexer::default();

        for (token, label) in other_tokens {
            lexer.add_token(label, token.into());
        }

        // numerals; validation happens when the parser converts them
        lexer.add_lexer(|_, source, start| {
            let bytes = source.as_bytes();

            let valid_start = bytes[start].is_ascii_digit()
                || (bytes[start] == b'.'
                    && bytes.get(start + 1).is_some_and(|b| b.is_ascii_digit()));

            if !valid_start {
                return None;
            }

            let mut last_byte = b' ';
            let mut len = 0;

            while let Some(&b) = bytes.get(start + len) {
                let keep = match b {
                    b'.' => true,
                    b'-' | b'+' => matches!(last_byte, b'e' | b'E' | b'p' | b'P'),
                    _ => b.is_ascii_alphanumeric(),
                };
                if !keep {
                    break;
                }
                last_byte = b;
                len += 1;
            }

            Some((TokenLabel::Numeral, len))
        });

        // reserved words and names
        lexer.add_lexer(move |_, source, start| {
            let bytes = source.as_bytes();
            let first = bytes[start];

            if first != b'_' && !first.is_ascii_alphabetic() {
                return None;
            }

            let mut len = 1;
            while bytes
                .get(start + len)
                .is_some_and(|b| *b == b'_' || b.is_ascii_alphanumeric())
            {
                len += 1;
            }

            let word = &source[start..start + len];

            match reserved_words.get(word) {
                Some(label) => Some((*label, len)),
                None => Some((TokenLabel::Name, len)),
            }
        });

        // quoted strings
        lexer.add_lexer(|_, source, start| {
            let bytes = source.as_bytes();
            let quote = bytes[start];

            if quote != b'"' && quote != b'\'' {
                return None;
            }

            let mut i = start + 1;
            let mut escaped = false;
            while let Some(&b) = bytes.get(i) {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == quote {
                    return Some((TokenLabel::StringLiteral, i - start + 1));
                } else if b == b'\n' {
                    return None;
                }
                i += 1;
            }

            None
        });

        // long-bracket strings
        lexer.add_lexer(|_, source, start| {
            long_bracket_len(source, start).map(|len| (TokenLabel::StringLiteral, len))
        });

        // whitespace
        lexer.add_ignorer(|source, start| {
            source[start..]
                .bytes()
                .take_while(|b| b.is_ascii_whitespace())
                .count()
        });

        // comments, line and long-bracket form
        lexer.add_ignorer(|source, start| {
            let substr = &source[start..];
            if !substr.starts_with("--") {
                return 0;
            }
            if let Some(len) = long_bracket_len(source, start + 2) {
                return 2 + len;
            }
            substr.find(['\r', '\n']).unwrap_or(substr.len())
        });

        Self { lexer }
    }
}

impl LuaLexer {
    pub fn lex<'lexer: 'iter, 'source: 'iter, 'iter>(
        &'lexer self,
        source: &'source str,
    ) -> impl Iterator<Item = Result<LuaToken<'source>, super::lexer::LexError>> + 'iter {
        self.lexer.lex(source)
    }
}

/// Total length of a `[=*[ ... ]=*]` bracket at `start`, when one opens
/// there and closes at the same level.
pub(crate) fn long_bracket_len(source: &str, start: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    if bytes.get(start) != Some(&b'[') {
        return None;
    }
    let mut level = 0;
    while bytes.get(start + 1 + level) == Some(&b'=') {
        level += 1;
    }
    if bytes.get(start + 1 + level) != Some(&b'[') {
        return None;
    }

    let mut i = start + level + 2;
    while i < bytes.len() {
        if bytes[i] == b']' {
            let mut eq = 0;
            while bytes.get(i + 1 + eq) == Some(&b'=') {
                eq += 1;
            }
            if eq == level && bytes.get(i + 1 + eq) == Some(&b']') {
                return Some(i + eq + 2 - start);
            }
        }
        i += 1;
    }
    None
}

/// Decodes a string literal's token content (quotes or long brackets
/// included) into its byte value.
pub(crate) fn decode_string(content: &str) -> Result<Vec<u8>, String> {
    let bytes = content.as_bytes();
    match bytes.first() {
        Some(b'"') | Some(b'\'') => {
            let end = bytes.len() - 1;
            let mut out = Vec::with_capacity(end);
            let mut i = 1;
            while i < end {
                let b = bytes[i];
                if b != b'\\' {
                    out.push(b);
                    i += 1;
                    continue;
                }
                i += 1;
                let Some(&esc) = bytes.get(i) else {
                    return Err("unfinished string".to_string());
                };
                i += 1;
                match esc {
                    b'a' => out.push(7),
                    b'b' => out.push(8),
                    b'f' => out.push(12),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'v' => out.push(11),
                    b'\\' => out.push(b'\\'),
                    b'"' => out.push(b'"'),
                    b'\'' => out.push(b'\''),
                    b'\n' => out.push(b'\n'),
                    b'0'..=b'9' => {
                        let mut value = (esc - b'0') as u32;
                        for _ in 0..2 {
                            match bytes.get(i) {
                                Some(d) if d.is_ascii_digit() => {
                                    value = value * 10 + (d - b'0') as u32;
                                    i += 1;
                                }
                                _ => break,
                            }
                        }
                        if value > 255 {
                            return Err("escape sequence too large".to_string());
                        }
                        out.push(value as u8);
                    }
                    other => {
                        return Err(format!(
                            "invalid escape sequence '\\{}'",
                            other as char
                        ))
                    }
                }
            }
            Ok(out)
        }
        Some(b'[') => {
            let mut level = 0;
            while bytes.get(1 + level) == Some(&b'=') {
                level += 1;
            }
            let mut inner = &bytes[level + 2..bytes.len() - (level + 2)];
            // a newline directly after the opening bracket is dropped
            if inner.first() == Some(&b'\r') {
                inner = &inner[1..];
            }
            if inner.first() == Some(&b'\n') {
                inner = &inner[1..];
            }
            Ok(inner.to_vec())
        }
        _ => Err("malformed string literal".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::LexError;

    fn labels(source: &str) -> Vec<TokenLabel> {
        LuaLexer::default()
            .lex(source)
            .collect::<Result<Vec<_>, LexError>>()
            .unwrap()
            .into_iter()
            .map(|t| t.label)
            .collect()
    }

    #[test]
    fn statements() {
        assert_eq!(
            labels("local x = 1 + 2"),
            vec![
                TokenLabel::Local,
                TokenLabel::Name,
                TokenLabel::Assign,
                TokenLabel::Numeral,
                TokenLabel::Plus,
                TokenLabel::Numeral,
            ]
        );
    }

    #[test]
    fn numerals_keep_their_spelling() {
        let numbers = ["3", "345", "0xff", "3.", "3.1416", "314.16e-2", "0.31416E1", ".5"];
        let lexer = LuaLexer::default();
        for s in numbers {
            let token = lexer.lex(s).next().unwrap().unwrap();
            assert_eq!((token.label, token.content), (TokenLabel::Numeral, s));
        }
    }

    #[test]
    fn strings_span_their_quotes() {
        let strings = [
            "'a\\n'",
            "\"b\\065\"",
            "[[long\ntext]]",
            "[==[x]==]",
            "'[==[d\"ef]==]'",
        ];
        let lexer = LuaLexer::default();
        for s in strings {
            let token = lexer.lex(s).next().unwrap().unwrap();
            assert_eq!((token.label, token.content), (TokenLabel::StringLiteral, s));
        }
    }

    #[test]
    fn decodes_literals() {
        assert_eq!(decode_string("'a\\n'").unwrap(), b"a\n".to_vec());
        assert_eq!(decode_string("\"b\\065\"").unwrap(), b"bA".to_vec());
        assert_eq!(decode_string("[[long\ntext]]").unwrap(), b"long\ntext".to_vec());
        assert_eq!(decode_string("[[\nskipped]]").unwrap(), b"skipped".to_vec());
        assert_eq!(decode_string("[==[x]==]").unwrap(), b"x".to_vec());
        assert!(decode_string("'bad \\q'").is_err());
    }

    #[test]
    fn comments_are_ignored() {
        assert_eq!(
            labels("a --c\n --[[ block\ncomment ]] ~= b .. ..."),
            vec![
                TokenLabel::Name,
                TokenLabel::CmpNotEqual,
                TokenLabel::Name,
                TokenLabel::DoubleDot,
                TokenLabel::TripleDot,
            ]
        );
    }

    #[test]
    fn operators_match_longest_first() {
        assert_eq!(
            labels("<= < .. . ..."),
            vec![
                TokenLabel::CmpLessThanEqual,
                TokenLabel::CmpLessThan,
                TokenLabel::DoubleDot,
                TokenLabel::Dot,
                TokenLabel::TripleDot,
            ]
        );
    }
}
