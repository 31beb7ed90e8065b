//! Recursive-descent parser for the Lua 5.1 grammar, consuming the
//! labeled source slices produced by [LuaLexer]. Literal decoding
//! (string escapes, numeral validation) happens here, at the point a
//! token becomes a syntax-tree node.

use super::ast::*;
use super::lua_lexer::{decode_string, LuaLexer, LuaToken, TokenLabel};
use super::token::line_and_col;
use crate::errors::CompileError;

struct BinPriority {
    left: u8,
    right: u8,
}

const UNARY_PRIORITY: u8 = 12;

fn bin_priority(label: TokenLabel) -> Option<BinPriority> {
    let (left, right) = match label {
        TokenLabel::Or => (1, 1),
        TokenLabel::And => (2, 2),
        TokenLabel::CmpLessThan
        | TokenLabel::CmpGreaterThan
        | TokenLabel::CmpLessThanEqual
        | TokenLabel::CmpGreaterThanEqual
        | TokenLabel::CmpNotEqual
        | TokenLabel::CmpEqual => (3, 3),
        TokenLabel::DoubleDot => (9, 8), // right associative
        TokenLabel::Plus | TokenLabel::Minus => (10, 10),
        TokenLabel::Star | TokenLabel::Slash | TokenLabel::Percent => (11, 11),
        TokenLabel::Caret => (14, 13), // right associative
        _ => return None,
    };
    Some(BinPriority { left, right })
}

pub struct Parser<'a> {
    source: &'a str,
    source_name: &'a str,
    tokens: Vec<LuaToken<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, source_name: &'a str) -> Result<Parser<'a>, CompileError> {
        let lexer = LuaLexer::default();
        let mut tokens = Vec::new();
        for result in lexer.lex(source) {
            match result {
                Ok(token) => tokens.push(token),
                Err(err) => {
                    let (line, _) = line_and_col(source, err.offset);
                    return Err(CompileError::new(source_name, line, err.message));
                }
            }
        }
        Ok(Parser {
            source,
            source_name,
            tokens,
            pos: 0,
        })
    }

    /// Parses a whole chunk to end of input.
    pub fn parse_chunk(mut self) -> Result<Vec<Stmt>, CompileError> {
        let block = self.block()?;
        if self.label() != TokenLabel::Eof {
            return Err(self.unexpected("<eof>"));
        }
        Ok(block)
    }

    fn label(&self) -> TokenLabel {
        self.tokens
            .get(self.pos)
            .map(|t| t.label)
            .unwrap_or(TokenLabel::Eof)
    }

    fn label_at(&self, ahead: usize) -> TokenLabel {
        self.tokens
            .get(self.pos + ahead)
            .map(|t| t.label)
            .unwrap_or(TokenLabel::Eof)
    }

    fn content(&self) -> &'a str {
        self.tokens.get(self.pos).map(|t| t.content).unwrap_or("")
    }

    fn line(&self) -> u32 {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or(self.source.len());
        line_and_col(self.source, offset).0
    }

    /// Line of the previous token, used to close spans.
    fn last_line(&self) -> u32 {
        match self.pos.checked_sub(1).and_then(|p| self.tokens.get(p)) {
            Some(token) => line_and_col(self.source, token.offset).0,
            None => 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(self.source_name, self.line(), message)
    }

    fn unexpected(&self, wanted: &str) -> CompileError {
        self.error(format!(
            "{} expected near {}",
            wanted,
            self.label().describe(self.content())
        ))
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn accept(&mut self, label: TokenLabel) -> bool {
        if self.label() == label {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, label: TokenLabel, spelling: &str) -> Result<(), CompileError> {
        if self.label() == label {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{spelling}'")))
        }
    }

    fn expect_name(&mut self) -> Result<String, CompileError> {
        if self.label() == TokenLabel::Name {
            let name = self.content().to_string();
            self.advance();
            Ok(name)
        } else {
            Err(self.unexpected("<name>"))
        }
    }

    /// Decodes the current string literal and consumes it.
    fn string_value(&mut self) -> Result<Vec<u8>, CompileError> {
        match decode_string(self.content()) {
            Ok(bytes) => {
                self.advance();
                Ok(bytes)
            }
            Err(message) => Err(self.error(message)),
        }
    }

    /// Validates the current numeral's spelling and consumes it.
    fn number_text(&mut self) -> Result<String, CompileError> {
        let text = self.content();
        if crate::value::parse_number(text).is_none() {
            return Err(self.error(format!("malformed number near '{text}'")));
        }
        let text = text.to_string();
        self.advance();
        Ok(text)
    }

    fn block_follow(&self) -> bool {
        matches!(
            self.label(),
            TokenLabel::Else
                | TokenLabel::ElseIf
                | TokenLabel::End
                | TokenLabel::Until
                | TokenLabel::Eof
        )
    }

    fn block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        while !self.block_follow() {
            let is_return = self.label() == TokenLabel::Return;
            if let Some(stmt) = self.statement()? {
                stmts.push(stmt);
            }
            if is_return {
                break;
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Option<Stmt>, CompileError> {
        let line = self.line();
        match self.label() {
            TokenLabel::SemiColon => {
                self.advance();
                Ok(None)
            }
            TokenLabel::If => self.if_stmt().map(Some),
            TokenLabel::While => self.while_stmt().map(Some),
            TokenLabel::Do => {
                self.advance();
                let body = self.block()?;
                let mut stmt = Stmt::new(StmtKind::DoBlock(body), line);
                stmt.last_line = self.line();
                self.expect(TokenLabel::End, "end")?;
                Ok(Some(stmt))
            }
            TokenLabel::For => self.for_stmt().map(Some),
            TokenLabel::Repeat => self.repeat_stmt().map(Some),
            TokenLabel::Function => self.func_stmt().map(Some),
            TokenLabel::Local => self.local_stmt().map(Some),
            TokenLabel::Return => self.return_stmt().map(Some),
            TokenLabel::Break => {
                self.advance();
                Ok(Some(Stmt::new(StmtKind::Break, line)))
            }
            _ => self.expr_stmt().map(Some),
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance(); // if / elseif
        let condition = self.expr()?;
        self.expect(TokenLabel::Then, "then")?;
        let then = self.block()?;

        let els = match self.label() {
            TokenLabel::ElseIf => vec![self.if_stmt()?],
            TokenLabel::Else => {
                self.advance();
                let els = self.block()?;
                self.expect(TokenLabel::End, "end")?;
                els
            }
            TokenLabel::End => {
                self.advance();
                Vec::new()
            }
            _ => return Err(self.unexpected("'end'")),
        };

        let mut stmt = Stmt::new(
            StmtKind::If {
                condition,
                then,
                els,
            },
            line,
        );
        stmt.last_line = self.last_line();
        Ok(stmt)
    }

    fn while_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance();
        let condition = self.expr()?;
        self.expect(TokenLabel::Do, "do")?;
        let body = self.block()?;
        let mut stmt = Stmt::new(StmtKind::While { condition, body }, line);
        stmt.last_line = self.line();
        self.expect(TokenLabel::End, "end")?;
        Ok(stmt)
    }

    fn repeat_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance();
        let body = self.block()?;
        self.expect(TokenLabel::Until, "until")?;
        let condition = self.expr()?;
        let mut stmt = Stmt::new(StmtKind::Repeat { condition, body }, line);
        stmt.last_line = self.last_line();
        Ok(stmt)
    }

    fn for_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance();
        let first = self.expect_name()?;

        if self.accept(TokenLabel::Assign) {
            let init = self.expr()?;
            self.expect(TokenLabel::Comma, ",")?;
            let limit = self.expr()?;
            let step = if self.accept(TokenLabel::Comma) {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect(TokenLabel::Do, "do")?;
            let body = self.block()?;
            let mut stmt = Stmt::new(
                StmtKind::NumberFor {
                    name: first,
                    init,
                    limit,
                    step,
                    body,
                },
                line,
            );
            stmt.last_line = self.line();
            self.expect(TokenLabel::End, "end")?;
            return Ok(stmt);
        }

        let mut names = vec![first];
        while self.accept(TokenLabel::Comma) {
            names.push(self.expect_name()?);
        }
        self.expect(TokenLabel::In, "in")?;
        let mut exprs = vec![self.expr()?];
        while self.accept(TokenLabel::Comma) {
            exprs.push(self.expr()?);
        }
        self.expect(TokenLabel::Do, "do")?;
        let body = self.block()?;
        let mut stmt = Stmt::new(StmtKind::GenericFor { names, exprs, body }, line);
        stmt.last_line = self.line();
        self.expect(TokenLabel::End, "end")?;
        Ok(stmt)
    }

    fn func_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance();

        // funcname: Name {'.' Name} [':' Name]
        let name_line = self.line();
        let root = self.expect_name()?;
        let mut target = Expr::new(ExprKind::Ident(root), name_line);
        let mut method = String::new();
        loop {
            if self.accept(TokenLabel::Dot) {
                let key_line = self.line();
                let key = self.expect_name()?;
                target = Expr::new(
                    ExprKind::AttrGet {
                        object: Box::new(target),
                        key: Box::new(Expr::new(ExprKind::String(key.into_bytes()), key_line)),
                    },
                    name_line,
                );
            } else if self.accept(TokenLabel::Colon) {
                method = self.expect_name()?;
                break;
            } else {
                break;
            }
        }

        let func = self.function_body(line)?;
        let name = if method.is_empty() {
            FuncName {
                func: Some(target),
                receiver: None,
                method,
            }
        } else {
            FuncName {
                func: None,
                receiver: Some(target),
                method,
            }
        };
        let mut stmt = Stmt::new(StmtKind::FuncDef { name, func }, line);
        stmt.last_line = self.last_line();
        Ok(stmt)
    }

    fn local_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance();

        if self.accept(TokenLabel::Function) {
            let name = self.expect_name()?;
            let func = self.function_body(line)?;
            let mut stmt = Stmt::new(
                StmtKind::LocalAssign {
                    names: vec![name],
                    exprs: vec![func],
                },
                line,
            );
            stmt.last_line = self.last_line();
            return Ok(stmt);
        }

        let mut names = vec![self.expect_name()?];
        while self.accept(TokenLabel::Comma) {
            names.push(self.expect_name()?);
        }
        let mut exprs = Vec::new();
        if self.accept(TokenLabel::Assign) {
            exprs.push(self.expr()?);
            while self.accept(TokenLabel::Comma) {
                exprs.push(self.expr()?);
            }
        }
        let mut stmt = Stmt::new(StmtKind::LocalAssign { names, exprs }, line);
        stmt.last_line = self.last_line();
        Ok(stmt)
    }

    fn return_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.advance();
        let mut exprs = Vec::new();
        if !self.block_follow() && self.label() != TokenLabel::SemiColon {
            exprs.push(self.expr()?);
            while self.accept(TokenLabel::Comma) {
                exprs.push(self.expr()?);
            }
        }
        self.accept(TokenLabel::SemiColon);
        let mut stmt = Stmt::new(StmtKind::Return(exprs), line);
        stmt.last_line = self.last_line();
        Ok(stmt)
    }

    /// Either an assignment or a bare call.
    fn expr_stmt(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        let first = self.suffixed_expr()?;

        if matches!(self.label(), TokenLabel::Assign | TokenLabel::Comma) {
            let mut lhs = vec![first];
            while self.accept(TokenLabel::Comma) {
                lhs.push(self.suffixed_expr()?);
            }
            for target in &lhs {
                if !matches!(target.kind, ExprKind::Ident(_) | ExprKind::AttrGet { .. }) {
                    return Err(self.error("cannot assign to this expression"));
                }
            }
            self.expect(TokenLabel::Assign, "=")?;
            let mut rhs = vec![self.expr()?];
            while self.accept(TokenLabel::Comma) {
                rhs.push(self.expr()?);
            }
            let mut stmt = Stmt::new(StmtKind::Assign { lhs, rhs }, line);
            stmt.last_line = self.last_line();
            return Ok(stmt);
        }

        if !matches!(first.kind, ExprKind::FuncCall(_)) {
            return Err(self.error("syntax error: unexpected expression statement"));
        }
        let mut stmt = Stmt::new(StmtKind::FuncCall(first), line);
        stmt.last_line = self.last_line();
        Ok(stmt)
    }

    fn function_body(&mut self, line: u32) -> Result<Expr, CompileError> {
        self.expect(TokenLabel::OpenParen, "(")?;
        let mut params = ParList {
            names: Vec::new(),
            has_vararg: false,
        };
        if self.label() != TokenLabel::CloseParen {
            loop {
                match self.label() {
                    TokenLabel::TripleDot => {
                        self.advance();
                        params.has_vararg = true;
                        break;
                    }
                    TokenLabel::Name => {
                        params.names.push(self.expect_name()?);
                    }
                    _ => return Err(self.unexpected("<name>")),
                }
                if !self.accept(TokenLabel::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenLabel::CloseParen, ")")?;
        let body = self.block()?;
        let mut expr = Expr::new(
            ExprKind::Function(Box::new(FunctionBody { params, body })),
            line,
        );
        expr.last_line = self.line();
        self.expect(TokenLabel::End, "end")?;
        Ok(expr)
    }

    fn expr(&mut self) -> Result<Expr, CompileError> {
        self.sub_expr(0)
    }

    /// Precedence climbing; `limit` cuts off binary operators that bind
    /// no tighter than the caller's.
    fn sub_expr(&mut self, limit: u8) -> Result<Expr, CompileError> {
        let line = self.line();
        let mut lhs = match self.label() {
            TokenLabel::Not => {
                self.advance();
                let operand = self.sub_expr(UNARY_PRIORITY)?;
                Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(operand),
                    },
                    line,
                )
            }
            TokenLabel::Minus => {
                self.advance();
                let operand = self.sub_expr(UNARY_PRIORITY)?;
                Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Minus,
                        expr: Box::new(operand),
                    },
                    line,
                )
            }
            TokenLabel::Hash => {
                self.advance();
                let operand = self.sub_expr(UNARY_PRIORITY)?;
                Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Len,
                        expr: Box::new(operand),
                    },
                    line,
                )
            }
            _ => self.simple_expr()?,
        };

        loop {
            let op_label = self.label();
            let Some(priority) = bin_priority(op_label) else {
                break;
            };
            if priority.left <= limit {
                break;
            }
            self.advance();
            let rhs = self.sub_expr(priority.right)?;
            let last_line = rhs.last_line;
            let kind = match op_label {
                TokenLabel::Plus => arith(ArithOp::Add, lhs, rhs),
                TokenLabel::Minus => arith(ArithOp::Sub, lhs, rhs),
                TokenLabel::Star => arith(ArithOp::Mul, lhs, rhs),
                TokenLabel::Slash => arith(ArithOp::Div, lhs, rhs),
                TokenLabel::Percent => arith(ArithOp::Mod, lhs, rhs),
                TokenLabel::Caret => arith(ArithOp::Pow, lhs, rhs),
                TokenLabel::DoubleDot => ExprKind::Concat {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                TokenLabel::CmpEqual => relational(RelOp::Eq, lhs, rhs),
                TokenLabel::CmpNotEqual => relational(RelOp::Ne, lhs, rhs),
                TokenLabel::CmpLessThan => relational(RelOp::Lt, lhs, rhs),
                TokenLabel::CmpLessThanEqual => relational(RelOp::Le, lhs, rhs),
                TokenLabel::CmpGreaterThan => relational(RelOp::Gt, lhs, rhs),
                TokenLabel::CmpGreaterThanEqual => relational(RelOp::Ge, lhs, rhs),
                TokenLabel::And => ExprKind::Logical {
                    op: LogicalOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                TokenLabel::Or => ExprKind::Logical {
                    op: LogicalOp::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                _ => unreachable!(),
            };
            lhs = Expr {
                kind,
                line,
                last_line,
            };
        }

        Ok(lhs)
    }

    fn simple_expr(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let kind = match self.label() {
            TokenLabel::Nil => {
                self.advance();
                ExprKind::Nil
            }
            TokenLabel::True => {
                self.advance();
                ExprKind::True
            }
            TokenLabel::False => {
                self.advance();
                ExprKind::False
            }
            TokenLabel::Numeral => ExprKind::Number(self.number_text()?),
            TokenLabel::StringLiteral => ExprKind::String(self.string_value()?),
            TokenLabel::TripleDot => {
                self.advance();
                ExprKind::Vararg
            }
            TokenLabel::Function => {
                self.advance();
                return self.function_body(line);
            }
            TokenLabel::OpenCurly => return self.table_expr(),
            _ => return self.suffixed_expr(),
        };
        Ok(Expr::new(kind, line))
    }

    fn table_expr(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        self.expect(TokenLabel::OpenCurly, "{")?;
        let mut fields = Vec::new();
        while self.label() != TokenLabel::CloseCurly {
            match self.label() {
                TokenLabel::OpenBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(TokenLabel::CloseBracket, "]")?;
                    self.expect(TokenLabel::Assign, "=")?;
                    let value = self.expr()?;
                    fields.push(TableField {
                        key: Some(key),
                        value,
                    });
                }
                TokenLabel::Name if self.label_at(1) == TokenLabel::Assign => {
                    let key_line = self.line();
                    let name = self.expect_name()?;
                    self.expect(TokenLabel::Assign, "=")?;
                    let value = self.expr()?;
                    fields.push(TableField {
                        key: Some(Expr::new(ExprKind::String(name.into_bytes()), key_line)),
                        value,
                    });
                }
                _ => {
                    let value = self.expr()?;
                    fields.push(TableField { key: None, value });
                }
            }
            if !self.accept(TokenLabel::Comma) && !self.accept(TokenLabel::SemiColon) {
                break;
            }
        }
        let mut expr = Expr::new(ExprKind::Table(fields), line);
        expr.last_line = self.line();
        self.expect(TokenLabel::CloseCurly, "}")?;
        Ok(expr)
    }

    fn primary_expr(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        match self.label() {
            TokenLabel::Name => {
                let name = self.expect_name()?;
                Ok(Expr::new(ExprKind::Ident(name), line))
            }
            TokenLabel::OpenParen => {
                self.advance();
                let mut inner = self.expr()?;
                self.expect(TokenLabel::CloseParen, ")")?;
                // a parenthesized call is adjusted to exactly one value
                if let ExprKind::FuncCall(call) = &mut inner.kind {
                    call.adjust_ret = true;
                }
                Ok(inner)
            }
            label => Err(self.error(format!(
                "unexpected symbol near {}",
                label.describe(self.content())
            ))),
        }
    }

    fn suffixed_expr(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let mut expr = self.primary_expr()?;
        loop {
            match self.label() {
                TokenLabel::Dot => {
                    self.advance();
                    let key_line = self.line();
                    let key = self.expect_name()?;
                    expr = Expr::new(
                        ExprKind::AttrGet {
                            object: Box::new(expr),
                            key: Box::new(Expr::new(
                                ExprKind::String(key.into_bytes()),
                                key_line,
                            )),
                        },
                        line,
                    );
                }
                TokenLabel::OpenBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(TokenLabel::CloseBracket, "]")?;
                    expr = Expr::new(
                        ExprKind::AttrGet {
                            object: Box::new(expr),
                            key: Box::new(key),
                        },
                        line,
                    );
                }
                TokenLabel::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = Expr::new(
                        ExprKind::FuncCall(Box::new(FuncCall {
                            func: None,
                            receiver: Some(expr),
                            method,
                            args,
                            adjust_ret: false,
                        })),
                        line,
                    );
                    expr.last_line = self.last_line();
                }
                TokenLabel::OpenParen | TokenLabel::StringLiteral | TokenLabel::OpenCurly => {
                    let args = self.call_args()?;
                    expr = Expr::new(
                        ExprKind::FuncCall(Box::new(FuncCall {
                            func: Some(expr),
                            receiver: None,
                            method: String::new(),
                            args,
                            adjust_ret: false,
                        })),
                        line,
                    );
                    expr.last_line = self.last_line();
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        match self.label() {
            TokenLabel::StringLiteral => {
                let line = self.line();
                let bytes = self.string_value()?;
                Ok(vec![Expr::new(ExprKind::String(bytes), line)])
            }
            TokenLabel::OpenCurly => Ok(vec![self.table_expr()?]),
            TokenLabel::OpenParen => {
                self.advance();
                let mut args = Vec::new();
                if self.label() != TokenLabel::CloseParen {
                    args.push(self.expr()?);
                    while self.accept(TokenLabel::Comma) {
                        args.push(self.expr()?);
                    }
                }
                self.expect(TokenLabel::CloseParen, ")")?;
                Ok(args)
            }
            _ => Err(self.unexpected("function arguments")),
        }
    }
}

fn arith(op: ArithOp, lhs: Expr, rhs: Expr) -> ExprKind {
    ExprKind::Arith {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn relational(op: RelOp, lhs: Expr, rhs: Expr) -> ExprKind {
    ExprKind::Relational {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Parses `source` into a statement list.
pub fn parse(source: &str, source_name: &str) -> Result<Vec<Stmt>, CompileError> {
    Parser::new(source, source_name)?.parse_chunk()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_precedence() {
        let chunk = parse("return 1 + 2 * 3 ^ -4 .. 'x'", "test").unwrap();
        let StmtKind::Return(exprs) = &chunk[0].kind else {
            panic!("expected return");
        };
        // concat binds loosest of the lot
        assert!(matches!(exprs[0].kind, ExprKind::Concat { .. }));
    }

    #[test]
    fn parses_method_definition() {
        let chunk = parse("function obj.sub:m(a, ...) return a end", "test").unwrap();
        let StmtKind::FuncDef { name, func } = &chunk[0].kind else {
            panic!("expected funcdef");
        };
        assert_eq!(name.method, "m");
        assert!(name.func.is_none());
        assert!(name.receiver.is_some());
        let ExprKind::Function(body) = &func.kind else {
            panic!("expected function");
        };
        assert_eq!(body.params.names, vec!["a"]);
        assert!(body.params.has_vararg);
    }

    #[test]
    fn parses_table_constructors() {
        let chunk = parse("t = {1, 2; x = 3, [k] = 4, f()}", "test").unwrap();
        let StmtKind::Assign { rhs, .. } = &chunk[0].kind else {
            panic!("expected assign");
        };
        let ExprKind::Table(fields) = &rhs[0].kind else {
            panic!("expected table");
        };
        assert_eq!(fields.len(), 5);
        assert!(fields[0].key.is_none());
        assert!(fields[2].key.is_some());
    }

    #[test]
    fn parenthesized_call_adjusts_to_one_value() {
        let chunk = parse("return (f())", "test").unwrap();
        let StmtKind::Return(exprs) = &chunk[0].kind else {
            panic!("expected return");
        };
        let ExprKind::FuncCall(call) = &exprs[0].kind else {
            panic!("expected call");
        };
        assert!(call.adjust_ret);
    }

    #[test]
    fn string_literals_decode_here() {
        let chunk = parse("return 'a\\n', [[raw]]", "test").unwrap();
        let StmtKind::Return(exprs) = &chunk[0].kind else {
            panic!("expected return");
        };
        assert_eq!(exprs[0].kind, ExprKind::String(b"a\n".to_vec()));
        assert_eq!(exprs[1].kind, ExprKind::String(b"raw".to_vec()));
    }

    #[test]
    fn statements_carry_source_lines() {
        let chunk = parse("local a = 1\nreturn a", "test").unwrap();
        assert_eq!(chunk[0].line, 1);
        assert_eq!(chunk[1].line, 2);
    }

    #[test]
    fn rejects_bad_statements() {
        assert!(parse("1 + 2", "test").is_err());
        assert!(parse("if x then", "test").is_err());
        assert!(parse("local = 3", "test").is_err());
        assert!(parse("return 1..2", "test").is_err());
    }
}
