//! Syntax tree consumed by the code generator. Every node carries its
//! first and last source line.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
    pub last_line: u32,
}

impl Expr {
    pub fn new(kind: ExprKind, line: u32) -> Expr {
        Expr {
            kind,
            line,
            last_line: line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UnaryOp {
    Minus,
    Not,
    Len,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExprKind {
    Nil,
    True,
    False,
    /// Numeric literal, kept as source text until compilation.
    Number(String),
    String(Vec<u8>),
    /// `...`
    Vararg,
    Ident(String),
    /// `object[key]`; `object.name` desugars to a string key.
    AttrGet {
        object: Box<Expr>,
        key: Box<Expr>,
    },
    Table(Vec<TableField>),
    FuncCall(Box<FuncCall>),
    Function(Box<FunctionBody>),
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Concat {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Relational {
        op: RelOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TableField {
    /// None for positional (array) entries.
    pub key: Option<Expr>,
    pub value: Expr,
}

/// `f(args)` or `receiver:method(args)`; exactly one of `func` /
/// `receiver` is set.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FuncCall {
    pub func: Option<Expr>,
    pub receiver: Option<Expr>,
    pub method: String,
    pub args: Vec<Expr>,
    /// Set for parenthesized calls, which always produce one value.
    pub adjust_ret: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParList {
    pub names: Vec<String>,
    pub has_vararg: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FunctionBody {
    pub params: ParList,
    pub body: Vec<Stmt>,
}

/// Target of a `function name` statement: a plain assignable expression
/// or `receiver:method`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FuncName {
    pub func: Option<Expr>,
    pub receiver: Option<Expr>,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
    pub last_line: u32,
}

impl Stmt {
    pub fn new(kind: StmtKind, line: u32) -> Stmt {
        Stmt {
            kind,
            line,
            last_line: line,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StmtKind {
    Assign {
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
    },
    LocalAssign {
        names: Vec<String>,
        exprs: Vec<Expr>,
    },
    FuncCall(Expr),
    DoBlock(Vec<Stmt>),
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    Repeat {
        condition: Expr,
        body: Vec<Stmt>,
    },
    If {
        condition: Expr,
        then: Vec<Stmt>,
        els: Vec<Stmt>,
    },
    NumberFor {
        name: String,
        init: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    GenericFor {
        names: Vec<String>,
        exprs: Vec<Expr>,
        body: Vec<Stmt>,
    },
    FuncDef {
        name: FuncName,
        func: Expr,
    },
    Return(Vec<Expr>),
    Break,
}
