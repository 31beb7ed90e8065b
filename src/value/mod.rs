mod channel;
mod function;
mod string;
mod userdata;

pub use channel::Channel;
pub use function::{FuncKind, Function, HostFn};
pub use string::LuaStr;
pub use userdata::{UserData, UserDataValue};

pub(crate) use string::hash_bytes32;

use crate::state::State;
use crate::table::Table;
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The primitive type of a [Value], as reported by `type()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TypeName {
    Nil,
    Bool,
    Number,
    String,
    Function,
    UserData,
    Thread,
    Table,
    Channel,
}

impl TypeName {
    pub fn as_str(self) -> &'static str {
        match self {
            TypeName::Nil => "nil",
            TypeName::Bool => "boolean",
            TypeName::Number => "number",
            TypeName::String => "string",
            TypeName::Function => "function",
            TypeName::UserData => "userdata",
            TypeName::Thread => "thread",
            TypeName::Table => "table",
            TypeName::Channel => "channel",
        }
    }

    /// Stable tag used by the binary chunk format and the builtin
    /// metatable registry.
    pub fn tag(self) -> u8 {
        match self {
            TypeName::Nil => 0,
            TypeName::Bool => 1,
            TypeName::Number => 3,
            TypeName::String => 4,
            TypeName::Function => 6,
            TypeName::UserData => 7,
            TypeName::Thread => 8,
            TypeName::Table => 5,
            TypeName::Channel => 9,
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A Lua runtime value.
///
/// Nil, booleans, numbers and strings compare by content; tables,
/// functions, userdata, threads and channels compare by identity.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(Rc<LuaStr>),
    Table(Rc<Table>),
    Function(Rc<Function>),
    UserData(Rc<UserData>),
    Thread(Rc<State>),
    Channel(Rc<Channel>),
}

impl Value {
    #[inline]
    pub fn string(s: impl Into<LuaStr>) -> Value {
        Value::String(Rc::new(s.into()))
    }

    #[inline]
    pub fn type_name(&self) -> TypeName {
        match self {
            Value::Nil => TypeName::Nil,
            Value::Bool(_) => TypeName::Bool,
            Value::Number(_) => TypeName::Number,
            Value::String(_) => TypeName::String,
            Value::Table(_) => TypeName::Table,
            Value::Function(_) => TypeName::Function,
            Value::UserData(_) => TypeName::UserData,
            Value::Thread(_) => TypeName::Thread,
            Value::Channel(_) => TypeName::Channel,
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Lua truth: everything except nil and false.
    #[inline]
    pub fn is_false(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    #[inline]
    pub fn as_bool(&self) -> bool {
        !self.is_false()
    }

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Number, or a string convertible to one.
    pub fn coerce_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => parse_number(&s.to_string_lossy()),
            _ => None,
        }
    }

    #[inline]
    pub fn can_convert_to_string(&self) -> bool {
        matches!(self, Value::String(_) | Value::Number(_))
    }

    /// String, or a number rendered as one.
    pub fn coerce_string(&self) -> Option<LuaStr> {
        match self {
            Value::String(s) => Some((**s).clone()),
            Value::Number(n) => Some(LuaStr::from(number_to_string(*n))),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Rc<Table>> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<Function>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_lua_string(&self) -> Option<&Rc<LuaStr>> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Raw textual rendering used by error values and default
    /// `tostring`; never consults metamethods.
    pub fn display_string(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::String(s) => s.to_string_lossy().into_owned(),
            Value::Table(t) => format!("table: {:p}", Rc::as_ptr(t)),
            Value::Function(f) => format!("function: {:p}", Rc::as_ptr(f)),
            Value::UserData(u) => format!("userdata: {:p}", Rc::as_ptr(u)),
            Value::Thread(t) => format!("thread: {:p}", Rc::as_ptr(t)),
            Value::Channel(c) => format!("channel: {:p}", Rc::as_ptr(c)),
        }
    }

    /// Identity for reference values, content for primitives; never
    /// consults `__eq`.
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::UserData(a), Value::UserData(b)) => Rc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => Rc::ptr_eq(a, b),
            (Value::Channel(a), Value::Channel(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Address used for identity hashing of reference values.
    pub(crate) fn identity(&self) -> usize {
        match self {
            Value::Table(t) => Rc::as_ptr(t) as usize,
            Value::Function(f) => Rc::as_ptr(f) as usize,
            Value::UserData(u) => Rc::as_ptr(u) as usize,
            Value::Thread(t) => Rc::as_ptr(t) as usize,
            Value::Channel(c) => Rc::as_ptr(c) as usize,
            _ => 0,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.raw_equals(other)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s.to_string_lossy()),
            other => write!(f, "{}", other.display_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::string(s)
    }
}

impl From<Rc<Table>> for Value {
    fn from(t: Rc<Table>) -> Value {
        Value::Table(t)
    }
}

impl From<Rc<Function>> for Value {
    fn from(f: Rc<Function>) -> Value {
        Value::Function(f)
    }
}

/// Parses a Lua numeric literal: optional sign, decimal (with fraction
/// and exponent) or `0x` hexadecimal, surrounded by optional blanks.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_matches([' ', '\t', '\n']);
    if trimmed.is_empty() {
        return None;
    }

    let (sign, digits) = match trimmed.as_bytes()[0] {
        b'-' => (-1.0, &trimmed[1..]),
        b'+' => (1.0, &trimmed[1..]),
        _ => (1.0, trimmed),
    };

    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        return u64::from_str_radix(hex, 16).ok().map(|v| sign * v as f64);
    }

    // reject forms f64::from_str accepts but Lua does not
    if digits.is_empty() || !digits.bytes().next().is_some_and(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    if !digits
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return None;
    }

    digits.parse::<f64>().ok().map(|v| sign * v)
}

/// Renders a number the way Lua 5.1 prints it: `%d` when the value is an
/// exact integer, `%.14g` otherwise.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    format_g(n, 14)
}

// %.<prec>g: shortest of fixed / scientific with `prec` significant
// digits, trailing zeros stripped.
fn format_g(n: f64, prec: usize) -> String {
    let sci = format!("{:.*e}", prec - 1, n);
    let (mantissa, exp) = sci.split_once('e').unwrap();
    let exp: i32 = exp.parse().unwrap();

    if exp < -4 || exp >= prec as i32 {
        let mantissa = strip_zeros(mantissa);
        let exp_sign = if exp < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, exp_sign, exp.abs());
    }

    let decimals = (prec as i32 - 1 - exp).max(0) as usize;
    strip_zeros(&format!("{:.*}", decimals, n))
}

fn strip_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_literals() {
        assert_eq!(parse_number("10"), Some(10.0));
        assert_eq!(parse_number("  -3.5  "), Some(-3.5));
        assert_eq!(parse_number("0x10"), Some(16.0));
        assert_eq!(parse_number("1e2"), Some(100.0));
        assert_eq!(parse_number(".5"), Some(0.5));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("nan"), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn renders_numbers() {
        assert_eq!(number_to_string(5.0), "5");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(1.25), "1.25");
        assert_eq!(number_to_string(1e100), "1e+100");
        assert_eq!(number_to_string(5000050000.0), "5000050000");
    }

    #[test]
    fn equality_is_content_for_primitives() {
        assert_eq!(Value::string("a"), Value::string("a"));
        assert_ne!(Value::Number(1.0), Value::string("1"));
        assert_eq!(Value::Nil, Value::Nil);
    }
}
