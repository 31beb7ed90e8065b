//! `string` library, minus the pattern engine (find/match/gmatch/gsub
//! are provided by a separate pattern module when one is linked in).

use super::{register_module, set_fn};
use crate::errors::RuntimeError;
use crate::state::State;
use crate::table::Table;
use crate::value::{number_to_string, LuaStr, Value};
use std::rc::Rc;

pub fn open_string(l: &Rc<State>) {
    let module = register_module(l, "string");

    set_fn(l, &module, "len", str_len);
    set_fn(l, &module, "sub", str_sub);
    set_fn(l, &module, "upper", str_upper);
    set_fn(l, &module, "lower", str_lower);
    set_fn(l, &module, "rep", str_rep);
    set_fn(l, &module, "reverse", str_reverse);
    set_fn(l, &module, "byte", str_byte);
    set_fn(l, &module, "char", str_char);
    set_fn(l, &module, "format", str_format);

    // strings dispatch methods through their builtin metatable
    let mt = Table::with_capacity(0, 1).wrap();
    mt.raw_set_string("__index", Value::Table(module));
    let _ = l.set_metatable(&Value::string(""), Value::Table(mt));
}

/// Translates a possibly negative 1-based string position.
fn str_position(pos: i64, len: usize) -> i64 {
    if pos >= 0 {
        pos
    } else {
        len as i64 + pos + 1
    }
}

fn str_len(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let s = l.check_string(1)?;
    l.push(Value::Number(s.len() as f64));
    Ok(1)
}

fn str_sub(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let s = l.check_string(1)?;
    let len = s.len();
    let mut i = str_position(l.opt_int(2, 1)?, len);
    let mut j = str_position(l.opt_int(3, -1)?, len);
    if i < 1 {
        i = 1;
    }
    if j > len as i64 {
        j = len as i64;
    }
    if i > j {
        l.push(Value::string(""));
    } else {
        l.push(Value::string(&s.as_bytes()[i as usize - 1..j as usize]));
    }
    Ok(1)
}

fn str_upper(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let s = l.check_string(1)?;
    l.push(Value::string(s.as_bytes().to_ascii_uppercase()));
    Ok(1)
}

fn str_lower(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let s = l.check_string(1)?;
    l.push(Value::string(s.as_bytes().to_ascii_lowercase()));
    Ok(1)
}

fn str_rep(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let s = l.check_string(1)?;
    let n = l.check_int(2)?;
    let mut out = Vec::new();
    for _ in 0..n.max(0) {
        out.extend_from_slice(s.as_bytes());
    }
    l.push(Value::string(out));
    Ok(1)
}

fn str_reverse(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let s = l.check_string(1)?;
    let mut bytes = s.as_bytes().to_vec();
    bytes.reverse();
    l.push(Value::string(bytes));
    Ok(1)
}

fn str_byte(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let s = l.check_string(1)?;
    let len = s.len();
    let i = str_position(l.opt_int(2, 1)?, len).max(1);
    let j = str_position(l.opt_int(3, i)?, len).min(len as i64);
    let mut count = 0;
    for idx in i..=j {
        l.push(Value::Number(s.as_bytes()[idx as usize - 1] as f64));
        count += 1;
    }
    Ok(count)
}

fn str_char(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let mut out = Vec::with_capacity(l.get_top() as usize);
    for i in 1..=l.get_top() {
        let code = l.check_int(i)?;
        if !(0..=255).contains(&code) {
            return Err(l.arg_error(i, "value out of range"));
        }
        out.push(code as u8);
    }
    l.push(Value::string(out));
    Ok(1)
}

struct FormatSpec {
    minus: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

fn pad(spec: &FormatSpec, body: String) -> String {
    let Some(width) = spec.width else {
        return body;
    };
    if body.len() >= width {
        return body;
    }
    let fill = width - body.len();
    if spec.minus {
        format!("{}{}", body, " ".repeat(fill))
    } else if spec.zero {
        let (sign, digits) = match body.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", body.as_str()),
        };
        format!("{}{}{}", sign, "0".repeat(fill), digits)
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn quote(bytes: &[u8]) -> String {
    let mut out = String::from("\"");
    for b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0 => out.push_str("\\0"),
            b if b.is_ascii_graphic() || *b == b' ' => out.push(*b as char),
            b => out.push_str(&format!("\\{b}")),
        }
    }
    out.push('"');
    out
}

fn str_format(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let fmt = l.check_string(1)?;
    let bytes = fmt.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut arg = 2i32;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= bytes.len() {
            break;
        }
        if bytes[i] == b'%' {
            out.push(b'%');
            i += 1;
            continue;
        }

        let mut spec = FormatSpec {
            minus: false,
            zero: false,
            width: None,
            precision: None,
        };
        while i < bytes.len() && matches!(bytes[i], b'-' | b'0' | b'+' | b' ' | b'#') {
            match bytes[i] {
                b'-' => spec.minus = true,
                b'0' => spec.zero = true,
                _ => {}
            }
            i += 1;
        }
        let mut width = 0usize;
        let mut has_width = false;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            width = width * 10 + (bytes[i] - b'0') as usize;
            has_width = true;
            i += 1;
        }
        if has_width {
            spec.width = Some(width);
        }
        if i < bytes.len() && bytes[i] == b'.' {
            i += 1;
            let mut precision = 0usize;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                precision = precision * 10 + (bytes[i] - b'0') as usize;
                i += 1;
            }
            spec.precision = Some(precision);
        }
        if i >= bytes.len() {
            break;
        }

        let conv = bytes[i];
        i += 1;
        let rendered = match conv {
            b'd' | b'i' => pad(&spec, format!("{}", l.check_number(arg)? as i64)),
            b'u' => pad(&spec, format!("{}", l.check_number(arg)? as i64 as u64)),
            b'x' => pad(&spec, format!("{:x}", l.check_number(arg)? as i64)),
            b'X' => pad(&spec, format!("{:X}", l.check_number(arg)? as i64)),
            b'o' => pad(&spec, format!("{:o}", l.check_number(arg)? as i64)),
            b'c' => {
                let code = l.check_int(arg)?;
                String::from_utf8_lossy(&[code as u8]).into_owned()
            }
            b'f' | b'F' => {
                let precision = spec.precision.unwrap_or(6);
                pad(&spec, format!("{:.*}", precision, l.check_number(arg)?))
            }
            b'e' | b'E' => {
                let precision = spec.precision.unwrap_or(6);
                let s = format!("{:.*e}", precision, l.check_number(arg)?);
                pad(&spec, if conv == b'E' { s.to_uppercase() } else { s })
            }
            b'g' | b'G' => {
                let s = number_to_string(l.check_number(arg)?);
                pad(&spec, if conv == b'G' { s.to_uppercase() } else { s })
            }
            b's' => {
                let value = l.check_any(arg)?;
                let mut s = l.tostring_value(&value)?.display_string();
                if let Some(precision) = spec.precision {
                    s.truncate(precision);
                }
                pad(&spec, s)
            }
            b'q' => {
                let s = l.check_string(arg)?;
                quote(s.as_bytes())
            }
            other => {
                return Err(l.arg_error(
                    1,
                    format!("invalid option '%{}' to 'format'", other as char),
                ))
            }
        };
        out.extend_from_slice(rendered.as_bytes());
        arg += 1;
    }

    l.push(Value::String(Rc::new(LuaStr::from(out))));
    Ok(1)
}
