use crate::errors::{ErrorKind, RuntimeError};
use crate::state::State;
use crate::value::{parse_number, Value};
use crate::MULTRET;
use std::io::Write;
use std::rc::Rc;

pub fn open_base(l: &Rc<State>) {
    let globals = l.g.globals.borrow().clone();
    globals.raw_set_string("_G", Value::Table(globals.clone()));
    globals.raw_set_string("_VERSION", Value::string("Lua 5.1"));

    let next_fn = l.new_function(base_next);
    globals.raw_set_string("next", Value::Function(next_fn.clone()));

    l.register("print", base_print);
    l.register("type", base_type);
    l.register("tostring", base_tostring);
    l.register("tonumber", base_tonumber);
    l.register("select", base_select);
    l.register("rawget", base_rawget);
    l.register("rawset", base_rawset);
    l.register("rawequal", base_rawequal);
    l.register("setmetatable", base_setmetatable);
    l.register("getmetatable", base_getmetatable);
    l.register("assert", base_assert);
    l.register("error", base_error);
    l.register("unpack", base_unpack);
    l.register("collectgarbage", base_collectgarbage);
    l.register("loadstring", base_loadstring);
    l.register("load", base_loadstring);
    l.register("loadfile", base_loadfile);
    l.register("dofile", base_dofile);
    l.register("pcall", base_pcall);
    l.register("xpcall", base_xpcall);
    l.register("getfenv", base_getfenv);
    l.register("setfenv", base_setfenv);

    // pairs closes over the shared `next`
    let pairs_next = next_fn.clone();
    l.register("pairs", move |l| {
        let t = l.check_table(1)?;
        l.push(Value::Function(pairs_next.clone()));
        l.push(Value::Table(t));
        l.push(Value::Nil);
        Ok(3)
    });

    let ipairs_aux = l.new_function(|l| {
        let t = l.check_table(1)?;
        let i = l.check_int(2)? + 1;
        let v = t.raw_get_int(i);
        if v.is_nil() {
            l.push(Value::Nil);
            Ok(1)
        } else {
            l.push(Value::Number(i as f64));
            l.push(v);
            Ok(2)
        }
    });
    l.register("ipairs", move |l| {
        let t = l.check_table(1)?;
        l.push(Value::Function(ipairs_aux.clone()));
        l.push(Value::Table(t));
        l.push(Value::Number(0.0));
        Ok(3)
    });
}

fn base_print(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let top = l.get_top();
    for i in 1..=top {
        let value = l.get(i);
        let text = l.tostring_value(&value)?;
        if i > 1 {
            let _ = out.write_all(b"\t");
        }
        let _ = out.write_all(text.display_string().as_bytes());
    }
    let _ = out.write_all(b"\n");
    Ok(0)
}

fn base_type(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let value = l.check_any(1)?;
    l.push(Value::string(value.type_name().as_str()));
    Ok(1)
}

fn base_tostring(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let value = l.check_any(1)?;
    let s = l.tostring_value(&value)?;
    l.push(s);
    Ok(1)
}

fn base_tonumber(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let base = l.opt_int(2, 10)?;
    if base == 10 {
        match l.get(1) {
            Value::Number(n) => l.push(Value::Number(n)),
            Value::String(s) => match parse_number(&s.to_string_lossy()) {
                Some(n) => l.push(Value::Number(n)),
                None => l.push(Value::Nil),
            },
            _ => l.push(Value::Nil),
        }
    } else {
        if !(2..=36).contains(&base) {
            return Err(l.arg_error(2, "base out of range"));
        }
        let s = l.check_string(1)?;
        let text = s.to_string_lossy().trim().to_lowercase();
        match i64::from_str_radix(&text, base as u32) {
            Ok(n) => l.push(Value::Number(n as f64)),
            Err(_) => l.push(Value::Nil),
        }
    }
    Ok(1)
}

fn base_next(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let key = l.get(2);
    match t.next(&key)? {
        Some((k, v)) => {
            l.push(k);
            l.push(v);
            Ok(2)
        }
        None => {
            l.push(Value::Nil);
            Ok(1)
        }
    }
}

fn base_select(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let top = l.get_top();
    match l.get(1) {
        Value::String(s) if s.as_bytes() == b"#" => {
            l.push(Value::Number((top - 1) as f64));
            Ok(1)
        }
        _ => {
            let n = l.check_int(1)?;
            if n < 0 || n >= top as i64 {
                return Err(l.arg_error(1, "index out of range"));
            }
            Ok(top - n as i32)
        }
    }
}

fn base_rawget(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let key = l.check_any(2)?;
    l.push(t.raw_get(&key));
    Ok(1)
}

fn base_rawset(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let key = l.check_any(2)?;
    let value = l.check_any(3)?;
    l.raw_set(&t, key, value)?;
    l.push(Value::Table(t));
    Ok(1)
}

fn base_rawequal(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let a = l.check_any(1)?;
    let b = l.check_any(2)?;
    l.push(Value::Bool(a.raw_equals(&b)));
    Ok(1)
}

fn base_setmetatable(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let mt = l.get(2);
    if !matches!(mt, Value::Nil | Value::Table(_)) {
        return Err(l.arg_error(2, "nil or table expected"));
    }
    if let Value::Table(old) = t.metatable() {
        if !old.raw_get_string("__metatable").is_nil() {
            return Err(l.runtime_error(1, "cannot change a protected metatable"));
        }
    }
    t.set_metatable(mt);
    l.push(Value::Table(t));
    Ok(1)
}

fn base_getmetatable(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let value = l.check_any(1)?;
    l.push(l.get_metatable(&value));
    Ok(1)
}

fn base_assert(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let value = l.check_any(1)?;
    if value.is_false() {
        let message = match l.get(2) {
            Value::Nil => Value::string("assertion failed!"),
            other => other,
        };
        return Err(l.error_value(message, 1));
    }
    Ok(l.get_top())
}

fn base_error(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let value = l.get(1);
    let level = l.opt_int(2, 1)? as i32;
    Err(l.error_value(value, level))
}

fn base_unpack(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let i = l.opt_int(2, 1)?;
    let j = l.opt_int(3, t.len())?;
    let mut count = 0;
    for idx in i..=j {
        l.push(t.raw_get_int(idx));
        count += 1;
    }
    Ok(count)
}

fn base_collectgarbage(l: &Rc<State>) -> Result<i32, RuntimeError> {
    // reclamation is reference counted; report zero like an idle
    // collector
    l.push(Value::Number(0.0));
    Ok(1)
}

fn base_loadstring(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let source = l.check_string(1)?;
    let name = l.opt_string(2, "=(load)")?;
    match l.load(source.as_bytes(), &name.to_string_lossy()) {
        Ok(f) => {
            l.push(Value::Function(f));
            Ok(1)
        }
        Err(err) => {
            l.push(Value::Nil);
            l.push(err.value);
            Ok(2)
        }
    }
}

fn base_loadfile(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let path = l.check_string(1)?;
    match l.load_file(&path.to_string_lossy()) {
        Ok(f) => {
            l.push(Value::Function(f));
            Ok(1)
        }
        Err(err) => {
            l.push(Value::Nil);
            l.push(err.value);
            Ok(2)
        }
    }
}

fn base_dofile(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let path = l.check_string(1)?;
    let f = l.load_file(&path.to_string_lossy())?;
    let base = l.get_top();
    l.push(Value::Function(f));
    l.call(0, MULTRET)?;
    Ok(l.get_top() - base)
}

fn base_pcall(l: &Rc<State>) -> Result<i32, RuntimeError> {
    l.check_any(1)?;
    let nargs = l.get_top() - 1;
    match l.pcall(nargs, MULTRET, None) {
        Ok(()) => {
            let nresults = l.get_top();
            l.insert(Value::Bool(true), 1);
            Ok(nresults + 1)
        }
        Err(err) if err.kind == ErrorKind::Panic => Err(err),
        Err(err) => {
            l.set_top(0);
            l.push(Value::Bool(false));
            l.push(err.value);
            Ok(2)
        }
    }
}

fn base_xpcall(l: &Rc<State>) -> Result<i32, RuntimeError> {
    l.check_any(1)?;
    let handler = l.check_function(2)?;
    let f = l.get(1);
    l.push(f);
    match l.pcall(0, MULTRET, Some(handler)) {
        Ok(()) => {
            let nresults = l.get_top() - 2;
            l.insert(Value::Bool(true), 3);
            Ok(nresults + 1)
        }
        Err(err) if err.kind == ErrorKind::Panic => Err(err),
        Err(err) => {
            l.set_top(0);
            l.push(Value::Bool(false));
            l.push(err.value);
            Ok(2)
        }
    }
}

fn base_getfenv(l: &Rc<State>) -> Result<i32, RuntimeError> {
    match l.get(1) {
        Value::Function(f) => l.push(Value::Table(f.env())),
        Value::Nil => l.push(Value::Table(l.current_env())),
        Value::Number(_) => l.push(Value::Table(l.current_env())),
        other => l.push(l.get_fenv(&other)),
    }
    Ok(1)
}

fn base_setfenv(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let target = l.check_any(1)?;
    let env = l.check_table(2)?;
    l.set_fenv(&target, Value::Table(env))?;
    l.push(target);
    Ok(1)
}
