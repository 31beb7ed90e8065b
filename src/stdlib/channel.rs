use super::{register_module, set_fn};
use crate::errors::RuntimeError;
use crate::state::State;
use crate::table::Table;
use crate::value::{Channel, Value};
use std::rc::Rc;

pub fn open_channel(l: &Rc<State>) {
    let module = register_module(l, "channel");

    set_fn(l, &module, "make", channel_make);
    set_fn(l, &module, "select", channel_select);

    // methods reach channel values through the builtin metatable
    let methods = Table::with_capacity(0, 4).wrap();
    set_fn(l, &methods, "send", channel_send);
    set_fn(l, &methods, "receive", channel_receive);
    set_fn(l, &methods, "close", channel_close);
    set_fn(l, &methods, "len", channel_len);

    let mt = Table::with_capacity(0, 1).wrap();
    mt.raw_set_string("__index", Value::Table(methods));
    let probe = Value::Channel(Rc::new(Channel::new(0)));
    let _ = l.set_metatable(&probe, Value::Table(mt));
}

fn channel_make(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let capacity = l.opt_int(1, 0)?;
    if capacity < 0 {
        return Err(l.arg_error(1, "capacity must not be negative"));
    }
    l.push(Value::Channel(Rc::new(Channel::new(capacity as usize))));
    Ok(1)
}

fn channel_send(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let ch = l.check_channel(1)?;
    let value = l.check_any(2)?;
    ch.send(value)?;
    Ok(0)
}

/// Returns `ok, value`: false with nil once the channel is drained.
fn channel_receive(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let ch = l.check_channel(1)?;
    match ch.receive() {
        Some(value) => {
            l.push(Value::Bool(true));
            l.push(value);
        }
        None => {
            l.push(Value::Bool(false));
            l.push(Value::Nil);
        }
    }
    Ok(2)
}

fn channel_close(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let ch = l.check_channel(1)?;
    ch.close();
    Ok(0)
}

fn channel_len(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let ch = l.check_channel(1)?;
    l.push(Value::Number(ch.len() as f64));
    Ok(1)
}

/// Polls the given channels; returns `index, value, ok` for the first
/// one holding a value, or nil when all are empty.
fn channel_select(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let top = l.get_top();
    for i in 1..=top {
        let ch = l.check_channel(i)?;
        if let Some(value) = ch.receive() {
            l.push(Value::Number(i as f64));
            l.push(value);
            l.push(Value::Bool(true));
            return Ok(3);
        }
    }
    l.push(Value::Nil);
    Ok(1)
}
