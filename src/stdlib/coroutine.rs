use super::{register_module, set_fn};
use crate::errors::RuntimeError;
use crate::state::{ResumeResult, State};
use crate::value::Value;
use std::rc::Rc;

pub fn open_coroutine(l: &Rc<State>) {
    let module = register_module(l, "coroutine");

    set_fn(l, &module, "create", co_create);
    set_fn(l, &module, "resume", co_resume);
    set_fn(l, &module, "yield", co_yield);
    set_fn(l, &module, "status", co_status);
    set_fn(l, &module, "wrap", co_wrap);
    set_fn(l, &module, "running", co_running);
}

// the entry function of a not-yet-started coroutine lives in the
// registry, keyed by the thread value
fn remember_entry(l: &Rc<State>, thread: &Rc<State>, fun: Value) {
    let registry = l.g.registry.borrow().clone();
    let _ = registry.raw_set(Value::Thread(thread.clone()), fun);
}

fn entry_of(l: &Rc<State>, thread: &Rc<State>) -> Option<Rc<crate::value::Function>> {
    let registry = l.g.registry.borrow().clone();
    registry
        .raw_get(&Value::Thread(thread.clone()))
        .as_function()
        .cloned()
}

fn co_create(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let fun = l.check_function(1)?;
    let thread = l.new_thread();
    remember_entry(l, &thread, Value::Function(fun));
    l.push(Value::Thread(thread));
    Ok(1)
}

fn co_resume(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let thread = l.check_thread(1)?;
    let mut args = Vec::new();
    for i in 2..=l.get_top() {
        args.push(l.get(i));
    }
    let Some(fun) = entry_of(l, &thread) else {
        return Err(l.arg_error(1, "coroutine expected"));
    };
    match l.resume(&thread, fun, &args) {
        ResumeResult::Ok(values) | ResumeResult::Yield(values) => {
            l.push(Value::Bool(true));
            let n = values.len() as i32;
            for value in values {
                l.push(value);
            }
            Ok(n + 1)
        }
        ResumeResult::Error(err) => {
            l.push(Value::Bool(false));
            l.push(err.value);
            Ok(2)
        }
    }
}

fn co_yield(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let mut values = Vec::new();
    for i in 1..=l.get_top() {
        values.push(l.get(i));
    }
    Ok(l.do_yield(values))
}

fn co_status(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let thread = l.check_thread(1)?;
    l.push(Value::string(l.status(&thread).as_str()));
    Ok(1)
}

fn co_wrap(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let fun = l.check_function(1)?;
    let thread = l.new_thread();
    remember_entry(l, &thread, Value::Function(fun.clone()));

    let wrapped = l.new_function(move |l| {
        let mut args = Vec::new();
        for i in 1..=l.get_top() {
            args.push(l.get(i));
        }
        match l.resume(&thread, fun.clone(), &args) {
            ResumeResult::Ok(values) | ResumeResult::Yield(values) => {
                let n = values.len() as i32;
                for value in values {
                    l.push(value);
                }
                Ok(n)
            }
            // errors cross the wrapper transparently
            ResumeResult::Error(err) => Err(err),
        }
    });
    l.push(Value::Function(wrapped));
    Ok(1)
}

fn co_running(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let current = l.g.current_thread.borrow().clone();
    match current.and_then(|weak| weak.upgrade()) {
        Some(th) if th.parent.borrow().is_some() => l.push(Value::Thread(th)),
        _ => l.push(Value::Nil),
    }
    Ok(1)
}
