use super::{register_module, set_fn};
use crate::errors::RuntimeError;
use crate::state::State;
use crate::value::Value;
use std::cell::Cell;
use std::rc::Rc;

pub fn open_math(l: &Rc<State>) {
    let module = register_module(l, "math");

    module.raw_set_string("pi", Value::Number(std::f64::consts::PI));
    module.raw_set_string("huge", Value::Number(f64::INFINITY));

    set_fn(l, &module, "abs", |l| unary(l, f64::abs));
    set_fn(l, &module, "ceil", |l| unary(l, f64::ceil));
    set_fn(l, &module, "floor", |l| unary(l, f64::floor));
    set_fn(l, &module, "sqrt", |l| unary(l, f64::sqrt));
    set_fn(l, &module, "sin", |l| unary(l, f64::sin));
    set_fn(l, &module, "cos", |l| unary(l, f64::cos));
    set_fn(l, &module, "tan", |l| unary(l, f64::tan));
    set_fn(l, &module, "asin", |l| unary(l, f64::asin));
    set_fn(l, &module, "acos", |l| unary(l, f64::acos));
    set_fn(l, &module, "atan", |l| unary(l, f64::atan));
    set_fn(l, &module, "exp", |l| unary(l, f64::exp));
    set_fn(l, &module, "log", |l| unary(l, f64::ln));
    set_fn(l, &module, "log10", |l| unary(l, f64::log10));
    set_fn(l, &module, "deg", |l| unary(l, f64::to_degrees));
    set_fn(l, &module, "rad", |l| unary(l, f64::to_radians));

    set_fn(l, &module, "pow", |l| {
        let x = l.check_number(1)?;
        let y = l.check_number(2)?;
        l.push(Value::Number(x.powf(y)));
        Ok(1)
    });
    set_fn(l, &module, "fmod", |l| {
        let x = l.check_number(1)?;
        let y = l.check_number(2)?;
        l.push(Value::Number(x % y));
        Ok(1)
    });
    set_fn(l, &module, "modf", |l| {
        let x = l.check_number(1)?;
        l.push(Value::Number(x.trunc()));
        l.push(Value::Number(x.fract()));
        Ok(2)
    });
    set_fn(l, &module, "max", |l| fold(l, f64::max));
    set_fn(l, &module, "min", |l| fold(l, f64::min));

    let seed = Rc::new(Cell::new(0x2545f4914f6cdd1du64));
    let random_seed = seed.clone();
    set_fn(l, &module, "random", move |l| {
        let r = next_random(&seed);
        match l.get_top() {
            0 => l.push(Value::Number(r)),
            1 => {
                let m = l.check_int(1)?;
                if m < 1 {
                    return Err(l.arg_error(1, "interval is empty"));
                }
                l.push(Value::Number((r * m as f64).floor() + 1.0));
            }
            _ => {
                let lo = l.check_int(1)?;
                let hi = l.check_int(2)?;
                if lo > hi {
                    return Err(l.arg_error(2, "interval is empty"));
                }
                l.push(Value::Number((r * (hi - lo + 1) as f64).floor() + lo as f64));
            }
        }
        Ok(1)
    });
    set_fn(l, &module, "randomseed", move |l| {
        let s = l.check_number(1)?;
        random_seed.set((s.to_bits()) | 1);
        Ok(0)
    });
}

fn unary(l: &Rc<State>, f: impl Fn(f64) -> f64) -> Result<i32, RuntimeError> {
    let x = l.check_number(1)?;
    l.push(Value::Number(f(x)));
    Ok(1)
}

fn fold(l: &Rc<State>, f: impl Fn(f64, f64) -> f64) -> Result<i32, RuntimeError> {
    let mut acc = l.check_number(1)?;
    for i in 2..=l.get_top() {
        acc = f(acc, l.check_number(i)?);
    }
    l.push(Value::Number(acc));
    Ok(1)
}

// xorshift*: cheap, deterministic, good enough for scripts
fn next_random(seed: &Cell<u64>) -> f64 {
    let mut s = seed.get();
    s ^= s >> 12;
    s ^= s << 25;
    s ^= s >> 27;
    seed.set(s);
    let bits = s.wrapping_mul(0x2545f4914f6cdd1d) >> 11;
    bits as f64 / (1u64 << 53) as f64
}
