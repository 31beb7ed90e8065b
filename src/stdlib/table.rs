use super::{register_module, set_fn};
use crate::errors::RuntimeError;
use crate::state::State;
use crate::table::Table;
use crate::value::{Function, Value};
use std::rc::Rc;

pub fn open_table(l: &Rc<State>) {
    let module = register_module(l, "table");

    set_fn(l, &module, "insert", table_insert);
    set_fn(l, &module, "remove", table_remove);
    set_fn(l, &module, "concat", table_concat);
    set_fn(l, &module, "maxn", table_maxn);
    set_fn(l, &module, "getn", table_getn);
    set_fn(l, &module, "sort", table_sort);
}

fn table_insert(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    match l.get_top() {
        2 => {
            t.append(l.check_any(2)?);
            Ok(0)
        }
        3 => {
            let pos = l.check_int(2)?;
            t.insert(pos, l.check_any(3)?);
            Ok(0)
        }
        _ => Err(l.runtime_error(1, "wrong number of arguments to 'insert'")),
    }
}

fn table_remove(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let pos = l.opt_int(2, -1)?;
    l.push(t.remove(pos));
    Ok(1)
}

fn table_concat(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let sep = l.opt_string(2, "")?;
    let i = l.opt_int(3, 1)?;
    let j = l.opt_int(4, t.len())?;
    let mut out: Vec<u8> = Vec::new();
    for idx in i..=j {
        let value = t.raw_get_int(idx);
        let Some(s) = value.coerce_string() else {
            return Err(l.runtime_error(
                1,
                format!("invalid value (at index {idx}) in table for 'concat'"),
            ));
        };
        out.extend_from_slice(s.as_bytes());
        if idx < j {
            out.extend_from_slice(sep.as_bytes());
        }
    }
    l.push(Value::string(out));
    Ok(1)
}

fn table_maxn(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    l.push(Value::Number(t.max_n() as f64));
    Ok(1)
}

fn table_getn(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    l.push(Value::Number(t.len() as f64));
    Ok(1)
}

struct SortState<'a> {
    state: &'a Rc<State>,
    table: &'a Rc<Table>,
    comparator: Option<Rc<Function>>,
}

impl SortState<'_> {
    fn less_value(&self, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
        match &self.comparator {
            Some(f) => {
                self.state.push(Value::Function(f.clone()));
                self.state.push(a.clone());
                self.state.push(b.clone());
                self.state.call(2, 1)?;
                Ok(self.state.reg_pop().as_bool())
            }
            None => self.state.less_than(a, b),
        }
    }

    fn less(&self, i: i64, j: i64) -> Result<bool, RuntimeError> {
        self.less_value(&self.table.raw_get_int(i), &self.table.raw_get_int(j))
    }

    fn swap(&self, i: i64, j: i64) {
        let vi = self.table.raw_get_int(i);
        let vj = self.table.raw_get_int(j);
        self.table.raw_set_int(i, vj);
        self.table.raw_set_int(j, vi);
    }

    fn bad_order(&self) -> RuntimeError {
        self.state.arg_error(2, "invalid order function for sorting")
    }
}

// in-place quicksort over t[l..u]; recursion always takes the smaller
// half, and partition cursors that run off the range expose an
// inconsistent comparator
fn aux_sort(state: &SortState, mut l: i64, mut u: i64) -> Result<(), RuntimeError> {
    while l < u {
        if state.less(u, l)? {
            state.swap(u, l);
        }
        if u - l == 1 {
            break;
        }
        let mut i = (l + u) / 2;
        if state.less(i, l)? {
            state.swap(i, l);
        } else if state.less(u, i)? {
            state.swap(u, i);
        }
        if u - l == 2 {
            break;
        }
        let pivot = state.table.raw_get_int(i);
        state.swap(i, u - 1);
        // t[l] <= P == t[u-1] <= t[u]: sort from l+1 to u-2
        i = l;
        let mut j = u - 1;
        loop {
            // invariant: t[l..i] <= P <= t[j..u]
            loop {
                i += 1;
                if !state.less_value(&state.table.raw_get_int(i), &pivot)? {
                    break;
                }
                if i >= u {
                    return Err(state.bad_order());
                }
            }
            loop {
                j -= 1;
                if !state.less_value(&pivot, &state.table.raw_get_int(j))? {
                    break;
                }
                if j <= l {
                    return Err(state.bad_order());
                }
            }
            if j < i {
                break;
            }
            state.swap(i, j);
        }
        state.swap(u - 1, i);
        // recurse into the smaller half, loop on the larger one
        let (rec_l, rec_u) = if i - l < u - i {
            let range = (l, i - 1);
            l = i + 1;
            range
        } else {
            let range = (i + 1, u);
            u = i - 1;
            range
        };
        aux_sort(state, rec_l, rec_u)?;
    }
    Ok(())
}

fn table_sort(l: &Rc<State>) -> Result<i32, RuntimeError> {
    let t = l.check_table(1)?;
    let comparator = if l.get_top() != 1 {
        Some(l.check_function(2)?)
    } else {
        None
    };
    let n = t.len();
    let state = SortState {
        state: l,
        table: &t,
        comparator,
    };
    aux_sort(&state, 1, n)?;
    Ok(0)
}
