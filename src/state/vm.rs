//! The interpreter: one tight loop decoding 32-bit words from the
//! current frame, with helpers for arithmetic, comparison and
//! concatenation metamethod fallbacks, coroutine switching and frame
//! initialization.

use super::{CallFrame, State};
use crate::bytecode::{self as bc, OpCode};
use crate::errors::RuntimeError;
use crate::table::Table;
use crate::value::{parse_number, Function, Value};
use crate::{FIELDS_PER_FLUSH, MULTRET};
use std::rc::Rc;

pub(crate) fn copy_return_values(l: &Rc<State>, reg: usize, start: usize, n: usize, b: i32) {
    if b == 1 {
        l.reg.borrow_mut().fill_nil(reg, n);
    } else {
        l.reg.borrow_mut().copy_range(reg, start, -1, n);
    }
}

/// Hands control back to the resuming thread: moves `nargs` values (and
/// a leading status flag) onto the parent's stack, pops the frame that
/// suspended us and rewinds the register file.
pub(crate) fn switch_to_parent_thread(
    l: &Rc<State>,
    nargs: i32,
    haserror: bool,
    kill: bool,
) -> Result<(), RuntimeError> {
    let Some(parent) = l.parent.borrow_mut().take() else {
        return Err(l.runtime_error(1, "can not yield from outside of a coroutine"));
    };
    l.g.set_current_thread(&parent);
    parent.push(Value::Bool(!haserror));
    l.xmove_to(&parent, nargs);
    let popped = l.stack.borrow_mut().pop();
    let offset = popped.local_base - popped.return_base;
    let top = l.reg.borrow().top();
    l.reg.borrow_mut().set_top(top - offset);
    if kill {
        l.kill();
        tracing::trace!("coroutine finished");
    }
    Ok(())
}

/// Invokes the host function in the current frame. Returns true when
/// the thread suspended (the dispatch loop must unwind to its resumer).
pub(crate) fn call_g_function(l: &Rc<State>, tailcall: bool) -> Result<bool, RuntimeError> {
    let (host, frame_nret, frame_return_base) = {
        let stack = l.stack.borrow();
        let cf = stack.last().unwrap();
        let crate::value::FuncKind::Host(host) = &cf.fun.kind else {
            unreachable!("host frame expected");
        };
        (host.clone(), cf.n_ret, cf.return_base)
    };

    let gfnret = host(l)?;

    if tailcall {
        let sp = l.stack.borrow().sp();
        l.stack.borrow_mut().remove(sp - 2);
    }

    if gfnret < 0 {
        switch_to_parent_thread(l, l.get_top(), false, false)?;
        return Ok(true);
    }

    let wantret = if frame_nret == MULTRET {
        gfnret
    } else {
        frame_nret
    };

    if tailcall && l.parent.borrow().is_some() && l.stack.borrow().sp() == 1 {
        switch_to_parent_thread(l, wantret, false, true)?;
        return Ok(true);
    }

    let top = l.reg.borrow().top();
    l.reg.borrow_mut().copy_range(
        frame_return_base,
        top - gfnret.max(0) as usize,
        -1,
        wantret.max(0) as usize,
    );
    l.stack.borrow_mut().pop();
    Ok(false)
}

/// Runs a coroutine body, converting an escaped error into a rejected
/// hand-off to the parent.
pub(crate) fn thread_run(l: &Rc<State>) -> Result<(), RuntimeError> {
    if l.stack.borrow().is_empty() {
        return Ok(());
    }
    match main_loop(l, None) {
        Ok(()) => Ok(()),
        Err(err) => {
            if l.parent.borrow().is_some() {
                l.set_top(0);
                l.push(err.value.clone());
                switch_to_parent_thread(l, 1, true, true)?;
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

struct Fetched {
    fun: Rc<Function>,
    inst: u32,
    lbase: usize,
    a: i32,
    ra: usize,
    frame_idx: usize,
}

fn fetch(l: &Rc<State>) -> Fetched {
    let mut stack = l.stack.borrow_mut();
    let frame_idx = stack.sp() - 1;
    let cf = stack.last_mut().unwrap();
    let fun = cf.fun.clone();
    let inst = fun.proto().unwrap().code[cf.pc];
    cf.pc += 1;
    let lbase = cf.local_base;
    let a = bc::get_arg_a(inst);
    Fetched {
        fun,
        inst,
        lbase,
        a,
        ra: lbase + a as usize,
        frame_idx,
    }
}

/// The dispatch loop. `start_idx` marks the frame whose return exits
/// the loop (None runs to stack exhaustion).
pub(crate) fn main_loop(l: &Rc<State>, start_idx: Option<usize>) -> Result<(), RuntimeError> {
    if l.stack.borrow().is_empty() {
        return Ok(());
    }
    l.started.set(true);

    if l.stack.borrow().last().unwrap().fun.is_host() {
        call_g_function(l, false)?;
        return Ok(());
    }

    loop {
        let Fetched {
            fun,
            inst,
            lbase,
            a,
            ra,
            frame_idx,
        } = fetch(l);
        let opcode = OpCode::from_u32(bc::get_opcode(inst)).expect("invalid opcode");

        match opcode {
            OpCode::Move => {
                let b = bc::get_arg_b(inst);
                let v = l.reg.borrow().get(lbase + b as usize);
                l.reg.borrow_mut().set(ra, v);
            }
            OpCode::MoveN => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let v = l.reg.borrow().get(lbase + b as usize);
                l.reg.borrow_mut().set(ra, v);
                // the merged MOVEs follow inline
                let proto = fun.proto().unwrap();
                let mut stack = l.stack.borrow_mut();
                let cf = stack.last_mut().unwrap();
                let mut registers = l.reg.borrow_mut();
                for _ in 0..c {
                    let next = proto.code[cf.pc];
                    cf.pc += 1;
                    let na = bc::get_arg_a(next);
                    let nb = bc::get_arg_b(next);
                    let v = registers.get(lbase + nb as usize);
                    registers.set(lbase + na as usize, v);
                }
            }
            OpCode::LoadK => {
                let bx = bc::get_arg_bx(inst);
                let v = fun.proto().unwrap().constants[bx as usize].clone();
                l.reg.borrow_mut().set(ra, v);
            }
            OpCode::LoadBool => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                l.reg.borrow_mut().set(ra, Value::Bool(b != 0));
                if c != 0 {
                    l.stack.borrow_mut().last_mut().unwrap().pc += 1;
                }
            }
            OpCode::LoadNil => {
                let b = bc::get_arg_b(inst);
                let mut registers = l.reg.borrow_mut();
                for i in ra..=lbase + b as usize {
                    registers.set(i, Value::Nil);
                }
            }
            OpCode::GetUpval => {
                let b = bc::get_arg_b(inst);
                let v = fun.upvalue(b as usize).value();
                l.reg.borrow_mut().set(ra, v);
            }
            OpCode::GetGlobal => {
                let bx = bc::get_arg_bx(inst);
                let key = fun.proto().unwrap().constants[bx as usize].clone();
                let env = Value::Table(fun.env());
                let v = l.get_field(&env, &key)?;
                l.reg.borrow_mut().set(ra, v);
            }
            OpCode::SetGlobal => {
                let bx = bc::get_arg_bx(inst);
                let key = fun.proto().unwrap().constants[bx as usize].clone();
                let env = Value::Table(fun.env());
                let v = l.reg.borrow().get(ra);
                l.set_field(&env, &key, v)?;
            }
            OpCode::GetTable | OpCode::GetTableKs => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let obj = l.reg.borrow().get(lbase + b as usize);
                let key = l.rk_value(c);
                let v = l.get_field(&obj, &key)?;
                l.reg.borrow_mut().set(ra, v);
            }
            OpCode::SetTable | OpCode::SetTableKs => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let obj = l.reg.borrow().get(ra);
                let key = l.rk_value(b);
                let value = l.rk_value(c);
                l.set_field(&obj, &key, value)?;
            }
            OpCode::SetUpval => {
                let b = bc::get_arg_b(inst);
                let v = l.reg.borrow().get(ra);
                fun.upvalue(b as usize).set_value(v);
            }
            OpCode::NewTable => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let t = Table::with_capacity(b as usize, c as usize).wrap();
                l.reg.borrow_mut().set(ra, Value::Table(t));
            }
            OpCode::SelfOp => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let selfobj = l.reg.borrow().get(lbase + b as usize);
                let key = l.rk_value(c);
                let v = l.get_field(&selfobj, &key)?;
                l.reg.borrow_mut().set(ra, v);
                l.reg.borrow_mut().set(ra + 1, selfobj);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let lhs = l.rk_value(b);
                let rhs = l.rk_value(c);
                let ret = match (lhs.as_number(), rhs.as_number()) {
                    (Some(v1), Some(v2)) => Value::Number(number_arith(opcode, v1, v2)),
                    _ => object_arith(l, opcode, lhs, rhs)?,
                };
                l.reg.borrow_mut().set(ra, ret);
            }
            OpCode::Unm => {
                let b = bc::get_arg_b(inst);
                let unaryv = l.rk_value(b);
                match unaryv.as_number() {
                    Some(n) => l.reg.borrow_mut().set(ra, Value::Number(-n)),
                    None => {
                        let op = l.meta_op1(&unaryv, "__unm");
                        if let Value::Function(_) = op {
                            l.push(op);
                            l.push(unaryv);
                            l.call(1, 1)?;
                            let v = l.reg_pop();
                            l.reg.borrow_mut().set(ra, v);
                        } else if let Value::String(s) = &unaryv {
                            match parse_number(&s.to_string_lossy()) {
                                Some(n) => l.reg.borrow_mut().set(ra, Value::Number(-n)),
                                None => return Err(l.runtime_error(1, "__unm undefined")),
                            }
                        } else {
                            return Err(l.runtime_error(1, "__unm undefined"));
                        }
                    }
                }
            }
            OpCode::Not => {
                let b = bc::get_arg_b(inst);
                let v = l.reg.borrow().get(lbase + b as usize);
                l.reg.borrow_mut().set(ra, Value::Bool(v.is_false()));
            }
            OpCode::Len => {
                let b = bc::get_arg_b(inst);
                let v = l.rk_value(b);
                match &v {
                    Value::String(s) => {
                        let n = s.len() as f64;
                        l.reg.borrow_mut().set(ra, Value::Number(n));
                    }
                    Value::Table(t) => {
                        let n = t.len() as f64;
                        l.reg.borrow_mut().set(ra, Value::Number(n));
                    }
                    _ => {
                        let op = l.meta_op1(&v, "__len");
                        if let Value::Function(_) = op {
                            l.push(op);
                            l.push(v);
                            l.call(1, 1)?;
                            let ret = l.reg_pop();
                            l.reg.borrow_mut().set(ra, ret);
                        } else {
                            return Err(l.runtime_error(1, "__len undefined"));
                        }
                    }
                }
            }
            OpCode::Concat => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let rb = lbase + b as usize;
                let rc = lbase + c as usize;
                let ret = string_concat(l, rc - rb + 1, rc)?;
                l.reg.borrow_mut().set(ra, ret);
            }
            OpCode::Jmp => {
                let sbx = bc::get_arg_sbx(inst);
                let mut stack = l.stack.borrow_mut();
                let cf = stack.last_mut().unwrap();
                cf.pc = (cf.pc as i64 + sbx as i64) as usize;
            }
            OpCode::Eq => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let ret = equals(l, &l.rk_value(b), &l.rk_value(c), false)?;
                if (!ret) as i32 == a {
                    l.stack.borrow_mut().last_mut().unwrap().pc += 1;
                }
            }
            OpCode::Lt => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let ret = less_than(l, &l.rk_value(b), &l.rk_value(c))?;
                if (!ret) as i32 == a {
                    l.stack.borrow_mut().last_mut().unwrap().pc += 1;
                }
            }
            OpCode::Le => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let lhs = l.rk_value(b);
                let rhs = l.rk_value(c);
                let ret = less_than_eq(l, &lhs, &rhs)?;
                if (!ret) as i32 == a {
                    l.stack.borrow_mut().last_mut().unwrap().pc += 1;
                }
            }
            OpCode::Test => {
                let c = bc::get_arg_c(inst);
                let v = l.reg.borrow().get(ra);
                if v.as_bool() == (c == 0) {
                    l.stack.borrow_mut().last_mut().unwrap().pc += 1;
                }
            }
            OpCode::TestSet => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let value = l.reg.borrow().get(lbase + b as usize);
                if value.as_bool() != (c == 0) {
                    l.reg.borrow_mut().set(ra, value);
                } else {
                    l.stack.borrow_mut().last_mut().unwrap().pc += 1;
                }
            }
            OpCode::Call => {
                let b = bc::get_arg_b(inst);
                let c = bc::get_arg_c(inst);
                let nargs = if b == 0 {
                    l.reg.borrow().top() as i32 - (ra as i32 + 1)
                } else {
                    b - 1
                };
                let fn_value = l.reg.borrow().get(ra);
                let nret = c - 1;
                let (callable, meta) = l.meta_call(&fn_value);
                let Some(callable) = callable else {
                    return Err(l.runtime_error(1, "attempt to call a non-function object"));
                };
                let is_host = callable.is_host();
                l.push_call_frame(
                    CallFrame {
                        fun: callable,
                        pc: 0,
                        base: ra,
                        local_base: ra + 1,
                        return_base: ra,
                        n_args: nargs,
                        n_ret: nret,
                        parent: Some(frame_idx),
                        tail_call: 0,
                    },
                    fn_value,
                    meta,
                )?;
                if is_host && call_g_function(l, false)? {
                    return Ok(());
                }
                let stack = l.stack.borrow();
                match stack.last() {
                    None => return Ok(()),
                    Some(cf) if cf.fun.is_host() => return Ok(()),
                    _ => {}
                }
            }
            OpCode::TailCall => {
                let b = bc::get_arg_b(inst);
                let nargs = if b == 0 {
                    l.reg.borrow().top() as i32 - (ra as i32 + 1)
                } else {
                    b - 1
                };
                let fn_value = l.reg.borrow().get(ra);
                let (callable, meta) = l.meta_call(&fn_value);
                let Some(callable) = callable else {
                    return Err(l.runtime_error(1, "attempt to call a non-function object"));
                };
                l.close_upvalues(lbase);
                if callable.is_host() {
                    let (return_base, n_ret) = {
                        let stack = l.stack.borrow();
                        let cf = stack.last().unwrap();
                        (cf.return_base, cf.n_ret)
                    };
                    l.push_call_frame(
                        CallFrame {
                            fun: callable,
                            pc: 0,
                            base: ra,
                            local_base: ra + 1,
                            return_base,
                            n_args: nargs,
                            n_ret,
                            parent: Some(frame_idx),
                            tail_call: 0,
                        },
                        fn_value,
                        meta,
                    )?;
                    if call_g_function(l, true)? {
                        return Ok(());
                    }
                    let done = {
                        let stack = l.stack.borrow();
                        match stack.last() {
                            None => true,
                            Some(cf) => cf.fun.is_host(),
                        }
                    };
                    // the caller frame was spliced out by the host-side
                    // tailcall
                    if done || start_idx == Some(frame_idx) {
                        return Ok(());
                    }
                } else {
                    // reuse the frame in place: no stack growth however
                    // deep the recursion
                    let (base, lbase_new) = {
                        let mut stack = l.stack.borrow_mut();
                        let cf = stack.last_mut().unwrap();
                        let base = cf.base;
                        cf.fun = callable;
                        cf.pc = 0;
                        cf.base = ra;
                        cf.local_base = ra + 1;
                        cf.n_args = nargs;
                        cf.tail_call += 1;
                        (base, cf.local_base)
                    };
                    if meta {
                        let mut stack = l.stack.borrow_mut();
                        let cf = stack.last_mut().unwrap();
                        cf.n_args += 1;
                        let local_base = cf.local_base;
                        drop(stack);
                        l.reg.borrow_mut().insert(fn_value, local_base);
                    }
                    l.init_call_frame();
                    let top = l.reg.borrow().top();
                    l.reg
                        .borrow_mut()
                        .copy_range(base, ra, -1, top.saturating_sub(ra + 1));
                    let mut stack = l.stack.borrow_mut();
                    let cf = stack.last_mut().unwrap();
                    cf.base = base;
                    cf.local_base = base + (cf.local_base - lbase_new + 1);
                }
            }
            OpCode::Return => {
                let b = bc::get_arg_b(inst);
                l.close_upvalues(lbase);
                let nret = if b == 0 {
                    l.reg.borrow().top() as i32 - ra as i32
                } else {
                    b - 1
                };
                let (frame_nret, return_base) = {
                    let stack = l.stack.borrow();
                    let cf = stack.last().unwrap();
                    (cf.n_ret, cf.return_base)
                };
                let n = if frame_nret == MULTRET { nret } else { frame_nret };

                if l.parent.borrow().is_some()
                    && (start_idx == Some(frame_idx) || l.stack.borrow().sp() == 1)
                {
                    let top = l.reg.borrow().top();
                    copy_return_values(l, top, ra, n.max(0) as usize, b);
                    switch_to_parent_thread(l, n, false, true)?;
                    return Ok(());
                }
                l.stack.borrow_mut().pop();
                let islast = start_idx == Some(frame_idx) || l.stack.borrow().is_empty();
                copy_return_values(l, return_base, ra, n.max(0) as usize, b);
                let done = {
                    let stack = l.stack.borrow();
                    match stack.last() {
                        None => true,
                        Some(cf) => cf.fun.is_host(),
                    }
                };
                if islast || done {
                    return Ok(());
                }
            }
            OpCode::ForPrep => {
                let sbx = bc::get_arg_sbx(inst);
                let init = l.reg.borrow().get(ra);
                let step = l.reg.borrow().get(ra + 2);
                match (init.as_number(), step.as_number()) {
                    (Some(init), Some(step)) => {
                        l.reg.borrow_mut().set(ra, Value::Number(init - step));
                    }
                    (Some(_), None) => {
                        return Err(l.runtime_error(1, "for statement step must be a number"))
                    }
                    _ => return Err(l.runtime_error(1, "for statement init must be a number")),
                }
                let mut stack = l.stack.borrow_mut();
                let cf = stack.last_mut().unwrap();
                cf.pc = (cf.pc as i64 + sbx as i64) as usize;
            }
            OpCode::ForLoop => {
                let init = l.reg.borrow().get(ra);
                let limit = l.reg.borrow().get(ra + 1);
                let step = l.reg.borrow().get(ra + 2);
                let Some(mut init) = init.as_number() else {
                    return Err(l.runtime_error(1, "for statement init must be a number"));
                };
                let Some(limit) = limit.as_number() else {
                    return Err(l.runtime_error(1, "for statement limit must be a number"));
                };
                let Some(step) = step.as_number() else {
                    return Err(l.runtime_error(1, "for statement step must be a number"));
                };
                init += step;
                l.reg.borrow_mut().set(ra, Value::Number(init));
                let in_range = (step > 0.0 && init <= limit) || (step <= 0.0 && init >= limit);
                if in_range {
                    let sbx = bc::get_arg_sbx(inst);
                    {
                        let mut stack = l.stack.borrow_mut();
                        let cf = stack.last_mut().unwrap();
                        cf.pc = (cf.pc as i64 + sbx as i64) as usize;
                    }
                    l.reg.borrow_mut().set(ra + 3, Value::Number(init));
                } else {
                    l.reg.borrow_mut().set_top(ra + 1);
                }
            }
            OpCode::TForLoop => {
                let c = bc::get_arg_c(inst);
                l.reg.borrow_mut().set_top(ra + 3);
                l.call_r(2, c, ra as i32 + 3)?;
                l.reg.borrow_mut().set_top(ra + 2 + c as usize + 1);
                let value = l.reg.borrow().get(ra + 3);
                if !value.is_nil() {
                    l.reg.borrow_mut().set(ra + 2, value);
                } else {
                    l.stack.borrow_mut().last_mut().unwrap().pc += 1;
                }
            }
            OpCode::SetList => {
                let b = bc::get_arg_b(inst);
                let mut c = bc::get_arg_c(inst);
                if c == 0 {
                    let mut stack = l.stack.borrow_mut();
                    let cf = stack.last_mut().unwrap();
                    c = fun.proto().unwrap().code[cf.pc] as i32;
                    cf.pc += 1;
                }
                let offset = (c - 1) * FIELDS_PER_FLUSH;
                let Value::Table(table) = l.reg.borrow().get(ra) else {
                    return Err(l.runtime_error(1, "attempt to initialize a non-table object"));
                };
                let nelem = if b == 0 {
                    l.reg.borrow().top() as i32 - ra as i32 - 1
                } else {
                    b
                };
                for i in 1..=nelem {
                    let v = l.reg.borrow().get(ra + i as usize);
                    table.raw_set_int((offset + i) as i64, v);
                }
            }
            OpCode::Close => {
                l.close_upvalues(ra);
            }
            OpCode::Closure => {
                let bx = bc::get_arg_bx(inst);
                let proto = fun.proto().unwrap().protos[bx as usize].clone();
                let nupvalues = proto.num_upvalues as usize;
                let closure = Rc::new(Function::new_lua(proto, fun.env()));
                l.reg
                    .borrow_mut()
                    .set(ra, Value::Function(closure.clone()));
                for i in 0..nupvalues {
                    // consume one capture pseudo-instruction per upvalue
                    let (pseudo, b) = {
                        let mut stack = l.stack.borrow_mut();
                        let cf = stack.last_mut().unwrap();
                        let word = fun.proto().unwrap().code[cf.pc];
                        cf.pc += 1;
                        (bc::get_opcode(word), bc::get_arg_b(word))
                    };
                    if pseudo == OpCode::Move as u32 {
                        closure.set_upvalue(i, l.find_upvalue(lbase + b as usize));
                    } else if pseudo == OpCode::GetUpval as u32 {
                        closure.set_upvalue(i, fun.upvalue(b as usize));
                    }
                }
            }
            OpCode::VarArg => {
                let b = bc::get_arg_b(inst);
                let (nparams, base, local_base, n_args) = {
                    let stack = l.stack.borrow();
                    let cf = stack.last().unwrap();
                    (
                        cf.fun.proto().unwrap().num_parameters as i32,
                        cf.base,
                        cf.local_base,
                        cf.n_args,
                    )
                };
                let nvarargs = (n_args - nparams).max(0);
                let nwant = if b == 0 { nvarargs } else { b - 1 };
                l.reg.borrow_mut().copy_range(
                    ra,
                    base + nparams as usize + 1,
                    local_base as i32,
                    nwant.max(0) as usize,
                );
            }
            OpCode::Nop => {}
        }
    }
}

fn lua_modulo(lhs: f64, rhs: f64) -> f64 {
    let v = lhs % rhs;
    if (lhs < 0.0 || rhs < 0.0) && !(lhs < 0.0 && rhs < 0.0) {
        v + rhs
    } else {
        v
    }
}

pub(crate) fn number_arith(opcode: OpCode, lhs: f64, rhs: f64) -> f64 {
    match opcode {
        OpCode::Add => lhs + rhs,
        OpCode::Sub => lhs - rhs,
        OpCode::Mul => lhs * rhs,
        OpCode::Div => lhs / rhs,
        OpCode::Mod => lua_modulo(lhs, rhs),
        OpCode::Pow => lhs.powf(rhs),
        _ => unreachable!("non-arithmetic opcode"),
    }
}

pub(crate) fn object_arith(
    l: &Rc<State>,
    opcode: OpCode,
    mut lhs: Value,
    mut rhs: Value,
) -> Result<Value, RuntimeError> {
    let event = match opcode {
        OpCode::Add => "__add",
        OpCode::Sub => "__sub",
        OpCode::Mul => "__mul",
        OpCode::Div => "__div",
        OpCode::Mod => "__mod",
        OpCode::Pow => "__pow",
        _ => unreachable!("non-arithmetic opcode"),
    };
    let op = l.meta_op2(&lhs, &rhs, event);
    if let Value::Function(_) = op {
        l.push(op);
        l.push(lhs);
        l.push(rhs);
        l.call(2, 1)?;
        return Ok(l.reg_pop());
    }
    if let Value::String(s) = &lhs {
        if let Some(n) = parse_number(&s.to_string_lossy()) {
            lhs = Value::Number(n);
        }
    }
    if let Value::String(s) = &rhs {
        if let Some(n) = parse_number(&s.to_string_lossy()) {
            rhs = Value::Number(n);
        }
    }
    if let (Some(v1), Some(v2)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(Value::Number(number_arith(opcode, v1, v2)));
    }
    Err(l.runtime_error(
        1,
        format!(
            "cannot perform {} operation between {} and {}",
            event.trim_start_matches('_'),
            lhs.type_name(),
            rhs.type_name()
        ),
    ))
}

/// Concatenates registers `last-total+1 ..= last` right to left,
/// joining convertible runs in one pass and falling back to `__concat`
/// at each non-convertible boundary.
pub(crate) fn string_concat(l: &Rc<State>, total: usize, last: usize) -> Result<Value, RuntimeError> {
    let mut rhs = l.reg.borrow().get(last);
    let mut total = total as i64 - 1;
    let mut i = last as i64 - 1;
    while total > 0 {
        let lhs = l.reg.borrow().get(i as usize);
        if !(lhs.can_convert_to_string() && rhs.can_convert_to_string()) {
            let op = l.meta_op2(&lhs, &rhs, "__concat");
            if let Value::Function(_) = op {
                l.push(op);
                l.push(lhs);
                l.push(rhs);
                l.call(2, 1)?;
                rhs = l.reg_pop();
                total -= 1;
                i -= 1;
            } else {
                return Err(l.runtime_error(
                    1,
                    format!(
                        "cannot perform concat operation between {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    ),
                ));
            }
        } else {
            let mut buf: Vec<Vec<u8>> = vec![rhs.coerce_string().unwrap().as_bytes().to_vec()];
            while total > 0 {
                let lhs = l.reg.borrow().get(i as usize);
                if !lhs.can_convert_to_string() {
                    break;
                }
                buf.push(lhs.coerce_string().unwrap().as_bytes().to_vec());
                i -= 1;
                total -= 1;
            }
            let mut joined = Vec::new();
            for part in buf.iter().rev() {
                joined.extend_from_slice(part);
            }
            rhs = Value::string(joined);
        }
    }
    Ok(rhs)
}

pub(crate) fn less_than(l: &Rc<State>, lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
    if let Some(v1) = lhs.as_number() {
        if let Some(v2) = rhs.as_number() {
            return Ok(v1 < v2);
        }
        return Err(compare_error(l, lhs, rhs));
    }
    if lhs.type_name() != rhs.type_name() {
        return Err(compare_error(l, lhs, rhs));
    }
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(a.as_bytes() < b.as_bytes()),
        _ => match object_rational(l, lhs, rhs, "__lt")? {
            Some(ret) => Ok(ret),
            None => Err(compare_error(l, lhs, rhs)),
        },
    }
}

fn less_than_eq(l: &Rc<State>, lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
    if let Some(v1) = lhs.as_number() {
        if let Some(v2) = rhs.as_number() {
            return Ok(v1 <= v2);
        }
        return Err(compare_error(l, lhs, rhs));
    }
    if lhs.type_name() != rhs.type_name() {
        return Err(compare_error(l, lhs, rhs));
    }
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(a.as_bytes() <= b.as_bytes()),
        _ => match object_rational(l, lhs, rhs, "__le")? {
            Some(ret) => Ok(ret),
            // a <= b falls back to not (b < a)
            None => match object_rational(l, rhs, lhs, "__lt")? {
                Some(ret) => Ok(!ret),
                None => Err(compare_error(l, lhs, rhs)),
            },
        },
    }
}

fn compare_error(l: &Rc<State>, lhs: &Value, rhs: &Value) -> RuntimeError {
    l.runtime_error(
        1,
        format!(
            "attempt to compare {} with {}",
            lhs.type_name(),
            rhs.type_name()
        ),
    )
}

pub(crate) fn equals(
    l: &Rc<State>,
    lhs: &Value,
    rhs: &Value,
    raw: bool,
) -> Result<bool, RuntimeError> {
    if lhs.type_name() != rhs.type_name() {
        return Ok(false);
    }
    match (lhs, rhs) {
        (Value::UserData(_), _) | (Value::Table(_), _) => {
            if lhs.raw_equals(rhs) {
                Ok(true)
            } else if raw {
                Ok(false)
            } else {
                // __eq only fires when both sides share the handler
                Ok(object_rational(l, lhs, rhs, "__eq")?.unwrap_or(false))
            }
        }
        _ => Ok(lhs.raw_equals(rhs)),
    }
}

/// Invokes a shared comparison metamethod; None when the operands do
/// not share one.
fn object_rational(
    l: &Rc<State>,
    lhs: &Value,
    rhs: &Value,
    event: &str,
) -> Result<Option<bool>, RuntimeError> {
    let m1 = l.meta_op1(lhs, event);
    let m2 = l.meta_op1(rhs, event);
    if let (Value::Function(f1), Value::Function(f2)) = (&m1, &m2) {
        if Rc::ptr_eq(f1, f2) {
            l.push(m1);
            l.push(lhs.clone());
            l.push(rhs.clone());
            l.call(2, 1)?;
            return Ok(Some(l.reg_pop().as_bool()));
        }
    }
    Ok(None)
}
