//! VM threads and the embedding API.
//!
//! A [State] is one cooperative thread: a register file, a call-frame
//! stack and an open-upvalue list, sharing a [GlobalState] with every
//! other coroutine of the program. The host-facing API indexes the
//! thread's stack the conventional way: positive indices count from the
//! local base, negative from the top, and named pseudo-indices address
//! the registry, the environment and the globals.

mod coroutine;
mod frame;
mod global;
mod registers;
mod upvalue;
pub(crate) mod vm;

pub use coroutine::{ResumeResult, ThreadStatus};
pub use global::GlobalState;
pub use upvalue::Upvalue;

pub(crate) use frame::{CallFrame, FrameStack};
pub(crate) use registers::Registers;

use crate::errors::{ErrorKind, RuntimeError, StackTrace};
use crate::table::Table;
use crate::value::{FuncKind, Function, HostFn, LuaStr, UserData, Value};
use crate::{
    ENVIRON_INDEX, GLOBALS_INDEX, MAX_TABLE_GET_LOOP, MULTRET, REGISTRY_INDEX, REGISTRY_SIZE,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One VM thread and its embedding API surface.
pub struct State {
    pub(crate) g: Rc<GlobalState>,
    pub(crate) reg: Rc<RefCell<Registers>>,
    pub(crate) stack: RefCell<FrameStack>,
    pub(crate) parent: RefCell<Option<Rc<State>>>,
    pub(crate) env: RefCell<Rc<Table>>,
    pub(crate) open_upvalues: RefCell<Vec<Rc<Upvalue>>>,
    pub(crate) dead: Cell<bool>,
    pub(crate) started: Cell<bool>,
}

impl State {
    /// A fresh program with the standard library opened.
    pub fn new() -> Rc<State> {
        let state = State::new_bare();
        crate::stdlib::open_libs(&state);
        state
    }

    /// A fresh program with an empty globals table and no libraries.
    pub fn new_bare() -> Rc<State> {
        let g = GlobalState::new();
        let env = g.globals.borrow().clone();
        Rc::new(State {
            g,
            reg: Rc::new(RefCell::new(Registers::new(REGISTRY_SIZE))),
            stack: RefCell::new(FrameStack::new()),
            parent: RefCell::new(None),
            env: RefCell::new(env),
            open_upvalues: RefCell::new(Vec::new()),
            dead: Cell::new(false),
            started: Cell::new(false),
        })
    }

    /// Signals the memory-limit observer and tears down host resources.
    pub fn close(&self) {
        self.g
            .mem_stop
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /* thread bookkeeping */

    pub(crate) fn is_started(&self) -> bool {
        self.started.get()
    }

    pub(crate) fn kill(&self) {
        self.dead.set(true);
    }

    pub(crate) fn current_local_base(&self) -> usize {
        self.stack
            .borrow()
            .last()
            .map(|cf| cf.local_base)
            .unwrap_or(0)
    }

    fn index_to_reg(&self, idx: i32) -> i32 {
        let base = self.current_local_base() as i32;
        if idx > 0 {
            base + idx - 1
        } else if idx == 0 {
            -1
        } else {
            let tidx = self.reg.borrow().top() as i32 + idx;
            if tidx < base {
                -1
            } else {
                tidx
            }
        }
    }

    pub(crate) fn current_env(&self) -> Rc<Table> {
        self.env.borrow().clone()
    }

    /* stack manipulation */

    pub fn get_top(&self) -> i32 {
        self.reg.borrow().top() as i32 - self.current_local_base() as i32
    }

    pub fn set_top(&self, idx: i32) {
        let base = self.current_local_base();
        let newtop = self.index_to_reg(idx) + 1;
        if newtop < base as i32 {
            self.reg.borrow_mut().set_top(base);
        } else {
            self.reg.borrow_mut().set_top(newtop as usize);
        }
    }

    pub fn push(&self, value: Value) {
        self.reg.borrow_mut().push(value);
    }

    pub fn pop(&self, n: i32) -> Result<(), RuntimeError> {
        for _ in 0..n {
            if self.get_top() == 0 {
                return Err(self.runtime_error(1, "register underflow"));
            }
            self.reg.borrow_mut().pop();
        }
        Ok(())
    }

    pub(crate) fn reg_pop(&self) -> Value {
        self.reg.borrow_mut().pop()
    }

    pub fn get(&self, idx: i32) -> Value {
        let base = self.current_local_base();
        if idx > 0 {
            let reg = base + idx as usize - 1;
            if reg < self.reg.borrow().top() {
                return self.reg.borrow().get(reg);
            }
            Value::Nil
        } else if idx == 0 {
            Value::Nil
        } else if idx > REGISTRY_INDEX {
            let tidx = self.reg.borrow().top() as i32 + idx;
            if tidx < base as i32 {
                return Value::Nil;
            }
            self.reg.borrow().get(tidx as usize)
        } else {
            match idx {
                REGISTRY_INDEX => Value::Table(self.g.registry.borrow().clone()),
                ENVIRON_INDEX => match self.stack.borrow().last() {
                    None => Value::Table(self.env.borrow().clone()),
                    Some(cf) => Value::Table(cf.fun.env()),
                },
                GLOBALS_INDEX => Value::Table(self.g.globals.borrow().clone()),
                _ => {
                    let stack = self.stack.borrow();
                    let Some(cf) = stack.last() else {
                        return Value::Nil;
                    };
                    let index = (GLOBALS_INDEX - idx - 1) as usize;
                    if index < cf.fun.num_upvalues() {
                        cf.fun.upvalue(index).value()
                    } else {
                        Value::Nil
                    }
                }
            }
        }
    }

    pub fn replace(&self, idx: i32, value: Value) -> Result<(), RuntimeError> {
        let base = self.current_local_base();
        if idx > 0 {
            let reg = base + idx as usize - 1;
            if reg < self.reg.borrow().top() {
                self.reg.borrow_mut().set(reg, value);
            }
            Ok(())
        } else if idx == 0 {
            Ok(())
        } else if idx > REGISTRY_INDEX {
            let tidx = self.reg.borrow().top() as i32 + idx;
            if tidx >= base as i32 {
                self.reg.borrow_mut().set(tidx as usize, value);
            }
            Ok(())
        } else {
            match idx {
                REGISTRY_INDEX => match value {
                    Value::Table(t) => {
                        *self.g.registry.borrow_mut() = t;
                        Ok(())
                    }
                    other => Err(self.runtime_error(
                        1,
                        format!("registry must be a table({})", other.type_name()),
                    )),
                },
                ENVIRON_INDEX => {
                    let fun = {
                        let stack = self.stack.borrow();
                        stack.last().map(|cf| cf.fun.clone())
                    };
                    let Some(fun) = fun else {
                        return Err(self.runtime_error(1, "no calling environment"));
                    };
                    match value {
                        Value::Table(t) => {
                            fun.set_env(t);
                            Ok(())
                        }
                        other => Err(self.runtime_error(
                            1,
                            format!("environment must be a table({})", other.type_name()),
                        )),
                    }
                }
                GLOBALS_INDEX => match value {
                    Value::Table(t) => {
                        *self.g.globals.borrow_mut() = t;
                        Ok(())
                    }
                    other => Err(self.runtime_error(
                        1,
                        format!("_G must be a table({})", other.type_name()),
                    )),
                },
                _ => {
                    let stack = self.stack.borrow();
                    if let Some(cf) = stack.last() {
                        let index = (GLOBALS_INDEX - idx - 1) as usize;
                        if index < cf.fun.num_upvalues() {
                            cf.fun.upvalue(index).set_value(value);
                        }
                    }
                    Ok(())
                }
            }
        }
    }

    pub fn insert(&self, value: Value, index: i32) {
        let reg = self.index_to_reg(index);
        if reg < 0 {
            return;
        }
        let top = self.reg.borrow().top() as i32;
        if reg >= top {
            self.reg.borrow_mut().set(reg as usize, value);
            return;
        }
        let base = self.current_local_base() as i32;
        let reg = reg.max(base);
        self.reg.borrow_mut().insert(value, reg as usize);
    }

    pub fn remove(&self, index: i32) {
        let reg = self.index_to_reg(index);
        let top = self.reg.borrow().top() as i32;
        let base = self.current_local_base() as i32;
        if reg > top || reg < base {
            return;
        }
        if reg == top {
            let _ = self.pop(1);
            return;
        }
        let mut registers = self.reg.borrow_mut();
        for i in reg..top - 1 {
            let v = registers.get(i as usize + 1);
            registers.set(i as usize, v);
        }
        registers.set_top(top as usize - 1);
    }

    /* object allocation */

    pub fn new_table(&self) -> Rc<Table> {
        Table::with_capacity(32, 32).wrap()
    }

    pub fn create_table(&self, acap: usize, hcap: usize) -> Rc<Table> {
        Table::with_capacity(acap, hcap).wrap()
    }

    /// A new coroutine thread sharing this program's global state.
    pub fn new_thread(self: &Rc<State>) -> Rc<State> {
        Rc::new(State {
            g: self.g.clone(),
            reg: Rc::new(RefCell::new(Registers::new(REGISTRY_SIZE))),
            stack: RefCell::new(FrameStack::new()),
            parent: RefCell::new(None),
            env: RefCell::new(self.env.borrow().clone()),
            open_upvalues: RefCell::new(Vec::new()),
            dead: Cell::new(false),
            started: Cell::new(false),
        })
    }

    pub fn new_userdata(&self) -> Rc<UserData> {
        Rc::new(UserData::new(self.current_env()))
    }

    pub fn new_function(
        &self,
        fun: impl Fn(&Rc<State>) -> Result<i32, RuntimeError> + 'static,
    ) -> Rc<Function> {
        Rc::new(Function::new_host(Rc::new(fun), self.current_env(), 0))
    }

    /// A host function with preset closed upvalues.
    pub fn new_closure(
        &self,
        fun: impl Fn(&Rc<State>) -> Result<i32, RuntimeError> + 'static,
        upvalues: Vec<Value>,
    ) -> Rc<Function> {
        let f = Function::new_host(Rc::new(fun) as HostFn, self.current_env(), upvalues.len());
        for (i, value) in upvalues.into_iter().enumerate() {
            f.set_upvalue(i, Rc::new(Upvalue::new_closed(value)));
        }
        Rc::new(f)
    }

    /* type coercions */

    pub fn to_bool(&self, n: i32) -> bool {
        self.get(n).as_bool()
    }

    pub fn to_number(&self, n: i32) -> f64 {
        self.get(n).coerce_number().unwrap_or(0.0)
    }

    pub fn to_int(&self, n: i32) -> i64 {
        self.to_number(n) as i64
    }

    pub fn to_lua_string(&self, n: i32) -> String {
        self.get(n)
            .coerce_string()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn to_table(&self, n: i32) -> Option<Rc<Table>> {
        self.get(n).as_table().cloned()
    }

    pub fn to_function(&self, n: i32) -> Option<Rc<Function>> {
        self.get(n).as_function().cloned()
    }

    pub fn to_thread(&self, n: i32) -> Option<Rc<State>> {
        match self.get(n) {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_channel(&self, n: i32) -> Option<Rc<crate::value::Channel>> {
        match self.get(n) {
            Value::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn to_userdata(&self, n: i32) -> Option<Rc<UserData>> {
        match self.get(n) {
            Value::UserData(u) => Some(u),
            _ => None,
        }
    }

    /* argument checks used by library functions */

    pub fn check_any(&self, n: i32) -> Result<Value, RuntimeError> {
        if n > self.get_top() {
            return Err(self.arg_error(n, "value expected"));
        }
        Ok(self.get(n))
    }

    pub fn check_number(&self, n: i32) -> Result<f64, RuntimeError> {
        self.get(n)
            .coerce_number()
            .ok_or_else(|| self.type_arg_error(n, "number"))
    }

    pub fn check_int(&self, n: i32) -> Result<i64, RuntimeError> {
        Ok(self.check_number(n)? as i64)
    }

    pub fn check_string(&self, n: i32) -> Result<LuaStr, RuntimeError> {
        self.get(n)
            .coerce_string()
            .ok_or_else(|| self.type_arg_error(n, "string"))
    }

    pub fn check_table(&self, n: i32) -> Result<Rc<Table>, RuntimeError> {
        self.to_table(n)
            .ok_or_else(|| self.type_arg_error(n, "table"))
    }

    pub fn check_function(&self, n: i32) -> Result<Rc<Function>, RuntimeError> {
        self.to_function(n)
            .ok_or_else(|| self.type_arg_error(n, "function"))
    }

    pub fn check_thread(&self, n: i32) -> Result<Rc<State>, RuntimeError> {
        self.to_thread(n)
            .ok_or_else(|| self.type_arg_error(n, "thread"))
    }

    pub fn check_channel(&self, n: i32) -> Result<Rc<crate::value::Channel>, RuntimeError> {
        self.to_channel(n)
            .ok_or_else(|| self.type_arg_error(n, "channel"))
    }

    pub fn opt_number(&self, n: i32, default: f64) -> Result<f64, RuntimeError> {
        if self.get(n).is_nil() {
            return Ok(default);
        }
        self.check_number(n)
    }

    pub fn opt_int(&self, n: i32, default: i64) -> Result<i64, RuntimeError> {
        Ok(self.opt_number(n, default as f64)? as i64)
    }

    pub fn opt_string(&self, n: i32, default: &str) -> Result<LuaStr, RuntimeError> {
        if self.get(n).is_nil() {
            return Ok(LuaStr::from(default));
        }
        self.check_string(n)
    }

    pub fn arg_error(&self, n: i32, message: impl std::fmt::Display) -> RuntimeError {
        self.runtime_error(1, format!("bad argument #{n} ({message})"))
    }

    fn type_arg_error(&self, n: i32, expected: &str) -> RuntimeError {
        let received = self.get(n).type_name();
        self.arg_error(n, format!("{expected} expected, got {received}"))
    }

    /* error handling */

    pub(crate) fn close_all_upvalues(&self) {
        self.close_upvalues(0);
    }

    pub(crate) fn close_upvalues(&self, idx: usize) {
        let drained: Vec<Rc<Upvalue>> = {
            let mut list = self.open_upvalues.borrow_mut();
            match list
                .iter()
                .position(|uv| uv.index().map_or(true, |i| i >= idx))
            {
                Some(pos) => list.drain(pos..).collect(),
                None => Vec::new(),
            }
        };
        for uv in drained {
            uv.close();
        }
    }

    pub(crate) fn find_upvalue(&self, idx: usize) -> Rc<Upvalue> {
        let mut list = self.open_upvalues.borrow_mut();
        let mut insert_at = list.len();
        for (i, uv) in list.iter().enumerate() {
            match uv.index() {
                Some(existing) if existing == idx => return uv.clone(),
                Some(existing) if existing > idx => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let uv = Rc::new(Upvalue::new_open(self.reg.clone(), idx));
        list.insert(insert_at, uv.clone());
        uv
    }

    /// Builds a runtime error whose message carries the source position
    /// (for `level` > 0) and the assembled traceback.
    pub fn runtime_error(&self, level: i32, message: impl Into<String>) -> RuntimeError {
        self.close_all_upvalues();
        let mut message = message.into();
        if level > 0 {
            message = format!("{} {}", self.where_(level - 1), message);
            message = self.stack_trace(&message, true);
        }
        RuntimeError::new(ErrorKind::Run, message)
    }

    /// Raises `value` as an error; strings gain position and traceback.
    pub fn error_value(&self, value: Value, level: i32) -> RuntimeError {
        match &value {
            Value::String(s) => self.runtime_error(level, s.to_string_lossy().into_owned()),
            _ => {
                self.close_all_upvalues();
                RuntimeError::with_value(ErrorKind::Run, value)
            }
        }
    }

    /// `source:line:` of the frame `level` levels up, or an empty
    /// string.
    pub fn where_(&self, level: i32) -> String {
        let stack = self.stack.borrow();
        let Some(idx) = self.frame_at_level(&stack, level) else {
            return String::new();
        };
        let cf = stack.at(idx);
        let Some(proto) = cf.fun.proto() else {
            return String::new();
        };
        let line = if cf.pc > 0 {
            proto.source_line(cf.pc - 1)
        } else {
            0
        };
        format!("{}:{}:", proto.source_name, line)
    }

    fn frame_at_level(&self, stack: &FrameStack, level: i32) -> Option<usize> {
        if stack.is_empty() {
            return None;
        }
        let mut level = level;
        let mut idx = Some(stack.sp() - 1);
        while level > 0 {
            let i = idx?;
            let cf = stack.at(i);
            level -= 1;
            if !cf.fun.is_host() {
                level -= cf.tail_call;
            }
            idx = cf.parent;
        }
        if level <= 0 {
            idx
        } else {
            None
        }
    }

    /// Appends the call trace to `message`, collapsing the middle of
    /// deep stacks.
    pub fn stack_trace(&self, message: &str, include_current: bool) -> String {
        let mut trace = StackTrace::new(message);
        let stack = self.stack.borrow();
        if !stack.is_empty() {
            let mut level = if include_current { 0 } else { 1 };
            while let Some(idx) = self.frame_at_level(&stack, level) {
                let cf = stack.at(idx);
                trace.push(format!(
                    "\t{} in {}",
                    self.where_(level),
                    self.frame_func_name(&stack, idx)
                ));
                if !cf.fun.is_host() && cf.tail_call > 0 {
                    for _ in 0..cf.tail_call {
                        trace.push("\t(tailcall): ?".to_string());
                        level += 1;
                    }
                }
                level += 1;
            }
        }
        trace.render()
    }

    fn frame_func_name(&self, stack: &FrameStack, idx: usize) -> String {
        let cf = stack.at(idx);
        let Some(parent_idx) = cf.parent else {
            return if self.parent.borrow().is_none() {
                "main chunk".to_string()
            } else {
                "coroutine".to_string()
            };
        };
        let parent = stack.at(parent_idx);
        if !parent.fun.is_host() {
            if let Some(proto) = parent.fun.proto() {
                let pc = parent.pc.saturating_sub(1) as u32;
                for call in &proto.dbg_calls {
                    if call.pc == pc {
                        let mut name = call.name.clone();
                        if (name == "?" || cf.tail_call > 0) && !cf.fun.is_host() {
                            if let Some(p) = cf.fun.proto() {
                                name = format!("<{}:{}>", p.source_name, p.line_defined);
                            }
                        }
                        return name;
                    }
                }
            }
        }
        "anonymous function".to_string()
    }

    /* metatables */

    pub(crate) fn metatable(&self, value: &Value, raw: bool) -> Value {
        let mut metatable = match value {
            Value::Table(t) => t.metatable(),
            Value::UserData(u) => u.metatable(),
            other => self
                .g
                .builtin_mts
                .borrow()
                .get(&other.type_name().tag())
                .cloned()
                .unwrap_or(Value::Nil),
        };

        if !raw && !metatable.is_nil() {
            if let Value::Table(t) = &metatable {
                let locked = t.raw_get_string("__metatable");
                if !locked.is_nil() {
                    metatable = locked;
                }
            }
        }

        metatable
    }

    pub(crate) fn meta_op1(&self, value: &Value, event: &str) -> Value {
        if let Value::Table(mt) = self.metatable(value, true) {
            return mt.raw_get_string(event);
        }
        Value::Nil
    }

    pub(crate) fn meta_op2(&self, value1: &Value, value2: &Value, event: &str) -> Value {
        if let Value::Table(mt) = self.metatable(value1, true) {
            let ret = mt.raw_get_string(event);
            if !ret.is_nil() {
                return ret;
            }
        }
        if let Value::Table(mt) = self.metatable(value2, true) {
            return mt.raw_get_string(event);
        }
        Value::Nil
    }

    /// Resolves a callable: the value itself, or its `__call`
    /// metamethod (in which case the original value becomes argument
    /// zero).
    pub(crate) fn meta_call(&self, value: &Value) -> (Option<Rc<Function>>, bool) {
        if let Value::Function(f) = value {
            return (Some(f.clone()), false);
        }
        if let Value::Function(f) = self.meta_op1(value, "__call") {
            return (Some(f), true);
        }
        (None, false)
    }

    pub fn get_metatable(&self, value: &Value) -> Value {
        self.metatable(value, false)
    }

    pub fn set_metatable(&self, value: &Value, mt: Value) -> Result<(), RuntimeError> {
        match &mt {
            Value::Nil | Value::Table(_) => {}
            other => {
                return Err(self.runtime_error(
                    1,
                    format!("metatable must be a table or nil, but got {}", other.type_name()),
                ))
            }
        }
        match value {
            Value::Table(t) => t.set_metatable(mt),
            Value::UserData(u) => u.set_metatable(mt),
            other => {
                self.g
                    .builtin_mts
                    .borrow_mut()
                    .insert(other.type_name().tag(), mt);
            }
        }
        Ok(())
    }

    /* environments */

    pub fn get_fenv(&self, value: &Value) -> Value {
        match value {
            Value::Function(f) => Value::Table(f.env()),
            Value::UserData(u) => Value::Table(u.env()),
            Value::Thread(t) => Value::Table(t.env.borrow().clone()),
            _ => Value::Nil,
        }
    }

    pub fn set_fenv(&self, value: &Value, env: Value) -> Result<(), RuntimeError> {
        let Value::Table(t) = env else {
            return Err(self.runtime_error(
                1,
                format!("cannot use {} as an environment", env.type_name()),
            ));
        };
        match value {
            Value::Function(f) => f.set_env(t),
            Value::UserData(u) => u.set_env(t),
            Value::Thread(th) => *th.env.borrow_mut() = t,
            _ => {}
        }
        Ok(())
    }

    /* table access */

    pub fn raw_get(&self, table: &Rc<Table>, key: &Value) -> Value {
        table.raw_get(key)
    }

    pub fn raw_set(
        &self,
        table: &Rc<Table>,
        key: Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match &key {
            Value::Number(n) if n.is_nan() => Err(self.runtime_error(1, "table index is NaN")),
            Value::Nil => Err(self.runtime_error(1, "table index is nil")),
            Value::Channel(_) => Err(self.runtime_error(1, "table index is channel")),
            _ => table.raw_set(key, value),
        }
    }

    /// Metamethod-respecting read, following `__index` chains a bounded
    /// number of hops.
    pub fn get_field(self: &Rc<State>, obj: &Value, key: &Value) -> Result<Value, RuntimeError> {
        let mut current = obj.clone();
        for _ in 0..MAX_TABLE_GET_LOOP {
            let mut is_table = false;
            if let Value::Table(t) = &current {
                is_table = true;
                let ret = t.raw_get(key);
                if !ret.is_nil() {
                    return Ok(ret);
                }
            }
            let metaindex = self.meta_op1(&current, "__index");
            match metaindex {
                Value::Nil => {
                    if !is_table {
                        return Err(self.runtime_error(
                            1,
                            format!("attempt to index a non-table object({})", current.type_name()),
                        ));
                    }
                    return Ok(Value::Nil);
                }
                Value::Function(_) => {
                    self.push(metaindex);
                    self.push(current);
                    self.push(key.clone());
                    self.call(2, 1)?;
                    return Ok(self.reg_pop());
                }
                other => current = other,
            }
        }
        Err(self.runtime_error(1, "too many recursions in gettable"))
    }

    /// Metamethod-respecting write, following `__newindex` chains a
    /// bounded number of hops.
    pub fn set_field(
        self: &Rc<State>,
        obj: &Value,
        key: &Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let mut current = obj.clone();
        for _ in 0..MAX_TABLE_GET_LOOP {
            let mut table = None;
            if let Value::Table(t) = &current {
                if !t.raw_get(key).is_nil() {
                    return self.raw_set(t, key.clone(), value);
                }
                table = Some(t.clone());
            }
            let metaindex = self.meta_op1(&current, "__newindex");
            match metaindex {
                Value::Nil => {
                    let Some(t) = table else {
                        return Err(self.runtime_error(
                            1,
                            format!("attempt to index a non-table object({})", current.type_name()),
                        ));
                    };
                    return self.raw_set(&t, key.clone(), value);
                }
                Value::Function(_) => {
                    self.push(metaindex);
                    self.push(current);
                    self.push(key.clone());
                    self.push(value);
                    self.call(3, 0)?;
                    return Ok(());
                }
                other => current = other,
            }
        }
        Err(self.runtime_error(1, "too many recursions in settable"))
    }

    pub fn get_field_string(self: &Rc<State>, obj: &Value, key: &str) -> Result<Value, RuntimeError> {
        self.get_field(obj, &Value::string(key))
    }

    pub fn set_field_string(
        self: &Rc<State>,
        obj: &Value,
        key: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        self.set_field(obj, &Value::string(key), value)
    }

    /// Reads a global; metamethod failures surface as nil.
    pub fn get_global(self: &Rc<State>, name: &str) -> Value {
        let globals = Value::Table(self.g.globals.borrow().clone());
        self.get_field_string(&globals, name).unwrap_or(Value::Nil)
    }

    pub fn set_global(self: &Rc<State>, name: &str, value: Value) -> Result<(), RuntimeError> {
        let globals = Value::Table(self.g.globals.borrow().clone());
        self.set_field_string(&globals, name, value)
    }

    /// Registers a host function under a global name.
    pub fn register(
        self: &Rc<State>,
        name: &str,
        fun: impl Fn(&Rc<State>) -> Result<i32, RuntimeError> + 'static,
    ) {
        let f = self.new_function(fun);
        self.g
            .globals
            .borrow()
            .raw_set_string(name, Value::Function(f));
    }

    pub fn next(&self, table: &Rc<Table>, key: &Value) -> Result<Option<(Value, Value)>, RuntimeError> {
        table.next(key)
    }

    pub fn for_each(&self, table: &Rc<Table>, f: impl FnMut(&Value, &Value)) {
        table.for_each(f);
    }

    /// `#v` with `__len` honored for non-strings.
    pub fn obj_len(self: &Rc<State>, value: &Value) -> Result<i64, RuntimeError> {
        if let Value::String(s) = value {
            return Ok(s.len() as i64);
        }
        let op = self.meta_op1(value, "__len");
        if let Value::Function(_) = op {
            self.push(op);
            self.push(value.clone());
            self.call(1, 1)?;
            let ret = self.reg_pop();
            if let Value::Number(n) = ret {
                return Ok(n as i64);
            }
            return Ok(0);
        }
        if let Value::Table(t) = value {
            return Ok(t.len());
        }
        Ok(0)
    }

    /* comparisons and concatenation */

    pub fn less_than(self: &Rc<State>, lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
        vm::less_than(self, lhs, rhs)
    }

    pub fn equal(self: &Rc<State>, lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
        vm::equals(self, lhs, rhs, false)
    }

    pub fn raw_equal(&self, lhs: &Value, rhs: &Value) -> bool {
        lhs.raw_equals(rhs)
    }

    pub fn concat_values(self: &Rc<State>, values: Vec<Value>) -> Result<String, RuntimeError> {
        let top = self.reg.borrow().top();
        let count = values.len();
        for value in values {
            self.push(value);
        }
        let last = self.reg.borrow().top() - 1;
        let ret = vm::string_concat(self, count, last);
        self.reg.borrow_mut().set_top(top);
        Ok(ret?.display_string())
    }

    /// Default `tostring` behavior: `__tostring` when present, raw
    /// rendering otherwise.
    pub fn tostring_value(self: &Rc<State>, value: &Value) -> Result<Value, RuntimeError> {
        if let Value::Function(_) = self.meta_op1(value, "__tostring") {
            let op = self.meta_op1(value, "__tostring");
            self.push(op);
            self.push(value.clone());
            self.call(1, 1)?;
            Ok(self.reg_pop())
        } else {
            Ok(Value::string(value.display_string()))
        }
    }

    /* loading and calling */

    /// Loads a chunk: precompiled bytes (recognized by the signature)
    /// or source text. The result closes over the current environment.
    pub fn load(&self, chunk: &[u8], name: &str) -> Result<Rc<Function>, RuntimeError> {
        let proto = if chunk.first() == Some(&crate::bytecode::CHUNK_SIGNATURE[0]) {
            crate::bytecode::undump(&mut &chunk[..])
                .map_err(|e| RuntimeError::new(ErrorKind::Syntax, e.to_string()))?
        } else {
            let source = std::str::from_utf8(chunk)
                .map_err(|_| RuntimeError::new(ErrorKind::Syntax, "invalid chunk encoding"))?;
            crate::compiler::compile_source(source, name)
                .map_err(|e| RuntimeError::new(ErrorKind::Syntax, e.to_string()))?
        };
        Ok(Rc::new(Function::new_lua(proto, self.current_env())))
    }

    pub fn load_string(&self, source: &str, name: &str) -> Result<Rc<Function>, RuntimeError> {
        self.load(source.as_bytes(), name)
    }

    pub fn load_file(&self, path: &str) -> Result<Rc<Function>, RuntimeError> {
        let bytes = std::fs::read(path)
            .map_err(|e| RuntimeError::new(ErrorKind::File, format!("cannot open {path}: {e}")))?;
        self.load(&bytes, path)
    }

    /// Compiles and runs `source` under a protected call.
    pub fn do_string(self: &Rc<State>, source: &str, name: &str) -> Result<(), RuntimeError> {
        let f = self.load_string(source, name)?;
        self.push(Value::Function(f));
        self.pcall(0, MULTRET, None)
    }

    pub fn do_file(self: &Rc<State>, path: &str) -> Result<(), RuntimeError> {
        let f = self.load_file(path)?;
        self.push(Value::Function(f));
        self.pcall(0, MULTRET, None)
    }

    /// Unprotected call: the function and `nargs` arguments must be on
    /// the stack; `nret` results replace them.
    pub fn call(self: &Rc<State>, nargs: i32, nret: i32) -> Result<(), RuntimeError> {
        self.call_r(nargs, nret, -1)
    }

    pub(crate) fn call_r(self: &Rc<State>, nargs: i32, nret: i32, rbase: i32) -> Result<(), RuntimeError> {
        let base = self.reg.borrow().top() as i32 - nargs - 1;
        let rbase = if rbase < 0 { base } else { rbase };
        let lv = self.reg.borrow().get(base as usize);
        let (fun, meta) = self.meta_call(&lv);
        let parent = {
            let stack = self.stack.borrow();
            if stack.is_empty() {
                None
            } else {
                Some(stack.sp() - 1)
            }
        };
        self.push_call_frame(
            CallFrame {
                fun: match fun {
                    Some(f) => f,
                    None => {
                        return Err(self.runtime_error(1, "attempt to call a non-function object"))
                    }
                },
                pc: 0,
                base: base as usize,
                local_base: base as usize + 1,
                return_base: rbase as usize,
                n_args: nargs,
                n_ret: nret,
                parent,
                tail_call: 0,
            },
            lv,
            meta,
        )?;

        let start = self.stack.borrow().sp() - 1;
        if self.g.main_thread.borrow().is_none() {
            *self.g.main_thread.borrow_mut() = Some(Rc::downgrade(self));
            self.g.set_current_thread(self);
            vm::main_loop(self, None)?;
        } else {
            vm::main_loop(self, Some(start))?;
        }
        if nret != MULTRET {
            self.reg.borrow_mut().set_top((rbase + nret) as usize);
        }
        Ok(())
    }

    pub(crate) fn push_call_frame(
        self: &Rc<State>,
        mut cf: CallFrame,
        fn_value: Value,
        meta: bool,
    ) -> Result<(), RuntimeError> {
        if meta {
            cf.n_args += 1;
            self.reg.borrow_mut().insert(fn_value, cf.local_base);
        }
        let pushed = self.stack.borrow_mut().push(cf);
        if let Err(err) = pushed {
            return Err(self.runtime_error(1, err.value.display_string()));
        }
        self.init_call_frame();
        self.started.set(true);
        Ok(())
    }

    /// Prepares the freshly pushed frame: pads missing arguments with
    /// nil and, for vararg functions, rotates named parameters above
    /// the varargs (materializing the legacy `arg` table when needed).
    pub(crate) fn init_call_frame(&self) {
        let mut stack = self.stack.borrow_mut();
        let cf = stack.last_mut().expect("init on empty call stack");
        let mut registers = self.reg.borrow_mut();

        if cf.fun.is_host() {
            registers.set_top(cf.local_base + cf.n_args.max(0) as usize);
            return;
        }

        let proto = cf.fun.proto().unwrap().clone();
        let mut nargs = cf.n_args.max(0) as usize;
        let np = proto.num_parameters as usize;
        let nvarargs = nargs.saturating_sub(np);

        for i in nargs..np {
            registers.set(cf.local_base + i, Value::Nil);
            nargs = np;
        }

        if proto.is_vararg & crate::bytecode::VARARG_IS_VARARG != 0 {
            registers.set_top(cf.local_base + nargs + np);
            for i in 0..np {
                let v = registers.get(cf.local_base + i);
                registers.set(cf.local_base + nargs + i, v);
                registers.set(cf.local_base + i, Value::Nil);
            }

            if crate::COMPAT_VARARG {
                registers.set_top(cf.local_base + nargs + np + 1);
                if proto.is_vararg & crate::bytecode::VARARG_NEEDS_ARG != 0 {
                    let argtb = Table::with_capacity(nvarargs, 0);
                    for i in 0..nvarargs {
                        argtb.raw_set_int(i as i64 + 1, registers.get(cf.local_base + np + i));
                    }
                    argtb.raw_set_string("n", Value::Number(nvarargs as f64));
                    registers.set(cf.local_base + nargs + np, Value::Table(argtb.wrap()));
                } else {
                    registers.set(cf.local_base + nargs + np, Value::Nil);
                }
            }
            cf.local_base += nargs;
        } else {
            for i in np..nargs {
                registers.set(cf.local_base + i, Value::Nil);
            }
            registers.set_top(cf.local_base + np + 1);
        }

        let maxreg = cf.local_base + proto.num_used_registers as usize;
        registers.set_top(maxreg);
    }

    pub(crate) fn rk_value(&self, idx: i32) -> Value {
        if crate::bytecode::is_k(idx) {
            let stack = self.stack.borrow();
            let cf = stack.last().unwrap();
            cf.fun.proto().unwrap().constants[crate::bytecode::index_k(idx) as usize].clone()
        } else {
            let lbase = self.current_local_base();
            self.reg.borrow().get(lbase + idx as usize)
        }
    }

    /// Protected call; on failure the optional handler sees the error
    /// value, then the stack unwinds to the pre-call shape and the
    /// error is returned.
    pub fn pcall(
        self: &Rc<State>,
        nargs: i32,
        nret: i32,
        errfunc: Option<Rc<Function>>,
    ) -> Result<(), RuntimeError> {
        let sp = self.stack.borrow().sp();
        let base = self.reg.borrow().top() as i32 - nargs - 1;

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.call(nargs, nret)
        }));

        let mut err = match outcome {
            Ok(Ok(())) => {
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(panic) => RuntimeError::new(ErrorKind::Panic, panic_message(panic)),
        };

        if err.kind != ErrorKind::Panic {
            if let Some(handler) = errfunc {
                self.push(Value::Function(handler));
                self.push(err.value.clone());
                let handled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    self.call(1, 1)
                }));
                match handled {
                    Ok(Ok(())) => {}
                    Ok(Err(handler_err)) => {
                        err = RuntimeError::with_value(ErrorKind::Error, handler_err.value);
                    }
                    Err(panic) => {
                        err = RuntimeError::new(ErrorKind::Panic, panic_message(panic));
                    }
                }
            }
        }

        self.reg.borrow_mut().set_top(base.max(0) as usize);
        self.stack.borrow_mut().set_sp(sp);
        Err(err)
    }

    /* coroutine operations are in coroutine.rs */

    /// Moves the top `n` values of this thread onto `other`.
    pub fn xmove_to(self: &Rc<State>, other: &Rc<State>, n: i32) {
        if Rc::ptr_eq(self, other) {
            return;
        }
        let top = self.get_top();
        let n = n.min(top);
        for i in (1..=n).rev() {
            other.push(self.get(top - i + 1));
        }
        self.set_top(top - n);
    }

    /* host-attached data */

    pub fn set_app_data<T: std::any::Any>(&self, value: T) {
        self.g
            .app_data
            .borrow_mut()
            .insert(std::any::TypeId::of::<T>(), Box::new(value));
    }

    pub fn app_data<T: std::any::Any + Clone>(&self) -> Option<T> {
        self.g
            .app_data
            .borrow()
            .get(&std::any::TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>().ok().cloned())
    }

    pub fn remove_app_data<T: std::any::Any>(&self) {
        self.g.app_data.borrow_mut().remove(&std::any::TypeId::of::<T>());
    }

    /* memory limit */

    /// Caps the process at `mx` megabytes of tracked allocations,
    /// sampled by a background observer. Main thread only.
    pub fn set_memory_limit(&self, mx: usize) -> Result<(), RuntimeError> {
        if self.parent.borrow().is_some() {
            return Err(self.runtime_error(1, "sub threads are not allowed to set a memory limit"));
        }
        crate::memory::spawn_observer(mx * 1024 * 1024, self.g.mem_stop.clone());
        Ok(())
    }

    /// Dumps a Lua function's prototype as a precompiled chunk.
    pub fn dump_function(&self, fun: &Rc<Function>, strip: bool) -> Result<Vec<u8>, RuntimeError> {
        match &fun.kind {
            FuncKind::Lua(proto) => {
                let mut out = Vec::new();
                crate::bytecode::dump(proto, &mut out, strip)?;
                Ok(out)
            }
            FuncKind::Host(_) => Err(self.runtime_error(1, "unable to dump given function")),
        }
    }

}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "host panic".to_string()
    }
}
