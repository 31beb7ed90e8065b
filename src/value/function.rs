use crate::bytecode::FunctionProto;
use crate::errors::RuntimeError;
use crate::state::{State, Upvalue};
use crate::table::Table;
use std::cell::RefCell;
use std::rc::Rc;
use thin_vec::ThinVec;

/// A host-provided function. Arguments arrive on the calling thread's
/// stack; the return value is the number of results pushed, or a
/// negative count to signal a coroutine yield.
pub type HostFn = Rc<dyn Fn(&Rc<State>) -> Result<i32, RuntimeError>>;

pub enum FuncKind {
    Lua(Rc<FunctionProto>),
    Host(HostFn),
}

/// A callable value: a bytecode closure (prototype + captured upvalues)
/// or a host function, each paired with an environment table.
pub struct Function {
    pub(crate) kind: FuncKind,
    pub(crate) env: RefCell<Rc<Table>>,
    pub(crate) upvalues: RefCell<ThinVec<Rc<Upvalue>>>,
}

impl Function {
    pub fn new_lua(proto: Rc<FunctionProto>, env: Rc<Table>) -> Function {
        let n = proto.num_upvalues as usize;
        Function {
            kind: FuncKind::Lua(proto),
            env: RefCell::new(env),
            upvalues: RefCell::new(nil_upvalues(n)),
        }
    }

    pub fn new_host(host: HostFn, env: Rc<Table>, num_upvalues: usize) -> Function {
        Function {
            kind: FuncKind::Host(host),
            env: RefCell::new(env),
            upvalues: RefCell::new(nil_upvalues(num_upvalues)),
        }
    }

    #[inline]
    pub fn is_host(&self) -> bool {
        matches!(self.kind, FuncKind::Host(_))
    }

    pub fn proto(&self) -> Option<&Rc<FunctionProto>> {
        match &self.kind {
            FuncKind::Lua(proto) => Some(proto),
            FuncKind::Host(_) => None,
        }
    }

    pub fn env(&self) -> Rc<Table> {
        self.env.borrow().clone()
    }

    pub fn set_env(&self, env: Rc<Table>) {
        *self.env.borrow_mut() = env;
    }

    pub(crate) fn upvalue(&self, index: usize) -> Rc<Upvalue> {
        self.upvalues.borrow()[index].clone()
    }

    pub(crate) fn set_upvalue(&self, index: usize, upvalue: Rc<Upvalue>) {
        self.upvalues.borrow_mut()[index] = upvalue;
    }

    pub fn num_upvalues(&self) -> usize {
        self.upvalues.borrow().len()
    }
}

// each slot is its own cell; CLOSURE replaces them one by one
fn nil_upvalues(n: usize) -> ThinVec<Rc<Upvalue>> {
    let mut upvalues = ThinVec::with_capacity(n);
    for _ in 0..n {
        upvalues.push(Rc::new(Upvalue::new_closed(crate::value::Value::Nil)));
    }
    upvalues
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FuncKind::Lua(proto) => write!(
                f,
                "function <{}:{}>",
                proto.source_name, proto.line_defined
            ),
            FuncKind::Host(_) => write!(f, "function (host)"),
        }
    }
}
