use super::registers::Registers;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

enum UpvalueState {
    /// Points at a live register of the owning thread.
    Open {
        reg: Rc<RefCell<Registers>>,
        index: usize,
    },
    /// Owns its value; the one-way destination of every upvalue.
    Closed(Value),
}

/// A shared variable cell captured by one or more closures.
pub struct Upvalue {
    state: RefCell<UpvalueState>,
}

impl Upvalue {
    pub(crate) fn new_open(reg: Rc<RefCell<Registers>>, index: usize) -> Upvalue {
        Upvalue {
            state: RefCell::new(UpvalueState::Open { reg, index }),
        }
    }

    pub fn new_closed(value: Value) -> Upvalue {
        Upvalue {
            state: RefCell::new(UpvalueState::Closed(value)),
        }
    }

    pub fn value(&self) -> Value {
        match &*self.state.borrow() {
            UpvalueState::Open { reg, index } => reg.borrow().get(*index),
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    pub fn set_value(&self, value: Value) {
        match &mut *self.state.borrow_mut() {
            UpvalueState::Open { reg, index } => reg.borrow_mut().set(*index, value),
            UpvalueState::Closed(slot) => *slot = value,
        }
    }

    /// Snapshots the referenced register into the cell; a no-op when
    /// already closed.
    pub fn close(&self) {
        let value = self.value();
        *self.state.borrow_mut() = UpvalueState::Closed(value);
    }

    pub(crate) fn index(&self) -> Option<usize> {
        match &*self.state.borrow() {
            UpvalueState::Open { index, .. } => Some(*index),
            UpvalueState::Closed(_) => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.index().is_some()
    }
}
