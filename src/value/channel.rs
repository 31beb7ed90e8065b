use super::Value;
use crate::errors::RuntimeError;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// A bounded FIFO used for value handoff between coroutines of one
/// program.
///
/// Scheduling is cooperative, so operations never block: sending into a
/// full bounded channel is an error and receiving from an empty one
/// reports absence. A capacity of zero means unbounded.
pub struct Channel {
    queue: RefCell<VecDeque<Value>>,
    capacity: usize,
    closed: Cell<bool>,
}

impl Channel {
    pub fn new(capacity: usize) -> Channel {
        Channel {
            queue: RefCell::new(VecDeque::new()),
            capacity,
            closed: Cell::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn send(&self, value: Value) -> Result<(), RuntimeError> {
        if self.closed.get() {
            return Err(RuntimeError::runtime("send on a closed channel"));
        }
        let mut queue = self.queue.borrow_mut();
        if self.capacity > 0 && queue.len() >= self.capacity {
            return Err(RuntimeError::runtime("channel buffer is full"));
        }
        queue.push_back(value);
        Ok(())
    }

    /// Pops the oldest value; `None` when the channel is drained.
    pub fn receive(&self) -> Option<Value> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn close(&self) {
        self.closed.set(true);
    }
}
