use super::{vm, CallFrame, State};
use crate::errors::{ErrorKind, RuntimeError};
use crate::value::{Function, Value};
use crate::MULTRET;
use std::rc::Rc;

/// Lifecycle of a coroutine thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Suspended,
    Running,
    /// Alive but currently resuming another coroutine.
    Normal,
    Dead,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        }
    }
}

/// Outcome of resuming a coroutine.
#[derive(Debug)]
pub enum ResumeResult {
    /// The body returned; the coroutine is now dead.
    Ok(Vec<Value>),
    /// The body yielded these values.
    Yield(Vec<Value>),
    Error(RuntimeError),
}

impl State {
    pub fn status(self: &Rc<State>, th: &Rc<State>) -> ThreadStatus {
        if th.dead.get() {
            ThreadStatus::Dead
        } else if self.g.current_thread_is(th) {
            ThreadStatus::Running
        } else if self
            .parent
            .borrow()
            .as_ref()
            .is_some_and(|p| Rc::ptr_eq(p, th))
        {
            ThreadStatus::Normal
        } else {
            ThreadStatus::Suspended
        }
    }

    /// Transfers control into `th` until it yields, returns or fails.
    /// `fun` seeds the first resume; later resumes ignore it.
    pub fn resume(
        self: &Rc<State>,
        th: &Rc<State>,
        fun: Rc<Function>,
        args: &[Value],
    ) -> ResumeResult {
        let isstarted = th.is_started();
        if !isstarted {
            let pushed = th.stack.borrow_mut().push(CallFrame {
                fun,
                pc: 0,
                base: 0,
                local_base: 1,
                return_base: 0,
                n_args: 0,
                n_ret: MULTRET,
                parent: None,
                tail_call: 0,
            });
            if let Err(err) = pushed {
                return ResumeResult::Error(err);
            }
        }

        if self.g.current_thread_is(th) {
            return ResumeResult::Error(RuntimeError::new(
                ErrorKind::Run,
                "can not resume a running thread",
            ));
        }
        if th.dead.get() {
            return ResumeResult::Error(RuntimeError::new(
                ErrorKind::Run,
                "can not resume a dead thread",
            ));
        }

        *th.parent.borrow_mut() = Some(self.clone());
        self.g.set_current_thread(th);
        tracing::trace!(started = isstarted, "resuming coroutine");

        if !isstarted {
            th.started.set(true);
            th.set_top(0);
            for arg in args {
                th.push(arg.clone());
            }
            th.stack.borrow_mut().last_mut().unwrap().n_args = args.len() as i32;
            th.init_call_frame();
        } else {
            for arg in args {
                th.push(arg.clone());
            }
        }

        let top = self.get_top();
        if let Err(err) = vm::thread_run(th) {
            return ResumeResult::Error(err);
        }

        // the yielding side pushed a status flag followed by its values
        let haserror = self.get(top + 1).is_false();
        let mut ret = Vec::new();
        let mut idx = top + 2;
        while idx <= self.get_top() {
            ret.push(self.get(idx));
            idx += 1;
        }
        self.set_top(top);

        if haserror {
            let value = ret.first().cloned().unwrap_or(Value::Nil);
            ResumeResult::Error(RuntimeError::with_value(ErrorKind::Run, value))
        } else if th.stack.borrow().is_empty() {
            ResumeResult::Ok(ret)
        } else {
            ResumeResult::Yield(ret)
        }
    }

    /// Stages `values` for the resumer and returns the sentinel a host
    /// function hands back to suspend its thread.
    pub fn do_yield(&self, values: Vec<Value>) -> i32 {
        self.set_top(0);
        for value in values {
            self.push(value);
        }
        -1
    }
}
