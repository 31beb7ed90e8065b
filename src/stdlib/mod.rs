//! Standard library modules. Each `open_*` builds its table and
//! registers it under the canonical global name; [open_libs] runs the
//! full set.

mod base;
mod channel;
mod coroutine;
mod math;
mod os;
mod string;
mod table;

pub use base::open_base;
pub use channel::open_channel;
pub use coroutine::open_coroutine;
pub use math::open_math;
pub use os::open_os;
pub use string::open_string;
pub use table::open_table;

use crate::state::State;
use crate::table::Table;
use crate::value::Value;
use std::rc::Rc;

pub fn open_libs(l: &Rc<State>) {
    open_base(l);
    open_table(l);
    open_os(l);
    open_string(l);
    open_math(l);
    open_channel(l);
    open_coroutine(l);
}

pub(crate) fn register_module(l: &Rc<State>, name: &str) -> Rc<Table> {
    let module = Table::with_capacity(0, 16).wrap();
    l.g.globals
        .borrow()
        .raw_set_string(name, Value::Table(module.clone()));
    module
}

pub(crate) fn set_fn(
    l: &Rc<State>,
    module: &Rc<Table>,
    name: &str,
    fun: impl Fn(&Rc<State>) -> Result<i32, crate::errors::RuntimeError> + 'static,
) {
    module.raw_set_string(name, Value::Function(l.new_function(fun)));
}
