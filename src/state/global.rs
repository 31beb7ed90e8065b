use super::State;
use crate::table::Table;
use crate::value::Value;
use crate::FastHashMap;
use downcast::{downcast, Any};
use std::any::TypeId;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub(crate) trait AppData: Any {}

impl<T: std::any::Any> AppData for T {}

downcast!(dyn AppData);

/// State shared by every coroutine of one program: the globals table,
/// the registry, the builtin metatables keyed by primitive type tag,
/// and host-attached data.
pub struct GlobalState {
    pub(crate) registry: RefCell<Rc<Table>>,
    pub(crate) globals: RefCell<Rc<Table>>,
    pub(crate) builtin_mts: RefCell<FastHashMap<u8, Value>>,
    pub(crate) main_thread: RefCell<Option<Weak<State>>>,
    pub(crate) current_thread: RefCell<Option<Weak<State>>>,
    pub(crate) app_data: RefCell<FastHashMap<TypeId, Box<dyn AppData>>>,
    /// Read by the memory-limit observer thread.
    pub(crate) mem_stop: Arc<AtomicBool>,
}

impl GlobalState {
    pub(crate) fn new() -> Rc<GlobalState> {
        Rc::new(GlobalState {
            registry: RefCell::new(Table::with_capacity(0, 32).wrap()),
            globals: RefCell::new(Table::with_capacity(0, 64).wrap()),
            builtin_mts: RefCell::new(FastHashMap::default()),
            main_thread: RefCell::new(None),
            current_thread: RefCell::new(None),
            app_data: RefCell::new(FastHashMap::default()),
            mem_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn current_thread_is(&self, thread: &Rc<State>) -> bool {
        self.current_thread
            .borrow()
            .as_ref()
            .is_some_and(|weak| weak.as_ptr() == Rc::as_ptr(thread))
    }

    pub(crate) fn set_current_thread(&self, thread: &Rc<State>) {
        *self.current_thread.borrow_mut() = Some(Rc::downgrade(thread));
    }
}
