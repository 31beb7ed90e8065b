use super::Value;
use crate::table::Table;
use downcast::{downcast, Any};
use std::cell::RefCell;
use std::rc::Rc;

/// Payload stored inside a [UserData] value.
pub trait UserDataValue: Any {}

impl<T: std::any::Any> UserDataValue for T {}

downcast!(dyn UserDataValue);

/// An opaque host object carried through the VM by identity, with an
/// optional metatable and an environment table.
pub struct UserData {
    data: RefCell<Box<dyn UserDataValue>>,
    pub(crate) env: RefCell<Rc<Table>>,
    pub(crate) metatable: RefCell<Value>,
}

impl UserData {
    pub fn new(env: Rc<Table>) -> UserData {
        UserData {
            data: RefCell::new(Box::new(())),
            env: RefCell::new(env),
            metatable: RefCell::new(Value::Nil),
        }
    }

    pub fn with_data<T: std::any::Any>(data: T, env: Rc<Table>) -> UserData {
        UserData {
            data: RefCell::new(Box::new(data)),
            env: RefCell::new(env),
            metatable: RefCell::new(Value::Nil),
        }
    }

    pub fn set_data<T: std::any::Any>(&self, data: T) {
        *self.data.borrow_mut() = Box::new(data);
    }

    /// Clones the payload out when it is a `T`.
    pub fn data<T: std::any::Any + Clone>(&self) -> Option<T> {
        self.data.borrow().downcast_ref::<T>().ok().cloned()
    }

    pub fn with_data_ref<T: std::any::Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let data = self.data.borrow();
        data.downcast_ref::<T>().ok().map(f)
    }

    pub fn env(&self) -> Rc<Table> {
        self.env.borrow().clone()
    }

    pub fn set_env(&self, env: Rc<Table>) {
        *self.env.borrow_mut() = env;
    }

    pub fn metatable(&self) -> Value {
        self.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, metatable: Value) {
        *self.metatable.borrow_mut() = metatable;
    }
}
