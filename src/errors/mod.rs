mod compile_error;
mod runtime_error;
mod stack_trace;

pub use compile_error::CompileError;
pub use runtime_error::{ErrorKind, RuntimeError};
pub use stack_trace::StackTrace;
