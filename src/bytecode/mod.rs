mod dump;
mod opcode;
mod proto;
mod undump;

pub use dump::{dump, CHUNK_SIGNATURE};
pub use opcode::*;
pub use proto::{DbgCall, DbgLocal, FunctionProto, VARARG_HAS_ARG, VARARG_IS_VARARG, VARARG_NEEDS_ARG};
pub use undump::undump;
