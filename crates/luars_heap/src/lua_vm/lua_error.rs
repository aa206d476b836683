use thiserror::Error;

use crate::LuaValue;
use crate::lua_vm::LuaHeap;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LuaError {
    #[error("{0}")]
    RuntimeError(String),
    #[error("not enough memory")]
    MemoryError,
    /// Raised by a finalizer, kept apart from ordinary runtime errors
    #[error("error in __gc metamethod ({0})")]
    GcMetamethod(String),
    #[error("invalid table key: {0}")]
    InvalidKey(&'static str),
    /// A handle that no longer names a live object of the expected kind
    #[error("invalid object handle")]
    InvalidHandle,
}

pub type LuaResult<T> = Result<T, LuaError>;

/// Native function. Receives the heap and its arguments; bound values of a
/// native closure follow the arguments.
pub type CFunction = fn(&mut LuaHeap, &[LuaValue]) -> LuaResult<()>;
