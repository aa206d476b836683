// Lua heap
// Reference-counted object heap with a generational cycle collector and an
// incremental tracing collector, string interning and pinned constants.

#[cfg(test)]
mod test;

pub mod gc;
pub mod lua_value;
pub mod lua_vm;

pub use gc::{Collectable, GcId, GcKind, GcObjectKind, GcState, GcStats};
pub use lua_value::LuaValue;
pub use lua_vm::{CFunction, FinalizerErrors, LuaError, LuaHeap, LuaResult, SafeOption, lua_limits};
