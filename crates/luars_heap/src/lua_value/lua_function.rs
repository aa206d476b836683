use crate::GcId;
use crate::lua_vm::CFunction;

use super::LuaValue;

/// Function prototype: the part of a compiled function the heap cares about.
/// Bytecode itself is opaque here.
pub struct LuaProto {
    pub(crate) source: LuaValue,
    pub(crate) constants: Vec<LuaValue>,
    pub(crate) protos: Vec<LuaValue>,
}

impl LuaProto {
    pub fn source(&self) -> LuaValue {
        self.source
    }

    pub fn constants(&self) -> &[LuaValue] {
        &self.constants
    }

    pub fn protos(&self) -> &[LuaValue] {
        &self.protos
    }
}

/// Lua closure: a prototype plus its captured variables
pub struct LuaClosure {
    pub(crate) proto: LuaValue,
    /// Upvalue objects, one per captured variable
    pub(crate) upvalues: Vec<LuaValue>,
}

impl LuaClosure {
    pub fn proto(&self) -> LuaValue {
        self.proto
    }

    pub fn upvalues(&self) -> &[LuaValue] {
        &self.upvalues
    }
}

/// Native closure: a light function with values bound to it.
/// Calls receive the arguments followed by the bound values.
pub struct CClosure {
    pub(crate) func: CFunction,
    pub(crate) upvalues: Vec<LuaValue>,
}

impl CClosure {
    pub fn func(&self) -> CFunction {
        self.func
    }

    pub fn upvalues(&self) -> &[LuaValue] {
        &self.upvalues
    }
}

/// Captured variable. Open upvalues alias a live stack slot of a thread;
/// closing one copies the slot into the upvalue.
#[derive(Debug, Clone, Copy)]
pub enum LuaUpvalue {
    Open { thread: GcId, index: usize },
    Closed(LuaValue),
}

impl LuaUpvalue {
    #[inline(always)]
    pub fn is_open(&self) -> bool {
        matches!(self, LuaUpvalue::Open { .. })
    }
}
