use crate::GcId;
use crate::lua_vm::lua_limits::BASIC_STACK_SIZE;

use super::LuaValue;

/// Coroutine state as seen by the heap: a value stack and the upvalues
/// still open on it.
pub struct LuaThread {
    pub(crate) stack: Vec<LuaValue>,
    /// Open upvalues sorted by stack index. Not counted: an open upvalue
    /// holds a counted reference to this thread instead.
    pub(crate) open_upvalues: Vec<GcId>,
}

impl LuaThread {
    pub fn new() -> Self {
        LuaThread {
            stack: Vec::with_capacity(BASIC_STACK_SIZE),
            open_upvalues: Vec::new(),
        }
    }

    pub fn stack(&self) -> &[LuaValue] {
        &self.stack
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    pub fn has_open_upvalues(&self) -> bool {
        !self.open_upvalues.is_empty()
    }

    /// Drop spare stack capacity, keeping some headroom
    pub(crate) fn shrink_stack(&mut self) {
        let wanted = (self.stack.len() * 2).max(BASIC_STACK_SIZE);
        if self.stack.capacity() > wanted {
            self.stack.shrink_to(wanted);
        }
    }
}

impl Default for LuaThread {
    fn default() -> Self {
        Self::new()
    }
}
