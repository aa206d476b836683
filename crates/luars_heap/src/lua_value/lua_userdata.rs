use crate::GcId;

use super::LuaValue;

/// Full userdata: an opaque byte payload owned by the heap, plus one user
/// value slot and an optional behavior record.
pub struct LuaUserdata {
    pub(crate) payload: Box<[u8]>,
    pub(crate) user_value: LuaValue,
    pub(crate) metatable: Option<GcId>,
}

impl LuaUserdata {
    pub fn new(size: usize) -> Self {
        LuaUserdata {
            payload: vec![0u8; size].into_boxed_slice(),
            user_value: LuaValue::nil(),
            metatable: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn user_value(&self) -> LuaValue {
        self.user_value
    }

    pub fn metatable(&self) -> Option<GcId> {
        self.metatable
    }
}
