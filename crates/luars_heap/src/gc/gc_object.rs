// ============ GC Header ============

use crate::lua_value::{
    BIT_ISCOLLECTABLE, CClosure, LUA_VBOXFLT, LUA_VBOXINT, LUA_VCCL, LUA_VLCL, LUA_VLNGSTR,
    LUA_VPROTO, LUA_VSHRSTR, LUA_VTABLE, LUA_VTHREAD, LUA_VUPVAL, LUA_VUSERDATA, LuaClosure,
    LuaProto, LuaString, LuaTable, LuaThread, LuaUpvalue, LuaUserdata, LuaValue,
};
use crate::{GcId, GcObjectKind};

// Color bit positions in marked field
pub const WHITE0BIT: u8 = 3; // Object is white (type 0)
pub const WHITE1BIT: u8 = 4; // Object is white (type 1)
pub const BLACKBIT: u8 = 5; // Object is black
pub const FIXEDBIT: u8 = 6; // Pinned by the constant pool, never swept

pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);
pub const MASKCOLORS: u8 = (1 << BLACKBIT) | WHITEBITS;

/// Collectable state of a heap object, as seen through any value
/// referencing it
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collectable {
    /// Not a heap reference
    Immediate = 0,
    /// Refcounted and live
    Live = 1,
    /// Count reached zero; parked in the recycle bin awaiting confirmation
    Pending = 2,
    /// Carries a finalizer that must run before destruction
    Finalize = 3,
}

/// Header shared by both control-block shapes.
///
/// Bit layout of `marked`:
/// - Bit 3: WHITE0
/// - Bit 4: WHITE1
/// - Bit 5: BLACK
/// - Bit 6: FIXED
///
/// Gray is implicit: no white bit and no black bit.
#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    pub marked: u8,
    pub collectable: Collectable,
    pub kind: GcObjectKind,
    /// External reference count
    pub nref: i32,
    /// Size in bytes charged to the heap
    pub size: u32,
}

impl GcHeader {
    #[inline(always)]
    pub fn with_white(kind: GcObjectKind, current_white: u8, size: u32) -> Self {
        debug_assert!(
            current_white == 0 || current_white == 1,
            "current_white must be 0 or 1"
        );
        GcHeader {
            marked: 1 << (WHITE0BIT + current_white),
            collectable: Collectable::Live,
            kind,
            nref: 0,
            size,
        }
    }

    // ============ Color Operations (tri-color marking) ============

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        (self.marked & WHITEBITS) != 0
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        (self.marked & (1 << BLACKBIT)) != 0
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        (self.marked & MASKCOLORS) == 0
    }

    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        self.marked = (self.marked & !MASKCOLORS) | (1 << (WHITE0BIT + current_white));
    }

    #[inline(always)]
    pub fn make_gray(&mut self) {
        self.marked &= !MASKCOLORS;
    }

    #[inline(always)]
    pub fn make_black(&mut self) {
        self.marked = (self.marked & !WHITEBITS) | (1 << BLACKBIT);
    }

    /// Dead means carrying the white of the previous cycle
    #[inline(always)]
    pub fn is_dead(&self, other_white: u8) -> bool {
        !self.is_fixed() && (self.marked & (1 << (WHITE0BIT + other_white))) != 0
    }

    #[inline(always)]
    pub fn otherwhite(current_white: u8) -> u8 {
        current_white ^ 1
    }

    // ============ Special Flags ============

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        (self.marked & (1 << FIXEDBIT)) != 0
    }

    /// Pinned objects stay gray forever, so marking skips them and the
    /// sweep never sees them as dead
    #[inline(always)]
    pub fn set_fixed(&mut self) {
        self.marked = (self.marked & !MASKCOLORS) | (1 << FIXEDBIT);
    }

    #[inline(always)]
    pub fn clear_fixed(&mut self, current_white: u8) {
        self.marked &= !(1 << FIXEDBIT);
        self.make_white(current_white);
    }
}

// ============ Generation link ============

/// Lists a composite object can be linked into
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListId {
    Gen0 = 0,
    Gen1 = 1,
    Gen2 = 2,
    /// Provisionally unreachable during a scan
    Unreachable = 3,
    /// Unreachable with a pending finalizer during a scan
    Finalizers = 4,
    /// Confirmed garbage of a scan
    Garbage = 5,
    /// Not linked anywhere (cleared shells)
    Detached = 6,
}

pub const NUM_LISTS: usize = 6;

impl ListId {
    #[inline(always)]
    pub fn generation(gen_index: usize) -> ListId {
        match gen_index {
            0 => ListId::Gen0,
            1 => ListId::Gen1,
            _ => ListId::Gen2,
        }
    }

    #[inline(always)]
    pub fn is_generation(self) -> bool {
        matches!(self, ListId::Gen0 | ListId::Gen1 | ListId::Gen2)
    }

    /// Owned by an in-progress scan; refcount drops must not destroy it
    #[inline(always)]
    pub fn is_scan_list(self) -> bool {
        matches!(
            self,
            ListId::Unreachable | ListId::Finalizers | ListId::Garbage
        )
    }
}

/// Shadow count of an object outside any scan
pub const NOT_SCANNING: i32 = i32::MIN;
/// Shadow count of an object moved to the unreachable list
pub const UNREACHABLE: i32 = -1;

#[derive(Debug, Clone, Copy)]
pub struct GenLink {
    pub prev: Option<GcId>,
    pub next: Option<GcId>,
    pub list: ListId,
    /// Shadow count, only meaningful during a scan
    pub gc_ref: i32,
}

impl GenLink {
    pub fn detached() -> Self {
        GenLink {
            prev: None,
            next: None,
            list: ListId::Detached,
            gc_ref: NOT_SCANNING,
        }
    }
}

/// Control block: generation-tracked for composite objects, refcount only
/// for plain objects
#[derive(Debug, Clone, Copy)]
pub enum ControlBlock {
    Tracked(GenLink),
    Plain,
}

// ============ GC Object ============

pub enum GcObjectData {
    String(LuaString),
    BoxedInt(i64),
    BoxedFloat(f64),
    Table(LuaTable),
    Closure(LuaClosure),
    CClosure(CClosure),
    Proto(LuaProto),
    Upvalue(LuaUpvalue),
    Userdata(LuaUserdata),
    Thread(LuaThread),
    /// Cleared by a collector while still referenced from other garbage
    Shell,
}

pub struct GcObject {
    pub header: GcHeader,
    pub block: ControlBlock,
    pub data: GcObjectData,
}

impl GcObject {
    #[inline(always)]
    pub fn link(&self) -> Option<&GenLink> {
        match &self.block {
            ControlBlock::Tracked(link) => Some(link),
            ControlBlock::Plain => None,
        }
    }

    #[inline(always)]
    pub fn link_mut(&mut self) -> Option<&mut GenLink> {
        match &mut self.block {
            ControlBlock::Tracked(link) => Some(link),
            ControlBlock::Plain => None,
        }
    }

    #[inline(always)]
    pub fn is_shell(&self) -> bool {
        matches!(self.data, GcObjectData::Shell)
    }

    /// Type tag for values referencing this object
    pub fn value_tag(&self) -> u8 {
        match &self.data {
            GcObjectData::String(s) if s.is_short() => LUA_VSHRSTR,
            GcObjectData::String(_) => LUA_VLNGSTR,
            _ => kind_tag(self.header.kind),
        }
    }

    pub fn to_value(&self, id: GcId) -> LuaValue {
        LuaValue::from_gc(self.value_tag(), id)
    }

    pub fn as_table(&self) -> Option<&LuaTable> {
        match &self.data {
            GcObjectData::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_table_mut(&mut self) -> Option<&mut LuaTable> {
        match &mut self.data {
            GcObjectData::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&LuaString> {
        match &self.data {
            GcObjectData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string_mut(&mut self) -> Option<&mut LuaString> {
        match &mut self.data {
            GcObjectData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&LuaThread> {
        match &self.data {
            GcObjectData::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_thread_mut(&mut self) -> Option<&mut LuaThread> {
        match &mut self.data {
            GcObjectData::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&LuaUpvalue> {
        match &self.data {
            GcObjectData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut LuaUpvalue> {
        match &mut self.data {
            GcObjectData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<&LuaUserdata> {
        match &self.data {
            GcObjectData::Userdata(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_userdata_mut(&mut self) -> Option<&mut LuaUserdata> {
        match &mut self.data {
            GcObjectData::Userdata(u) => Some(u),
            _ => None,
        }
    }

    /// Behavior record of tables and userdata
    pub fn metatable(&self) -> Option<GcId> {
        match &self.data {
            GcObjectData::Table(t) => t.metatable,
            GcObjectData::Userdata(u) => u.metatable,
            _ => None,
        }
    }
}

/// Value tag for a kind; strings default to short
pub fn kind_tag(kind: GcObjectKind) -> u8 {
    let tt = match kind {
        GcObjectKind::String => LUA_VSHRSTR,
        GcObjectKind::BoxedInt => LUA_VBOXINT,
        GcObjectKind::BoxedFloat => LUA_VBOXFLT,
        GcObjectKind::Table => LUA_VTABLE,
        GcObjectKind::Closure => LUA_VLCL,
        GcObjectKind::CClosure => LUA_VCCL,
        GcObjectKind::Proto => LUA_VPROTO,
        GcObjectKind::Upvalue => LUA_VUPVAL,
        GcObjectKind::Userdata => LUA_VUSERDATA,
        GcObjectKind::Thread => LUA_VTHREAD,
    };
    debug_assert!(tt & BIT_ISCOLLECTABLE != 0);
    tt
}
