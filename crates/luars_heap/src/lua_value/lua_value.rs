// LuaValue - tagged value shared by the interpreter and the heap
//
// Layout:
// - Value union: 8 bytes (integer, float, packed GcId, light userdata address,
//   light function address, boolean)
// - tt: 1 byte type tag
//
// Type tag encoding (bits 0-6):
// - Bits 0-3: base type (LUA_TNIL, LUA_TBOOLEAN, LUA_TNUMBER, ...)
// - Bits 4-5: variant bits (integer/float, short/long string, ...)
// - Bit 6: BIT_ISCOLLECTABLE (payload is a heap object id)
//
// Every constructor writes all 8 payload bytes, so reading the integer field
// of any value is always defined.
use crate::GcId;
use crate::lua_vm::CFunction;
use std::hash::{Hash, Hasher};

// ============ Basic type tags (bits 0-3) ============
pub const LUA_TNIL: u8 = 0;
pub const LUA_TBOOLEAN: u8 = 1;
pub const LUA_TLIGHTUSERDATA: u8 = 2;
pub const LUA_TNUMBER: u8 = 3;
pub const LUA_TSTRING: u8 = 4;
pub const LUA_TTABLE: u8 = 5;
pub const LUA_TFUNCTION: u8 = 6;
pub const LUA_TUSERDATA: u8 = 7;
pub const LUA_TTHREAD: u8 = 8;
pub const LUA_NUMTYPES: usize = 9;

// Internal types, never visible to scripts
pub const LUA_TUPVAL: u8 = LUA_NUMTYPES as u8;
pub const LUA_TPROTO: u8 = LUA_NUMTYPES as u8 + 1;

// ============ Variant tags (with bits 4-5) ============
macro_rules! makevariant {
    ($base:expr, $variant:expr) => {
        $base | ($variant << 4)
    };
}

pub const BIT_ISCOLLECTABLE: u8 = 1 << 6;

pub const LUA_VNIL: u8 = makevariant!(LUA_TNIL, 0);

pub const LUA_VFALSE: u8 = makevariant!(LUA_TBOOLEAN, 0);
pub const LUA_VTRUE: u8 = makevariant!(LUA_TBOOLEAN, 1);

pub const LUA_VNUMINT: u8 = makevariant!(LUA_TNUMBER, 0);
pub const LUA_VNUMFLT: u8 = makevariant!(LUA_TNUMBER, 1);
pub const LUA_VBOXINT: u8 = makevariant!(LUA_TNUMBER, 2) | BIT_ISCOLLECTABLE;
pub const LUA_VBOXFLT: u8 = makevariant!(LUA_TNUMBER, 3) | BIT_ISCOLLECTABLE;

pub const LUA_VLIGHTUSERDATA: u8 = makevariant!(LUA_TLIGHTUSERDATA, 0);

pub const LUA_VSHRSTR: u8 = makevariant!(LUA_TSTRING, 0) | BIT_ISCOLLECTABLE;
pub const LUA_VLNGSTR: u8 = makevariant!(LUA_TSTRING, 1) | BIT_ISCOLLECTABLE;

pub const LUA_VTABLE: u8 = LUA_TTABLE | BIT_ISCOLLECTABLE;

pub const LUA_VLCL: u8 = makevariant!(LUA_TFUNCTION, 0) | BIT_ISCOLLECTABLE;
pub const LUA_VCCL: u8 = makevariant!(LUA_TFUNCTION, 1) | BIT_ISCOLLECTABLE;
pub const LUA_VLCF: u8 = makevariant!(LUA_TFUNCTION, 2);

pub const LUA_VUSERDATA: u8 = LUA_TUSERDATA | BIT_ISCOLLECTABLE;
pub const LUA_VTHREAD: u8 = LUA_TTHREAD | BIT_ISCOLLECTABLE;
pub const LUA_VUPVAL: u8 = LUA_TUPVAL | BIT_ISCOLLECTABLE;
pub const LUA_VPROTO: u8 = LUA_TPROTO | BIT_ISCOLLECTABLE;

#[inline(always)]
pub const fn novariant(tt: u8) -> u8 {
    tt & 0x0F
}

// ============ Value union ============
#[derive(Clone, Copy)]
#[repr(C)]
pub union Value {
    pub i: i64, // integers, packed ids, addresses, booleans
    pub n: f64, // float numbers
}

impl Value {
    #[inline(always)]
    pub const fn nil() -> Self {
        Value { i: 0 }
    }

    #[inline(always)]
    pub const fn integer(i: i64) -> Self {
        Value { i }
    }

    #[inline(always)]
    pub const fn float(n: f64) -> Self {
        Value { n }
    }
}

// ============ LuaValue ============
#[derive(Clone, Copy)]
#[repr(C)]
pub struct LuaValue {
    pub(crate) value: Value,
    pub(crate) tt: u8,
}

impl LuaValue {
    // ============ Constructors ============

    #[inline(always)]
    pub const fn nil() -> Self {
        Self {
            value: Value::nil(),
            tt: LUA_VNIL,
        }
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        Self {
            value: Value::nil(),
            tt: if b { LUA_VTRUE } else { LUA_VFALSE },
        }
    }

    #[inline(always)]
    pub const fn integer(i: i64) -> Self {
        Self {
            value: Value::integer(i),
            tt: LUA_VNUMINT,
        }
    }

    #[inline(always)]
    pub const fn float(n: f64) -> Self {
        Self {
            value: Value::float(n),
            tt: LUA_VNUMFLT,
        }
    }

    #[inline(always)]
    pub fn lightuserdata(addr: usize) -> Self {
        Self {
            value: Value::integer(addr as i64),
            tt: LUA_VLIGHTUSERDATA,
        }
    }

    #[inline(always)]
    pub fn cfunction(f: CFunction) -> Self {
        Self {
            value: Value::integer(f as usize as i64),
            tt: LUA_VLCF,
        }
    }

    /// Wrap a heap object id; `tt` must carry BIT_ISCOLLECTABLE
    #[inline(always)]
    pub(crate) fn from_gc(tt: u8, id: GcId) -> Self {
        debug_assert!(tt & BIT_ISCOLLECTABLE != 0);
        Self {
            value: Value::integer(id.to_bits()),
            tt,
        }
    }

    // ============ Type Tag Access ============

    #[inline(always)]
    pub fn tt(&self) -> u8 {
        self.tt
    }

    #[inline(always)]
    pub fn base_type(&self) -> u8 {
        novariant(self.tt)
    }

    #[inline(always)]
    pub fn type_name(&self) -> &'static str {
        match self.base_type() {
            LUA_TNIL => "nil",
            LUA_TBOOLEAN => "boolean",
            LUA_TLIGHTUSERDATA | LUA_TUSERDATA => "userdata",
            LUA_TNUMBER => "number",
            LUA_TSTRING => "string",
            LUA_TTABLE => "table",
            LUA_TFUNCTION => "function",
            LUA_TTHREAD => "thread",
            LUA_TUPVAL => "upvalue",
            LUA_TPROTO => "proto",
            _ => "no value",
        }
    }

    #[inline(always)]
    fn raw_bits(&self) -> i64 {
        // SAFETY: every constructor initializes the full 8-byte payload
        unsafe { self.value.i }
    }

    // ============ Predicates ============

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        self.tt == LUA_VNIL
    }

    #[inline(always)]
    pub fn is_collectable(&self) -> bool {
        self.tt & BIT_ISCOLLECTABLE != 0
    }

    #[inline(always)]
    pub fn is_boolean(&self) -> bool {
        self.base_type() == LUA_TBOOLEAN
    }

    #[inline(always)]
    pub fn is_falsy(&self) -> bool {
        self.tt == LUA_VNIL || self.tt == LUA_VFALSE
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        self.base_type() == LUA_TNUMBER
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        self.base_type() == LUA_TSTRING
    }

    #[inline(always)]
    pub fn is_short_string(&self) -> bool {
        self.tt == LUA_VSHRSTR
    }

    #[inline(always)]
    pub fn is_long_string(&self) -> bool {
        self.tt == LUA_VLNGSTR
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        self.tt == LUA_VTABLE
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        self.base_type() == LUA_TFUNCTION
    }

    #[inline(always)]
    pub fn is_cfunction(&self) -> bool {
        self.tt == LUA_VLCF
    }

    #[inline(always)]
    pub fn is_userdata(&self) -> bool {
        self.tt == LUA_VUSERDATA
    }

    #[inline(always)]
    pub fn is_thread(&self) -> bool {
        self.tt == LUA_VTHREAD
    }

    #[inline(always)]
    pub fn is_float(&self) -> bool {
        self.tt == LUA_VNUMFLT
    }

    // ============ Accessors ============

    #[inline(always)]
    pub fn gc_id(&self) -> Option<GcId> {
        if self.is_collectable() {
            Some(GcId::from_bits(self.raw_bits()))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_boolean(&self) -> Option<bool> {
        match self.tt {
            LUA_VTRUE => Some(true),
            LUA_VFALSE => Some(false),
            _ => None,
        }
    }

    /// Immediate integer payload. Boxed integers need the heap to unbox.
    #[inline(always)]
    pub fn as_integer(&self) -> Option<i64> {
        if self.tt == LUA_VNUMINT {
            Some(self.raw_bits())
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_float(&self) -> Option<f64> {
        if self.tt == LUA_VNUMFLT {
            // SAFETY: tag says the float field was written
            Some(unsafe { self.value.n })
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_lightuserdata(&self) -> Option<usize> {
        if self.tt == LUA_VLIGHTUSERDATA {
            Some(self.raw_bits() as usize)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_cfunction(&self) -> Option<CFunction> {
        if self.tt == LUA_VLCF {
            // SAFETY: the payload was produced from a CFunction in `cfunction`
            Some(unsafe { std::mem::transmute::<usize, CFunction>(self.raw_bits() as usize) })
        } else {
            None
        }
    }

    /// Normalize a value for use as a table key: floats with an exact
    /// integer value become integers.
    pub(crate) fn normalize_key(self) -> Self {
        if let Some(n) = self.as_float() {
            let i = n as i64;
            if i as f64 == n && n.is_finite() {
                return LuaValue::integer(i);
            }
        }
        self
    }
}

impl Default for LuaValue {
    fn default() -> Self {
        LuaValue::nil()
    }
}

// Raw identity equality: same tag and same payload bits. Interned short
// strings compare by identity, which matches content equality.
impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        if self.tt != other.tt {
            return false;
        }
        match self.tt {
            LUA_VNIL | LUA_VTRUE | LUA_VFALSE => true,
            LUA_VNUMFLT => self.as_float() == other.as_float(),
            _ => self.raw_bits() == other.raw_bits(),
        }
    }
}

impl Eq for LuaValue {}

impl Hash for LuaValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tt.hash(state);
        match self.tt {
            LUA_VNIL | LUA_VTRUE | LUA_VFALSE => {}
            _ => self.raw_bits().hash(state),
        }
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tt {
            LUA_VNIL => write!(f, "nil"),
            LUA_VTRUE => write!(f, "true"),
            LUA_VFALSE => write!(f, "false"),
            LUA_VNUMINT => write!(f, "{}", self.raw_bits()),
            LUA_VNUMFLT => write!(f, "{:?}", unsafe { self.value.n }),
            LUA_VLIGHTUSERDATA => write!(f, "lightuserdata: 0x{:x}", self.raw_bits()),
            LUA_VLCF => write!(f, "cfunction: 0x{:x}", self.raw_bits()),
            _ => match self.gc_id() {
                Some(id) => write!(f, "{}: {}", self.type_name(), id),
                None => write!(f, "unknown(tt=0x{:02x})", self.tt),
            },
        }
    }
}
