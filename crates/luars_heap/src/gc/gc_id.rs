// ============ Object IDs ============
// An id is a slot index plus the serial stamped on the slot when the object
// was allocated. A freed slot gets a new serial on reuse, so a stale id never
// resolves to the object that replaced it.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct GcId {
    index: u32,
    serial: u32,
}

impl GcId {
    #[inline(always)]
    pub(crate) const fn new(index: u32, serial: u32) -> Self {
        GcId { index, serial }
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub fn serial(self) -> u32 {
        self.serial
    }

    /// Pack into the 8-byte payload of a `LuaValue`
    #[inline(always)]
    pub(crate) fn to_bits(self) -> i64 {
        (((self.serial as u64) << 32) | self.index as u64) as i64
    }

    #[inline(always)]
    pub(crate) fn from_bits(bits: i64) -> Self {
        let bits = bits as u64;
        GcId {
            index: bits as u32,
            serial: (bits >> 32) as u32,
        }
    }
}

impl std::fmt::Display for GcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.index, self.serial)
    }
}
