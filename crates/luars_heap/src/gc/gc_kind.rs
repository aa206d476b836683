/// Kind of a heap object. Composite kinds carry a generation link and take
/// part in cycle scans; the rest are plain refcounted leaves.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum GcObjectKind {
    String = 0,
    BoxedInt = 1,
    BoxedFloat = 2,
    Table = 3,
    Closure = 4,
    CClosure = 5,
    Proto = 6,
    Upvalue = 7,
    Userdata = 8,
    Thread = 9,
}

impl GcObjectKind {
    #[inline(always)]
    pub fn is_composite(self) -> bool {
        !matches!(
            self,
            GcObjectKind::String | GcObjectKind::BoxedInt | GcObjectKind::BoxedFloat
        )
    }

    /// Objects with nothing to traverse are blackened directly when marked
    #[inline(always)]
    pub fn is_leaf(self) -> bool {
        !self.is_composite()
    }

    /// Only containers and user payloads may carry a `__gc` finalizer
    #[inline(always)]
    pub fn may_finalize(self) -> bool {
        matches!(self, GcObjectKind::Table | GcObjectKind::Userdata)
    }
}
