use crate::GcId;

/// Back-pointer of an interned string node: either the bucket whose head is
/// this node, or the node that links to it. Unlinking needs no rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternLink {
    Bucket(usize),
    Node(GcId),
}

/// Immutable byte string
pub struct LuaString {
    bytes: Box<[u8]>,
    hash: u64,
    has_hash: bool,
    short: bool,
    // Intern chain, only used by short strings
    pub(crate) prev: Option<InternLink>,
    pub(crate) next: Option<GcId>,
}

impl LuaString {
    /// Short string with the hash computed by the intern table
    pub(crate) fn new_short(bytes: &[u8], hash: u64) -> Self {
        LuaString {
            bytes: bytes.into(),
            hash,
            has_hash: true,
            short: true,
            prev: None,
            next: None,
        }
    }

    /// Long string; its hash is computed on first use
    pub(crate) fn new_long(bytes: Box<[u8]>) -> Self {
        LuaString {
            bytes,
            hash: 0,
            has_hash: false,
            short: false,
            prev: None,
            next: None,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline(always)]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn is_short(&self) -> bool {
        self.short
    }

    #[inline(always)]
    pub fn cached_hash(&self) -> Option<u64> {
        self.has_hash.then_some(self.hash)
    }

    pub(crate) fn set_hash(&mut self, hash: u64) {
        self.hash = hash;
        self.has_hash = true;
    }
}

impl std::fmt::Debug for LuaString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.bytes))
    }
}
