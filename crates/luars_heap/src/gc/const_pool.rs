use crate::GcId;
use crate::gc::ObjectAllocator;
use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::{SMALL_INT_MAX, SMALL_INT_MIN};

/// Strings pinned for the life of the heap
pub const PINNED_STRINGS: [&str; 3] = ["__gc", "__mode", "not enough memory"];

/// Pinned objects shared by every value that needs them. Pinned objects are
/// marked fixed: refcount drops never free them and the sweep never sees
/// them. They are unpinned only when the heap shuts down.
#[derive(Default)]
pub struct ConstPool {
    small_ints: Vec<GcId>,
    tm_gc: Option<GcId>,
    tm_mode: Option<GcId>,
    memerrmsg: Option<GcId>,
}

impl ConstPool {
    /// Boxed integer for `i` if it falls in the pinned range
    #[inline]
    pub fn small_integer(&self, i: i64) -> Option<GcId> {
        if !(SMALL_INT_MIN..=SMALL_INT_MAX).contains(&i) {
            return None;
        }
        self.small_ints.get((i - SMALL_INT_MIN) as usize).copied()
    }

    pub fn tm_gc(&self) -> Option<GcId> {
        self.tm_gc
    }

    pub fn tm_mode(&self) -> Option<GcId> {
        self.tm_mode
    }

    pub fn memerrmsg(&self) -> Option<GcId> {
        self.memerrmsg
    }

    pub fn is_empty(&self) -> bool {
        self.small_ints.is_empty() && self.tm_gc.is_none()
    }

    fn all(&self) -> impl Iterator<Item = GcId> + '_ {
        self.small_ints
            .iter()
            .copied()
            .chain(self.tm_gc)
            .chain(self.tm_mode)
            .chain(self.memerrmsg)
    }
}

impl ObjectAllocator {
    /// Create and pin the constant pool
    pub(crate) fn init_constants(&mut self) {
        let mut small_ints = Vec::with_capacity((SMALL_INT_MAX - SMALL_INT_MIN + 1) as usize);
        for i in SMALL_INT_MIN..=SMALL_INT_MAX {
            let id = self.box_integer(i);
            self.pin(id);
            small_ints.push(id);
        }
        self.consts.small_ints = small_ints;

        let [tm_gc, tm_mode, memerrmsg] = PINNED_STRINGS.map(|s| {
            let id = self.create_string(s.as_bytes());
            self.pin(id);
            id
        });
        self.consts.tm_gc = Some(tm_gc);
        self.consts.tm_mode = Some(tm_mode);
        self.consts.memerrmsg = Some(memerrmsg);
    }

    fn pin(&mut self, id: GcId) {
        if let Some(obj) = self.pool.get_mut(id) {
            obj.header.nref += 1;
            obj.header.set_fixed();
        }
    }

    /// Unpin every constant and release the pool's reference to it
    pub(crate) fn release_constants(&mut self) {
        let pinned: Vec<GcId> = self.consts.all().collect();
        self.consts = ConstPool::default();
        let current_white = self.current_white;
        for id in pinned {
            let value = match self.pool.get_mut(id) {
                Some(obj) => {
                    obj.header.clear_fixed(current_white);
                    obj.to_value(id)
                }
                None => continue,
            };
            self.defer_release(value);
        }
        self.drain_releases();
    }

    /// Boxed constant for `i`, if pinned
    pub fn constant_integer(&self, i: i64) -> Option<LuaValue> {
        self.consts.small_integer(i).and_then(|id| self.value_of(id))
    }
}
