// Object allocator - owner of every heap object and of the structures that
// index them
//
// - All objects live in one GcPool, addressed by GcId
// - Short strings are interned, boxed integers outside the constant range
//   are pooled; both go through the recycle bin when their count hits zero
// - Composite objects are linked into generation lists on creation
// - Refcount drops cascade through an explicit stack, never recursion

use ahash::RandomState;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, VecDeque};

use crate::gc::{
    Collectable, ConstPool, ControlBlock, GcHeader, GcObject, GcObjectData, GcPool, GcStats,
    GenLink, Generations, ListId, RecycleBin, StringInterner, Verdict,
};
use crate::lua_value::{LUA_VTHREAD, LuaString, LuaUpvalue, LuaValue};
use crate::lua_vm::SafeOption;
use crate::{GcId, GcObjectKind};

/// Index structure an object must leave before it is cleared
enum SideEntry {
    Interned,
    IntPool(i64),
    Thread,
    OpenUpvalue(GcId),
    None,
}

pub struct ObjectAllocator {
    pub(crate) pool: GcPool,
    pub(crate) strings: StringInterner,
    /// Boxed integers outside the constant range, deduplicated
    pub(crate) int_pool: HashMap<i64, GcId, RandomState>,
    pub(crate) recycle: RecycleBin,
    pub(crate) gens: Generations,
    pub(crate) consts: ConstPool,

    /// Embedder-held references: counted, and roots for tracing
    pub(crate) anchors: IndexMap<GcId, u32, RandomState>,
    /// Objects registered for finalization
    pub(crate) finobj: IndexSet<GcId, RandomState>,
    /// Objects whose finalizer is due; each entry holds a counted reference
    pub(crate) tobefnz: VecDeque<GcId>,
    /// Threads with open upvalues
    pub(crate) twups: IndexSet<GcId, RandomState>,

    pub(crate) short_limit: usize,
    /// White given to new objects; owned by the tracing collector
    pub(crate) current_white: u8,
    pub(crate) total_bytes: usize,
    pub(crate) stats: GcStats,

    release_stack: Vec<GcId>,
    draining: bool,
    ref_scratch: Vec<LuaValue>,
}

impl ObjectAllocator {
    pub fn new(option: &SafeOption) -> Self {
        Self {
            pool: GcPool::new(),
            strings: StringInterner::new(option.hash_seed),
            int_pool: HashMap::with_hasher(RandomState::new()),
            recycle: RecycleBin::new(option.recycle_threshold),
            gens: Generations::new(option.generation_thresholds),
            consts: ConstPool::default(),
            anchors: IndexMap::with_hasher(RandomState::new()),
            finobj: IndexSet::with_hasher(RandomState::new()),
            tobefnz: VecDeque::new(),
            twups: IndexSet::with_hasher(RandomState::new()),
            short_limit: option.short_string_limit,
            current_white: 0,
            total_bytes: 0,
            stats: GcStats::default(),
            release_stack: Vec::new(),
            draining: false,
            ref_scratch: Vec::new(),
        }
    }

    // ==================== Object storage ====================

    #[inline(always)]
    pub fn get(&self, id: GcId) -> Option<&GcObject> {
        self.pool.get(id)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: GcId) -> Option<&mut GcObject> {
        self.pool.get_mut(id)
    }

    #[inline]
    pub fn value_of(&self, id: GcId) -> Option<LuaValue> {
        self.pool.get(id).map(|o| o.to_value(id))
    }

    /// Store a new object with a zero count. Composite objects are linked
    /// into generation 0.
    pub fn alloc_object(&mut self, kind: GcObjectKind, data: GcObjectData, size: usize) -> GcId {
        let size = size + std::mem::size_of::<GcObject>();
        let header = GcHeader::with_white(kind, self.current_white, size as u32);
        let block = if kind.is_composite() {
            ControlBlock::Tracked(GenLink::detached())
        } else {
            ControlBlock::Plain
        };
        let id = self.pool.alloc(GcObject {
            header,
            block,
            data,
        });
        if kind.is_composite() {
            self.link_tail(ListId::Gen0, id);
            self.gens.note_allocation();
        }
        self.total_bytes += size;
        self.stats.objects_allocated += 1;
        self.stats.bytes_allocated += size;
        id
    }

    pub(crate) fn free_object(&mut self, id: GcId) {
        if let Some(obj) = self.pool.free(id) {
            debug_assert!(obj.header.nref == 0, "freeing {id} with count {}", obj.header.nref);
            let size = obj.header.size as usize;
            self.total_bytes = self.total_bytes.saturating_sub(size);
            self.stats.bytes_freed += size;
            self.stats.objects_freed += 1;
        }
    }

    // ==================== Strings ====================

    /// Intern a short string or create a long one. Returns the id with its
    /// count untouched; a found string is revived if it was parked or dead.
    pub fn create_string(&mut self, bytes: &[u8]) -> GcId {
        if bytes.len() > self.short_limit {
            let size = bytes.len();
            return self.alloc_object(
                GcObjectKind::String,
                GcObjectData::String(LuaString::new_long(bytes.into())),
                size,
            );
        }

        let hash = self.strings.hash_bytes(bytes);
        if let Some(id) = self.strings.find(&self.pool, bytes, hash) {
            self.revive(id);
            return id;
        }

        let id = self.alloc_object(
            GcObjectKind::String,
            GcObjectData::String(LuaString::new_short(bytes, hash)),
            bytes.len(),
        );
        self.strings.insert(&mut self.pool, id);
        id
    }

    /// Hash of a string object, computing and caching it for long strings
    pub fn hash_long_string(&mut self, id: GcId) -> Option<u64> {
        let cached = self.pool.get(id)?.as_string()?.cached_hash();
        if let Some(hash) = cached {
            return Some(hash);
        }
        let hash = self.strings.hash_bytes(self.pool.get(id)?.as_string()?.as_bytes());
        self.pool.get_mut(id)?.as_string_mut()?.set_hash(hash);
        Some(hash)
    }

    // ==================== Boxed scalars ====================

    pub fn box_integer(&mut self, i: i64) -> GcId {
        if let Some(id) = self.consts.small_integer(i) {
            return id;
        }
        if let Some(&id) = self.int_pool.get(&i) {
            if self.pool.is_valid(id) {
                self.revive(id);
                return id;
            }
        }
        let id = self.alloc_object(GcObjectKind::BoxedInt, GcObjectData::BoxedInt(i), 8);
        self.int_pool.insert(i, id);
        id
    }

    pub fn box_float(&mut self, n: f64) -> GcId {
        self.alloc_object(GcObjectKind::BoxedFloat, GcObjectData::BoxedFloat(n), 8)
    }

    /// A parked or dead-white object found through a lookup becomes usable
    /// again. Parked objects stay in the bin until its next scan.
    fn revive(&mut self, id: GcId) {
        let current_white = self.current_white;
        if let Some(obj) = self.pool.get_mut(id) {
            if obj.header.is_dead(GcHeader::otherwhite(current_white)) {
                obj.header.make_white(current_white);
            }
            if obj.header.collectable == Collectable::Pending {
                self.stats.recycle_revived += 1;
            }
        }
    }

    // ==================== Refcount ====================

    #[inline]
    pub fn inc_ref(&mut self, v: LuaValue) {
        if let Some(id) = v.gc_id() {
            self.inc_ref_id(id);
        }
    }

    #[inline]
    pub fn inc_ref_id(&mut self, id: GcId) {
        if let Some(obj) = self.pool.get_mut(id) {
            obj.header.nref += 1;
        } else {
            debug_assert!(false, "retain of freed object {id}");
        }
    }

    #[inline]
    pub fn dec_ref(&mut self, v: LuaValue) {
        if let Some(id) = v.gc_id() {
            self.dec_ref_id(id);
        }
    }

    pub fn dec_ref_id(&mut self, id: GcId) {
        self.release_stack.push(id);
        self.drain_releases();
    }

    /// Queue a drop without draining; for callers that batch releases
    pub(crate) fn defer_release(&mut self, v: LuaValue) {
        if let Some(id) = v.gc_id() {
            self.release_stack.push(id);
        }
    }

    pub(crate) fn drain_releases(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        while let Some(id) = self.release_stack.pop() {
            self.release_one(id);
        }
        self.draining = false;
    }

    fn release_one(&mut self, id: GcId) {
        let Some(obj) = self.pool.get_mut(id) else {
            debug_assert!(false, "release of freed object {id}");
            return;
        };
        obj.header.nref -= 1;
        debug_assert!(obj.header.nref >= 0, "negative count on {id}");
        if obj.header.nref > 0 || obj.header.is_fixed() {
            return;
        }

        match obj.header.collectable {
            Collectable::Pending => return,
            Collectable::Finalize => {
                // The queue takes over the reference; the finalizer runs at
                // the next step point and the object dies when the queue
                // lets go
                obj.header.collectable = Collectable::Live;
                obj.header.nref = 1;
                self.finobj.swap_remove(&id);
                self.tobefnz.push_back(id);
                return;
            }
            Collectable::Live | Collectable::Immediate => {}
        }

        if obj.link().is_some_and(|link| link.list.is_scan_list()) {
            return;
        }
        if obj.is_shell() {
            self.free_object(id);
            return;
        }
        if self.is_recyclable(id) {
            self.recycle_add(id);
            return;
        }
        self.destroy(id);
        self.stats.freed_by_refcount += 1;
    }

    /// Clear, unlink and free an object whose count is zero, queueing
    /// releases for everything it referenced
    fn destroy(&mut self, id: GcId) {
        let mut refs = std::mem::take(&mut self.ref_scratch);
        self.clear_object(id, &mut refs);
        self.unlink(id);
        self.free_object(id);
        for v in refs.drain(..) {
            self.defer_release(v);
        }
        self.ref_scratch = refs;
    }

    /// Tear down an object that a collector found dead. It becomes a shell
    /// if other garbage still references it, and is freed once they let go.
    pub(crate) fn destroy_garbage(&mut self, id: GcId) {
        if !self.pool.is_valid(id) {
            return;
        }
        let mut refs = std::mem::take(&mut self.ref_scratch);
        self.clear_object(id, &mut refs);
        self.unlink(id);
        if self.pool.get(id).is_some_and(|o| o.header.nref == 0) {
            self.free_object(id);
        }
        for v in refs.drain(..) {
            self.defer_release(v);
        }
        self.ref_scratch = refs;
        self.drain_releases();
    }

    /// Detach an object from every side structure and strip its references
    /// into `refs`, leaving a shell in the slot
    pub(crate) fn clear_object(&mut self, id: GcId, refs: &mut Vec<LuaValue>) {
        let side = match self.pool.get(id).map(|o| &o.data) {
            None => return,
            Some(GcObjectData::String(s)) if s.is_short() => SideEntry::Interned,
            Some(GcObjectData::BoxedInt(i)) => SideEntry::IntPool(*i),
            Some(GcObjectData::Thread(_)) => SideEntry::Thread,
            Some(GcObjectData::Upvalue(LuaUpvalue::Open { thread, .. })) => {
                SideEntry::OpenUpvalue(*thread)
            }
            Some(_) => SideEntry::None,
        };
        match side {
            SideEntry::Interned => self.strings.remove(&mut self.pool, id),
            SideEntry::IntPool(i) => {
                if self.int_pool.get(&i) == Some(&id) {
                    self.int_pool.remove(&i);
                }
            }
            SideEntry::Thread => {
                self.close_thread_upvalues(id, 0, refs);
                self.twups.swap_remove(&id);
            }
            SideEntry::OpenUpvalue(thread) => {
                if let Some(th) = self.pool.get_mut(thread).and_then(|o| o.as_thread_mut()) {
                    th.open_upvalues.retain(|uv| *uv != id);
                }
            }
            SideEntry::None => {}
        }
        self.finobj.swap_remove(&id);
        if let Some(obj) = self.pool.get_mut(id) {
            if obj.header.collectable == Collectable::Finalize {
                obj.header.collectable = Collectable::Live;
            }
            obj.data.take_refs(refs);
        }
    }

    /// Close the open upvalues of `thread` at or above `level`. Each closed
    /// upvalue retains the slot value and gives up its reference to the
    /// thread, which is pushed to `refs` for the caller to release.
    pub(crate) fn close_thread_upvalues(
        &mut self,
        thread: GcId,
        level: usize,
        refs: &mut Vec<LuaValue>,
    ) {
        let Some(th) = self.pool.get_mut(thread).and_then(|o| o.as_thread_mut()) else {
            return;
        };
        let candidates = std::mem::take(&mut th.open_upvalues);
        let mut keep = Vec::new();
        let mut closing = Vec::new();
        for uv_id in candidates {
            let index = self
                .pool
                .get(uv_id)
                .and_then(|o| o.as_upvalue())
                .and_then(|uv| match uv {
                    LuaUpvalue::Open { index, .. } => Some(*index),
                    LuaUpvalue::Closed(_) => None,
                });
            match index {
                Some(index) if index >= level => closing.push((uv_id, index)),
                Some(_) => keep.push(uv_id),
                None => {}
            }
        }
        let mut values = Vec::with_capacity(closing.len());
        if let Some(th) = self.pool.get_mut(thread).and_then(|o| o.as_thread_mut()) {
            th.open_upvalues = keep;
            for (_, index) in &closing {
                values.push(th.stack.get(*index).copied().unwrap_or_default());
            }
            if th.open_upvalues.is_empty() {
                self.twups.swap_remove(&thread);
            }
        }
        for ((uv_id, _), value) in closing.into_iter().zip(values) {
            self.inc_ref(value);
            if let Some(uv) = self.pool.get_mut(uv_id).and_then(|o| o.as_upvalue_mut()) {
                *uv = LuaUpvalue::Closed(value);
            }
            refs.push(LuaValue::from_gc(LUA_VTHREAD, thread));
        }
    }

    // ==================== Recycle bin ====================

    fn is_recyclable(&self, id: GcId) -> bool {
        match self.pool.get(id).map(|o| &o.data) {
            Some(GcObjectData::String(s)) => s.is_short(),
            Some(GcObjectData::BoxedInt(i)) => self.int_pool.get(i) == Some(&id),
            _ => false,
        }
    }

    fn recycle_add(&mut self, id: GcId) {
        if self.recycle.needs_scan() {
            self.scan_recycle_bin(false);
        }
        if let Some(obj) = self.pool.get_mut(id) {
            obj.header.collectable = Collectable::Pending;
            self.recycle.push(id);
        }
    }

    /// Confirmation pass over the bin. Returns the number of objects freed.
    pub fn scan_recycle_bin(&mut self, force: bool) -> usize {
        let pool = &mut self.pool;
        let confirmed = self.recycle.scan(force, |id| match pool.get_mut(id) {
            None => Verdict::Gone,
            Some(obj) if obj.header.nref > 0 => {
                obj.header.collectable = Collectable::Live;
                Verdict::Revived
            }
            Some(_) => Verdict::Waiting,
        });
        let freed = confirmed.len();
        for id in confirmed {
            let mut refs = Vec::new();
            self.clear_object(id, &mut refs);
            debug_assert!(refs.is_empty());
            self.free_object(id);
        }
        self.stats.recycle_scans += 1;
        self.stats.recycle_confirmed += freed;
        log::trace!("recycle bin scan: freed {freed}, {} parked", self.recycle.len());
        freed
    }

    // ==================== Anchors ====================

    pub fn anchor(&mut self, id: GcId) {
        *self.anchors.entry(id).or_insert(0) += 1;
    }

    /// Drop one anchor; returns false if the object was not anchored
    pub fn unanchor(&mut self, id: GcId) -> bool {
        match self.anchors.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.anchors.swap_remove(&id);
                true
            }
            None => false,
        }
    }

    // ==================== Finalizers ====================

    /// Register or unregister an object for finalization
    pub fn set_finalizable(&mut self, id: GcId, finalizable: bool) {
        let Some(obj) = self.pool.get_mut(id) else {
            return;
        };
        if finalizable {
            if obj.header.collectable == Collectable::Live {
                obj.header.collectable = Collectable::Finalize;
                self.finobj.insert(id);
            }
        } else if obj.header.collectable == Collectable::Finalize {
            obj.header.collectable = Collectable::Live;
            self.finobj.swap_remove(&id);
        }
    }

    /// Queue a finalizable object directly, taking a counted reference
    pub(crate) fn queue_finalizer(&mut self, id: GcId) {
        if let Some(obj) = self.pool.get_mut(id) {
            obj.header.collectable = Collectable::Live;
            obj.header.nref += 1;
            self.finobj.swap_remove(&id);
            self.tobefnz.push_back(id);
        }
    }

    // ==================== Queries ====================

    pub fn string_bytes(&self, id: GcId) -> Option<&[u8]> {
        self.pool.get(id)?.as_string().map(|s| s.as_bytes())
    }

    pub fn is_interned(&self, id: GcId) -> bool {
        self.pool
            .get(id)
            .and_then(|o| o.as_string())
            .is_some_and(|s| s.prev.is_some())
    }
}
