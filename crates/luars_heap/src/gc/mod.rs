// Garbage collection for the heap
//
// Two collectors share one object store:
// - Reference counting with generational trial deletion (generation.rs):
//   acyclic garbage dies the moment its count reaches zero, cycles of
//   composite objects are found by scanning generations
// - An incremental tri-color mark & sweep (this file), kept as the
//   whole-heap baseline and as the driver of finalizers and weak tables
//
// GC States of the tracing collector:
// - Pause: between cycles
// - Propagate: marking objects
// - EnterAtomic / Atomic: finish marking in one go, clear weak tables,
//   separate objects to be finalized, flip the current white
// - SwpAllGc: sweep regular objects
// - SwpFinObj: sweep objects with finalizers
// - SwpToBeFnz: sweep objects to be finalized
// - SwpEnd: sweep finished, shrink tables
// - CallFin: call finalizers
//
// Tri-color invariant: Black objects cannot point to white objects

mod const_pool;
mod gc_id;
mod gc_kind;
mod gc_object;
mod gc_pool;
mod generation;
mod object_allocator;
mod recycle_bin;
mod string_interner;
mod traverse;

use crate::lua_value::{LuaUpvalue, LuaValue};
use crate::lua_vm::lua_limits::{GCFINNUM, GCSWEEPMAX, NUM_GENERATIONS};
pub use const_pool::*;
pub use gc_id::*;
pub use gc_kind::*;
pub use gc_object::*;
pub use gc_pool::*;
pub use generation::*;
pub use object_allocator::*;
pub use recycle_bin::*;
pub use string_interner::*;

// GC Parameters
pub const PAUSE: usize = 0; // Pause between GC cycles (default 200%)
pub const STEPMUL: usize = 1; // GC speed multiplier (default 200)
pub const STEPSIZE: usize = 2; // Step size in bytes
pub const GCPARAM_COUNT: usize = 3;

/// Maximum l_mem value
const MAX_LMEM: isize = isize::MAX;

/// Compute ceil(log2(x)) for GC parameter encoding
fn ceil_log2(x: u32) -> u8 {
    static LOG_2: [u8; 256] = [
        0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
        5, 5, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
        6, 6, 6, 6, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
        7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
        7, 7, 7, 7, 7, 7, 7, 7, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
        8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
        8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
        8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
        8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
    ];
    let mut x = x.saturating_sub(1);
    let mut l: u32 = 0;
    while x >= 256 {
        l += 8;
        x >>= 8;
    }
    (l as u8) + LOG_2[x as usize]
}

/// Encode a percentage value 'p' as a floating-point byte (eeeexxxx).
///
/// The exponent is represented using excess-7. The representation
/// normalizes the number when possible, assuming an extra 1 before the
/// mantissa (xxxx) and adding one to the exponent (eeee) to signal that.
/// So, the real value is (1xxxx) * 2^(eeee - 7 - 1) if eeee != 0, and
/// (xxxx) * 2^-7 otherwise (subnormal numbers).
pub fn code_param(p: u32) -> u8 {
    if p >= ((0x1Fu64) << (0xF - 7 - 1)) as u32 * 100 {
        return 0xFF;
    }

    // p' = (p * 128 + 99) / 100 (round up the division)
    let p_scaled = ((p as u64) * 128 + 99) / 100;

    if p_scaled < 0x10 {
        p_scaled as u8
    } else {
        // p >= 0x10 implies ceil(log2(p + 1)) >= 5; preserve 5 bits
        let log = ceil_log2((p_scaled + 1) as u32).saturating_sub(5);
        let mantissa = ((p_scaled >> log) - 0x10) as u8;
        let exponent = ((log as u8) + 1) << 4;
        mantissa | exponent
    }
}

/// Approximate percentage stored in an encoded byte; inverse of `code_param`
pub fn decode_param(p: u8) -> i32 {
    let m = (p & 0xF) as isize;
    let e = (p >> 4) as i32;
    let x: isize = 100;

    let (m_full, e_adj) = if e > 0 {
        (m + 0x10, e - 1 - 7)
    } else {
        (m, -7)
    };

    if e_adj >= 0 {
        ((x * m_full) << e_adj as u32) as i32
    } else {
        ((x * m_full) >> (-e_adj) as u32) as i32
    }
}

/// Which strategy reclaims garbage. Reference counting is always on.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum GcKind {
    /// Generational scans triggered by allocation count; the tracing
    /// collector only runs on explicit request
    #[default]
    Generational = 0,
    /// Tracing collector stepped by allocation debt; no generational scans
    Incremental = 1,
}

/// GC state machine
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum GcState {
    Propagate = 0,
    EnterAtomic = 1,
    Atomic = 2,
    SwpAllGc = 3,
    SwpFinObj = 4,
    SwpToBeFnz = 5,
    SwpEnd = 6,
    CallFin = 7,
    Pause = 8,
}

impl GcState {
    pub fn is_sweep_phase(self) -> bool {
        matches!(
            self,
            GcState::SwpAllGc | GcState::SwpFinObj | GcState::SwpToBeFnz | GcState::SwpEnd
        )
    }

    /// Black objects must not point to white ones while this holds
    pub fn keep_invariant(self) -> bool {
        (self as u8) <= (GcState::Atomic as u8)
    }
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GcStats {
    pub objects_allocated: usize,
    pub objects_freed: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
    pub freed_by_refcount: usize,
    pub freed_by_scan: usize,
    pub freed_by_sweep: usize,
    pub generation_scans: [usize; NUM_GENERATIONS],
    pub promoted_objects: usize,
    pub collection_count: usize,
    pub emergency_collections: usize,
    pub finalizers_called: usize,
    pub finalizer_errors: usize,
    pub recycle_scans: usize,
    pub recycle_confirmed: usize,
    pub recycle_revived: usize,
}

/// Tracing collector state. Objects live in the `ObjectAllocator`, which
/// every method takes explicitly.
pub struct GC {
    /// Bytes that may still be allocated before the next step; a step is
    /// due once it drops to zero
    pub gc_debt: isize,
    /// Bytes marked in the current cycle
    pub gc_marked: isize,

    pub gc_state: GcState,
    pub gc_kind: GcKind,
    pub gc_emergency: bool,
    /// Stops collector re-entry while a step or finalizer is running
    pub gc_stopem: bool,
    /// Collector stopped by the embedder
    pub gc_stopped: bool,

    /// Stored as compressed floating-point bytes, see `code_param`
    pub gc_params: [u8; GCPARAM_COUNT],

    pub gray: Vec<GcId>,
    /// Objects to be revisited at atomic phase
    pub grayagain: Vec<GcId>,
    /// Weak value tables
    pub weak: Vec<GcId>,
    /// Ephemeron tables (weak keys)
    pub ephemeron: Vec<GcId>,
    /// Fully weak tables, and ephemerons with white keys
    pub allweak: Vec<GcId>,

    /// Next arena slot the sweep looks at
    sweep_index: usize,
    /// Number of finalizers to run in the next CallFin step
    pub gcfinnum: usize,

    /// References dropped by weak-table clearing, released after atomic
    pending_releases: Vec<LuaValue>,
    scratch: Vec<LuaValue>,
}

impl GC {
    pub fn new(kind: GcKind, pause: u32, stepmul: u32, stepsize: u32) -> Self {
        GC {
            gc_debt: 0,
            gc_marked: 0,
            gc_state: GcState::Pause,
            gc_kind: kind,
            gc_emergency: false,
            gc_stopem: false,
            gc_stopped: false,
            gc_params: [code_param(pause), code_param(stepmul), code_param(stepsize)],
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(64),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            sweep_index: 0,
            gcfinnum: GCFINNUM,
            pending_releases: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Charge an allocation against the debt
    #[inline]
    pub fn track_size(&mut self, size: usize) {
        self.gc_debt -= size as isize;
    }

    #[inline]
    pub fn should_collect(&self) -> bool {
        self.gc_debt <= 0
    }

    pub fn set_debt(&mut self, debt: isize, total_bytes: usize) {
        let real_bytes = total_bytes as isize;
        self.gc_debt = debt.min(MAX_LMEM - real_bytes);
    }

    /// Computes 'p' times 'x', where 'p' is a floating-point byte.
    /// Returns MAX_LMEM on overflow.
    pub(crate) fn apply_param(&self, param_idx: usize, value: isize) -> isize {
        let p = self.gc_params[param_idx];
        let x = value;

        let m = (p & 0xF) as isize;
        let e = (p >> 4) as i32;

        let (m_full, e_adj) = if e > 0 {
            (m + 0x10, e - 1 - 7)
        } else {
            (m, -7)
        };

        if e_adj >= 0 {
            let e_adj = e_adj as u32;
            let max_safe = (MAX_LMEM / 0x1F) >> e_adj;
            if x < max_safe {
                (x * m_full) << e_adj
            } else {
                MAX_LMEM
            }
        } else {
            let e_neg = (-e_adj) as u32;
            if x < MAX_LMEM / 0x1F {
                (x * m_full) >> e_neg
            } else if (x >> e_neg) < MAX_LMEM / 0x1F {
                (x >> e_neg) * m_full
            } else {
                MAX_LMEM
            }
        }
    }

    pub fn keep_invariant(&self) -> bool {
        self.gc_state.keep_invariant()
    }

    // ============ Marking ============

    /// Mark root set and reset all gray lists, to start a new collection
    pub(crate) fn restart_collection(&mut self, alloc: &mut ObjectAllocator, roots: &[LuaValue]) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();
        self.sweep_index = 0;
        self.gc_marked = 0;
        self.mark_roots(alloc, roots);
    }

    /// Roots: the values handed in by the heap, embedder anchors, objects
    /// already queued for finalization, and the members of a generational
    /// scan in progress
    fn mark_roots(&mut self, alloc: &mut ObjectAllocator, roots: &[LuaValue]) {
        for value in roots {
            self.mark_value(alloc, *value);
        }
        let anchored: Vec<GcId> = alloc.anchors.keys().copied().collect();
        for id in anchored {
            self.mark_object(alloc, id);
        }
        self.mark_being_fnz(alloc);
        if alloc.gens.collecting {
            for list in [ListId::Unreachable, ListId::Finalizers, ListId::Garbage] {
                for id in alloc.list_ids(list) {
                    self.mark_object(alloc, id);
                }
            }
        }
    }

    fn mark_being_fnz(&mut self, alloc: &mut ObjectAllocator) {
        let queued: Vec<GcId> = alloc.tobefnz.iter().copied().collect();
        for id in queued {
            self.mark_object(alloc, id);
        }
    }

    #[inline]
    pub(crate) fn mark_value(&mut self, alloc: &mut ObjectAllocator, value: LuaValue) {
        if let Some(id) = value.gc_id() {
            self.mark_object(alloc, id);
        }
    }

    /// Leaves go straight to black, upvalues are visited here, everything
    /// else is grayed for later traversal. Fixed objects are gray forever
    /// and so never re-marked.
    pub(crate) fn mark_object(&mut self, alloc: &mut ObjectAllocator, id: GcId) {
        let Some(obj) = alloc.pool.get_mut(id) else {
            return;
        };
        if !obj.header.is_white() {
            return;
        }
        self.gc_marked += obj.header.size as isize;

        if obj.header.kind.is_leaf() {
            obj.header.make_black();
            return;
        }

        let upvalue_target = match obj.as_upvalue().copied() {
            Some(LuaUpvalue::Open { thread, index }) => {
                // open upvalues are kept gray
                obj.header.make_gray();
                alloc
                    .pool
                    .get(thread)
                    .and_then(|o| o.as_thread())
                    .and_then(|th| th.stack.get(index).copied())
            }
            Some(LuaUpvalue::Closed(v)) => {
                obj.header.make_black();
                Some(v)
            }
            None => {
                obj.header.make_gray();
                self.gray.push(id);
                return;
            }
        };
        if let Some(v) = upvalue_target {
            self.mark_value(alloc, v);
        }
    }

    fn is_white(&self, alloc: &ObjectAllocator, value: LuaValue) -> bool {
        value
            .gc_id()
            .and_then(|id| alloc.pool.get(id))
            .is_some_and(|o| o.header.is_white())
    }

    /// Whether a weak entry holding `value` must be cleared. Strings and
    /// boxed numbers are values, never weak: they get marked instead.
    fn is_cleared(&mut self, alloc: &mut ObjectAllocator, value: LuaValue) -> bool {
        let Some(id) = value.gc_id() else {
            return false;
        };
        let Some(obj) = alloc.pool.get(id) else {
            return true;
        };
        if obj.header.kind.is_leaf() {
            self.mark_object(alloc, id);
            false
        } else {
            obj.header.is_white()
        }
    }

    pub(crate) fn propagate_all(&mut self, alloc: &mut ObjectAllocator) {
        while !self.gray.is_empty() {
            self.propagate_mark(alloc);
        }
    }

    /// Traverse one gray object; returns the work done
    pub(crate) fn propagate_mark(&mut self, alloc: &mut ObjectAllocator) -> isize {
        match self.gray.pop() {
            Some(id) => self.mark_one(alloc, id),
            None => 0,
        }
    }

    fn mark_one(&mut self, alloc: &mut ObjectAllocator, id: GcId) -> isize {
        let Some(obj) = alloc.pool.get_mut(id) else {
            return 0;
        };
        match obj.data {
            GcObjectData::Table(_) => self.traverse_table(alloc, id),
            GcObjectData::Thread(_) => self.traverse_thread(alloc, id),
            _ => {
                obj.header.make_black();
                let mut refs = std::mem::take(&mut self.scratch);
                refs.clear();
                obj.data.for_each_ref(|v| refs.push(v));
                let work = 1 + refs.len() as isize;
                for v in refs.drain(..) {
                    self.mark_value(alloc, v);
                }
                self.scratch = refs;
                work
            }
        }
    }

    /// Stacks change without barriers, so a thread seen while propagating
    /// is traversed again in the atomic phase
    fn traverse_thread(&mut self, alloc: &mut ObjectAllocator, id: GcId) -> isize {
        let in_atomic = self.gc_state == GcState::Atomic;
        let shrink = in_atomic && !self.gc_emergency;
        let Some(obj) = alloc.pool.get_mut(id) else {
            return 0;
        };
        let Some(th) = obj.as_thread_mut() else {
            return 0;
        };
        if shrink {
            th.shrink_stack();
        }
        let stack = th.stack.clone();
        let upvalues = th.open_upvalues.clone();
        if in_atomic {
            obj.header.make_black();
        } else {
            obj.header.make_gray();
            self.grayagain.push(id);
        }

        for v in &stack {
            self.mark_value(alloc, *v);
        }
        for uv in &upvalues {
            self.mark_object(alloc, *uv);
        }
        1 + stack.len() as isize
    }

    /// Weak mode declared by the table's behavior record
    fn weak_mode(&self, alloc: &ObjectAllocator, table: GcId) -> Option<(bool, bool)> {
        let mt = alloc.pool.get(table)?.as_table()?.metatable?;
        let mode_key = alloc.value_of(alloc.consts.tm_mode()?)?;
        let mode = alloc.pool.get(mt)?.as_table()?.raw_get(&mode_key)?;
        let bytes = alloc.string_bytes(mode.gc_id()?)?;
        let weak_keys = bytes.contains(&b'k');
        let weak_values = bytes.contains(&b'v');
        (weak_keys || weak_values).then_some((weak_keys, weak_values))
    }

    fn traverse_table(&mut self, alloc: &mut ObjectAllocator, id: GcId) -> isize {
        let metatable = alloc.pool.get(id).and_then(|o| o.metatable());
        if let Some(mt) = metatable {
            self.mark_object(alloc, mt);
        }
        match self.weak_mode(alloc, id) {
            None => self.traverse_strong_table(alloc, id),
            Some((false, true)) => self.traverse_weak_value(alloc, id),
            Some((true, false)) => {
                self.traverse_ephemeron(alloc, id, false);
                1
            }
            Some((true, true)) => self.traverse_fully_weak(alloc, id),
            Some((false, false)) => unreachable!(),
        }
    }

    fn table_entries(alloc: &ObjectAllocator, id: GcId) -> Vec<(LuaValue, LuaValue)> {
        alloc
            .pool
            .get(id)
            .and_then(|o| o.as_table())
            .map(|t| t.iter_all())
            .unwrap_or_default()
    }

    fn set_black(alloc: &mut ObjectAllocator, id: GcId) {
        if let Some(obj) = alloc.pool.get_mut(id) {
            obj.header.make_black();
        }
    }

    fn link_gray(alloc: &mut ObjectAllocator, id: GcId, list: &mut Vec<GcId>) {
        if let Some(obj) = alloc.pool.get_mut(id) {
            obj.header.make_gray();
        }
        list.push(id);
    }

    fn traverse_strong_table(&mut self, alloc: &mut ObjectAllocator, id: GcId) -> isize {
        Self::set_black(alloc, id);
        let entries = Self::table_entries(alloc, id);
        for (k, v) in &entries {
            self.mark_value(alloc, *k);
            self.mark_value(alloc, *v);
        }
        1 + entries.len() as isize
    }

    /// Keys are strong, values weak
    fn traverse_weak_value(&mut self, alloc: &mut ObjectAllocator, id: GcId) -> isize {
        let entries = Self::table_entries(alloc, id);
        let mut has_clears = false;
        for (k, v) in &entries {
            self.mark_value(alloc, *k);
            if !has_clears && self.is_cleared(alloc, *v) {
                has_clears = true;
            }
        }
        if self.gc_state == GcState::Atomic {
            if has_clears {
                Self::link_gray(alloc, id, &mut self.weak);
            } else {
                Self::set_black(alloc, id);
            }
        } else {
            Self::link_gray(alloc, id, &mut self.grayagain);
        }
        1 + entries.len() as isize
    }

    /// Keys are weak; a value is marked only once its key is. Returns true
    /// if any value was marked.
    fn traverse_ephemeron(&mut self, alloc: &mut ObjectAllocator, id: GcId, inv: bool) -> bool {
        let mut entries = Self::table_entries(alloc, id);
        if inv {
            entries.reverse();
        }
        let mut marked = false;
        let mut has_clears = false;
        let mut has_ww = false;
        for (k, v) in entries {
            if self.is_cleared(alloc, k) {
                has_clears = true;
                if self.is_white(alloc, v) {
                    has_ww = true;
                }
            } else if self.is_white(alloc, v) {
                marked = true;
                self.mark_value(alloc, v);
            }
        }

        if self.gc_state == GcState::Propagate {
            Self::link_gray(alloc, id, &mut self.grayagain);
        } else if has_ww {
            Self::link_gray(alloc, id, &mut self.ephemeron);
        } else if has_clears {
            Self::link_gray(alloc, id, &mut self.allweak);
        } else {
            Self::set_black(alloc, id);
        }
        marked
    }

    fn traverse_fully_weak(&mut self, alloc: &mut ObjectAllocator, id: GcId) -> isize {
        if self.gc_state == GcState::Propagate {
            Self::link_gray(alloc, id, &mut self.grayagain);
        } else {
            Self::link_gray(alloc, id, &mut self.allweak);
        }
        1
    }

    /// Traverse all ephemeron tables propagating marks from keys to values,
    /// until nothing new is marked. `dir` alternates the traversal order to
    /// speed up convergence on chains in the same table.
    fn converge_ephemerons(&mut self, alloc: &mut ObjectAllocator) {
        let mut dir = false;
        loop {
            let list = std::mem::take(&mut self.ephemeron);
            let mut changed = false;
            for id in list {
                Self::set_black(alloc, id);
                if self.traverse_ephemeron(alloc, id, dir) {
                    self.propagate_all(alloc);
                    changed = true;
                }
            }
            dir = !dir;
            if !changed {
                break;
            }
        }
    }

    /// Re-mark values of open upvalues whose thread was not traced this
    /// cycle; such a stack is not traversed, so the upvalue alone keeps
    /// the slot alive
    fn remark_upvalues(&mut self, alloc: &mut ObjectAllocator) {
        let threads: Vec<GcId> = alloc.twups.iter().copied().collect();
        for thread in threads {
            let Some(obj) = alloc.pool.get(thread) else {
                alloc.twups.swap_remove(&thread);
                continue;
            };
            if !obj.header.is_white() {
                continue;
            }
            let Some(th) = obj.as_thread() else {
                continue;
            };
            let mut values = Vec::new();
            for uv in &th.open_upvalues {
                let Some(uv_obj) = alloc.pool.get(*uv) else {
                    continue;
                };
                if uv_obj.header.is_white() {
                    continue;
                }
                if let Some(LuaUpvalue::Open { index, .. }) = uv_obj.as_upvalue() {
                    if let Some(v) = th.stack.get(*index) {
                        values.push(*v);
                    }
                }
            }
            for v in values {
                self.mark_value(alloc, v);
            }
        }
    }

    // ============ Weak table clearing ============

    /// Remove entries with unmarked keys from ephemeron and fully weak tables
    fn clear_by_keys(&mut self, alloc: &mut ObjectAllocator) {
        let tables: Vec<GcId> = self.ephemeron.iter().chain(&self.allweak).copied().collect();
        for id in tables {
            let entries = Self::table_entries(alloc, id);
            for (k, _) in entries {
                if self.is_cleared(alloc, k) {
                    self.remove_weak_entry(alloc, id, k);
                }
            }
        }
    }

    /// Remove entries with unmarked values, for tables at or past the given
    /// positions of the weak and all-weak lists
    fn clear_by_values(&mut self, alloc: &mut ObjectAllocator, from_weak: usize, from_all: usize) {
        let tables: Vec<GcId> = self.weak[from_weak.min(self.weak.len())..]
            .iter()
            .chain(&self.allweak[from_all.min(self.allweak.len())..])
            .copied()
            .collect();
        for id in tables {
            let entries = Self::table_entries(alloc, id);
            for (k, v) in entries {
                if self.is_cleared(alloc, v) {
                    self.remove_weak_entry(alloc, id, k);
                }
            }
        }
    }

    fn remove_weak_entry(&mut self, alloc: &mut ObjectAllocator, table: GcId, key: LuaValue) {
        let removed = alloc
            .pool
            .get_mut(table)
            .and_then(|o| o.as_table_mut())
            .and_then(|t| t.remove_entry(&key));
        if let Some((stored_key, value)) = removed {
            if let Some(k) = stored_key {
                self.pending_releases.push(k);
            }
            self.pending_releases.push(value);
        }
    }

    // ============ Atomic phase ============

    /// Move unreached objects with finalizers (or all of them, with `all`)
    /// to the queue of objects to be finalized
    pub(crate) fn separate_tobefnz(&mut self, alloc: &mut ObjectAllocator, all: bool) {
        let candidates: Vec<GcId> = alloc.finobj.iter().copied().collect();
        for id in candidates {
            let unreached = alloc.pool.get(id).is_some_and(|o| o.header.is_white());
            if all || unreached {
                alloc.queue_finalizer(id);
            }
        }
    }

    pub(crate) fn atomic(&mut self, alloc: &mut ObjectAllocator, roots: &[LuaValue]) {
        self.gc_state = GcState::Atomic;

        self.mark_roots(alloc, roots);
        self.propagate_all(alloc);
        self.remark_upvalues(alloc);
        self.propagate_all(alloc);

        let grayagain = std::mem::take(&mut self.grayagain);
        self.gray.extend(grayagain);
        self.propagate_all(alloc);

        // All strongly accessible objects are marked now
        self.converge_ephemerons(alloc);
        self.clear_by_values(alloc, 0, 0);
        let origweak = self.weak.len();
        let origall = self.allweak.len();

        // Finalizable objects that died are resurrected for their finalizer
        self.separate_tobefnz(alloc, false);
        self.mark_being_fnz(alloc);
        self.propagate_all(alloc);
        self.converge_ephemerons(alloc);

        self.clear_by_keys(alloc);
        self.clear_by_values(alloc, origweak, origall);

        alloc.current_white = GcHeader::otherwhite(alloc.current_white);

        for v in std::mem::take(&mut self.pending_releases) {
            alloc.defer_release(v);
        }
        alloc.drain_releases();
        log::trace!("atomic: {} bytes marked", self.gc_marked);
    }

    // ============ Sweep ============

    pub(crate) fn enter_sweep(&mut self) {
        self.gc_state = GcState::SwpAllGc;
        self.sweep_index = 0;
        self.gcfinnum = GCFINNUM;
    }

    /// Sweep up to GCSWEEPMAX slots (all of them with `fast`). Dead objects
    /// are torn down; survivors turn to the current white. Objects with a
    /// finalizer are left to their own sweep state, and objects owned by
    /// the recycle bin or a generational scan are only re-whitened.
    /// Returns true once every slot has been visited.
    pub(crate) fn sweep_step(&mut self, alloc: &mut ObjectAllocator, fast: bool) -> bool {
        let max_sweep = if fast { usize::MAX } else { GCSWEEPMAX };
        let current_white = alloc.current_white;
        let other_white = GcHeader::otherwhite(current_white);
        let mut count = 0;

        while self.sweep_index < alloc.pool.capacity() && count < max_sweep {
            let index = self.sweep_index;
            self.sweep_index += 1;
            count += 1;

            let Some(id) = alloc.pool.id_at(index) else {
                continue;
            };
            let Some(obj) = alloc.pool.get_mut(id) else {
                continue;
            };
            if obj.header.is_fixed() || obj.header.collectable == Collectable::Finalize {
                continue;
            }
            let parked = obj.header.collectable == Collectable::Pending;
            let scanning = obj.link().is_some_and(|l| l.list.is_scan_list());
            if parked || scanning || !obj.header.is_dead(other_white) {
                obj.header.make_white(current_white);
                continue;
            }

            let size = obj.header.size as isize;
            alloc.destroy_garbage(id);
            if !alloc.pool.is_valid(id) {
                self.gc_debt += size;
                alloc.stats.freed_by_sweep += 1;
            }
        }

        self.sweep_index >= alloc.pool.capacity()
    }

    pub(crate) fn sweep_finobj(&mut self, alloc: &mut ObjectAllocator) {
        let current_white = alloc.current_white;
        let ids: Vec<GcId> = alloc.finobj.iter().copied().collect();
        for id in ids {
            if let Some(obj) = alloc.pool.get_mut(id) {
                obj.header.make_white(current_white);
            }
        }
    }

    pub(crate) fn sweep_tobefnz(&mut self, alloc: &mut ObjectAllocator) {
        let current_white = alloc.current_white;
        let ids: Vec<GcId> = alloc.tobefnz.iter().copied().collect();
        for id in ids {
            if let Some(obj) = alloc.pool.get_mut(id) {
                obj.header.make_white(current_white);
            }
        }
    }

    /// End of sweep: shrink the intern table unless in an emergency
    pub(crate) fn sweep_end(&mut self, alloc: &mut ObjectAllocator) {
        if !self.gc_emergency {
            alloc.strings.check_shrink(&mut alloc.pool);
        }
    }

    pub fn set_pause(&mut self, alloc: &mut ObjectAllocator) {
        let threshold = self.apply_param(PAUSE, self.gc_marked);
        let real_bytes = alloc.total_bytes as isize;
        let debt = (threshold - real_bytes).max(0);
        self.set_debt(debt, alloc.total_bytes);
        if !self.gc_emergency {
            alloc.pool.shrink_to_fit();
        }
    }

    // ============ Write barriers ============

    /// Forward barrier: black object `o` now points to `v`. While marking,
    /// `v` is marked; during the sweep `o` is whitened instead so it does
    /// not trigger again.
    pub fn barrier(&mut self, alloc: &mut ObjectAllocator, o: GcId, v: LuaValue) {
        let Some(v_id) = v.gc_id() else {
            return;
        };
        let o_black = alloc.pool.get(o).is_some_and(|obj| obj.header.is_black());
        let v_white = alloc.pool.get(v_id).is_some_and(|obj| obj.header.is_white());
        if !o_black || !v_white {
            return;
        }

        if self.keep_invariant() {
            self.mark_object(alloc, v_id);
        } else if self.gc_state.is_sweep_phase() {
            let current_white = alloc.current_white;
            if let Some(obj) = alloc.pool.get_mut(o) {
                obj.header.make_white(current_white);
            }
        }
    }

    /// Backward barrier: black object `o` was mutated; gray it again so it
    /// is re-traversed instead of marking what was stored
    pub fn barrier_back(&mut self, alloc: &mut ObjectAllocator, o: GcId) {
        let Some(obj) = alloc.pool.get_mut(o) else {
            return;
        };
        if !obj.header.is_black() {
            return;
        }
        obj.header.make_gray();
        if self.keep_invariant() {
            self.grayagain.push(o);
        } else {
            self.gray.push(o);
        }
    }
}

impl Default for GC {
    fn default() -> Self {
        Self::new(GcKind::default(), 200, 200, 16000)
    }
}
