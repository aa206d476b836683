// Heap runtime context
// Owns the object allocator and the tracing collector, and is the only way
// embedder code creates or drops references to heap objects.
mod collector;
mod finalizer;
mod lua_error;
pub mod lua_limits;
mod safe_option;

use crate::gc::{Collectable, GC, GcObject, GcObjectData, GcState, GcStats, ObjectAllocator};
use crate::lua_value::{
    CClosure, LUA_NUMTYPES, LUA_VTABLE, LuaClosure, LuaProto, LuaTable, LuaThread, LuaUpvalue,
    LuaUserdata, LuaValue,
};
use crate::lua_vm::lua_limits::{LUA_RIDX_GLOBALS, LUA_RIDX_MAINTHREAD};
use crate::{GcId, GcKind, GcObjectKind};
pub use lua_error::{CFunction, LuaError, LuaResult};
pub use safe_option::{FinalizerErrors, SafeOption};

pub struct LuaHeap {
    pub(crate) alloc: ObjectAllocator,
    pub(crate) gc: GC,
    pub(crate) option: SafeOption,

    /// Registry table: holds the main thread and the globals table.
    /// The heap owns one reference to it.
    registry: LuaValue,
    main_thread: LuaValue,
    /// Thread finalizers run on; the heap owns one reference to it
    running_thread: LuaValue,
    /// Behavior records shared by every value of a basic type
    type_metatables: [Option<GcId>; LUA_NUMTYPES],

    /// First finalizer error of an explicit collection request
    pub(crate) finalizer_error: Option<LuaError>,
    /// Finalizer errors are being collected for the current request
    pub(crate) collect_errors: bool,
    closed: bool,
}

impl LuaHeap {
    pub fn new(option: SafeOption) -> Self {
        let mut alloc = ObjectAllocator::new(&option);
        alloc.init_constants();
        alloc.gens.enabled = option.gc_kind == GcKind::Generational;
        let gc = GC::new(
            option.gc_kind,
            option.gc_pause,
            option.gc_stepmul,
            option.gc_stepsize,
        );

        let mut heap = LuaHeap {
            alloc,
            gc,
            option,
            registry: LuaValue::nil(),
            main_thread: LuaValue::nil(),
            running_thread: LuaValue::nil(),
            type_metatables: [None; LUA_NUMTYPES],
            finalizer_error: None,
            collect_errors: false,
            closed: false,
        };

        let registry = heap.alloc_internal(
            GcObjectKind::Table,
            GcObjectData::Table(LuaTable::new(2, 0)),
            std::mem::size_of::<LuaTable>(),
        );
        let main_thread = heap.alloc_internal(
            GcObjectKind::Thread,
            GcObjectData::Thread(LuaThread::new()),
            std::mem::size_of::<LuaThread>(),
        );
        let globals = heap.alloc_internal(
            GcObjectKind::Table,
            GcObjectData::Table(LuaTable::new(0, 32)),
            std::mem::size_of::<LuaTable>(),
        );
        heap.alloc.inc_ref(registry);
        heap.alloc.inc_ref(main_thread);
        heap.registry = registry;
        heap.main_thread = main_thread;
        heap.running_thread = main_thread;
        for (slot, value) in [(LUA_RIDX_MAINTHREAD, main_thread), (LUA_RIDX_GLOBALS, globals)] {
            // fresh table, integer keys: cannot fail
            let _ = heap.raw_table_set(registry, LuaValue::integer(slot), value);
        }

        heap.gc.gc_marked = heap.alloc.total_bytes as isize;
        heap.gc.set_pause(&mut heap.alloc);
        log::debug!(
            "heap created: {} bytes, {} pinned objects",
            heap.alloc.total_bytes,
            heap.alloc.pool.len()
        );
        heap
    }

    /// Object for the heap's own bookkeeping: no anchor, no step point
    fn alloc_internal(&mut self, kind: GcObjectKind, data: GcObjectData, size: usize) -> LuaValue {
        let id = self.alloc.alloc_object(kind, data, size);
        let value = self.alloc.value_of(id).unwrap_or_default();
        if let Some(obj) = self.alloc.get(id) {
            self.gc.track_size(obj.header.size as usize);
        }
        value
    }

    // ==================== Allocation ====================

    /// Make room for `size` payload bytes under the memory limit. On
    /// failure an emergency collection runs once before giving up.
    fn reserve(&mut self, size: usize) -> LuaResult<()> {
        let size = size + std::mem::size_of::<GcObject>();
        if self.fits(size) {
            return Ok(());
        }
        if !self.gc.gc_stopem && !self.alloc.gens.collecting {
            log::debug!(
                "allocation of {size} bytes over the limit, running emergency collection"
            );
            self.full_gc(true);
        }
        if self.fits(size) {
            Ok(())
        } else {
            log::warn!(
                "out of memory: {} bytes in use, {size} requested, limit {}",
                self.alloc.total_bytes,
                self.option.max_memory_limit
            );
            Err(LuaError::MemoryError)
        }
    }

    #[inline]
    fn fits(&self, size: usize) -> bool {
        self.alloc.total_bytes.saturating_add(size) <= self.option.max_memory_limit
    }

    /// Store a new object. Its outgoing references are retained; the
    /// caller gets an anchored handle.
    fn allocate(&mut self, kind: GcObjectKind, data: GcObjectData, size: usize) -> LuaResult<LuaValue> {
        let mut children = Vec::new();
        data.for_each_ref(|v| children.push(v));
        for child in &children {
            self.check_alive(*child)?;
        }
        self.reserve(size)?;
        for child in children {
            self.alloc.inc_ref(child);
        }
        let id = self.alloc.alloc_object(kind, data, size);
        self.finish_allocation(id, true)
    }

    fn finish_allocation(&mut self, id: GcId, fresh: bool) -> LuaResult<LuaValue> {
        if fresh {
            if let Some(obj) = self.alloc.get(id) {
                self.gc.track_size(obj.header.size as usize);
            }
        }
        let value = self.alloc.value_of(id).ok_or(LuaError::InvalidHandle)?;
        self.alloc.inc_ref_id(id);
        self.alloc.anchor(id);
        if fresh {
            self.check_gc();
        }
        Ok(value)
    }

    pub fn create_table(&mut self, narr: usize, nrec: usize) -> LuaResult<LuaValue> {
        let table = LuaTable::new(narr, nrec);
        let size = table.estimated_size();
        self.allocate(GcObjectKind::Table, GcObjectData::Table(table), size)
    }

    pub fn create_closure(&mut self, proto: LuaValue, upvalues: &[LuaValue]) -> LuaResult<LuaValue> {
        self.expect_object(proto, GcObjectKind::Proto)?;
        for uv in upvalues {
            self.expect_object(*uv, GcObjectKind::Upvalue)?;
        }
        let size = std::mem::size_of::<LuaClosure>()
            + upvalues.len() * std::mem::size_of::<LuaValue>();
        let closure = LuaClosure {
            proto,
            upvalues: upvalues.to_vec(),
        };
        self.allocate(GcObjectKind::Closure, GcObjectData::Closure(closure), size)
    }

    pub fn create_c_closure(&mut self, func: CFunction, upvalues: &[LuaValue]) -> LuaResult<LuaValue> {
        let size = std::mem::size_of::<CClosure>()
            + upvalues.len() * std::mem::size_of::<LuaValue>();
        let closure = CClosure {
            func,
            upvalues: upvalues.to_vec(),
        };
        self.allocate(GcObjectKind::CClosure, GcObjectData::CClosure(closure), size)
    }

    /// Prototype produced by a compiler: its source name, constants and
    /// nested prototypes. Bytecode is only accounted for by size.
    pub fn create_proto(
        &mut self,
        source: LuaValue,
        constants: &[LuaValue],
        protos: &[LuaValue],
        code_size: usize,
    ) -> LuaResult<LuaValue> {
        for p in protos {
            self.expect_object(*p, GcObjectKind::Proto)?;
        }
        let size = std::mem::size_of::<LuaProto>()
            + (constants.len() + protos.len()) * std::mem::size_of::<LuaValue>()
            + code_size;
        let proto = LuaProto {
            source,
            constants: constants.to_vec(),
            protos: protos.to_vec(),
        };
        self.allocate(GcObjectKind::Proto, GcObjectData::Proto(proto), size)
    }

    pub fn create_userdata(&mut self, size: usize) -> LuaResult<LuaValue> {
        let total = std::mem::size_of::<LuaUserdata>() + size;
        self.allocate(
            GcObjectKind::Userdata,
            GcObjectData::Userdata(LuaUserdata::new(size)),
            total,
        )
    }

    pub fn create_thread(&mut self) -> LuaResult<LuaValue> {
        self.allocate(
            GcObjectKind::Thread,
            GcObjectData::Thread(LuaThread::new()),
            std::mem::size_of::<LuaThread>(),
        )
    }

    /// Open upvalue for stack slot `index` of `thread`. An upvalue already
    /// open on that slot is shared.
    pub fn create_upvalue(&mut self, thread: LuaValue, index: usize) -> LuaResult<LuaValue> {
        let thread_id = self.expect_object(thread, GcObjectKind::Thread)?;
        let th = self.thread_ref(thread_id)?;
        if index >= th.stack.len() {
            return Err(LuaError::RuntimeError(format!(
                "stack index {index} out of range"
            )));
        }
        let existing = th.open_upvalues.iter().copied().find(|uv| {
            matches!(
                self.alloc.get(*uv).and_then(|o| o.as_upvalue()),
                Some(LuaUpvalue::Open { index: i, .. }) if *i == index
            )
        });
        if let Some(uv) = existing {
            return self.finish_allocation(uv, false);
        }

        let value = self.allocate(
            GcObjectKind::Upvalue,
            GcObjectData::Upvalue(LuaUpvalue::Open {
                thread: thread_id,
                index,
            }),
            std::mem::size_of::<LuaUpvalue>(),
        )?;
        let uv = value.gc_id().ok_or(LuaError::InvalidHandle)?;

        // keep the open list sorted by stack index
        let th = self.thread_ref(thread_id)?;
        let pos = th.open_upvalues.partition_point(|other| {
            matches!(
                self.alloc.get(*other).and_then(|o| o.as_upvalue()),
                Some(LuaUpvalue::Open { index: i, .. }) if *i < index
            )
        });
        self.thread_mut(thread_id)?.open_upvalues.insert(pos, uv);
        self.alloc.twups.insert(thread_id);
        Ok(value)
    }

    /// Short strings are interned: equal content gives the same object
    pub fn create_string(&mut self, s: &str) -> LuaResult<LuaValue> {
        self.create_binary_string(s.as_bytes())
    }

    pub fn create_binary_string(&mut self, bytes: &[u8]) -> LuaResult<LuaValue> {
        self.reserve(bytes.len())?;
        let before = self.alloc.stats.objects_allocated;
        let id = self.alloc.create_string(bytes);
        let fresh = self.alloc.stats.objects_allocated != before;
        self.finish_allocation(id, fresh)
    }

    pub fn box_integer(&mut self, i: i64) -> LuaResult<LuaValue> {
        self.reserve(8)?;
        let before = self.alloc.stats.objects_allocated;
        let id = self.alloc.box_integer(i);
        let fresh = self.alloc.stats.objects_allocated != before;
        self.finish_allocation(id, fresh)
    }

    pub fn box_float(&mut self, n: f64) -> LuaResult<LuaValue> {
        self.reserve(8)?;
        let id = self.alloc.box_float(n);
        self.finish_allocation(id, true)
    }

    // ==================== Object model ====================

    pub fn value_kind(&self, value: LuaValue) -> Option<GcObjectKind> {
        self.alloc.get(value.gc_id()?).map(|o| o.header.kind)
    }

    pub fn collectable_state(&self, value: LuaValue) -> Collectable {
        value
            .gc_id()
            .and_then(|id| self.alloc.get(id))
            .map_or(Collectable::Immediate, |o| o.header.collectable)
    }

    pub fn ref_count(&self, value: LuaValue) -> Option<i32> {
        self.alloc.get(value.gc_id()?).map(|o| o.header.nref)
    }

    /// Immediates are always alive; a heap value is alive while its slot
    /// still holds it and it has not been torn down
    pub fn is_alive(&self, value: LuaValue) -> bool {
        match value.gc_id() {
            None => true,
            Some(id) => self.alloc.get(id).is_some_and(|o| !o.is_shell()),
        }
    }

    pub fn generation_of(&self, value: LuaValue) -> Option<usize> {
        self.alloc.generation_of(value.gc_id()?)
    }

    pub fn string_bytes(&self, value: LuaValue) -> Option<&[u8]> {
        self.alloc.string_bytes(value.gc_id()?)
    }

    pub fn unbox_integer(&self, value: LuaValue) -> Option<i64> {
        match self.alloc.get(value.gc_id()?)?.data {
            GcObjectData::BoxedInt(i) => Some(i),
            _ => None,
        }
    }

    pub fn unbox_float(&self, value: LuaValue) -> Option<f64> {
        match self.alloc.get(value.gc_id()?)?.data {
            GcObjectData::BoxedFloat(n) => Some(n),
            _ => None,
        }
    }

    /// Hash of a string value; long strings compute it on first use
    pub fn string_hash(&mut self, value: LuaValue) -> Option<u64> {
        self.alloc.hash_long_string(value.gc_id()?)
    }

    fn check_alive(&self, value: LuaValue) -> LuaResult<()> {
        if self.is_alive(value) {
            Ok(())
        } else {
            Err(LuaError::InvalidHandle)
        }
    }

    pub(crate) fn expect_object(&self, value: LuaValue, kind: GcObjectKind) -> LuaResult<GcId> {
        let id = value.gc_id().ok_or(LuaError::InvalidHandle)?;
        match self.alloc.get(id) {
            Some(obj) if obj.header.kind == kind && !obj.is_shell() => Ok(id),
            _ => Err(LuaError::InvalidHandle),
        }
    }

    fn table_ref(&self, id: GcId) -> LuaResult<&LuaTable> {
        self.alloc
            .get(id)
            .and_then(|o| o.as_table())
            .ok_or(LuaError::InvalidHandle)
    }

    fn table_mut(&mut self, id: GcId) -> LuaResult<&mut LuaTable> {
        self.alloc
            .get_mut(id)
            .and_then(|o| o.as_table_mut())
            .ok_or(LuaError::InvalidHandle)
    }

    fn thread_ref(&self, id: GcId) -> LuaResult<&LuaThread> {
        self.alloc
            .get(id)
            .and_then(|o| o.as_thread())
            .ok_or(LuaError::InvalidHandle)
    }

    fn thread_mut(&mut self, id: GcId) -> LuaResult<&mut LuaThread> {
        self.alloc
            .get_mut(id)
            .and_then(|o| o.as_thread_mut())
            .ok_or(LuaError::InvalidHandle)
    }

    // ==================== Refcount protocol ====================

    /// Take an embedder reference to `value`
    pub fn retain(&mut self, value: LuaValue) -> LuaResult<()> {
        let Some(id) = value.gc_id() else {
            return Ok(());
        };
        self.check_alive(value)?;
        self.alloc.inc_ref_id(id);
        self.alloc.anchor(id);
        Ok(())
    }

    /// Drop an embedder reference taken by `retain` or an allocation
    pub fn release(&mut self, value: LuaValue) -> LuaResult<()> {
        let Some(id) = value.gc_id() else {
            return Ok(());
        };
        if !self.alloc.unanchor(id) {
            return Err(LuaError::InvalidHandle);
        }
        self.alloc.dec_ref_id(id);
        Ok(())
    }

    /// Store `value` into an embedder-held slot: retain the new value,
    /// release the old one, then store. On error the slot is untouched.
    pub fn assign(&mut self, slot: &mut LuaValue, value: LuaValue) -> LuaResult<()> {
        if slot.gc_id().is_some_and(|id| !self.alloc.anchors.contains_key(&id)) {
            return Err(LuaError::InvalidHandle);
        }
        self.retain(value)?;
        let old = std::mem::replace(slot, value);
        self.release(old)
    }

    // ==================== Barriers ====================

    /// `container` now references `value`
    pub fn forward_barrier(&mut self, container: LuaValue, value: LuaValue) {
        if let Some(id) = container.gc_id() {
            self.gc.barrier(&mut self.alloc, id, value);
        }
    }

    /// `container` was mutated and must be traversed again
    pub fn backward_barrier(&mut self, container: LuaValue) {
        if let Some(id) = container.gc_id() {
            self.gc.barrier_back(&mut self.alloc, id);
        }
    }

    // ==================== Containers ====================

    /// Raw read. The result is borrowed from the table: retain it to keep
    /// it past the next mutation.
    pub fn table_get(&self, table: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
        let id = self.expect_object(table, GcObjectKind::Table)?;
        Ok(self.table_ref(id)?.raw_get(&key).unwrap_or_default())
    }

    pub fn table_get_int(&self, table: LuaValue, key: i64) -> LuaResult<LuaValue> {
        let id = self.expect_object(table, GcObjectKind::Table)?;
        Ok(self.table_ref(id)?.get_int(key).unwrap_or_default())
    }

    /// Raw write; a nil value removes the entry
    pub fn table_set(&mut self, table: LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        self.expect_object(table, GcObjectKind::Table)?;
        self.check_alive(key)?;
        self.check_alive(value)?;
        self.raw_table_set(table, key, value)
    }

    pub fn table_set_int(&mut self, table: LuaValue, key: i64, value: LuaValue) -> LuaResult<()> {
        self.table_set(table, LuaValue::integer(key), value)
    }

    fn raw_table_set(&mut self, table: LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let id = table.gc_id().ok_or(LuaError::InvalidHandle)?;
        self.alloc.inc_ref(value);
        let displaced = match self.table_mut(id).and_then(|t| t.raw_set(key, value)) {
            Ok(displaced) => displaced,
            Err(e) => {
                self.alloc.dec_ref(value);
                return Err(e);
            }
        };
        if displaced.key_inserted {
            self.alloc.inc_ref(key);
        }
        if value.is_collectable() || (displaced.key_inserted && key.is_collectable()) {
            self.gc.barrier_back(&mut self.alloc, id);
        }
        for old in displaced.value.into_iter().chain(displaced.key) {
            self.alloc.dec_ref(old);
        }
        Ok(())
    }

    /// Border of the array part
    pub fn table_len(&self, table: LuaValue) -> LuaResult<usize> {
        let id = self.expect_object(table, GcObjectKind::Table)?;
        Ok(self.table_ref(id)?.len())
    }

    /// Iterate with `next`: pass nil for the first entry
    pub fn table_next(&self, table: LuaValue, key: LuaValue) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        let id = self.expect_object(table, GcObjectKind::Table)?;
        Ok(self.table_ref(id)?.next(&key))
    }

    /// Attach a behavior record to a table or userdata; nil removes it.
    /// A record with a `__gc` function registers the object for
    /// finalization.
    pub fn set_metatable(&mut self, object: LuaValue, metatable: LuaValue) -> LuaResult<()> {
        let id = object.gc_id().ok_or(LuaError::InvalidHandle)?;
        let mt = if metatable.is_nil() {
            None
        } else {
            Some(self.expect_object(metatable, GcObjectKind::Table)?)
        };
        let obj = self.alloc.get_mut(id).ok_or(LuaError::InvalidHandle)?;
        let slot = match &mut obj.data {
            GcObjectData::Table(t) => &mut t.metatable,
            GcObjectData::Userdata(u) => &mut u.metatable,
            _ => {
                return Err(LuaError::RuntimeError(format!(
                    "cannot set the metatable of a {} value",
                    object.type_name()
                )));
            }
        };
        let old = std::mem::replace(slot, mt);
        if let Some(mt) = mt {
            self.alloc.inc_ref_id(mt);
            self.gc.barrier(&mut self.alloc, id, metatable);
        }
        if let Some(old) = old {
            self.alloc.dec_ref(LuaValue::from_gc(LUA_VTABLE, old));
        }
        if mt.is_some() && self.gc_metamethod(id).is_some() {
            self.alloc.set_finalizable(id, true);
        }
        Ok(())
    }

    pub fn get_metatable(&self, value: LuaValue) -> Option<LuaValue> {
        let own = value
            .gc_id()
            .and_then(|id| self.alloc.get(id))
            .filter(|o| o.header.kind.may_finalize());
        let mt = match own {
            Some(obj) => obj.metatable(),
            None => self
                .type_metatables
                .get(value.base_type() as usize)
                .copied()
                .flatten(),
        };
        mt.map(|id| LuaValue::from_gc(LUA_VTABLE, id))
    }

    /// Behavior record for every value of basic type `base_type` that has
    /// no record of its own
    pub fn set_type_metatable(&mut self, base_type: u8, metatable: LuaValue) -> LuaResult<()> {
        let index = base_type as usize;
        if index >= LUA_NUMTYPES {
            return Err(LuaError::RuntimeError(format!("invalid type tag {base_type}")));
        }
        let mt = if metatable.is_nil() {
            None
        } else {
            Some(self.expect_object(metatable, GcObjectKind::Table)?)
        };
        if let Some(mt) = mt {
            self.alloc.inc_ref_id(mt);
        }
        let old = std::mem::replace(&mut self.type_metatables[index], mt);
        if let Some(old) = old {
            self.alloc.dec_ref(LuaValue::from_gc(LUA_VTABLE, old));
        }
        Ok(())
    }

    pub(crate) fn type_metatables_ids(&self) -> impl Iterator<Item = GcId> + '_ {
        self.type_metatables.iter().flatten().copied()
    }

    // ==================== Userdata ====================

    pub fn set_user_value(&mut self, userdata: LuaValue, value: LuaValue) -> LuaResult<()> {
        let id = self.expect_object(userdata, GcObjectKind::Userdata)?;
        self.check_alive(value)?;
        self.alloc.inc_ref(value);
        let old = match self.alloc.get_mut(id).and_then(|o| o.as_userdata_mut()) {
            Some(ud) => std::mem::replace(&mut ud.user_value, value),
            None => LuaValue::nil(),
        };
        self.gc.barrier(&mut self.alloc, id, value);
        self.alloc.dec_ref(old);
        Ok(())
    }

    pub fn user_value(&self, userdata: LuaValue) -> LuaResult<LuaValue> {
        let id = self.expect_object(userdata, GcObjectKind::Userdata)?;
        Ok(self
            .alloc
            .get(id)
            .and_then(|o| o.as_userdata())
            .map(|u| u.user_value)
            .unwrap_or_default())
    }

    pub fn userdata_payload_mut(&mut self, userdata: LuaValue) -> LuaResult<&mut [u8]> {
        let id = self.expect_object(userdata, GcObjectKind::Userdata)?;
        self.alloc
            .get_mut(id)
            .and_then(|o| o.as_userdata_mut())
            .map(|u| u.payload_mut())
            .ok_or(LuaError::InvalidHandle)
    }

    // ==================== Threads and upvalues ====================

    pub fn push(&mut self, thread: LuaValue, value: LuaValue) -> LuaResult<()> {
        let id = self.expect_object(thread, GcObjectKind::Thread)?;
        self.check_alive(value)?;
        self.alloc.inc_ref(value);
        self.thread_mut(id)?.stack.push(value);
        Ok(())
    }

    /// Drop the top `n` slots, closing upvalues open on them
    pub fn pop(&mut self, thread: LuaValue, n: usize) -> LuaResult<()> {
        let id = self.expect_object(thread, GcObjectKind::Thread)?;
        let top = self.thread_ref(id)?.stack.len();
        self.set_top(id, top.saturating_sub(n))
    }

    pub(crate) fn set_top(&mut self, thread: GcId, new_top: usize) -> LuaResult<()> {
        self.close_upvalues_at(thread, new_top)?;
        let dropped: Vec<LuaValue> = {
            let th = self.thread_mut(thread)?;
            if new_top >= th.stack.len() {
                return Ok(());
            }
            th.stack.drain(new_top..).collect()
        };
        for v in dropped {
            self.alloc.defer_release(v);
        }
        self.alloc.drain_releases();
        Ok(())
    }

    pub fn stack_top(&self, thread: LuaValue) -> LuaResult<usize> {
        let id = self.expect_object(thread, GcObjectKind::Thread)?;
        Ok(self.thread_ref(id)?.top())
    }

    pub fn stack_get(&self, thread: LuaValue, index: usize) -> LuaResult<LuaValue> {
        let id = self.expect_object(thread, GcObjectKind::Thread)?;
        Ok(self
            .thread_ref(id)?
            .stack
            .get(index)
            .copied()
            .unwrap_or_default())
    }

    pub fn stack_set(&mut self, thread: LuaValue, index: usize, value: LuaValue) -> LuaResult<()> {
        let id = self.expect_object(thread, GcObjectKind::Thread)?;
        self.check_alive(value)?;
        if index >= self.thread_ref(id)?.stack.len() {
            return Err(LuaError::RuntimeError(format!(
                "stack index {index} out of range"
            )));
        }
        self.alloc.inc_ref(value);
        let th = self.thread_mut(id)?;
        let old = std::mem::replace(&mut th.stack[index], value);
        self.alloc.dec_ref(old);
        Ok(())
    }

    /// Close every upvalue of `thread` open at or above `level`
    pub fn close_upvalues(&mut self, thread: LuaValue, level: usize) -> LuaResult<()> {
        let id = self.expect_object(thread, GcObjectKind::Thread)?;
        self.close_upvalues_at(id, level)
    }

    fn close_upvalues_at(&mut self, thread: GcId, level: usize) -> LuaResult<()> {
        let closing: Vec<GcId> = self
            .thread_ref(thread)?
            .open_upvalues
            .iter()
            .copied()
            .filter(|uv| {
                matches!(
                    self.alloc.get(*uv).and_then(|o| o.as_upvalue()),
                    Some(LuaUpvalue::Open { index, .. }) if *index >= level
                )
            })
            .collect();
        if closing.is_empty() {
            return Ok(());
        }

        let mut refs = Vec::new();
        self.alloc.close_thread_upvalues(thread, level, &mut refs);
        for uv in closing {
            // a marked upvalue turns black once closed; its new value must
            // not be left white behind it
            let value = match self.alloc.get_mut(uv) {
                Some(obj) if !obj.header.is_white() => {
                    obj.header.make_black();
                    match obj.as_upvalue() {
                        Some(LuaUpvalue::Closed(v)) => Some(*v),
                        _ => None,
                    }
                }
                _ => None,
            };
            if let Some(v) = value {
                self.gc.barrier(&mut self.alloc, uv, v);
            }
        }
        for v in refs {
            self.alloc.defer_release(v);
        }
        self.alloc.drain_releases();
        Ok(())
    }

    pub fn upvalue_get(&self, upvalue: LuaValue) -> LuaResult<LuaValue> {
        let id = self.expect_object(upvalue, GcObjectKind::Upvalue)?;
        match self.alloc.get(id).and_then(|o| o.as_upvalue()) {
            Some(LuaUpvalue::Open { thread, index }) => Ok(self
                .thread_ref(*thread)?
                .stack
                .get(*index)
                .copied()
                .unwrap_or_default()),
            Some(LuaUpvalue::Closed(v)) => Ok(*v),
            None => Err(LuaError::InvalidHandle),
        }
    }

    pub fn upvalue_set(&mut self, upvalue: LuaValue, value: LuaValue) -> LuaResult<()> {
        let id = self.expect_object(upvalue, GcObjectKind::Upvalue)?;
        self.check_alive(value)?;
        let state = self.alloc.get(id).and_then(|o| o.as_upvalue()).copied();
        match state {
            Some(LuaUpvalue::Open { thread, index }) => {
                let thread = self.alloc.value_of(thread).ok_or(LuaError::InvalidHandle)?;
                self.stack_set(thread, index, value)
            }
            Some(LuaUpvalue::Closed(_)) => {
                self.alloc.inc_ref(value);
                let old = match self.alloc.get_mut(id).and_then(|o| o.as_upvalue_mut()) {
                    Some(uv) => std::mem::replace(uv, LuaUpvalue::Closed(value)),
                    None => LuaUpvalue::Closed(LuaValue::nil()),
                };
                self.gc.barrier(&mut self.alloc, id, value);
                if let LuaUpvalue::Closed(old) = old {
                    self.alloc.dec_ref(old);
                }
                Ok(())
            }
            None => Err(LuaError::InvalidHandle),
        }
    }

    pub fn main_thread(&self) -> LuaValue {
        self.main_thread
    }

    pub fn running_thread(&self) -> LuaValue {
        self.running_thread
    }

    /// Switch the thread finalizers run on
    pub fn set_running_thread(&mut self, thread: LuaValue) -> LuaResult<()> {
        self.expect_object(thread, GcObjectKind::Thread)?;
        self.alloc.inc_ref(thread);
        let old = std::mem::replace(&mut self.running_thread, thread);
        self.alloc.dec_ref(old);
        Ok(())
    }

    // ==================== Globals ====================

    pub fn registry(&self) -> LuaValue {
        self.registry
    }

    pub fn globals(&self) -> LuaValue {
        self.table_get_int(self.registry, LUA_RIDX_GLOBALS)
            .unwrap_or_default()
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) -> LuaResult<()> {
        let key = self.create_string(name)?;
        let globals = self.globals();
        let result = self.table_set(globals, key, value);
        self.release(key)?;
        result
    }

    /// Borrowed like `table_get`
    pub fn get_global(&mut self, name: &str) -> LuaResult<LuaValue> {
        let key = self.create_string(name)?;
        let globals = self.globals();
        let result = self.table_get(globals, key);
        self.release(key)?;
        result
    }

    // ==================== Interning and constants ====================

    /// Number of strings in the intern table
    pub fn intern_count(&self) -> usize {
        self.alloc.strings.len()
    }

    pub fn is_interned(&self, value: LuaValue) -> bool {
        value.gc_id().is_some_and(|id| self.alloc.is_interned(id))
    }

    /// Free every recycle bin entry whose count is still zero. Returns the
    /// number of objects freed.
    pub fn force_recycle_drain(&mut self) -> usize {
        self.alloc.scan_recycle_bin(true)
    }

    pub fn recycle_len(&self) -> usize {
        self.alloc.recycle.len()
    }

    pub fn const_true(&self) -> LuaValue {
        LuaValue::boolean(true)
    }

    pub fn const_false(&self) -> LuaValue {
        LuaValue::boolean(false)
    }

    pub fn const_nil(&self) -> LuaValue {
        LuaValue::nil()
    }

    /// Pinned boxed integer, for values in the cached range
    pub fn small_integer(&self, i: i64) -> Option<LuaValue> {
        self.alloc.constant_integer(i)
    }

    // ==================== Collector state ====================

    pub fn stats(&self) -> &GcStats {
        &self.alloc.stats
    }

    pub fn gc_state(&self) -> GcState {
        self.gc.gc_state
    }

    pub fn gc_kind(&self) -> GcKind {
        self.gc.gc_kind
    }

    /// Memory in use, as whole kilobytes and the remaining bytes
    pub fn gc_count(&self) -> (usize, usize) {
        let total = self.alloc.total_bytes;
        (total / 1024, total % 1024)
    }

    pub fn total_bytes(&self) -> usize {
        self.alloc.total_bytes
    }

    /// Number of live heap objects, pinned constants included
    pub fn object_count(&self) -> usize {
        self.alloc.pool.len()
    }

    // ==================== Shutdown ====================

    /// Run every pending finalizer, drop all roots and free the heap.
    /// Called on drop; calling it twice is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.close_heap();
        self.closed = true;
    }

    fn close_heap(&mut self) {
        // every object still registered gets its finalizer now
        self.gc.separate_tobefnz(&mut self.alloc, true);
        self.run_pending_finalizers();

        self.gc.gc_stopped = true;
        self.alloc.gens.enabled = false;

        let anchors: Vec<(GcId, u32)> = self.alloc.anchors.drain(..).collect();
        for (id, count) in anchors {
            let Some(value) = self.alloc.value_of(id) else {
                continue;
            };
            for _ in 0..count {
                self.alloc.defer_release(value);
            }
        }
        self.alloc.drain_releases();

        for index in 0..LUA_NUMTYPES {
            if let Some(mt) = self.type_metatables[index].take() {
                self.alloc.dec_ref(LuaValue::from_gc(LUA_VTABLE, mt));
            }
        }
        let running = std::mem::take(&mut self.running_thread);
        self.alloc.dec_ref(running);
        let registry = std::mem::take(&mut self.registry);
        self.main_thread = LuaValue::nil();
        self.alloc.dec_ref(registry);

        // whatever is left is cyclic garbage; finalizers registered by the
        // finalizers above still get to run
        loop {
            self.generation_scan_queueing();
            if self.alloc.tobefnz.is_empty() {
                break;
            }
            self.run_pending_finalizers();
        }

        self.alloc.release_constants();
        self.alloc.scan_recycle_bin(true);
        debug_assert!(self.alloc.consts.is_empty());

        debug_assert!(
            self.alloc.strings.is_empty() && self.alloc.int_pool.is_empty(),
            "heap closed with {} interned strings and {} pooled integers",
            self.alloc.strings.len(),
            self.alloc.int_pool.len()
        );
        let leftover = self.alloc.pool.len();
        if leftover > 0 {
            log::warn!("heap closed with {leftover} objects still alive");
        }
        log::debug!(
            "heap closed: {} objects allocated, {} freed",
            self.alloc.stats.objects_allocated,
            self.alloc.stats.objects_freed
        );
        self.alloc.pool.clear();
        self.alloc.strings.clear();
        self.alloc.int_pool.clear();
        self.alloc.recycle.clear();
        self.alloc.total_bytes = 0;
    }
}

impl Default for LuaHeap {
    fn default() -> Self {
        Self::new(SafeOption::default())
    }
}

impl Drop for LuaHeap {
    fn drop(&mut self) {
        self.close();
    }
}
