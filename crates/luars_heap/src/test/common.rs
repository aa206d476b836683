// Helpers shared by the heap tests

use crate::{CFunction, LuaHeap, LuaResult, LuaValue};

/// Finalizer that bumps the global `finalized`
pub fn counting_finalizer(heap: &mut LuaHeap, _args: &[LuaValue]) -> LuaResult<()> {
    let n = heap.get_global("finalized")?.as_integer().unwrap_or(0);
    heap.set_global("finalized", LuaValue::integer(n + 1))
}

/// Counts like `counting_finalizer`, then stores its object in the global
/// `saved`
pub fn resurrecting_finalizer(heap: &mut LuaHeap, args: &[LuaValue]) -> LuaResult<()> {
    counting_finalizer(heap, args)?;
    heap.set_global("saved", args[0])
}

pub fn failing_finalizer(_heap: &mut LuaHeap, _args: &[LuaValue]) -> LuaResult<()> {
    Err(crate::LuaError::RuntimeError("boom".to_string()))
}

pub fn finalized_count(heap: &mut LuaHeap) -> i64 {
    heap.get_global("finalized").unwrap().as_integer().unwrap_or(0)
}

/// Behavior record with `__gc` set to `finalizer`; the caller owns the handle
pub fn gc_metatable(heap: &mut LuaHeap, finalizer: CFunction) -> LuaValue {
    let mt = heap.create_table(0, 1).unwrap();
    let key = heap.create_string("__gc").unwrap();
    heap.table_set(mt, key, LuaValue::cfunction(finalizer)).unwrap();
    heap.release(key).unwrap();
    mt
}

/// Behavior record with `__mode` set to `mode`
pub fn weak_metatable(heap: &mut LuaHeap, mode: &str) -> LuaValue {
    let mt = heap.create_table(0, 1).unwrap();
    let key = heap.create_string("__mode").unwrap();
    let value = heap.create_string(mode).unwrap();
    heap.table_set(mt, key, value).unwrap();
    heap.release(key).unwrap();
    heap.release(value).unwrap();
    mt
}

/// Table holding itself at index 1
pub fn self_cycle(heap: &mut LuaHeap) -> LuaValue {
    let t = heap.create_table(1, 0).unwrap();
    heap.table_set_int(t, 1, t).unwrap();
    t
}

/// Table registered for finalization, holding itself at index 1. Only the
/// returned handle keeps it out of cycle scans.
pub fn finalizable_cycle(heap: &mut LuaHeap, finalizer: CFunction) -> LuaValue {
    let t = self_cycle(heap);
    let mt = gc_metatable(heap, finalizer);
    heap.set_metatable(t, mt).unwrap();
    heap.release(mt).unwrap();
    t
}

/// Step the tracing collector until the current cycle completes
pub fn finish_cycle(heap: &mut LuaHeap) {
    for _ in 0..100_000 {
        if heap.step_collector().unwrap() {
            return;
        }
    }
    panic!("tracing cycle did not finish");
}
