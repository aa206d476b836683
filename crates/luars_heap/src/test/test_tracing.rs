// Tests for the incremental tracing collector

#[cfg(test)]
mod tests {
    use crate::gc::{code_param, decode_param};
    use crate::test::common::{finish_cycle, self_cycle, weak_metatable};
    use crate::{GcKind, GcState, LuaHeap, LuaValue, SafeOption};

    fn incremental_heap() -> LuaHeap {
        LuaHeap::new(SafeOption {
            gc_kind: GcKind::Incremental,
            ..SafeOption::default()
        })
    }

    fn is_black(heap: &LuaHeap, value: LuaValue) -> bool {
        value
            .gc_id()
            .and_then(|id| heap.alloc.get(id))
            .is_some_and(|o| o.header.is_black())
    }

    /// Start a cycle and mark everything reachable, leaving the collector
    /// in its propagate phase
    fn mark_everything(heap: &mut LuaHeap) {
        assert_eq!(heap.gc_state(), GcState::Pause);
        heap.single_step(false);
        assert_eq!(heap.gc_state(), GcState::Propagate);
        heap.gc.propagate_all(&mut heap.alloc);
    }

    #[test]
    fn test_set_gc_kind() {
        let mut heap = LuaHeap::default();
        assert_eq!(heap.gc_kind(), GcKind::Generational);
        assert_eq!(heap.set_gc_kind(GcKind::Incremental), GcKind::Generational);
        assert_eq!(heap.gc_kind(), GcKind::Incremental);
        assert_eq!(heap.set_gc_kind(GcKind::Incremental), GcKind::Incremental);
        assert_eq!(heap.set_gc_kind(GcKind::Generational), GcKind::Incremental);
    }

    #[test]
    fn test_gc_count_matches_total() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(64, 0).unwrap();
        let (kb, rem) = heap.gc_count();
        assert!(rem < 1024);
        assert_eq!(kb * 1024 + rem, heap.total_bytes());
        heap.release(t).unwrap();
    }

    #[test]
    fn test_step_reaches_pause() {
        let mut heap = incremental_heap();
        finish_cycle(&mut heap);
        assert_eq!(heap.gc_state(), GcState::Pause);
    }

    #[test]
    fn test_tracing_frees_cycles() {
        let mut heap = incremental_heap();
        heap.stop_collector();
        let kept = heap.create_table(0, 0).unwrap();
        let cycles: Vec<LuaValue> = (0..10).map(|_| self_cycle(&mut heap)).collect();
        for t in &cycles {
            heap.release(*t).unwrap();
        }

        let swept_before = heap.stats().freed_by_sweep;
        finish_cycle(&mut heap);
        assert!(cycles.iter().all(|t| !heap.is_alive(*t)));
        assert!(heap.stats().freed_by_sweep >= swept_before + cycles.len());
        assert!(heap.is_alive(kept));
        assert!(heap.is_alive(heap.globals()));
    }

    #[test]
    fn test_allocation_drives_incremental_steps() {
        let mut heap = incremental_heap();
        let first = self_cycle(&mut heap);
        heap.release(first).unwrap();
        for _ in 0..20_000 {
            let t = self_cycle(&mut heap);
            heap.release(t).unwrap();
        }
        assert!(heap.stats().freed_by_sweep > 0);
        assert!(!heap.is_alive(first));
        // cycle collection is left to tracing in this mode
        assert_eq!(heap.stats().generation_scans, [0, 0, 0]);
    }

    #[test]
    fn test_weak_values_are_cleared() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(2, 0).unwrap();
        let mt = weak_metatable(&mut heap, "v");
        heap.set_metatable(t, mt).unwrap();
        heap.release(mt).unwrap();

        let obj = heap.create_table(0, 0).unwrap();
        let s = heap.create_string("kept as a value").unwrap();
        heap.table_set_int(t, 1, obj).unwrap();
        heap.table_set_int(t, 2, s).unwrap();
        heap.release(obj).unwrap();
        heap.release(s).unwrap();

        // the entry counts as a reference until a trace clears it
        assert!(heap.is_alive(obj));
        heap.request_full_collection(false).unwrap();
        assert!(!heap.is_alive(obj));
        assert!(heap.table_get_int(t, 1).unwrap().is_nil());
        assert_eq!(heap.table_get_int(t, 2).unwrap(), s);
    }

    #[test]
    fn test_weak_keys_are_cleared() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 2).unwrap();
        let mt = weak_metatable(&mut heap, "k");
        heap.set_metatable(t, mt).unwrap();
        heap.release(mt).unwrap();

        let dead = heap.create_table(0, 0).unwrap();
        let live = heap.create_table(0, 0).unwrap();
        heap.table_set(t, dead, LuaValue::integer(1)).unwrap();
        heap.table_set(t, live, LuaValue::integer(2)).unwrap();
        heap.release(dead).unwrap();

        heap.request_full_collection(false).unwrap();
        assert!(!heap.is_alive(dead));
        assert_eq!(heap.table_get(t, live).unwrap(), LuaValue::integer(2));
        assert_eq!(heap.table_next(t, LuaValue::nil()).unwrap(), Some((live, LuaValue::integer(2))));
    }

    #[test]
    fn test_ephemeron_value_pointing_at_its_key() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 1).unwrap();
        let mt = weak_metatable(&mut heap, "k");
        heap.set_metatable(t, mt).unwrap();
        heap.release(mt).unwrap();

        let key = heap.create_table(0, 0).unwrap();
        let value = heap.create_table(1, 0).unwrap();
        heap.table_set_int(value, 1, key).unwrap();
        heap.table_set(t, key, value).unwrap();
        heap.release(key).unwrap();
        heap.release(value).unwrap();

        heap.request_full_collection(false).unwrap();
        assert!(!heap.is_alive(key));
        assert!(!heap.is_alive(value));
        assert_eq!(heap.table_next(t, LuaValue::nil()).unwrap(), None);
    }

    #[test]
    fn test_fully_weak_table() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 1).unwrap();
        let mt = weak_metatable(&mut heap, "kv");
        heap.set_metatable(t, mt).unwrap();
        heap.release(mt).unwrap();

        let k = heap.create_table(0, 0).unwrap();
        let v = heap.create_table(0, 0).unwrap();
        heap.table_set(t, k, v).unwrap();
        heap.release(v).unwrap();

        // a live key does not keep a weak value
        heap.request_full_collection(false).unwrap();
        assert!(heap.is_alive(k));
        assert!(!heap.is_alive(v));
        assert!(heap.table_get(t, k).unwrap().is_nil());
    }

    #[test]
    fn test_backward_barrier_on_table_store() {
        let mut heap = incremental_heap();
        heap.stop_collector();
        let a = heap.create_table(1, 0).unwrap();
        mark_everything(&mut heap);
        assert!(is_black(&heap, a));

        // new objects are white; storing one into a black table grays it
        let late = heap.create_table(0, 0).unwrap();
        heap.table_set_int(a, 1, late).unwrap();
        assert!(!is_black(&heap, a));
        heap.release(late).unwrap();

        finish_cycle(&mut heap);
        assert!(heap.is_alive(late));
        assert_eq!(heap.table_get_int(a, 1).unwrap(), late);
    }

    #[test]
    fn test_forward_barrier_on_user_value() {
        let mut heap = incremental_heap();
        heap.stop_collector();
        let ud = heap.create_userdata(8).unwrap();
        mark_everything(&mut heap);
        assert!(is_black(&heap, ud));

        let late = heap.create_table(0, 0).unwrap();
        heap.set_user_value(ud, late).unwrap();
        // the stored value is marked, the holder stays black
        assert!(is_black(&heap, ud));
        assert!(!late.gc_id().and_then(|id| heap.alloc.get(id)).unwrap().header.is_white());
        heap.release(late).unwrap();

        finish_cycle(&mut heap);
        assert!(heap.is_alive(late));
        assert_eq!(heap.user_value(ud).unwrap(), late);
    }

    #[test]
    fn test_full_collection_abandons_mark_phase() {
        let mut heap = incremental_heap();
        heap.stop_collector();
        let kept = heap.create_table(0, 0).unwrap();
        mark_everything(&mut heap);

        let t = self_cycle(&mut heap);
        heap.release(t).unwrap();
        heap.request_full_collection(false).unwrap();
        assert_eq!(heap.gc_state(), GcState::Pause);
        assert!(!heap.is_alive(t));
        assert!(heap.is_alive(kept));
        assert_eq!(heap.stats().collection_count, 1);
    }

    #[test]
    fn test_open_upvalue_keeps_stack_slot() {
        let mut heap = incremental_heap();
        heap.stop_collector();
        let thread = heap.create_thread().unwrap();
        let value = heap.create_table(0, 0).unwrap();
        heap.push(thread, value).unwrap();
        heap.release(value).unwrap();
        let uv = heap.create_upvalue(thread, 0).unwrap();
        heap.release(thread).unwrap();

        // only the open upvalue refers to the thread
        finish_cycle(&mut heap);
        finish_cycle(&mut heap);
        assert!(heap.is_alive(value));
        assert_eq!(heap.upvalue_get(uv).unwrap(), value);
        heap.release(uv).unwrap();
    }

    #[test]
    fn test_explicit_barriers() {
        let mut heap = incremental_heap();
        heap.stop_collector();
        let a = heap.create_table(0, 0).unwrap();
        let b = heap.create_table(0, 0).unwrap();
        mark_everything(&mut heap);
        assert!(is_black(&heap, a));

        heap.backward_barrier(a);
        assert!(!is_black(&heap, a));
        // immediates never need a barrier
        heap.forward_barrier(b, LuaValue::integer(1));
        heap.backward_barrier(LuaValue::nil());
        assert!(is_black(&heap, b));
        finish_cycle(&mut heap);
        assert!(heap.is_alive(a));
        assert!(heap.is_alive(b));
    }

    #[test]
    fn test_param_encoding() {
        for p in [100, 200] {
            assert_eq!(decode_param(code_param(p)), p as i32);
        }
        assert_eq!(code_param(u32::MAX), 0xFF);
        let approx = decode_param(code_param(333));
        assert!((300..=340).contains(&approx));
    }
}
