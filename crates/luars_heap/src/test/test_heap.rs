// Tests for the heap API: object kinds, roots, memory limit and shutdown

#[cfg(test)]
mod tests {
    use crate::lua_value::LUA_TSTRING;
    use crate::test::common::self_cycle;
    use crate::{GcObjectKind, LuaError, LuaHeap, LuaValue};

    #[test]
    fn test_new_heap_roots() {
        let mut heap = LuaHeap::default();
        let registry = heap.registry();
        assert_eq!(heap.value_kind(registry), Some(GcObjectKind::Table));
        assert_eq!(heap.value_kind(heap.globals()), Some(GcObjectKind::Table));
        assert_eq!(heap.value_kind(heap.main_thread()), Some(GcObjectKind::Thread));
        assert_eq!(heap.running_thread(), heap.main_thread());
        assert_eq!(heap.stack_top(heap.main_thread()).unwrap(), 0);

        assert!(heap.get_global("missing").unwrap().is_nil());
        heap.set_global("answer", LuaValue::integer(42)).unwrap();
        assert_eq!(heap.get_global("answer").unwrap(), LuaValue::integer(42));
        heap.set_global("answer", LuaValue::nil()).unwrap();
        assert!(heap.get_global("answer").unwrap().is_nil());
    }

    #[test]
    fn test_globals_hold_values() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        heap.set_global("t", t).unwrap();
        heap.release(t).unwrap();
        assert!(heap.is_alive(t));
        heap.set_global("t", LuaValue::nil()).unwrap();
        assert!(!heap.is_alive(t));
    }

    #[test]
    fn test_table_len_and_next() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(4, 0).unwrap();
        for i in 1..=3 {
            heap.table_set_int(t, i, LuaValue::integer(i * 10)).unwrap();
        }
        assert_eq!(heap.table_len(t).unwrap(), 3);

        let mut seen = Vec::new();
        let mut key = LuaValue::nil();
        while let Some((k, v)) = heap.table_next(t, key).unwrap() {
            seen.push((k.as_integer().unwrap(), v.as_integer().unwrap()));
            key = k;
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn test_upvalues_share_and_close() {
        let mut heap = LuaHeap::default();
        let thread = heap.main_thread();
        heap.push(thread, LuaValue::integer(1)).unwrap();
        heap.push(thread, LuaValue::integer(2)).unwrap();

        let a = heap.create_upvalue(thread, 1).unwrap();
        let b = heap.create_upvalue(thread, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.ref_count(a), Some(2));
        assert!(matches!(
            heap.create_upvalue(thread, 5),
            Err(LuaError::RuntimeError(_))
        ));

        // writes through an open upvalue land on the stack
        heap.upvalue_set(a, LuaValue::integer(7)).unwrap();
        assert_eq!(heap.stack_get(thread, 1).unwrap(), LuaValue::integer(7));

        heap.pop(thread, 1).unwrap();
        assert_eq!(heap.stack_top(thread).unwrap(), 1);
        assert_eq!(heap.upvalue_get(a).unwrap(), LuaValue::integer(7));

        // once closed it holds its own copy
        heap.upvalue_set(a, LuaValue::integer(8)).unwrap();
        assert_eq!(heap.upvalue_get(a).unwrap(), LuaValue::integer(8));
        assert_eq!(heap.stack_get(thread, 0).unwrap(), LuaValue::integer(1));

        // a new upvalue on a reused slot is a new object
        heap.push(thread, LuaValue::integer(3)).unwrap();
        let c = heap.create_upvalue(thread, 1).unwrap();
        assert_ne!(a, c);
        heap.close_upvalues(thread, 0).unwrap();
        assert_eq!(heap.upvalue_get(c).unwrap(), LuaValue::integer(3));
    }

    #[test]
    fn test_closed_upvalue_keeps_value() {
        let mut heap = LuaHeap::default();
        let thread = heap.create_thread().unwrap();
        let t = heap.create_table(0, 0).unwrap();
        heap.push(thread, t).unwrap();
        heap.release(t).unwrap();
        let uv = heap.create_upvalue(thread, 0).unwrap();

        heap.pop(thread, 1).unwrap();
        assert!(heap.is_alive(t));
        assert_eq!(heap.upvalue_get(uv).unwrap(), t);

        heap.release(uv).unwrap();
        assert!(!heap.is_alive(t));
        heap.release(thread).unwrap();
    }

    #[test]
    fn test_proto_and_closure() {
        let mut heap = LuaHeap::default();
        let source = heap.create_string("@main.lua").unwrap();
        let k = heap.create_string("constant").unwrap();
        let child = heap.create_proto(source, &[], &[], 16).unwrap();
        let proto = heap.create_proto(source, &[k, LuaValue::integer(3)], &[child], 64).unwrap();
        for v in [source, k, child] {
            heap.release(v).unwrap();
        }
        assert!(heap.is_alive(child));
        assert_eq!(heap.ref_count(source), Some(2));

        let closure = heap.create_closure(proto, &[]).unwrap();
        assert_eq!(heap.value_kind(closure), Some(GcObjectKind::Closure));
        heap.release(proto).unwrap();
        assert!(heap.is_alive(proto));

        heap.release(closure).unwrap();
        assert!(!heap.is_alive(proto));
        assert!(!heap.is_alive(child));
        // the strings are parked, not gone
        assert!(heap.is_interned(k));
        heap.force_recycle_drain();
        assert!(!heap.is_alive(k));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        assert_eq!(heap.create_closure(t, &[]), Err(LuaError::InvalidHandle));
        assert_eq!(heap.push(t, LuaValue::nil()), Err(LuaError::InvalidHandle));
        assert_eq!(heap.user_value(t), Err(LuaError::InvalidHandle));
        assert_eq!(heap.table_len(LuaValue::integer(1)), Err(LuaError::InvalidHandle));
        let s = heap.create_string("x").unwrap();
        assert_eq!(heap.set_metatable(t, s), Err(LuaError::InvalidHandle));
    }

    #[test]
    fn test_userdata_payload_and_user_value() {
        let mut heap = LuaHeap::default();
        let ud = heap.create_userdata(4).unwrap();
        assert_eq!(heap.value_kind(ud), Some(GcObjectKind::Userdata));
        heap.userdata_payload_mut(ud).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&*heap.userdata_payload_mut(ud).unwrap(), &[1u8, 2, 3, 4][..]);

        assert!(heap.user_value(ud).unwrap().is_nil());
        let t = heap.create_table(0, 0).unwrap();
        heap.set_user_value(ud, t).unwrap();
        heap.release(t).unwrap();
        assert_eq!(heap.user_value(ud).unwrap(), t);

        heap.release(ud).unwrap();
        assert!(!heap.is_alive(t));
    }

    #[test]
    fn test_metatables() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        let mt = heap.create_table(0, 0).unwrap();
        heap.set_metatable(t, mt).unwrap();
        heap.release(mt).unwrap();
        assert_eq!(heap.get_metatable(t), Some(mt));
        heap.set_metatable(t, LuaValue::nil()).unwrap();
        assert_eq!(heap.get_metatable(t), None);
        assert!(!heap.is_alive(mt));

        // strings share the record of their type
        let s = heap.create_string("abc").unwrap();
        let smt = heap.create_table(0, 0).unwrap();
        assert!(matches!(
            heap.set_metatable(s, smt),
            Err(LuaError::RuntimeError(_))
        ));
        heap.set_type_metatable(LUA_TSTRING, smt).unwrap();
        heap.release(smt).unwrap();
        assert_eq!(heap.get_metatable(s), Some(smt));
        assert_eq!(heap.get_metatable(t), None);
        assert!(heap.set_type_metatable(200, LuaValue::nil()).is_err());

        // the type record is a root for tracing
        heap.request_full_collection(false).unwrap();
        assert!(heap.is_alive(smt));
        heap.set_type_metatable(LUA_TSTRING, LuaValue::nil()).unwrap();
        assert!(!heap.is_alive(smt));
    }

    #[test]
    fn test_emergency_collection_makes_room() {
        let mut heap = LuaHeap::default();
        heap.option.max_memory_limit = heap.total_bytes() + 16 * 1024;
        for _ in 0..2000 {
            let t = self_cycle(&mut heap);
            heap.release(t).unwrap();
        }
        assert!(heap.stats().emergency_collections > 0);
        assert!(heap.total_bytes() <= heap.option.max_memory_limit);
    }

    #[test]
    fn test_out_of_memory_when_everything_is_held() {
        let mut heap = LuaHeap::default();
        heap.option.max_memory_limit = heap.total_bytes() + 16 * 1024;
        let mut held = Vec::new();
        let err = loop {
            match heap.create_table(8, 0) {
                Ok(t) => held.push(t),
                Err(e) => break e,
            }
            assert!(held.len() < 100_000, "memory limit never reached");
        };
        assert_eq!(err, LuaError::MemoryError);
        assert!(heap.stats().emergency_collections > 0);

        // freeing some memory lets allocation succeed again
        for t in held.drain(..) {
            heap.release(t).unwrap();
        }
        let t = heap.create_table(8, 0).unwrap();
        assert!(heap.is_alive(t));
    }

    #[test]
    fn test_close_frees_everything() {
        let mut heap = LuaHeap::default();
        let kept = heap.create_table(0, 0).unwrap();
        let name = heap.create_string("kept").unwrap();
        let long = heap.create_string(&"l".repeat(100)).unwrap();
        heap.table_set(kept, name, long).unwrap();
        let cycle = self_cycle(&mut heap);
        heap.release(cycle).unwrap();
        let boxed = heap.box_integer(1 << 40).unwrap();
        let ud = heap.create_userdata(32).unwrap();
        heap.set_user_value(ud, kept).unwrap();
        let thread = heap.create_thread().unwrap();
        heap.push(thread, ud).unwrap();
        heap.create_upvalue(thread, 0).unwrap();
        heap.set_global("boxed", boxed).unwrap();
        let parked = heap.create_string("parked").unwrap();
        heap.release(parked).unwrap();

        heap.close();
        let stats = heap.stats();
        assert_eq!(stats.objects_allocated, stats.objects_freed);
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.intern_count(), 0);
        assert_eq!(heap.total_bytes(), 0);

        // closing again does nothing
        heap.close();
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_close_empties_intern_table_and_integer_pool() {
        let mut heap = LuaHeap::default();
        // interned keys and pooled integers reachable only from a cycle
        let cycle = self_cycle(&mut heap);
        for i in 0..50 {
            let key = heap.create_string(&format!("key{i}")).unwrap();
            let boxed = heap.box_integer((1 << 40) + i).unwrap();
            heap.table_set(cycle, key, boxed).unwrap();
            heap.release(key).unwrap();
            heap.release(boxed).unwrap();
        }
        heap.release(cycle).unwrap();

        let thread = heap.create_thread().unwrap();
        let held = heap.box_integer(1 << 50).unwrap();
        heap.push(thread, held).unwrap();
        assert!(heap.intern_count() > 50);

        // shutdown asserts both tables are empty before clearing them
        heap.close();
        assert_eq!(heap.intern_count(), 0);
        assert_eq!(heap.object_count(), 0);
    }
}
