// Tests for the refcount protocol

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::test::common::self_cycle;
    use crate::{Collectable, LuaError, LuaHeap, LuaValue};

    #[test]
    fn test_handle_counts() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        assert_eq!(heap.ref_count(t), Some(1));
        assert_eq!(heap.collectable_state(t), Collectable::Live);

        heap.retain(t).unwrap();
        assert_eq!(heap.ref_count(t), Some(2));
        heap.release(t).unwrap();
        assert_eq!(heap.ref_count(t), Some(1));
        assert!(heap.is_alive(t));

        heap.release(t).unwrap();
        assert!(!heap.is_alive(t));
        assert_eq!(heap.ref_count(t), None);
    }

    #[test]
    fn test_release_without_handle_fails() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        heap.release(t).unwrap();
        assert_eq!(heap.release(t), Err(LuaError::InvalidHandle));
        assert_eq!(heap.retain(t), Err(LuaError::InvalidHandle));
    }

    #[test]
    fn test_immediates_are_not_counted() {
        let mut heap = LuaHeap::default();
        for v in [
            LuaValue::nil(),
            heap.const_true(),
            heap.const_false(),
            LuaValue::integer(7),
            LuaValue::float(1.5),
        ] {
            heap.retain(v).unwrap();
            heap.release(v).unwrap();
            heap.release(v).unwrap();
            assert_eq!(heap.collectable_state(v), Collectable::Immediate);
            assert!(heap.is_alive(v));
        }
    }

    #[test]
    fn test_assign_retains_before_release() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        let mut slot = LuaValue::nil();

        heap.assign(&mut slot, t).unwrap();
        heap.release(t).unwrap();
        assert!(heap.is_alive(t));

        // self-assignment must not free the object on the way
        let same = slot;
        heap.assign(&mut slot, same).unwrap();
        assert!(heap.is_alive(t));
        assert_eq!(heap.ref_count(t), Some(1));

        heap.assign(&mut slot, LuaValue::nil()).unwrap();
        assert!(!heap.is_alive(t));
    }

    #[test]
    fn test_assign_failure_leaves_slot_untouched() {
        let mut heap = LuaHeap::default();
        let held = heap.create_table(0, 0).unwrap();
        let t = heap.create_table(0, 0).unwrap();
        heap.table_set_int(t, 1, held).unwrap();
        heap.release(held).unwrap();

        // the slot holds a value the embedder never retained
        let mut slot = held;
        let value = heap.create_table(0, 0).unwrap();
        assert_eq!(heap.assign(&mut slot, value), Err(LuaError::InvalidHandle));
        assert_eq!(slot, held);
        assert_eq!(heap.ref_count(value), Some(1));
        assert_eq!(heap.ref_count(held), Some(1));

        heap.release(value).unwrap();
        assert!(!heap.is_alive(value));
        heap.release(t).unwrap();
    }

    #[test]
    fn test_acyclic_containers_free_synchronously() {
        let mut heap = LuaHeap::default();
        let interned = heap.intern_count();
        let scanned = heap.stats().freed_by_scan;
        let by_refcount = heap.stats().freed_by_refcount;

        let mut tables = Vec::with_capacity(1000);
        let mut strings = Vec::with_capacity(1000);
        for i in 0..1000 {
            let t = heap.create_table(1, 0).unwrap();
            let s = heap.create_string(&format!("{i:060}")).unwrap();
            assert!(!heap.is_interned(s));
            heap.table_set_int(t, 1, s).unwrap();
            heap.release(s).unwrap();
            tables.push(t);
            strings.push(s);
        }
        assert_eq!(heap.intern_count(), interned);

        for t in &tables {
            heap.release(*t).unwrap();
        }
        assert!(tables.iter().all(|t| !heap.is_alive(*t)));
        assert!(strings.iter().all(|s| !heap.is_alive(*s)));
        assert_eq!(heap.stats().freed_by_scan, scanned);
        assert!(heap.stats().freed_by_refcount >= by_refcount + 2000);
        assert_eq!(heap.intern_count(), interned);
    }

    #[test]
    fn test_table_stores_are_counted() {
        let mut heap = LuaHeap::default();
        let outer = heap.create_table(0, 0).unwrap();
        let a = heap.create_table(0, 0).unwrap();
        let b = heap.create_table(0, 0).unwrap();
        let key = heap.create_string("slot").unwrap();

        heap.table_set(outer, key, a).unwrap();
        heap.release(a).unwrap();
        assert_eq!(heap.ref_count(a), Some(1));

        // overwriting drops the displaced value
        heap.table_set(outer, key, b).unwrap();
        assert!(!heap.is_alive(a));
        heap.release(b).unwrap();
        assert!(heap.is_alive(b));

        heap.table_set(outer, key, LuaValue::nil()).unwrap();
        assert!(!heap.is_alive(b));
        assert_eq!(heap.table_next(outer, LuaValue::nil()).unwrap(), None);

        heap.release(key).unwrap();
        heap.release(outer).unwrap();
    }

    #[test]
    fn test_table_keys_are_counted() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        let k = heap.create_table(0, 0).unwrap();
        heap.table_set(t, k, LuaValue::integer(1)).unwrap();
        heap.release(k).unwrap();
        assert!(heap.is_alive(k));

        // removing the entry gives the key's reference back
        heap.table_set(t, k, LuaValue::nil()).unwrap();
        assert!(!heap.is_alive(k));
    }

    #[test]
    fn test_invalid_keys() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        let v = heap.create_table(0, 0).unwrap();
        assert!(matches!(
            heap.table_set(t, LuaValue::nil(), v),
            Err(LuaError::InvalidKey(_))
        ));
        assert!(matches!(
            heap.table_set(t, LuaValue::float(f64::NAN), v),
            Err(LuaError::InvalidKey(_))
        ));
        // a failed store leaves the count alone
        assert_eq!(heap.ref_count(v), Some(1));
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut heap = LuaHeap::default();
        let t = heap.create_table(0, 0).unwrap();
        heap.release(t).unwrap();
        let fresh = heap.create_table(0, 0).unwrap();
        assert!(heap.is_alive(fresh));
        assert_eq!(heap.table_set_int(t, 1, fresh), Err(LuaError::InvalidHandle));
        assert_eq!(heap.table_get_int(t, 1), Err(LuaError::InvalidHandle));
    }

    #[test]
    fn test_long_chain_release_does_not_recurse() {
        let mut heap = LuaHeap::default();
        let freed_before = heap.stats().freed_by_refcount;
        let head = heap.create_table(1, 0).unwrap();
        let mut tail = head;
        let mut all = vec![head];
        for _ in 0..10_000 {
            let next = heap.create_table(1, 0).unwrap();
            heap.table_set_int(tail, 1, next).unwrap();
            heap.release(next).unwrap();
            all.push(next);
            tail = next;
        }
        assert!(all.iter().all(|t| heap.is_alive(*t)));

        heap.release(head).unwrap();
        assert!(all.iter().all(|t| !heap.is_alive(*t)));
        assert_eq!(heap.stats().freed_by_refcount - freed_before, all.len());
    }

    #[test]
    fn test_self_cycle_survives_refcount() {
        let mut heap = LuaHeap::default();
        let t = self_cycle(&mut heap);
        heap.release(t).unwrap();
        assert!(heap.is_alive(t));
        assert_eq!(heap.ref_count(t), Some(1));
    }

    const NODES: usize = 12;

    fn reachable(held: &[bool], children: &[Vec<usize>]) -> Vec<bool> {
        let mut live = vec![false; held.len()];
        let mut stack: Vec<usize> = (0..held.len()).filter(|&i| held[i]).collect();
        while let Some(i) = stack.pop() {
            if live[i] {
                continue;
            }
            live[i] = true;
            stack.extend(children[i].iter().copied());
        }
        live
    }

    proptest! {
        #[test]
        fn acyclic_graph_frees_on_last_release(
            edges in prop::collection::vec((0..NODES, 0..NODES), 0..30),
            order in Just((0..NODES).collect::<Vec<usize>>()).prop_shuffle(),
        ) {
            let mut heap = LuaHeap::default();
            let freed_before = heap.stats().freed_by_refcount;
            let tables: Vec<LuaValue> = (0..NODES)
                .map(|_| heap.create_table(0, 4).unwrap())
                .collect();

            // edges only point to higher indices, so the graph has no cycle
            let mut children = vec![Vec::new(); NODES];
            for (n, (a, b)) in edges.into_iter().enumerate() {
                let (from, to) = (a.min(b), a.max(b));
                if from == to {
                    continue;
                }
                heap.table_set_int(tables[from], n as i64 + 1, tables[to]).unwrap();
                children[from].push(to);
            }

            let mut held = vec![true; NODES];
            for &i in &order {
                heap.release(tables[i]).unwrap();
                held[i] = false;
                let live = reachable(&held, &children);
                for j in 0..NODES {
                    prop_assert_eq!(heap.is_alive(tables[j]), live[j]);
                }
            }
            prop_assert_eq!(heap.stats().freed_by_refcount - freed_before, NODES);
            prop_assert_eq!(heap.stats().freed_by_scan, 0);
        }
    }
}
