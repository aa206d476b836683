// Tests for string interning, boxed scalars and the recycle bin

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use proptest::prelude::*;

    use crate::lua_limits::{LUAI_MAXSHORTLEN, SMALL_INT_MAX, SMALL_INT_MIN};
    use crate::{Collectable, GcObjectKind, LuaHeap, LuaValue, SafeOption};

    #[test]
    fn test_intern_same_object() {
        let mut heap = LuaHeap::default();
        let base = heap.intern_count();

        let a = heap.create_string("abc").unwrap();
        let b = heap.create_string("abc").unwrap();
        assert_eq!(a, b);
        assert!(heap.is_interned(a));
        assert_eq!(heap.intern_count(), base + 1);
        assert_eq!(heap.ref_count(a), Some(2));
        assert_eq!(heap.string_bytes(a), Some(&b"abc"[..]));

        heap.release(a).unwrap();
        heap.release(b).unwrap();
        // parked, not yet gone
        assert_eq!(heap.collectable_state(a), Collectable::Pending);
        assert_eq!(heap.intern_count(), base + 1);

        heap.force_recycle_drain();
        assert_eq!(heap.intern_count(), base);
        assert!(!heap.is_alive(a));
    }

    #[test]
    fn test_long_strings_bypass_interning() {
        let mut heap = LuaHeap::default();
        let base = heap.intern_count();
        let text = "x".repeat(LUAI_MAXSHORTLEN + 1);

        let a = heap.create_string(&text).unwrap();
        let b = heap.create_string(&text).unwrap();
        assert_ne!(a, b);
        assert!(!heap.is_interned(a));
        assert_eq!(heap.intern_count(), base);

        // lazily hashed, and equal content hashes equally
        let ha = heap.string_hash(a).unwrap();
        assert_eq!(heap.string_hash(a), Some(ha));
        assert_eq!(heap.string_hash(b), Some(ha));

        // no recycling: freed on the spot
        heap.release(a).unwrap();
        assert!(!heap.is_alive(a));
        assert_eq!(heap.recycle_len(), 0);
        heap.release(b).unwrap();
    }

    #[test]
    fn test_short_limit_boundary() {
        let mut heap = LuaHeap::default();
        let short = heap.create_string(&"s".repeat(LUAI_MAXSHORTLEN)).unwrap();
        assert!(heap.is_interned(short));
        let empty = heap.create_string("").unwrap();
        assert!(heap.is_interned(empty));
        assert_eq!(heap.string_bytes(empty), Some(&b""[..]));
    }

    #[test]
    fn test_binary_strings() {
        let mut heap = LuaHeap::default();
        let a = heap.create_binary_string(&[0, 159, 146, 150]).unwrap();
        let b = heap.create_binary_string(&[0, 159, 146, 150]).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.value_kind(a), Some(GcObjectKind::String));
    }

    #[test]
    fn test_pending_string_is_revived() {
        let mut heap = LuaHeap::default();
        let a = heap.create_string("phoenix").unwrap();
        heap.release(a).unwrap();
        assert_eq!(heap.recycle_len(), 1);

        let again = heap.create_string("phoenix").unwrap();
        assert_eq!(again, a);
        assert_eq!(heap.ref_count(again), Some(1));
        assert_eq!(heap.stats().recycle_revived, 1);

        // the bin lets go of it instead of freeing it
        assert_eq!(heap.force_recycle_drain(), 0);
        assert_eq!(heap.recycle_len(), 0);
        assert!(heap.is_alive(again));
        assert_eq!(heap.collectable_state(again), Collectable::Live);
    }

    #[test]
    fn test_bin_confirms_over_two_scans() {
        let mut heap = LuaHeap::new(SafeOption {
            recycle_threshold: 4,
            ..SafeOption::default()
        });
        let base = heap.intern_count();
        for i in 0..20 {
            let s = heap.create_string(&format!("tmp{i}")).unwrap();
            heap.release(s).unwrap();
        }
        let stats = heap.stats().clone();
        assert!(stats.recycle_scans > 0);
        assert!(stats.recycle_confirmed > 0);
        assert!(heap.recycle_len() <= 6);
        assert_eq!(heap.intern_count(), base + heap.recycle_len());
    }

    #[test]
    fn test_boxed_integers() {
        let mut heap = LuaHeap::default();
        let pinned = heap.box_integer(5).unwrap();
        assert_eq!(Some(pinned), heap.small_integer(5));
        assert_eq!(heap.unbox_integer(pinned), Some(5));
        heap.release(pinned).unwrap();
        // pinned constants never die
        assert!(heap.is_alive(pinned));

        assert!(heap.small_integer(SMALL_INT_MIN).is_some());
        assert!(heap.small_integer(SMALL_INT_MAX).is_some());
        assert!(heap.small_integer(SMALL_INT_MAX + 1).is_none());

        let a = heap.box_integer(100_000).unwrap();
        let b = heap.box_integer(100_000).unwrap();
        assert_eq!(a, b);
        heap.release(a).unwrap();
        heap.release(b).unwrap();
        assert_eq!(heap.collectable_state(a), Collectable::Pending);
        heap.force_recycle_drain();
        assert!(!heap.is_alive(a));

        let f = heap.box_float(0.25).unwrap();
        let g = heap.box_float(0.25).unwrap();
        assert_ne!(f, g);
        assert_eq!(heap.unbox_float(f), Some(0.25));
        heap.release(f).unwrap();
        assert!(!heap.is_alive(f));
        heap.release(g).unwrap();
    }

    #[test]
    fn test_constants() {
        let heap = LuaHeap::default();
        assert_eq!(heap.const_true(), LuaValue::boolean(true));
        assert_eq!(heap.const_false(), LuaValue::boolean(false));
        assert!(heap.const_nil().is_nil());
    }

    #[test]
    fn test_intern_table_grows_and_empties() {
        let mut heap = LuaHeap::default();
        let base = heap.intern_count();
        let strings: Vec<LuaValue> = (0..500)
            .map(|i| heap.create_string(&format!("key_{i}")).unwrap())
            .collect();
        assert_eq!(heap.intern_count(), base + 500);
        for (i, s) in strings.iter().enumerate() {
            let again = heap.create_string(&format!("key_{i}")).unwrap();
            assert_eq!(again, *s);
            heap.release(again).unwrap();
        }
        for s in strings {
            heap.release(s).unwrap();
        }
        heap.force_recycle_drain();
        assert_eq!(heap.intern_count(), base);
    }

    proptest! {
        #[test]
        fn equal_short_strings_share_one_object(words in prop::collection::vec("[a-z]{0,8}", 1..40)) {
            let mut heap = LuaHeap::default();
            let base = heap.intern_count();

            let mut handles = Vec::new();
            let mut first: HashMap<String, LuaValue> = HashMap::new();
            for w in &words {
                let s = heap.create_string(w).unwrap();
                let expected = *first.entry(w.clone()).or_insert(s);
                prop_assert_eq!(s, expected);
                handles.push(s);
            }
            prop_assert_eq!(heap.intern_count(), base + first.len());

            let distinct: HashSet<LuaValue> = first.values().copied().collect();
            prop_assert_eq!(distinct.len(), first.len());

            for s in handles {
                heap.release(s).unwrap();
            }
            heap.force_recycle_drain();
            prop_assert_eq!(heap.intern_count(), base);
        }
    }
}
