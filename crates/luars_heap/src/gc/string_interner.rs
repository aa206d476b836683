use ahash::RandomState;

use crate::GcId;
use crate::gc::GcPool;
use crate::lua_value::InternLink;
use crate::lua_vm::lua_limits::MINSTRTABSIZE;

/// Hash-consing table for short strings
/// - Singly linked buckets threaded through the string objects themselves
/// - Each node keeps a back-pointer (bucket head or previous node), so
///   removal is O(1)
/// - Capacity is a power of two; the table doubles when it holds more
///   strings than buckets
pub struct StringInterner {
    buckets: Vec<Option<GcId>>,
    count: usize,
    hashbuilder: RandomState,
}

impl StringInterner {
    pub fn new(seed: u64) -> Self {
        Self {
            buckets: vec![None; MINSTRTABSIZE],
            count: 0,
            hashbuilder: RandomState::with_seeds(seed, seed.rotate_left(17), 0x2d35_8dcc, 0x5851_f42d),
        }
    }

    #[inline(always)]
    pub fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        self.hashbuilder.hash_one(bytes)
    }

    #[inline(always)]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Number of interned strings
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Scan the bucket for a string with the same content
    pub fn find(&self, pool: &GcPool, bytes: &[u8], hash: u64) -> Option<GcId> {
        let mut node = self.buckets[self.bucket_of(hash)];
        while let Some(id) = node {
            let s = pool.get(id)?.as_string()?;
            if s.cached_hash() == Some(hash) && s.as_bytes() == bytes {
                return Some(id);
            }
            node = s.next;
        }
        None
    }

    /// Link a freshly allocated short string at the head of its bucket
    pub fn insert(&mut self, pool: &mut GcPool, id: GcId) {
        let Some(hash) = pool
            .get(id)
            .and_then(|o| o.as_string())
            .and_then(|s| s.cached_hash())
        else {
            return;
        };
        self.link_head(pool, id, self.bucket_of(hash));
        self.count += 1;
        if self.count > self.buckets.len() {
            let new_size = self.buckets.len() * 2;
            self.resize(pool, new_size);
        }
    }

    fn link_head(&mut self, pool: &mut GcPool, id: GcId, bucket: usize) {
        let old_head = self.buckets[bucket];
        if let Some(head) = old_head {
            if let Some(s) = pool.get_mut(head).and_then(|o| o.as_string_mut()) {
                s.prev = Some(InternLink::Node(id));
            }
        }
        if let Some(s) = pool.get_mut(id).and_then(|o| o.as_string_mut()) {
            s.prev = Some(InternLink::Bucket(bucket));
            s.next = old_head;
        }
        self.buckets[bucket] = Some(id);
    }

    /// Unlink a string through its back-pointer
    pub fn remove(&mut self, pool: &mut GcPool, id: GcId) {
        let Some(s) = pool.get_mut(id).and_then(|o| o.as_string_mut()) else {
            return;
        };
        let Some(prev) = s.prev.take() else {
            return;
        };
        let next = s.next.take();
        match prev {
            InternLink::Bucket(bucket) => self.buckets[bucket] = next,
            InternLink::Node(prev_id) => {
                if let Some(p) = pool.get_mut(prev_id).and_then(|o| o.as_string_mut()) {
                    p.next = next;
                }
            }
        }
        if let Some(next_id) = next {
            if let Some(n) = pool.get_mut(next_id).and_then(|o| o.as_string_mut()) {
                n.prev = Some(prev);
            }
        }
        debug_assert!(self.count > 0);
        self.count -= 1;
    }

    /// Rehash into `size` buckets, rounded up to a power of two, never below
    /// the minimum
    pub fn resize(&mut self, pool: &mut GcPool, size: usize) {
        let mut new_size = MINSTRTABSIZE;
        while new_size < size {
            new_size <<= 1;
        }
        if new_size == self.buckets.len() {
            return;
        }
        log::debug!(
            "string table resize {} -> {} ({} strings)",
            self.buckets.len(),
            new_size,
            self.count
        );
        let old = std::mem::replace(&mut self.buckets, vec![None; new_size]);
        for head in old {
            let mut node = head;
            while let Some(id) = node {
                let Some(s) = pool.get(id).and_then(|o| o.as_string()) else {
                    break;
                };
                node = s.next;
                let hash = s.cached_hash().unwrap_or_default();
                let bucket = self.bucket_of(hash);
                self.link_head(pool, id, bucket);
            }
        }
    }

    /// Halve the table while it is at most a quarter full
    pub fn check_shrink(&mut self, pool: &mut GcPool) {
        let mut size = self.buckets.len();
        while size > MINSTRTABSIZE && self.count <= size / 4 {
            size /= 2;
        }
        if size != self.buckets.len() {
            self.resize(pool, size);
        }
    }

    pub fn clear(&mut self) {
        self.buckets = vec![None; MINSTRTABSIZE];
        self.count = 0;
    }
}
