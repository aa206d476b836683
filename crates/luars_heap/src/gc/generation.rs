// Generational cycle scan by trial deletion
//
// Composite objects sit in one of three generation lists. A scan of
// generation g:
// - merges every younger generation into g
// - copies each member's count into its shadow count, then subtracts one
//   for every reference coming from another member; what remains is the
//   number of references from outside the scanned set
// - moves members with no outside reference to an unreachable list, and
//   pulls back anything reachable from a rescued member
// - promotes the survivors into g+1 (the oldest generation keeps them)
//
// Unreachable objects with a pending finalizer are split off so their
// finalizers can run first. After that a second partition of the
// unreachable set finds anything a finalizer resurrected, and only the
// remainder is destroyed.

use crate::GcId;
use crate::gc::{
    Collectable, GenLink, ListId, NOT_SCANNING, NUM_LISTS, ObjectAllocator, UNREACHABLE,
};
use crate::lua_vm::lua_limits::NUM_GENERATIONS;

#[derive(Debug, Clone, Copy, Default)]
pub struct GcList {
    head: Option<GcId>,
    tail: Option<GcId>,
    len: usize,
}

impl GcList {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Generations {
    lists: [GcList; NUM_LISTS],
    /// gen 0 counts allocations, gen i counts scans of gen i-1
    counts: [usize; NUM_GENERATIONS],
    thresholds: [usize; NUM_GENERATIONS],
    pub(crate) enabled: bool,
    /// A scan is in progress; nested scans are refused
    pub(crate) collecting: bool,
}

impl Generations {
    pub fn new(thresholds: [usize; NUM_GENERATIONS]) -> Self {
        Self {
            lists: [GcList::default(); NUM_LISTS],
            counts: [0; NUM_GENERATIONS],
            thresholds,
            enabled: true,
            collecting: false,
        }
    }

    #[inline]
    pub fn list(&self, list: ListId) -> &GcList {
        &self.lists[list as usize]
    }

    #[inline]
    pub fn count(&self, generation: usize) -> usize {
        self.counts[generation]
    }

    #[inline]
    pub fn threshold(&self, generation: usize) -> usize {
        self.thresholds[generation]
    }

    pub fn set_threshold(&mut self, generation: usize, threshold: usize) {
        self.thresholds[generation] = threshold;
    }

    #[inline]
    pub fn note_allocation(&mut self) {
        self.counts[0] += 1;
    }

    /// Oldest generation whose counter exceeds its threshold
    pub fn due(&self) -> Option<usize> {
        if !self.enabled || self.collecting {
            return None;
        }
        (0..NUM_GENERATIONS)
            .rev()
            .find(|&g| self.counts[g] > self.thresholds[g])
    }

    fn note_scan(&mut self, generation: usize) {
        if generation + 1 < NUM_GENERATIONS {
            self.counts[generation + 1] += 1;
        }
        for count in &mut self.counts[..=generation] {
            *count = 0;
        }
    }
}

/// Objects of a scan whose finalizers must run before the scan resolves
pub struct ScanInProgress {
    pub generation: usize,
    pub finalizers: Vec<GcId>,
    pub unreachable: usize,
}

impl ObjectAllocator {
    // ==================== List plumbing ====================

    #[inline]
    fn link_of(&self, id: GcId) -> Option<GenLink> {
        self.pool.get(id).and_then(|o| o.link()).copied()
    }

    #[inline]
    fn link_of_mut(&mut self, id: GcId) -> Option<&mut GenLink> {
        self.pool.get_mut(id).and_then(|o| o.link_mut())
    }

    pub(crate) fn link_tail(&mut self, list: ListId, id: GcId) {
        let tail = self.gens.lists[list as usize].tail;
        let Some(link) = self.link_of_mut(id) else {
            return;
        };
        link.prev = tail;
        link.next = None;
        link.list = list;
        match tail {
            Some(tail) => {
                if let Some(t) = self.link_of_mut(tail) {
                    t.next = Some(id);
                }
            }
            None => self.gens.lists[list as usize].head = Some(id),
        }
        let l = &mut self.gens.lists[list as usize];
        l.tail = Some(id);
        l.len += 1;
    }

    /// Remove an object from whatever list holds it
    pub(crate) fn unlink(&mut self, id: GcId) {
        let Some(link) = self.link_of(id) else {
            return;
        };
        if link.list == ListId::Detached {
            return;
        }
        let list = link.list as usize;
        match link.prev {
            Some(prev) => {
                if let Some(p) = self.link_of_mut(prev) {
                    p.next = link.next;
                }
            }
            None => self.gens.lists[list].head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(n) = self.link_of_mut(next) {
                    n.prev = link.prev;
                }
            }
            None => self.gens.lists[list].tail = link.prev,
        }
        self.gens.lists[list].len -= 1;
        if let Some(l) = self.link_of_mut(id) {
            *l = GenLink::detached();
        }
    }

    fn move_to(&mut self, id: GcId, list: ListId) {
        self.unlink(id);
        self.link_tail(list, id);
    }

    /// Append `from` to the end of `to`; members leave any scan state
    fn merge(&mut self, from: ListId, to: ListId) {
        if from == to {
            return;
        }
        let source = std::mem::take(&mut self.gens.lists[from as usize]);
        let mut node = source.head;
        while let Some(id) = node {
            let Some(link) = self.link_of_mut(id) else {
                break;
            };
            link.list = to;
            link.gc_ref = NOT_SCANNING;
            node = link.next;
        }
        let Some(head) = source.head else {
            return;
        };
        let target_tail = self.gens.lists[to as usize].tail;
        if let Some(h) = self.link_of_mut(head) {
            h.prev = target_tail;
        }
        match target_tail {
            Some(tail) => {
                if let Some(t) = self.link_of_mut(tail) {
                    t.next = Some(head);
                }
            }
            None => self.gens.lists[to as usize].head = Some(head),
        }
        let target = &mut self.gens.lists[to as usize];
        target.tail = source.tail;
        target.len += source.len;
    }

    pub(crate) fn list_ids(&self, list: ListId) -> Vec<GcId> {
        let mut out = Vec::with_capacity(self.gens.lists[list as usize].len);
        let mut node = self.gens.lists[list as usize].head;
        while let Some(id) = node {
            out.push(id);
            node = self.link_of(id).and_then(|l| l.next);
        }
        out
    }

    /// Generation an object currently sits in, if any
    pub fn generation_of(&self, id: GcId) -> Option<usize> {
        let link = self.link_of(id)?;
        link.list.is_generation().then_some(link.list as usize)
    }

    // ==================== Trial deletion ====================

    /// Shadow counts start from the real counts
    fn update_refs(&mut self, list: ListId) {
        for id in self.list_ids(list) {
            let nref = self.pool.get(id).map_or(0, |o| o.header.nref);
            if let Some(link) = self.link_of_mut(id) {
                link.gc_ref = nref;
            }
        }
    }

    /// Subtract the references members hold on each other
    fn subtract_refs(&mut self, list: ListId) {
        let mut children = Vec::new();
        for id in self.list_ids(list) {
            children.clear();
            if let Some(obj) = self.pool.get(id) {
                obj.data.collect_refs(&mut children);
            }
            for &child in &children {
                if let Some(link) = self.link_of_mut(child) {
                    if link.list == list && link.gc_ref != NOT_SCANNING {
                        link.gc_ref -= 1;
                    }
                }
            }
        }
    }

    /// Split `young` into members still referenced from outside (plus
    /// everything they reach) and the rest, which move to `dead`
    fn move_unreachable(&mut self, young: ListId, dead: ListId) {
        let mut children = Vec::new();
        let mut node = self.gens.lists[young as usize].head;
        while let Some(id) = node {
            let Some(link) = self.link_of(id) else {
                break;
            };
            let next = link.next;
            if link.gc_ref <= 0 {
                debug_assert!(link.gc_ref == 0, "shadow count below zero on {id}");
                self.move_to(id, dead);
                if let Some(l) = self.link_of_mut(id) {
                    l.gc_ref = UNREACHABLE;
                }
                node = next;
                continue;
            }

            children.clear();
            if let Some(obj) = self.pool.get(id) {
                obj.data.collect_refs(&mut children);
            }
            for &child in &children {
                let Some(child_link) = self.link_of(child) else {
                    continue;
                };
                if child_link.list == dead && child_link.gc_ref == UNREACHABLE {
                    // appended to the tail, so the walk visits it later
                    self.move_to(child, young);
                    if let Some(l) = self.link_of_mut(child) {
                        l.gc_ref = 1;
                    }
                } else if child_link.list == young && child_link.gc_ref == 0 {
                    if let Some(l) = self.link_of_mut(child) {
                        l.gc_ref = 1;
                    }
                }
            }
            // re-read: a rescued child may have become the new tail
            node = self.link_of(id).and_then(|l| l.next);
        }
    }

    /// Run the partition half of a scan. Returns `None` when a scan is
    /// already running.
    pub(crate) fn begin_scan(&mut self, generation: usize) -> Option<ScanInProgress> {
        if self.gens.collecting {
            return None;
        }
        let generation = generation.min(NUM_GENERATIONS - 1);
        self.gens.collecting = true;
        self.gens.note_scan(generation);

        let target = ListId::generation(generation);
        for younger in 0..generation {
            self.merge(ListId::generation(younger), target);
        }
        let scanned = self.gens.lists[target as usize].len;

        self.update_refs(target);
        self.subtract_refs(target);
        self.move_unreachable(target, ListId::Unreachable);

        let older = ListId::generation(generation + 1);
        if older != target {
            self.stats.promoted_objects += self.gens.lists[target as usize].len;
            self.merge(target, older);
        } else {
            for id in self.list_ids(target) {
                if let Some(link) = self.link_of_mut(id) {
                    link.gc_ref = NOT_SCANNING;
                }
            }
        }

        let mut finalizers = Vec::new();
        for id in self.list_ids(ListId::Unreachable) {
            let finalize = self
                .pool
                .get(id)
                .is_some_and(|o| o.header.collectable == Collectable::Finalize);
            if finalize {
                self.move_to(id, ListId::Finalizers);
                finalizers.push(id);
            }
        }
        let unreachable = self.gens.lists[ListId::Unreachable as usize].len + finalizers.len();
        log::trace!(
            "gen{generation} scan: {scanned} scanned, {unreachable} unreachable, {} with finalizers",
            finalizers.len()
        );
        Some(ScanInProgress {
            generation,
            finalizers,
            unreachable,
        })
    }

    /// Finalizable members of the scan are now plain objects; their
    /// finalizers are about to run
    pub(crate) fn release_finalizer_marks(&mut self, scan: &ScanInProgress) {
        for &id in &scan.finalizers {
            if let Some(obj) = self.pool.get_mut(id) {
                obj.header.collectable = Collectable::Live;
            }
            self.finobj.swap_remove(&id);
        }
    }

    /// Second half of a scan: pull back anything resurrected by finalizers,
    /// destroy the rest. Returns the number of objects destroyed.
    pub(crate) fn finish_scan(&mut self, scan: ScanInProgress) -> usize {
        let older = ListId::generation(scan.generation + 1);

        if !scan.finalizers.is_empty() {
            self.merge(ListId::Finalizers, ListId::Unreachable);
            self.update_refs(ListId::Unreachable);
            self.subtract_refs(ListId::Unreachable);
            self.move_unreachable(ListId::Unreachable, ListId::Garbage);
            let resurrected = self.gens.lists[ListId::Unreachable as usize].len;
            if resurrected > 0 {
                log::debug!("gen{} scan: {resurrected} objects resurrected", scan.generation);
            }
            self.merge(ListId::Unreachable, older);
        } else {
            self.merge(ListId::Unreachable, ListId::Garbage);
        }

        let garbage = self.list_ids(ListId::Garbage);

        // Strip every member first, so references between members are
        // dropped while all of them are still intact
        let mut refs = Vec::new();
        for &id in &garbage {
            self.clear_object(id, &mut refs);
        }
        for v in refs {
            self.defer_release(v);
        }
        self.drain_releases();

        let mut destroyed = 0;
        for id in garbage {
            self.unlink(id);
            match self.pool.get(id).map(|o| o.header.nref) {
                Some(0) => {
                    self.free_object(id);
                    destroyed += 1;
                }
                Some(_) => {}
                None => {}
            }
        }

        self.gens.collecting = false;
        self.stats.generation_scans[scan.generation] += 1;
        self.stats.freed_by_scan += destroyed;
        destroyed
    }

    /// Complete scan without finalizer calls: finalizable objects found
    /// unreachable are queued instead. Used by emergency collections.
    pub(crate) fn scan_queueing_finalizers(&mut self, generation: usize) -> usize {
        let Some(scan) = self.begin_scan(generation) else {
            return 0;
        };
        for &id in &scan.finalizers {
            self.queue_finalizer(id);
        }
        self.finish_scan(scan)
    }
}
