// Slot arena for heap objects
//
// - Objects live in Vec<Slot>; a free slot keeps its last serial
// - Free list for O(1) slot reuse
// - Ids carry the slot serial, so lookups through a stale id fail

use crate::GcId;
use crate::gc::GcObject;

struct Slot {
    serial: u32,
    object: Option<GcObject>,
}

pub struct GcPool {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    count: usize,
    next_serial: u32,
}

impl GcPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(256),
            free_list: Vec::new(),
            count: 0,
            next_serial: 1,
        }
    }

    /// Store an object and return its id
    #[inline]
    pub fn alloc(&mut self, object: GcObject) -> GcId {
        self.count += 1;
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.serial = serial;
            slot.object = Some(object);
            GcId::new(index, serial)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                serial,
                object: Some(object),
            });
            GcId::new(index, serial)
        }
    }

    #[inline(always)]
    pub fn get(&self, id: GcId) -> Option<&GcObject> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.serial == id.serial())
            .and_then(|slot| slot.object.as_ref())
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: GcId) -> Option<&mut GcObject> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.serial == id.serial())
            .and_then(|slot| slot.object.as_mut())
    }

    /// Id of whatever occupies slot `index`, used by the sweep cursor
    #[inline]
    pub fn id_at(&self, index: usize) -> Option<GcId> {
        let slot = self.slots.get(index)?;
        slot.object.as_ref()?;
        Some(GcId::new(index as u32, slot.serial))
    }

    /// Release a slot for reuse and hand back its object
    #[inline]
    pub fn free(&mut self, id: GcId) -> Option<GcObject> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.serial != id.serial() {
            return None;
        }
        let object = slot.object.take()?;
        self.free_list.push(id.index());
        self.count -= 1;
        Some(object)
    }

    #[inline(always)]
    pub fn is_valid(&self, id: GcId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live objects
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots, live or free
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Trim trailing free slots and spare capacity
    pub fn shrink_to_fit(&mut self) {
        while self.slots.last().is_some_and(|slot| slot.object.is_none()) {
            self.slots.pop();
        }
        let len = self.slots.len() as u32;
        self.free_list.retain(|&index| index < len);
        self.slots.shrink_to_fit();
        self.free_list.shrink_to_fit();
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_list.clear();
        self.count = 0;
    }
}

impl Default for GcPool {
    fn default() -> Self {
        Self::new()
    }
}
