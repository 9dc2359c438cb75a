//! Block cache: fixed-capacity slots with reference counting, LRU stamps,
//! dirty flags and delayed free.
//!
//! A slot whose reference counter is non-zero is pinned. A slot freed while
//! write-back is enabled is marked free-delayed: its data stays resident and
//! is written out when write-back ends or when eviction needs the slot.

use crate::errno::{Errno, KResult};

/// One cache slot.
#[derive(Debug)]
pub(crate) struct Slot {
    /// Logical block held by this slot; meaningful only when `valid`.
    pub(crate) lba: u64,
    /// Whether the slot holds resident data.
    pub(crate) valid: bool,
    /// Pin count.
    pub(crate) refctr: u32,
    /// LRU stamp; higher is more recent.
    pub(crate) lru_id: u32,
    /// Slot data differs from the device.
    pub(crate) dirty: bool,
    /// Write-out postponed until write-back ends or eviction.
    pub(crate) free_delay: bool,
    /// Block data.
    pub(crate) data: Box<[u8]>,
}

/// The cache proper: `cnt` slots of `itemsize` bytes.
#[derive(Debug)]
pub(crate) struct Bcache {
    slots: Vec<Slot>,
    /// Slots that are pinned or free-delayed.
    ref_blocks: u32,
    lru_counter: u32,
}

impl Bcache {
    /// Allocate `cnt` slots of `itemsize` bytes each.
    pub(crate) fn new(cnt: usize, itemsize: usize) -> KResult<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(cnt).map_err(|_| Errno::NoMem)?;
        for _ in 0..cnt {
            let mut data = Vec::new();
            data.try_reserve_exact(itemsize).map_err(|_| Errno::NoMem)?;
            data.resize(itemsize, 0);
            slots.push(Slot {
                lba: 0,
                valid: false,
                refctr: 0,
                lru_id: 0,
                dirty: false,
                free_delay: false,
                data: data.into_boxed_slice(),
            });
        }
        Ok(Bcache {
            slots,
            ref_blocks: 0,
            lru_counter: 0,
        })
    }

    pub(crate) fn slot(&self, id: usize) -> &Slot {
        &self.slots[id]
    }

    pub(crate) fn slot_mut(&mut self, id: usize) -> &mut Slot {
        &mut self.slots[id]
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether every slot is pinned or free-delayed.
    pub(crate) fn is_full(&self) -> bool {
        self.ref_blocks as usize == self.slots.len()
    }

    /// Pin the slot holding `lba`, or claim a reusable slot for it.
    ///
    /// Returns the slot id and whether the caller must read the block from
    /// the device (`is_new`). Fails with [`Errno::NoMem`] when every slot is
    /// pinned or delayed.
    pub(crate) fn alloc(&mut self, lba: u64) -> KResult<(usize, bool)> {
        self.lru_counter += 1;
        let stamp = self.lru_counter;

        // Resident hit: any valid slot with the right block, pinned or not.
        if let Some(id) = self
            .slots
            .iter()
            .position(|slot| slot.valid && slot.lba == lba)
        {
            let was_idle = {
                let slot = &mut self.slots[id];
                let was_idle = slot.refctr == 0 && !slot.free_delay;
                slot.refctr += 1;
                slot.lru_id = stamp;
                was_idle
            };
            if was_idle {
                self.ref_blocks += 1;
            }
            return Ok((id, false));
        }

        // Prefer a never-used slot, then the least recently used idle one.
        let candidate = self
            .slots
            .iter()
            .position(|slot| !slot.valid && slot.refctr == 0 && !slot.free_delay)
            .or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.refctr == 0 && !slot.free_delay)
                    .min_by_key(|(_, slot)| slot.lru_id)
                    .map(|(id, _)| id)
            });
        let id = candidate.ok_or(Errno::NoMem)?;

        let slot = &mut self.slots[id];
        slot.lba = lba;
        slot.valid = true;
        slot.refctr = 1;
        slot.lru_id = stamp;
        slot.dirty = false;
        slot.free_delay = false;
        self.ref_blocks += 1;
        Ok((id, true))
    }

    /// Unpin a slot; with `delay` set the slot becomes free-delayed instead
    /// of idle.
    pub(crate) fn free(&mut self, id: usize, delay: bool) {
        let slot = &mut self.slots[id];
        if slot.refctr > 0 {
            slot.refctr -= 1;
        }
        if delay {
            slot.free_delay = true;
        }
        if slot.refctr == 0 && !slot.free_delay {
            self.ref_blocks -= 1;
        }
    }

    /// Clear a slot's free-delayed mark once its data reached the device.
    pub(crate) fn delayed_written(&mut self, id: usize) {
        let slot = &mut self.slots[id];
        slot.free_delay = false;
        slot.dirty = false;
        if slot.refctr == 0 {
            self.ref_blocks -= 1;
        }
    }

    /// Drop a slot entirely (failed fill).
    pub(crate) fn invalidate(&mut self, id: usize) {
        let slot = &mut self.slots[id];
        let was_counted = slot.refctr > 0 || slot.free_delay;
        slot.valid = false;
        slot.refctr = 0;
        slot.dirty = false;
        slot.free_delay = false;
        if was_counted {
            self.ref_blocks -= 1;
        }
    }

    /// Ids of free-delayed, unpinned slots, least recently used first.
    pub(crate) fn delayed_idle(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.free_delay && slot.refctr == 0)
            .map(|(id, _)| id)
            .collect();
        ids.sort_by_key(|&id| self.slots[id].lru_id);
        ids
    }

    /// The least recently used free-delayed idle slot, if any.
    pub(crate) fn eviction_candidate(&self) -> Option<usize> {
        self.delayed_idle().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_on_idle_resident_slot() {
        let mut bc = Bcache::new(2, 16).unwrap();
        let (id, is_new) = bc.alloc(7).unwrap();
        assert!(is_new);
        bc.free(id, false);
        let (id2, is_new) = bc.alloc(7).unwrap();
        assert_eq!(id, id2);
        assert!(!is_new);
    }

    #[test]
    fn full_of_pinned_slots_reports_nomem() {
        let mut bc = Bcache::new(2, 16).unwrap();
        bc.alloc(1).unwrap();
        bc.alloc(2).unwrap();
        assert!(bc.is_full());
        assert_eq!(bc.alloc(3).unwrap_err(), Errno::NoMem);
    }

    #[test]
    fn lru_evicts_oldest_idle_slot() {
        let mut bc = Bcache::new(2, 16).unwrap();
        let (a, _) = bc.alloc(1).unwrap();
        bc.free(a, false);
        let (b, _) = bc.alloc(2).unwrap();
        bc.free(b, false);
        // Touch block 1 so block 2 becomes the LRU victim.
        let (a2, is_new) = bc.alloc(1).unwrap();
        assert!(!is_new);
        bc.free(a2, false);
        let (c, is_new) = bc.alloc(3).unwrap();
        assert!(is_new);
        assert_eq!(c, b);
    }

    #[test]
    fn delayed_slots_stay_counted() {
        let mut bc = Bcache::new(2, 16).unwrap();
        let (a, _) = bc.alloc(1).unwrap();
        bc.free(a, true);
        assert_eq!(bc.eviction_candidate(), Some(a));
        assert!(!bc.is_full());
        bc.delayed_written(a);
        assert_eq!(bc.eviction_candidate(), None);
    }
}
