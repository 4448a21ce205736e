//! Texture slot allocator.
//!
//! Hands out the hardware texture units used by one batched draw call.
//! A slot can be reused by the texture already sitting in it; otherwise a
//! round-robin scan picks the next slot that the current batch has not
//! touched and that is not protected. When every slot is taken the caller
//! must flush (which advances the batch id) and try again.

use crate::cache::CacheId;
use crate::registry::StoreId;

/// What occupies a texture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
    /// A registry texture.
    Store(StoreId),
    /// One of the two render targets of a cache.
    Surface(CacheId, usize),
}

/// Outcome of [`SlotAllocator::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAssignment {
    /// The key already sat in this slot; nothing to bind or upload.
    Reused(usize),
    /// The key was placed in `slot`, replacing `evicted` if anything.
    Assigned {
        /// Slot the key now occupies.
        slot: usize,
        /// Previous occupant.
        evicted: Option<SlotKey>,
    },
    /// Every usable slot is already part of the current batch.
    Overflow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    occupant: Option<SlotKey>,
    /// Batch that last used this slot.
    last_batch: Option<u64>,
}

/// Saved allocator state, restored after an off-screen pass.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    slots: Vec<Slot>,
    protected: Vec<bool>,
    cursor: usize,
}

/// Round-robin assignment of textures to batch slots.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    /// One entry per unit usable for batching.
    slots: Vec<Slot>,
    /// One flag per combined texture unit.
    protected: Vec<bool>,
    /// Where the next round-robin scan starts.
    cursor: usize,
}

impl SlotAllocator {
    /// Creates an allocator with `batch_units` batch slots and
    /// `combined_units` protectable units.
    pub fn new(batch_units: usize, combined_units: usize) -> Self {
        Self {
            slots: vec![Slot::default(); batch_units],
            protected: vec![false; combined_units.max(batch_units)],
            cursor: 0,
        }
    }

    /// Number of batch slots.
    pub fn units(&self) -> usize {
        self.slots.len()
    }

    /// Number of combined (protectable) units.
    pub fn combined_units(&self) -> usize {
        self.protected.len()
    }

    /// Occupant of `slot`, if any.
    pub fn occupant(&self, slot: usize) -> Option<SlotKey> {
        self.slots.get(slot).and_then(|s| s.occupant)
    }

    /// Every occupied batch slot.
    pub fn occupants(&self) -> impl Iterator<Item = (usize, SlotKey)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.occupant.map(|key| (i, key)))
    }

    /// Slot holding `key`, if any.
    pub fn find(&self, key: SlotKey) -> Option<usize> {
        self.slots.iter().position(|s| s.occupant == Some(key))
    }

    /// Whether `index` is protected.
    pub fn is_protected(&self, index: usize) -> bool {
        self.protected.get(index).copied().unwrap_or(false)
    }

    /// Places `key` into a slot for batch `batch_id`.
    pub fn insert(&mut self, key: SlotKey, batch_id: u64) -> SlotAssignment {
        if let Some(index) = self.find(key) {
            self.slots[index].last_batch = Some(batch_id);
            return SlotAssignment::Reused(index);
        }

        let count = self.slots.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let slot = &mut self.slots[index];
            if self.protected[index] || slot.last_batch == Some(batch_id) {
                continue;
            }
            let evicted = slot.occupant.replace(key);
            slot.last_batch = Some(batch_id);
            self.cursor = (index + 1) % count;
            return SlotAssignment::Assigned {
                slot: index,
                evicted,
            };
        }

        SlotAssignment::Overflow
    }

    /// Empties `key`'s slot, if it has one.
    pub fn remove(&mut self, key: SlotKey) -> Option<usize> {
        let index = self.find(key)?;
        self.slots[index] = Slot::default();
        Some(index)
    }

    /// Sets the protected flag of `index` and returns whatever occupied it,
    /// so a protected slot never keeps a batch texture. Out-of-range indices
    /// are ignored; callers validate first.
    pub fn protect(&mut self, index: usize, locked: bool) -> Option<SlotKey> {
        let flag = self.protected.get_mut(index)?;
        *flag = locked;
        if locked {
            self.slots.get_mut(index).and_then(|s| {
                let evicted = s.occupant.take();
                s.last_batch = None;
                evicted
            })
        } else {
            None
        }
    }

    /// Empties every slot; protected flags are kept.
    pub fn reset(&mut self) -> Vec<SlotKey> {
        let evicted = self.slots.iter_mut().filter_map(|s| s.occupant.take()).collect();
        self.slots.fill(Slot::default());
        self.cursor = 0;
        evicted
    }

    /// Changes the number of slots. Everything is evicted; protected flags
    /// that still fit are kept.
    pub fn resize(&mut self, batch_units: usize, combined_units: usize) -> Vec<SlotKey> {
        let evicted = self.reset();
        self.slots = vec![Slot::default(); batch_units];
        self.protected.resize(combined_units.max(batch_units), false);
        evicted
    }

    /// Captures the slot table and protected flags.
    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            slots: self.slots.clone(),
            protected: self.protected.clone(),
            cursor: self.cursor,
        }
    }

    /// Puts back a table captured by [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, snapshot: SlotSnapshot) {
        self.slots = snapshot.slots;
        self.protected = snapshot.protected;
        self.cursor = snapshot.cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(n: usize) -> SlotKey {
        SlotKey::Store(StoreId(n))
    }

    fn assigned_slot(a: SlotAssignment) -> usize {
        match a {
            SlotAssignment::Assigned { slot, .. } => slot,
            other => panic!("expected an assignment, got {other:?}"),
        }
    }

    #[test]
    fn reuses_slot_holding_key() {
        let mut alloc = SlotAllocator::new(4, 4);
        let slot = assigned_slot(alloc.insert(store(1), 0));
        assert_eq!(alloc.insert(store(1), 0), SlotAssignment::Reused(slot));
        assert_eq!(alloc.insert(store(1), 1), SlotAssignment::Reused(slot));
    }

    #[test]
    fn round_robin_then_overflow() {
        let mut alloc = SlotAllocator::new(2, 2);
        assert_eq!(assigned_slot(alloc.insert(store(1), 0)), 0);
        assert_eq!(assigned_slot(alloc.insert(store(2), 0)), 1);
        assert_eq!(alloc.insert(store(3), 0), SlotAssignment::Overflow);

        // A new batch frees every slot; the scan resumes after slot 1.
        match alloc.insert(store(3), 1) {
            SlotAssignment::Assigned { slot, evicted } => {
                assert_eq!(slot, 0);
                assert_eq!(evicted, Some(store(1)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn protected_slots_are_never_evicted() {
        let mut alloc = SlotAllocator::new(3, 3);
        alloc.insert(store(1), 0);
        assert_eq!(alloc.protect(0, true), Some(store(1)));
        for batch in 1..10 {
            let slot = assigned_slot(alloc.insert(store(100 + batch as usize), batch));
            assert_ne!(slot, 0);
        }
    }

    #[test]
    fn all_protected_overflows_even_after_flush() {
        let mut alloc = SlotAllocator::new(2, 2);
        alloc.protect(0, true);
        alloc.protect(1, true);
        assert_eq!(alloc.insert(store(1), 0), SlotAssignment::Overflow);
        assert_eq!(alloc.insert(store(1), 1), SlotAssignment::Overflow);
    }

    #[test]
    fn snapshot_restores_table() {
        let mut alloc = SlotAllocator::new(2, 4);
        alloc.insert(store(1), 0);
        let saved = alloc.snapshot();
        alloc.protect(3, true);
        assert_eq!(alloc.reset(), vec![store(1)]);
        alloc.insert(store(9), 1);
        alloc.restore(saved);
        assert_eq!(alloc.occupant(0), Some(store(1)));
        assert_eq!(alloc.find(store(9)), None);
        assert!(!alloc.is_protected(3));
    }

    #[test]
    fn resize_evicts_and_keeps_flags() {
        let mut alloc = SlotAllocator::new(4, 4);
        alloc.insert(store(1), 0);
        alloc.protect(1, true);
        let evicted = alloc.resize(2, 4);
        assert_eq!(evicted, vec![store(1)]);
        assert_eq!(alloc.units(), 2);
        assert!(alloc.is_protected(1));
        assert_eq!(alloc.combined_units(), 4);
    }
}
