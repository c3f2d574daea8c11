//! Recycle bin of reusable record slots
//!
//! Slots are ordered by capacity (then position), so the best fit for a
//! payload is the first slot at or above its length.

use super::descriptor::{DescriptorId, IndexedDiskElementDescriptor};
use std::collections::BTreeSet;

/// Bounded set of free slots
#[derive(Debug)]
pub struct RecycleBin {
    slots: BTreeSet<(u32, u64, DescriptorId)>,
    max_size: usize,
}

impl RecycleBin {
    /// Create a bin holding at most `max_size` slots
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            slots: BTreeSet::new(),
            max_size,
        }
    }

    /// Add a slot
    ///
    /// Returns `false` if the bin is full and the slot was not kept.
    pub fn add(&mut self, id: DescriptorId, descriptor: &IndexedDiskElementDescriptor) -> bool {
        if self.slots.len() >= self.max_size {
            return false;
        }
        self.slots
            .insert((descriptor.capacity, descriptor.position, id))
    }

    /// Take the smallest slot that can hold `len` payload bytes
    pub fn take_best_fit(&mut self, len: u32) -> Option<DescriptorId> {
        let entry = *self.slots.range((len, 0, DescriptorId::MIN)..).next()?;
        self.slots.remove(&entry);
        Some(entry.2)
    }

    /// Put back a slot taken by [`take_best_fit`](Self::take_best_fit)
    pub fn restore(&mut self, id: DescriptorId, descriptor: &IndexedDiskElementDescriptor) {
        self.slots
            .insert((descriptor.capacity, descriptor.position, id));
    }

    /// Ids of all slots
    pub fn ids(&self) -> impl Iterator<Item = DescriptorId> + '_ {
        self.slots.iter().map(|&(_, _, id)| id)
    }

    /// Number of slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the bin is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Forget every slot
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
