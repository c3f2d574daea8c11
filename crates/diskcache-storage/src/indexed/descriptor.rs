//! Record descriptors for the indexed engine
//!
//! A descriptor locates one framed record in the data file. Descriptors live
//! in an arena and are referred to by [`DescriptorId`]; the key store and the
//! recycle bin hold ids, never the descriptors themselves, so a slot is
//! mutated in exactly one place.

use crate::codec::{RECORD_HEADER_SIZE, framed_len};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::warn;

/// Location of a record in the data file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexedDiskElementDescriptor {
    /// Offset of the record's length prefix
    pub position: u64,
    /// Payload length of the record currently stored
    pub length: u32,
    /// Payload bytes the slot can hold; at least `length`
    pub capacity: u32,
}

impl IndexedDiskElementDescriptor {
    /// Descriptor for a freshly appended record
    #[must_use]
    pub const fn new(position: u64, length: u32) -> Self {
        Self {
            position,
            length,
            capacity: length,
        }
    }

    /// First byte after the slot
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.position + framed_len(self.capacity as u64)
    }

    /// Bytes the slot occupies on disk, header included
    #[must_use]
    pub const fn footprint(&self) -> u64 {
        framed_len(self.capacity as u64)
    }

    /// Check whether a payload of `len` bytes fits this slot
    #[must_use]
    pub const fn fits(&self, len: u32) -> bool {
        self.capacity >= len
    }
}

impl PartialOrd for IndexedDiskElementDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Descriptors order by capacity, ties broken by position
impl Ord for IndexedDiskElementDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.capacity
            .cmp(&other.capacity)
            .then(self.position.cmp(&other.position))
            .then(self.length.cmp(&other.length))
    }
}

/// Stable handle to a descriptor in a [`DescriptorArena`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(u32);

impl DescriptorId {
    /// Smallest id, used as a range bound
    pub const MIN: Self = Self(0);
}

/// Slab of descriptors addressed by id
#[derive(Debug, Default)]
pub struct DescriptorArena {
    slots: Vec<Option<IndexedDiskElementDescriptor>>,
    vacant: Vec<u32>,
    live: usize,
}

impl DescriptorArena {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a descriptor, returning its id
    pub fn insert(&mut self, descriptor: IndexedDiskElementDescriptor) -> DescriptorId {
        self.live += 1;
        if let Some(index) = self.vacant.pop() {
            self.slots[index as usize] = Some(descriptor);
            return DescriptorId(index);
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Some(descriptor));
        DescriptorId(index)
    }

    /// Look up a descriptor
    #[must_use]
    pub fn get(&self, id: DescriptorId) -> Option<&IndexedDiskElementDescriptor> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Look up a descriptor for modification
    pub fn get_mut(&mut self, id: DescriptorId) -> Option<&mut IndexedDiskElementDescriptor> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Release a descriptor
    pub fn remove(&mut self, id: DescriptorId) -> Option<IndexedDiskElementDescriptor> {
        let removed = self.slots.get_mut(id.0 as usize).and_then(Option::take);
        if removed.is_some() {
            self.live -= 1;
            self.vacant.push(id.0);
        }
        removed
    }

    /// Number of live descriptors
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Check if the arena is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop every descriptor
    pub fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        self.live = 0;
    }
}

/// Verify that position-sorted descriptors neither overlap nor run together
///
/// Returns the index of the first descriptor that collides with its
/// successor, or `None` if the sequence is sound.
#[must_use]
pub fn find_overlap(sorted: &[IndexedDiskElementDescriptor]) -> Option<usize> {
    sorted
        .windows(2)
        .position(|pair| pair[0].position + RECORD_HEADER_SIZE + u64::from(pair[0].capacity) > pair[1].position)
}

/// Check position-sorted descriptors for overlaps, logging the first one
#[must_use]
pub fn check_for_overlaps(cache_name: &str, sorted: &[IndexedDiskElementDescriptor]) -> bool {
    match find_overlap(sorted) {
        Some(i) => {
            warn!(
                "{}: descriptor at {} (capacity {}) overlaps descriptor at {}",
                cache_name,
                sorted[i].position,
                sorted[i].capacity,
                sorted[i + 1].position
            );
            false
        }
        None => true,
    }
}

/// Free space between position-sorted descriptors and up to `file_len`
///
/// Returns `(position, length)` pairs for every gap, including one before the
/// first descriptor and one after the last.
#[must_use]
pub fn find_gaps(sorted: &[IndexedDiskElementDescriptor], file_len: u64) -> Vec<(u64, u64)> {
    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    for descriptor in sorted {
        if descriptor.position > cursor {
            gaps.push((cursor, descriptor.position - cursor));
        }
        cursor = cursor.max(descriptor.end());
    }
    if file_len > cursor {
        gaps.push((cursor, file_len - cursor));
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential(lengths: &[u32]) -> Vec<IndexedDiskElementDescriptor> {
        let mut position = 0;
        lengths
            .iter()
            .map(|&len| {
                let d = IndexedDiskElementDescriptor::new(position, len);
                position = d.end();
                d
            })
            .collect()
    }

    #[test]
    fn test_overlap_check_passes_for_packed_records() {
        let descriptors = sequential(&[10, 20, 5, 100]);
        assert_eq!(find_overlap(&descriptors), None);
        assert!(check_for_overlaps("test", &descriptors));
    }

    #[test]
    fn test_overlap_check_fails_for_overlapping_records() {
        let mut descriptors = sequential(&[10, 20, 5]);
        // Second record starts inside the first
        descriptors[1].position = 8;
        assert_eq!(find_overlap(&descriptors), Some(0));
        assert!(!check_for_overlaps("test", &descriptors));
    }

    #[test]
    fn test_overlap_check_counts_header() {
        // 10 byte payload plus 4 byte header ends at 14
        let a = IndexedDiskElementDescriptor::new(0, 10);
        let b = IndexedDiskElementDescriptor::new(13, 1);
        assert_eq!(find_overlap(&[a, b]), Some(0));

        let c = IndexedDiskElementDescriptor::new(14, 1);
        assert_eq!(find_overlap(&[a, c]), None);
    }

    #[test]
    fn test_descriptor_ordering() {
        let small = IndexedDiskElementDescriptor::new(500, 10);
        let large = IndexedDiskElementDescriptor::new(0, 20);
        let small_later = IndexedDiskElementDescriptor::new(900, 10);
        assert!(small < large);
        assert!(small < small_later);
    }

    #[test]
    fn test_find_gaps() {
        let a = IndexedDiskElementDescriptor::new(10, 6); // ends at 20
        let b = IndexedDiskElementDescriptor::new(30, 6); // ends at 40
        let gaps = find_gaps(&[a, b], 50);
        assert_eq!(gaps, vec![(0, 10), (20, 10), (40, 10)]);

        let packed = sequential(&[4, 4]);
        assert!(find_gaps(&packed, 16).is_empty());
    }

    #[test]
    fn test_arena_reuses_ids() {
        let mut arena = DescriptorArena::new();
        let a = arena.insert(IndexedDiskElementDescriptor::new(0, 1));
        let b = arena.insert(IndexedDiskElementDescriptor::new(5, 1));
        assert_eq!(arena.len(), 2);

        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert!(arena.get(a).is_none());

        let c = arena.insert(IndexedDiskElementDescriptor::new(10, 1));
        assert_eq!(c, a);
        assert_eq!(arena.get(b).unwrap().position, 5);
        assert_eq!(arena.len(), 2);

        arena.get_mut(c).unwrap().length = 0;
        assert_eq!(arena.get(c).unwrap().length, 0);
    }
}
