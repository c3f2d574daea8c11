//! Key index for the indexed engine
//!
//! Maps keys to descriptor ids. When the region is configured with a key
//! limit, the least recently used key is evicted on overflow; recency is a
//! logical clock touched under a shared lock, the same way the block cache
//! tracks it.

use super::descriptor::DescriptorId;
use diskcache_common::{CacheKey, DiskCacheAttributes, DiskLimitType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capacity of the key index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLimit {
    /// No limit
    Unbounded,
    /// Maximum number of keys
    Count(u64),
    /// Maximum kilobytes of record data
    Kilobytes(u64),
}

impl KeyLimit {
    /// Derive the limit from region attributes
    #[must_use]
    pub fn from_attributes(attrs: &DiskCacheAttributes) -> Self {
        match (attrs.key_limit(), attrs.disk_limit_type) {
            (None, _) => Self::Unbounded,
            (Some(n), DiskLimitType::Count) => Self::Count(n),
            (Some(n), DiskLimitType::Size) => Self::Kilobytes(n),
        }
    }
}

/// Index entry with LRU tracking
#[derive(Debug)]
struct KeyEntry {
    id: DescriptorId,
    /// On-disk bytes charged against a size limit
    size: u64,
    last_access: AtomicU64,
}

impl KeyEntry {
    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

/// Outcome of an insert
#[derive(Debug, Default)]
pub struct Insertion {
    /// Id previously stored under the key
    pub replaced: Option<DescriptorId>,
    /// Keys evicted to make room
    pub evicted: Vec<(CacheKey, DescriptorId)>,
}

/// Key to descriptor index
#[derive(Debug)]
pub struct IndexedKeyStore {
    entries: HashMap<CacheKey, KeyEntry>,
    limit: KeyLimit,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    total_bytes: u64,
}

impl IndexedKeyStore {
    /// Create an empty index
    #[must_use]
    pub fn new(limit: KeyLimit) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
            clock: AtomicU64::new(0),
            total_bytes: 0,
        }
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a key, marking it recently used
    pub fn get(&self, key: &CacheKey) -> Option<DescriptorId> {
        let entry = self.entries.get(key)?;
        entry.touch(self.tick());
        Some(entry.id)
    }

    /// Look up a key without touching it
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<DescriptorId> {
        self.entries.get(key).map(|e| e.id)
    }

    /// Map `key` to `id`, evicting least recently used keys if over the limit
    ///
    /// The key being inserted is never evicted.
    pub fn insert(&mut self, key: CacheKey, id: DescriptorId, size: u64) -> Insertion {
        let clock = self.tick();
        let entry = KeyEntry {
            id,
            size,
            last_access: AtomicU64::new(clock),
        };

        self.total_bytes += size;
        let replaced = self.entries.insert(key.clone(), entry).map(|old| {
            self.total_bytes -= old.size;
            old.id
        });

        let mut evicted = Vec::new();
        while self.over_limit() {
            let Some(victim) = self.find_lru_entry(&key) else {
                break;
            };
            if let Some(old) = self.entries.remove(&victim) {
                self.total_bytes -= old.size;
                evicted.push((victim, old.id));
            }
        }

        Insertion { replaced, evicted }
    }

    /// Remove a single key
    pub fn remove(&mut self, key: &CacheKey) -> Option<DescriptorId> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size;
        Some(entry.id)
    }

    /// Remove every key covered by `target` (see [`CacheKey::is_covered_by`])
    pub fn remove_covered(&mut self, target: &CacheKey) -> Vec<(CacheKey, DescriptorId)> {
        let covered: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| key.is_covered_by(target))
            .cloned()
            .collect();

        covered
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|id| (key, id)))
            .collect()
    }

    /// Check whether the index exceeds its limit
    fn over_limit(&self) -> bool {
        match self.limit {
            KeyLimit::Unbounded => false,
            KeyLimit::Count(max) => self.entries.len() as u64 > max,
            KeyLimit::Kilobytes(max) => self.total_bytes > max.saturating_mul(1024),
        }
    }

    /// Find the least recently used key other than `exclude`
    fn find_lru_entry(&self, exclude: &CacheKey) -> Option<CacheKey> {
        self.entries
            .iter()
            .filter(|(key, _)| *key != exclude)
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone())
    }

    /// Snapshot of all keys
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys().cloned().collect()
    }

    /// Iterate over `(key, id)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, DescriptorId)> {
        self.entries.iter().map(|(key, entry)| (key, entry.id))
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes charged against a size limit
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// The configured limit
    #[must_use]
    pub const fn limit(&self) -> KeyLimit {
        self.limit
    }

    /// Drop every key
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}
