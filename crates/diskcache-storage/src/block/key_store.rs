//! Key index for the block engine

use crate::keyfile::KeyFile;
use diskcache_common::{CacheKey, Result};
use std::collections::HashMap;

/// Persisted form of one index entry
type BlockRecord = (CacheKey, Vec<u32>);

/// Maps keys to the ordered blocks holding their values
#[derive(Debug, Default)]
pub struct BlockKeyStore {
    entries: HashMap<CacheKey, Vec<u32>>,
}

impl BlockKeyStore {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index from `key_file`
    ///
    /// Returns `Ok(None)` when there is no key file.
    pub fn load(key_file: &KeyFile) -> Result<Option<Self>> {
        let Some(records) = key_file.load::<BlockRecord>()? else {
            return Ok(None);
        };
        Ok(Some(Self {
            entries: records.into_iter().collect(),
        }))
    }

    /// Write the index to `key_file`
    pub fn save(&self, key_file: &KeyFile) -> Result<()> {
        let records: Vec<(&CacheKey, &Vec<u32>)> = self.entries.iter().collect();
        key_file.save(&records)
    }

    /// Blocks of a key
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<&[u32]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Map `key` to `blocks`, returning the blocks it replaced
    pub fn insert(&mut self, key: CacheKey, blocks: Vec<u32>) -> Option<Vec<u32>> {
        self.entries.insert(key, blocks)
    }

    /// Remove a single key
    pub fn remove(&mut self, key: &CacheKey) -> Option<Vec<u32>> {
        self.entries.remove(key)
    }

    /// Remove every key covered by `target` (see [`CacheKey::is_covered_by`])
    pub fn remove_covered(&mut self, target: &CacheKey) -> Vec<(CacheKey, Vec<u32>)> {
        let covered: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| key.is_covered_by(target))
            .cloned()
            .collect();

        covered
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|blocks| (key, blocks)))
            .collect()
    }

    /// Every block referenced by the index
    pub fn referenced_blocks(&self) -> impl Iterator<Item = &u32> {
        self.entries.values().flatten()
    }

    /// Iterate over `(key, blocks)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &[u32])> {
        self.entries.iter().map(|(key, blocks)| (key, blocks.as_slice()))
    }

    /// Snapshot of all keys
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys().cloned().collect()
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

    /// Drop every key
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
