//! The contract both engines present to the surrounding cache tier
//!
//! Expected outcomes (a miss, a dropped write) are plain variants rather than
//! errors. Failures are logged by the engine and reported only by kind.

use diskcache_common::{CacheElement, CacheKey, ErrorKind, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Result of a lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The element was found and decoded
    Hit(CacheElement),
    /// No element is stored under the key
    Miss,
    /// The element could not be read; callers treat this as a miss
    Failed(ErrorKind),
}

impl Lookup {
    /// Convert into an option, treating failures as misses
    #[must_use]
    pub fn into_option(self) -> Option<CacheElement> {
        match self {
            Self::Hit(element) => Some(element),
            Self::Miss | Self::Failed(_) => None,
        }
    }

    /// Check whether this is a hit
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Result of an update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The element is on disk and indexed
    Stored,
    /// The write was refused by policy (disk limit, region not alive)
    Dropped,
    /// The write failed; the key is absent
    Failed(ErrorKind),
}

/// Lifecycle state of a region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Accepting operations
    Alive,
    /// Disposed by its owner
    Disposed,
    /// Disabled after a fatal error
    Error,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Alive => "ALIVE",
            Self::Disposed => "DISPOSED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Point-in-time snapshot of a region's statistics
#[derive(Clone, Debug)]
pub struct DiskCacheStats {
    /// Region name
    pub cache_name: String,
    /// Engine variant ("indexed" or "block")
    pub engine: &'static str,
    /// Lifecycle state
    pub status: CacheStatus,
    /// Keys in the index
    pub key_count: usize,
    /// Data file length in bytes
    pub data_file_size: u64,
    /// Entries in the free list (recycled slots or free blocks)
    pub free_list_size: usize,
    /// Writes that reused a free-list entry
    pub recycle_count: u64,
    /// Bytes on disk not holding live data
    pub bytes_free: u64,
    /// Keys removed since the last optimization
    pub remove_count: u64,
    /// Successful lookups
    pub hits: u64,
    /// Lookups that found nothing or failed
    pub misses: u64,
    /// Successful writes
    pub puts: u64,
    /// Writes refused by policy
    pub dropped_writes: u64,
    /// Completed optimizations
    pub optimizations: u64,
    /// Engine-specific values
    pub details: Vec<(&'static str, String)>,
}

impl fmt::Display for DiskCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} disk cache [{}]", self.engine, self.cache_name)?;
        writeln!(f, "  status:          {}", self.status)?;
        writeln!(f, "  keys:            {}", self.key_count)?;
        writeln!(f, "  data file size:  {}", self.data_file_size)?;
        writeln!(f, "  free list size:  {}", self.free_list_size)?;
        writeln!(f, "  recycle count:   {}", self.recycle_count)?;
        writeln!(f, "  bytes free:      {}", self.bytes_free)?;
        writeln!(f, "  remove count:    {}", self.remove_count)?;
        writeln!(f, "  hits / misses:   {} / {}", self.hits, self.misses)?;
        writeln!(f, "  puts:            {}", self.puts)?;
        writeln!(f, "  dropped writes:  {}", self.dropped_writes)?;
        write!(f, "  optimizations:   {}", self.optimizations)?;
        for (name, value) in &self.details {
            write!(f, "\n  {:<16} {}", format!("{}:", name), value)?;
        }
        Ok(())
    }
}

/// Disk storage engine contract
pub trait DiskCache: Send + Sync {
    /// Region name
    fn cache_name(&self) -> &str;

    /// Lifecycle state
    fn status(&self) -> CacheStatus;

    /// Look up a single key
    fn get(&self, key: &CacheKey) -> Lookup;

    /// Snapshot of the keys currently indexed
    fn key_set(&self) -> Vec<CacheKey>;

    /// Store an element, replacing any element under the same key
    fn update(&self, element: CacheElement) -> UpdateOutcome;

    /// Remove a key; group and partial-name keys remove every covered key
    ///
    /// Returns `true` if anything was removed.
    fn remove(&self, key: &CacheKey) -> bool;

    /// Remove everything and reset the files
    fn remove_all(&self);

    /// Optimize (if configured), persist the index and close the files
    fn dispose(&self);

    /// Rewrite the data file so it holds only live data
    fn optimize(&self) -> Result<()>;

    /// Number of keys in the index
    fn size(&self) -> usize;

    /// Statistics snapshot
    fn stats(&self) -> DiskCacheStats;

    /// Look up several keys; misses are left out of the result
    fn get_multiple(&self, keys: &[CacheKey]) -> HashMap<CacheKey, CacheElement> {
        keys.iter()
            .filter_map(|key| self.get(key).into_option().map(|e| (key.clone(), e)))
            .collect()
    }

    /// Look up every key whose display form fully matches `pattern`
    ///
    /// Matching runs over the in-memory key set, not the data file. An
    /// invalid pattern matches nothing.
    fn get_matching(&self, pattern: &str) -> HashMap<CacheKey, CacheElement> {
        let regex = match Regex::new(&format!("^(?:{})$", pattern)) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(
                    "{}: invalid key pattern {:?}: {}",
                    self.cache_name(),
                    pattern,
                    e
                );
                return HashMap::new();
            }
        };

        let keys: Vec<CacheKey> = self
            .key_set()
            .into_iter()
            .filter(|key| regex.is_match(&key.to_string()))
            .collect();
        self.get_multiple(&keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_into_option() {
        let element = CacheElement::new("r", CacheKey::name("k"), b"v".to_vec());
        assert_eq!(
            Lookup::Hit(element.clone()).into_option(),
            Some(element)
        );
        assert!(Lookup::Miss.into_option().is_none());
        assert!(
            Lookup::Failed(ErrorKind::CorruptionDetected)
                .into_option()
                .is_none()
        );
    }

    #[test]
    fn test_stats_display() {
        let stats = DiskCacheStats {
            cache_name: "region".into(),
            engine: "block",
            status: CacheStatus::Alive,
            key_count: 3,
            data_file_size: 4096,
            free_list_size: 1,
            recycle_count: 0,
            bytes_free: 1024,
            remove_count: 1,
            hits: 5,
            misses: 2,
            puts: 4,
            dropped_writes: 0,
            optimizations: 0,
            details: vec![("block size", "1024".into())],
        };

        let text = stats.to_string();
        assert!(text.starts_with("block disk cache [region]"));
        assert!(text.contains("keys:            3"));
        assert!(text.contains("hits / misses:   5 / 2"));
        assert!(text.contains("block size:"));
    }
}
