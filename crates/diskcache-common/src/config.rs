//! Configuration types for DiskCache
//!
//! Region attributes are handed to the engine by the surrounding cache tier.
//! They derive `serde` so the caller may load them from any format; every
//! field has a default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Suffix of the data file for a region
pub const DATA_FILE_SUFFIX: &str = "data";

/// Suffix of the key file for a region
pub const KEY_FILE_SUFFIX: &str = "key";

/// Default block size for the block engine
pub const DEFAULT_BLOCK_SIZE_BYTES: u32 = 4096;

/// Default bound on the indexed engine's recycle bin
pub const DEFAULT_MAX_RECYCLE_BIN_SIZE: usize = 5000;

/// How a disk limit is measured
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskLimitType {
    /// Limit counts items (keys for the indexed engine, blocks for the block engine)
    #[default]
    Count,
    /// Limit counts kilobytes of stored data
    Size,
}

/// Attributes shared by both engine variants
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheAttributes {
    /// Region name, also the stem of the data and key file names
    pub cache_name: String,
    /// Directory holding the region's files
    pub disk_path: PathBuf,
    /// Index capacity; negative means unbounded
    pub max_key_size: i64,
    /// Unit of `max_key_size`
    pub disk_limit_type: DiskLimitType,
    /// Size of the collaborator's in-flight holding area (not used by the engine)
    pub max_purgatory_size: i64,
    /// Optimize after this many removals; negative disables it
    pub optimize_at_remove_count: i64,
    /// Optimize on dispose when there is reclaimable space
    pub optimize_on_shutdown: bool,
    /// Discard any existing files when the region is opened
    pub clear_disk_on_startup: bool,
}

impl Default for DiskCacheAttributes {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            disk_path: PathBuf::from("./diskcache"),
            max_key_size: -1,
            disk_limit_type: DiskLimitType::Count,
            max_purgatory_size: 5000,
            optimize_at_remove_count: -1,
            optimize_on_shutdown: true,
            clear_disk_on_startup: false,
        }
    }
}

impl DiskCacheAttributes {
    /// Create attributes for a region stored under `disk_path`
    pub fn new(cache_name: impl Into<String>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_name: cache_name.into(),
            disk_path: disk_path.into(),
            ..Default::default()
        }
    }

    /// Path of the region's data file
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.disk_path
            .join(format!("{}.{}", self.cache_name, DATA_FILE_SUFFIX))
    }

    /// Path of the region's key file
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.disk_path
            .join(format!("{}.{}", self.cache_name, KEY_FILE_SUFFIX))
    }

    /// The key limit, or `None` when unbounded
    #[must_use]
    pub fn key_limit(&self) -> Option<u64> {
        u64::try_from(self.max_key_size).ok()
    }

    /// The removal count that triggers optimization, or `None` when disabled
    #[must_use]
    pub fn optimize_threshold(&self) -> Option<u64> {
        u64::try_from(self.optimize_at_remove_count)
            .ok()
            .filter(|&n| n > 0)
    }

    /// Validate the shared attributes
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.is_empty() {
            return Err(Error::configuration("cache_name must not be empty"));
        }
        if self
            .cache_name
            .contains(|c: char| c == '/' || c == '\\' || c == '\0')
        {
            return Err(Error::configuration(format!(
                "cache_name {:?} is not a valid file stem",
                self.cache_name
            )));
        }
        if self.max_key_size == 0 {
            return Err(Error::configuration(
                "max_key_size must be positive or negative (unbounded)",
            ));
        }
        Ok(())
    }
}

/// Attributes of an indexed-engine region
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexedDiskCacheAttributes {
    #[serde(flatten)]
    pub disk: DiskCacheAttributes,
    /// Maximum number of reusable slots remembered between optimizations
    pub max_recycle_bin_size: usize,
}

impl Default for IndexedDiskCacheAttributes {
    fn default() -> Self {
        Self {
            disk: DiskCacheAttributes::default(),
            max_recycle_bin_size: DEFAULT_MAX_RECYCLE_BIN_SIZE,
        }
    }
}

impl IndexedDiskCacheAttributes {
    /// Create attributes for a region stored under `disk_path`
    pub fn new(cache_name: impl Into<String>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk: DiskCacheAttributes::new(cache_name, disk_path),
            ..Default::default()
        }
    }

    /// Validate the attributes
    pub fn validate(&self) -> Result<()> {
        self.disk.validate()
    }
}

/// Attributes of a block-engine region
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDiskCacheAttributes {
    #[serde(flatten)]
    pub disk: DiskCacheAttributes,
    /// Size of each block in the data file
    pub block_size_bytes: u32,
}

impl Default for BlockDiskCacheAttributes {
    fn default() -> Self {
        Self {
            disk: DiskCacheAttributes::default(),
            block_size_bytes: DEFAULT_BLOCK_SIZE_BYTES,
        }
    }
}

impl BlockDiskCacheAttributes {
    /// Create attributes for a region stored under `disk_path`
    pub fn new(cache_name: impl Into<String>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk: DiskCacheAttributes::new(cache_name, disk_path),
            ..Default::default()
        }
    }

    /// Validate the attributes; `header_size` is the engine's per-value header
    pub fn validate(&self, header_size: u32) -> Result<()> {
        self.disk.validate()?;
        if self.block_size_bytes <= header_size {
            return Err(Error::configuration(format!(
                "block_size_bytes {} must exceed the {} byte block header",
                self.block_size_bytes, header_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_attributes() {
        let attrs = DiskCacheAttributes::default();
        assert_eq!(attrs.key_limit(), None);
        assert_eq!(attrs.optimize_threshold(), None);
        assert!(attrs.optimize_on_shutdown);
        assert!(attrs.validate().is_ok());
    }

    #[test]
    fn test_file_paths() {
        let attrs = DiskCacheAttributes::new("users", "/tmp/cache");
        assert_eq!(attrs.data_path(), PathBuf::from("/tmp/cache/users.data"));
        assert_eq!(attrs.key_path(), PathBuf::from("/tmp/cache/users.key"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut attrs = DiskCacheAttributes::new("", "/tmp");
        assert!(attrs.validate().is_err());

        attrs.cache_name = "a/b".into();
        assert!(attrs.validate().is_err());

        attrs.cache_name = "ok".into();
        attrs.max_key_size = 0;
        assert!(attrs.validate().is_err());

        let mut block = BlockDiskCacheAttributes::new("blocks", "/tmp");
        block.block_size_bytes = 4;
        assert!(block.validate(4).is_err());
        block.block_size_bytes = 64;
        assert!(block.validate(4).is_ok());
    }

    #[test]
    fn test_deserialize_indexed_attributes() {
        let json = r#"{
            "cache_name": "sessions",
            "disk_path": "/var/cache/sessions",
            "max_key_size": 10000,
            "disk_limit_type": "SIZE",
            "optimize_at_remove_count": 300,
            "max_recycle_bin_size": 50
        }"#;

        let attrs: IndexedDiskCacheAttributes = serde_json::from_str(json).unwrap();
        assert_eq!(attrs.disk.cache_name, "sessions");
        assert_eq!(attrs.disk.disk_limit_type, DiskLimitType::Size);
        assert_eq!(attrs.disk.key_limit(), Some(10000));
        assert_eq!(attrs.disk.optimize_threshold(), Some(300));
        assert_eq!(attrs.max_recycle_bin_size, 50);
        // Unspecified fields fall back to defaults
        assert!(attrs.disk.optimize_on_shutdown);
    }

    #[test]
    fn test_deserialize_block_attributes() {
        let json = r#"{ "cache_name": "blobs", "block_size_bytes": 512 }"#;
        let attrs: BlockDiskCacheAttributes = serde_json::from_str(json).unwrap();
        assert_eq!(attrs.block_size_bytes, 512);
        assert_eq!(attrs.disk.disk_limit_type, DiskLimitType::Count);
        assert_eq!(attrs.disk.max_key_size, -1);
    }
}
