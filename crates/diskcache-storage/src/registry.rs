//! Region registry
//!
//! Owns every open region by name. A region's files belong to exactly one
//! engine instance, so a second open of the same name is refused until the
//! first is removed.

use crate::block::BlockDiskCache;
use crate::facade::DiskCache;
use crate::indexed::IndexedDiskCache;
use diskcache_common::{BlockDiskCacheAttributes, Error, IndexedDiskCacheAttributes, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Open regions keyed by name
#[derive(Default)]
pub struct DiskCacheRegistry {
    regions: RwLock<HashMap<String, Arc<dyn DiskCache>>>,
}

impl DiskCacheRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an indexed region and register it
    pub fn open_indexed(&self, attrs: IndexedDiskCacheAttributes) -> Result<Arc<dyn DiskCache>> {
        let name = attrs.disk.cache_name.clone();
        self.register(name, || {
            Ok(Arc::new(IndexedDiskCache::open(attrs)?) as Arc<dyn DiskCache>)
        })
    }

    /// Open a block region and register it
    pub fn open_block(&self, attrs: BlockDiskCacheAttributes) -> Result<Arc<dyn DiskCache>> {
        let name = attrs.disk.cache_name.clone();
        self.register(name, || {
            Ok(Arc::new(BlockDiskCache::open(attrs)?) as Arc<dyn DiskCache>)
        })
    }

    fn register<F>(&self, name: String, open: F) -> Result<Arc<dyn DiskCache>>
    where
        F: FnOnce() -> Result<Arc<dyn DiskCache>>,
    {
        let mut regions = self.regions.write();
        if regions.contains_key(&name) {
            return Err(Error::configuration(format!(
                "region {} is already open",
                name
            )));
        }

        let region = open()?;
        debug!("Registered region {}", name);
        regions.insert(name, Arc::clone(&region));
        Ok(region)
    }

    /// Look up an open region
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn DiskCache>> {
        self.regions.read().get(name).cloned()
    }

    /// Dispose a region and forget it
    ///
    /// Returns `false` if no region has that name.
    pub fn remove(&self, name: &str) -> bool {
        let Some(region) = self.regions.write().remove(name) else {
            return false;
        };
        region.dispose();
        true
    }

    /// Names of all open regions
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.regions.read().keys().cloned().collect()
    }

    /// Number of open regions
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Check if no region is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    /// Dispose every region
    pub fn shutdown(&self) {
        let regions: Vec<(String, Arc<dyn DiskCache>)> = self.regions.write().drain().collect();
        if regions.is_empty() {
            return;
        }
        info!("Shutting down {} regions", regions.len());
        for (name, region) in regions {
            debug!("Disposing region {}", name);
            region.dispose();
        }
    }
}

impl Drop for DiskCacheRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
