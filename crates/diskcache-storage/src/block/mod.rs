//! Block disk cache
//!
//! Values are stored in fixed-size blocks addressed by number. The index maps
//! each key to the ordered list of blocks holding its value; freed blocks are
//! reused before the file grows.
//!
//! The region can be bounded by blocks in use (`COUNT`) or kilobytes in use
//! (`SIZE`). A write that would cross the bound is dropped; the engine never
//! evicts to make room.

pub mod allocator;
pub mod key_store;

use crate::codec::{ElementSerializer, RecordCodec};
use crate::defrag::FileRewriter;
use crate::facade::{CacheStatus, DiskCache, DiskCacheStats, Lookup, UpdateOutcome};
use crate::keyfile::KeyFile;
use crate::optimizer::Optimizer;
use allocator::{BLOCK_HEADER_SIZE, BlockAllocator};
use diskcache_common::{
    BlockDiskCacheAttributes, CacheElement, CacheKey, DiskCacheAttributes, DiskLimitType, Error,
    ErrorKind, Result,
};
use key_store::BlockKeyStore;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const ENGINE_NAME: &str = "block";

/// Disk usage bound of a block region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockLimit {
    /// No bound
    Unbounded,
    /// Maximum blocks in use
    Blocks(u64),
    /// Maximum bytes in use, counted in whole blocks
    Bytes(u64),
}

impl BlockLimit {
    /// Derive the bound from region attributes
    #[must_use]
    pub fn from_attributes(attrs: &DiskCacheAttributes) -> Self {
        match (attrs.key_limit(), attrs.disk_limit_type) {
            (None, _) => Self::Unbounded,
            (Some(n), DiskLimitType::Count) => Self::Blocks(n),
            (Some(n), DiskLimitType::Size) => Self::Bytes(n.saturating_mul(1024)),
        }
    }

    /// Check that `blocks` blocks of `block_size` bytes fit the bound
    ///
    /// `Blocks` limits are compared in blocks, `Bytes` limits in bytes.
    pub fn check(&self, blocks: u64, block_size: u32) -> Result<()> {
        let (required, limit) = match *self {
            Self::Unbounded => return Ok(()),
            Self::Blocks(max) => (blocks, max),
            Self::Bytes(max) => (blocks.saturating_mul(u64::from(block_size)), max),
        };
        if required > limit {
            return Err(Error::CapacityExceeded { required, limit });
        }
        Ok(())
    }
}

struct BlockState {
    status: CacheStatus,
    keys: BlockKeyStore,
    allocator: BlockAllocator,
    remove_count: u64,
    /// Blocks taken from the free set instead of extending the file
    recycle_count: u64,
}

impl BlockState {
    fn is_alive(&self) -> bool {
        self.status == CacheStatus::Alive
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    dropped: AtomicU64,
    optimizations: AtomicU64,
}

struct Inner {
    attrs: BlockDiskCacheAttributes,
    limit: BlockLimit,
    codec: RecordCodec,
    key_file: KeyFile,
    state: RwLock<BlockState>,
    counters: Counters,
}

/// Disk cache storing values in fixed-size blocks
pub struct BlockDiskCache {
    inner: Arc<Inner>,
    optimizer: Mutex<Option<Optimizer>>,
}

impl BlockDiskCache {
    /// Open (or create) a region using the bincode serializer
    pub fn open(attrs: BlockDiskCacheAttributes) -> Result<Self> {
        Self::with_codec(attrs, RecordCodec::default())
    }

    /// Open (or create) a region using a custom element serializer
    pub fn open_with_serializer(
        attrs: BlockDiskCacheAttributes,
        serializer: Arc<dyn ElementSerializer>,
    ) -> Result<Self> {
        Self::with_codec(attrs, RecordCodec::new(serializer))
    }

    fn with_codec(attrs: BlockDiskCacheAttributes, codec: RecordCodec) -> Result<Self> {
        attrs.validate(BLOCK_HEADER_SIZE)?;
        let allocator = BlockAllocator::open(attrs.disk.data_path(), attrs.block_size_bytes)?;
        let key_file = KeyFile::new(attrs.disk.key_path());

        let inner = Arc::new(Inner {
            limit: BlockLimit::from_attributes(&attrs.disk),
            state: RwLock::new(BlockState {
                status: CacheStatus::Alive,
                keys: BlockKeyStore::new(),
                allocator,
                remove_count: 0,
                recycle_count: 0,
            }),
            attrs,
            codec,
            key_file,
            counters: Counters::default(),
        });

        {
            let mut state = inner.state.write();
            inner.initialize(&mut state)?;
            info!(
                "{}: opened block disk cache with {} keys, {} of {} blocks free",
                inner.name(),
                state.keys.len(),
                state.allocator.free_count(),
                state.allocator.total_blocks()
            );
        }

        let optimizer = match inner.attrs.disk.optimize_threshold() {
            Some(_) => {
                let worker = Arc::clone(&inner);
                Some(Optimizer::spawn(inner.name(), move || {
                    if let Err(e) = worker.optimize() {
                        warn!("{}: deferred optimization failed: {}", worker.name(), e);
                    }
                })?)
            }
            None => None,
        };

        Ok(Self {
            inner,
            optimizer: Mutex::new(optimizer),
        })
    }

    fn request_optimization(&self) {
        if let Some(optimizer) = self.optimizer.lock().as_ref() {
            optimizer.request();
        }
    }
}

impl Inner {
    fn name(&self) -> &str {
        &self.attrs.disk.cache_name
    }

    fn initialize(&self, state: &mut BlockState) -> Result<()> {
        if self.attrs.disk.clear_disk_on_startup {
            info!("{}: clearing disk on startup", self.name());
            return self.reset(state);
        }

        if !self.key_file.exists() {
            if state.allocator.total_blocks() > 0 {
                warn!("{}: data file has no key file, discarding it", self.name());
                return self.reset(state);
            }
            return Ok(());
        }

        // The snapshot only describes a cleanly disposed region
        match self.load_keys(state) {
            Ok(()) => self.key_file.remove(),
            Err(e) => {
                warn!("{}: key file rejected: {}", self.name(), e);
                self.reset(state)
            }
        }
    }

    fn load_keys(&self, state: &mut BlockState) -> Result<()> {
        let started = Instant::now();
        let keys = BlockKeyStore::load(&self.key_file)?.unwrap_or_default();
        if keys.is_empty() {
            return Err(Error::corruption(0, "key file holds no keys"));
        }

        state.allocator.rebuild_free_list(keys.referenced_blocks())?;
        for (_, blocks) in keys.iter() {
            state.allocator.verify(blocks)?;
        }
        state.keys = keys;

        info!(
            "{}: loaded {} keys in {:?}",
            self.name(),
            state.keys.len(),
            started.elapsed()
        );
        Ok(())
    }

    fn reset(&self, state: &mut BlockState) -> Result<()> {
        warn!("{}: resetting disk cache", self.name());
        state.keys.clear();
        state.remove_count = 0;
        self.key_file.remove()?;
        state.allocator.reset()
    }

    fn disable(&self, state: &mut BlockState, err: &Error) {
        error!("{}: disabling region: {}", self.name(), err);
        state.status = CacheStatus::Error;
    }

    fn should_optimize(&self, state: &BlockState) -> bool {
        self.attrs
            .disk
            .optimize_threshold()
            .is_some_and(|threshold| state.remove_count >= threshold)
    }

    fn get(&self, key: &CacheKey) -> Lookup {
        let (blocks, result) = {
            let state = self.state.read();
            if !state.is_alive() {
                return Lookup::Miss;
            }
            let Some(blocks) = state.keys.get(key) else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Lookup::Miss;
            };
            (blocks.to_vec(), self.read_locked(&state, key, blocks))
        };

        match result {
            Ok(element) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Hit(element)
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                if e.is_corruption() {
                    warn!("{}: corrupt value for key {}: {}", self.name(), key, e);
                    self.evict_corrupt(key, &blocks);
                } else {
                    warn!("{}: failed to read key {}: {}", self.name(), key, e);
                }
                Lookup::Failed(e.kind())
            }
        }
    }

    /// Evict `key` if it still maps to `blocks` and they are still unreadable
    fn evict_corrupt(&self, key: &CacheKey, blocks: &[u32]) -> bool {
        let mut state = self.state.write();
        let still_corrupt = state.keys.get(key) == Some(blocks)
            && self
                .read_locked(&state, key, blocks)
                .is_err_and(|e| e.is_corruption());
        if still_corrupt {
            debug!("{}: evicting key {}", self.name(), key);
            state.keys.remove(key);
            state.allocator.free(blocks);
        }
        still_corrupt
    }

    fn read_locked(&self, state: &BlockState, key: &CacheKey, blocks: &[u32]) -> Result<CacheElement> {
        let payload = state.allocator.read(blocks)?;
        let offset = blocks
            .first()
            .map_or(0, |&b| allocator::block_offset(b, state.allocator.block_size()));
        let element = self
            .codec
            .decode(&payload)
            .map_err(|e| Error::corruption(offset, e.to_string()))?;
        if &element.key != key {
            return Err(Error::corruption(
                offset,
                format!("blocks hold key {} instead of {}", element.key, key),
            ));
        }
        Ok(element)
    }

    fn update(&self, element: CacheElement) -> (UpdateOutcome, bool) {
        let encoded = self.codec.encode(&element);

        let mut state = self.state.write();
        if !state.is_alive() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return (UpdateOutcome::Dropped, false);
        }

        // Free the old value first; a refused write leaves the key absent
        if let Some(old) = state.keys.remove(&element.key) {
            state.allocator.free(&old);
        }

        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}: failed to encode key {}: {}", self.name(), element.key, e);
                return (UpdateOutcome::Failed(e.kind()), false);
            }
        };

        let needed = state.allocator.blocks_for(payload.len());
        let in_use = u64::from(state.allocator.used_count()) + needed;
        if let Err(e) = self.limit.check(in_use, state.allocator.block_size()) {
            debug!("{}: dropping key {}: {}", self.name(), element.key, e);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return (UpdateOutcome::Dropped, false);
        }

        match state.allocator.write(&payload) {
            Ok((blocks, reused)) => {
                state.recycle_count += reused as u64;
                state.keys.insert(element.key, blocks);
                self.counters.puts.fetch_add(1, Ordering::Relaxed);
                (UpdateOutcome::Stored, self.should_optimize(&state))
            }
            Err(e) => {
                warn!("{}: failed to write key {}: {}", self.name(), element.key, e);
                if e.kind() == ErrorKind::Fatal {
                    self.disable(&mut state, &e);
                }
                (UpdateOutcome::Failed(e.kind()), false)
            }
        }
    }

    fn remove(&self, key: &CacheKey) -> (bool, bool) {
        let mut state = self.state.write();
        if !state.is_alive() {
            return (false, false);
        }

        let removed: Vec<Vec<u32>> = if key.is_multi_key() {
            state
                .keys
                .remove_covered(key)
                .into_iter()
                .map(|(_, blocks)| blocks)
                .collect()
        } else {
            state.keys.remove(key).into_iter().collect()
        };

        for blocks in &removed {
            state.allocator.free(blocks);
        }
        state.remove_count += removed.len() as u64;
        (!removed.is_empty(), self.should_optimize(&state))
    }

    fn remove_all(&self) {
        let mut state = self.state.write();
        if !state.is_alive() {
            return;
        }
        info!("{}: removing all keys", self.name());
        if let Err(e) = self.reset(&mut state) {
            self.disable(&mut state, &e);
        }
    }

    fn optimize(&self) -> Result<()> {
        let mut state = self.state.write();
        let result = self.optimize_locked(&mut state);
        if let Err(e) = &result
            && e.kind() == ErrorKind::Fatal
        {
            self.disable(&mut state, e);
        }
        result
    }

    /// Rewrite live values into blocks `0..n` of a fresh file
    fn optimize_locked(&self, state: &mut BlockState) -> Result<()> {
        if !state.is_alive() {
            return Err(Error::Disposed(self.name().to_string()));
        }

        let started = Instant::now();
        let before = state.allocator.total_blocks();
        let live: Vec<(CacheKey, Vec<u32>)> = state
            .keys
            .iter()
            .map(|(key, blocks)| (key.clone(), blocks.to_vec()))
            .collect();

        let rewriter = FileRewriter::create(state.allocator.file())?;
        let mut next = 0u32;
        let mut moved = Vec::with_capacity(live.len());
        let mut dropped = Vec::new();
        for (key, blocks) in live {
            match state.allocator.read(&blocks) {
                Ok(payload) => {
                    let packed = state.allocator.write_packed(&rewriter, next, &payload)?;
                    next += u32::try_from(packed.len())
                        .map_err(|_| Error::storage("block numbers exhausted"))?;
                    moved.push((key, packed));
                }
                Err(e) if e.is_corruption() => {
                    warn!("{}: dropping key {} during optimization: {}", self.name(), key, e);
                    dropped.push(key);
                }
                Err(e) => return Err(e),
            }
        }
        rewriter.commit(state.allocator.file())?;

        state.allocator.adopt_packed(next);
        for key in dropped {
            state.keys.remove(&key);
        }
        for (key, blocks) in moved {
            state.keys.insert(key, blocks);
        }
        state.remove_count = 0;

        self.counters.optimizations.fetch_add(1, Ordering::Relaxed);
        info!(
            "{}: optimized block file from {} to {} blocks in {:?}",
            self.name(),
            before,
            next,
            started.elapsed()
        );
        Ok(())
    }

    fn dispose(&self) {
        let mut state = self.state.write();
        if !state.is_alive() {
            return;
        }

        if self.attrs.disk.optimize_on_shutdown && state.allocator.free_count() > 0 {
            if let Err(e) = self.optimize_locked(&mut state) {
                if e.kind() == ErrorKind::Fatal {
                    self.disable(&mut state, &e);
                    return;
                }
                warn!("{}: optimization on dispose failed: {}", self.name(), e);
            }
        }

        if let Err(e) = state.keys.save(&self.key_file) {
            error!("{}: failed to save keys on dispose: {}", self.name(), e);
        }
        if let Err(e) = state.allocator.close() {
            warn!("{}: failed to close data file: {}", self.name(), e);
        }
        state.status = CacheStatus::Disposed;
        info!("{}: disposed with {} keys", self.name(), state.keys.len());
    }

    fn stats(&self) -> DiskCacheStats {
        let state = self.state.read();
        let allocator = &state.allocator;
        let block_size = allocator.block_size();
        DiskCacheStats {
            cache_name: self.name().to_string(),
            engine: ENGINE_NAME,
            status: state.status,
            key_count: state.keys.len(),
            data_file_size: allocator.file().length().unwrap_or(0),
            free_list_size: allocator.free_count() as usize,
            recycle_count: state.recycle_count,
            bytes_free: u64::from(allocator.free_count()) * u64::from(block_size),
            remove_count: state.remove_count,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            dropped_writes: self.counters.dropped.load(Ordering::Relaxed),
            optimizations: self.counters.optimizations.load(Ordering::Relaxed),
            details: vec![
                ("block size", block_size.to_string()),
                ("blocks in use", allocator.used_count().to_string()),
                ("total blocks", allocator.total_blocks().to_string()),
                ("limit", format!("{:?}", self.limit)),
            ],
        }
    }
}

impl DiskCache for BlockDiskCache {
    fn cache_name(&self) -> &str {
        self.inner.name()
    }

    fn status(&self) -> CacheStatus {
        self.inner.state.read().status
    }

    fn get(&self, key: &CacheKey) -> Lookup {
        self.inner.get(key)
    }

    fn key_set(&self) -> Vec<CacheKey> {
        let state = self.inner.state.read();
        if !state.is_alive() {
            return Vec::new();
        }
        state.keys.keys()
    }

    fn update(&self, element: CacheElement) -> UpdateOutcome {
        let (outcome, optimize) = self.inner.update(element);
        if optimize {
            self.request_optimization();
        }
        outcome
    }

    fn remove(&self, key: &CacheKey) -> bool {
        let (removed, optimize) = self.inner.remove(key);
        if optimize {
            self.request_optimization();
        }
        removed
    }

    fn remove_all(&self) {
        self.inner.remove_all();
    }

    fn dispose(&self) {
        if let Some(mut optimizer) = self.optimizer.lock().take() {
            optimizer.shutdown();
        }
        self.inner.dispose();
    }

    fn optimize(&self) -> Result<()> {
        self.inner.optimize()
    }

    fn size(&self) -> usize {
        self.inner.state.read().keys.len()
    }

    fn stats(&self) -> DiskCacheStats {
        self.inner.stats()
    }
}

impl Drop for BlockDiskCache {
    fn drop(&mut self) {
        DiskCache::dispose(self);
    }
}
