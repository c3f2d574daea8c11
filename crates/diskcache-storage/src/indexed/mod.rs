//! Indexed disk cache
//!
//! Each element is one framed record in the data file. An in-memory key
//! index maps keys to record descriptors; freed records go to a recycle bin
//! and are reused by later writes that fit.
//!
//! # Design
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                IndexedDiskCache                   │
//! │  ┌──────────────┐   ┌──────────────────────────┐  │
//! │  │ Key store    │──▶│ Descriptor arena         │  │
//! │  │ (LRU, limit) │   │ position/length/capacity │  │
//! │  └──────────────┘   └──────────────────────────┘  │
//! │                            ▲                      │
//! │  ┌──────────────┐          │                      │
//! │  │ Recycle bin  │──────────┘                      │
//! │  │ (best fit)   │                                 │
//! │  └──────────────┘                                 │
//! │        │                                          │
//! │  ┌─────▼────────────────────┐  ┌───────────────┐  │
//! │  │ <name>.data (records)    │  │ <name>.key    │  │
//! │  └──────────────────────────┘  └───────────────┘  │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! # Write Path
//! 1. Serialize the element outside the lock
//! 2. Overwrite in place if the key's slot is large enough
//! 3. Otherwise reuse the best-fitting recycled slot, or append
//! 4. Index the key; recycle the replaced slot and any evicted keys
//!
//! # Recovery
//! The key file is only trusted if its checksum matches and every descriptor
//! lies inside the data file without overlapping another. Anything else
//! resets the region. Space not covered by a descriptor is recycled.
//!
//! The key file is written on dispose and deleted once loaded, so a region
//! that was not disposed cleanly reopens empty.

pub mod descriptor;
pub mod key_store;
pub mod recycle;

use crate::codec::{ElementSerializer, RECORD_HEADER_SIZE, RecordCodec, framed_len, record_len};
use crate::defrag::FileRewriter;
use crate::facade::{CacheStatus, DiskCache, DiskCacheStats, Lookup, UpdateOutcome};
use crate::keyfile::KeyFile;
use crate::optimizer::Optimizer;
use crate::raw_io::RawFile;
use descriptor::{
    DescriptorArena, DescriptorId, IndexedDiskElementDescriptor, check_for_overlaps, find_gaps,
};
use diskcache_common::{
    CacheElement, CacheKey, Error, ErrorKind, IndexedDiskCacheAttributes, Result,
};
use key_store::{IndexedKeyStore, KeyLimit};
use parking_lot::{Mutex, RwLock};
use recycle::RecycleBin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const ENGINE_NAME: &str = "indexed";

/// Persisted form of one index entry
type KeyRecord = (CacheKey, IndexedDiskElementDescriptor);

/// Mutable state guarded by the region lock
struct IndexedState {
    status: CacheStatus,
    keys: IndexedKeyStore,
    arena: DescriptorArena,
    recycle: RecycleBin,
    /// Bytes in the data file not holding a live record
    bytes_free: u64,
    /// Keys removed since the last optimization
    remove_count: u64,
    /// Writes that reused a recycled slot
    recycle_count: u64,
}

impl IndexedState {
    fn new(attrs: &IndexedDiskCacheAttributes) -> Self {
        Self {
            status: CacheStatus::Alive,
            keys: IndexedKeyStore::new(KeyLimit::from_attributes(&attrs.disk)),
            arena: DescriptorArena::new(),
            recycle: RecycleBin::new(attrs.max_recycle_bin_size),
            bytes_free: 0,
            remove_count: 0,
            recycle_count: 0,
        }
    }

    fn is_alive(&self) -> bool {
        self.status == CacheStatus::Alive
    }

    fn descriptor(&self, id: DescriptorId) -> Result<IndexedDiskElementDescriptor> {
        self.arena
            .get(id)
            .copied()
            .ok_or_else(|| Error::storage(format!("dangling descriptor {:?}", id)))
    }

    /// Return a slot to the recycle bin
    ///
    /// If the bin is full the slot is forgotten; its bytes stay counted as
    /// free and come back at the next optimization.
    fn recycle(&mut self, id: DescriptorId) {
        let Some(descriptor) = self.arena.get(id).copied() else {
            return;
        };
        self.bytes_free += descriptor.footprint();
        if !self.recycle.add(id, &descriptor) {
            self.arena.remove(id);
        }
    }

    /// Forget a slot whose contents can't be trusted
    fn abandon(&mut self, id: DescriptorId) {
        if let Some(descriptor) = self.arena.remove(id) {
            self.bytes_free += descriptor.footprint();
        }
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.arena.clear();
        self.recycle.clear();
        self.bytes_free = 0;
        self.remove_count = 0;
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
    attrs: IndexedDiskCacheAttributes,
    codec: RecordCodec,
    data: RawFile,
    key_file: KeyFile,
    state: RwLock<IndexedState>,
    counters: Counters,
}

/// Disk cache storing one record per element
pub struct IndexedDiskCache {
    inner: Arc<Inner>,
    optimizer: Mutex<Option<Optimizer>>,
}

impl IndexedDiskCache {
    /// Open (or create) a region using the bincode serializer
    pub fn open(attrs: IndexedDiskCacheAttributes) -> Result<Self> {
        Self::with_codec(attrs, RecordCodec::default())
    }

    /// Open (or create) a region using a custom element serializer
    pub fn open_with_serializer(
        attrs: IndexedDiskCacheAttributes,
        serializer: Arc<dyn ElementSerializer>,
    ) -> Result<Self> {
        Self::with_codec(attrs, RecordCodec::new(serializer))
    }

    fn with_codec(attrs: IndexedDiskCacheAttributes, codec: RecordCodec) -> Result<Self> {
        attrs.validate()?;
        let data = RawFile::open(attrs.disk.data_path())?;
        let key_file = KeyFile::new(attrs.disk.key_path());

        let inner = Arc::new(Inner {
            state: RwLock::new(IndexedState::new(&attrs)),
            attrs,
            codec,
            data,
            key_file,
            counters: Counters::default(),
        });

        {
            let mut state = inner.state.write();
            inner.initialize(&mut state)?;
            info!(
                "{}: opened indexed disk cache with {} keys ({} bytes free)",
                inner.name(),
                state.keys.len(),
                state.bytes_free
            );
        }

        let optimizer = match inner.attrs.disk.optimize_threshold() {
            Some(threshold) => {
                debug!(
                    "{}: optimizing after every {} removals",
                    inner.name(),
                    threshold
                );
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
        if let Some(optimizer) = self.optimizer.lock().as_ref()
            && optimizer.request()
        {
            debug!("{}: optimization requested", self.inner.name());
        }
    }

    /// Check the live index for overlapping slots
    ///
    /// Covers both indexed records and recycled slots. Returns `true` when
    /// the index is sound.
    pub fn check_for_overlaps(&self) -> bool {
        let state = self.inner.state.read();
        let mut sorted: Vec<IndexedDiskElementDescriptor> = state
            .keys
            .iter()
            .map(|(_, id)| id)
            .chain(state.recycle.ids())
            .filter_map(|id| state.arena.get(id).copied())
            .collect();
        sorted.sort_by_key(|d| d.position);
        check_for_overlaps(self.inner.name(), &sorted)
    }
}

impl Inner {
    fn name(&self) -> &str {
        &self.attrs.disk.cache_name
    }

    fn initialize(&self, state: &mut IndexedState) -> Result<()> {
        if self.attrs.disk.clear_disk_on_startup {
            info!("{}: clearing disk on startup", self.name());
            return self.reset(state);
        }

        if !self.key_file.exists() {
            if self.data.length()? > 0 {
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

    /// Rebuild the index from the key file
    fn load_keys(&self, state: &mut IndexedState) -> Result<()> {
        let started = Instant::now();
        let records: Vec<KeyRecord> = self.key_file.load()?.unwrap_or_default();
        if records.is_empty() {
            return Err(Error::corruption(0, "key file holds no keys"));
        }

        let file_len = self.data.length()?;
        let mut sorted: Vec<IndexedDiskElementDescriptor> =
            records.iter().map(|(_, d)| *d).collect();
        sorted.sort_by_key(|d| d.position);

        for d in &sorted {
            if d.length > d.capacity {
                return Err(Error::corruption(
                    d.position,
                    format!("length {} exceeds capacity {}", d.length, d.capacity),
                ));
            }
            if d.end() > file_len {
                return Err(Error::corruption(
                    d.position,
                    format!("slot ends at {} past data file length {}", d.end(), file_len),
                ));
            }
        }
        if !check_for_overlaps(self.name(), &sorted) {
            return Err(Error::corruption(0, "overlapping descriptors"));
        }
        for d in &sorted {
            let declared = self.codec.record_length(&self.data, d.position)?;
            if declared != d.length {
                return Err(Error::corruption(
                    d.position,
                    format!("record length {} does not match index length {}", declared, d.length),
                ));
            }
        }

        for (key, descriptor) in records {
            let id = state.arena.insert(descriptor);
            let insertion = state
                .keys
                .insert(key, id, framed_len(u64::from(descriptor.length)));
            for (_, evicted) in insertion.evicted {
                state.recycle(evicted);
            }
        }

        for (position, len) in find_gaps(&sorted, file_len) {
            let capacity = len
                .checked_sub(RECORD_HEADER_SIZE)
                .and_then(|c| u32::try_from(c).ok())
                .filter(|&c| c > 0);
            match capacity {
                Some(capacity) => {
                    let id = state.arena.insert(IndexedDiskElementDescriptor {
                        position,
                        length: 0,
                        capacity,
                    });
                    state.recycle(id);
                }
                None => state.bytes_free += len,
            }
        }

        info!(
            "{}: loaded {} keys in {:?}, {} free slots",
            self.name(),
            state.keys.len(),
            started.elapsed(),
            state.recycle.len()
        );
        Ok(())
    }

    /// Drop every key and recreate both files empty
    fn reset(&self, state: &mut IndexedState) -> Result<()> {
        warn!("{}: resetting disk cache", self.name());
        state.clear();
        self.key_file.remove()?;
        self.data.truncate_and_reopen()
    }

    fn disable(&self, state: &mut IndexedState, err: &Error) {
        error!("{}: disabling region: {}", self.name(), err);
        state.status = CacheStatus::Error;
    }

    fn should_optimize(&self, state: &IndexedState) -> bool {
        self.attrs
            .disk
            .optimize_threshold()
            .is_some_and(|threshold| state.remove_count >= threshold)
    }

    fn get(&self, key: &CacheKey) -> Lookup {
        let (id, result) = {
            let state = self.state.read();
            if !state.is_alive() {
                return Lookup::Miss;
            }
            let Some(id) = state.keys.get(key) else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Lookup::Miss;
            };
            (id, self.read_locked(&state, key, id))
        };

        match result {
            Ok(element) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Hit(element)
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                if e.is_corruption() {
                    warn!("{}: corrupt record for key {}: {}", self.name(), key, e);
                    self.evict_corrupt(key, id);
                } else {
                    warn!("{}: failed to read key {}: {}", self.name(), key, e);
                }
                Lookup::Failed(e.kind())
            }
        }
    }

    /// Evict `key` if it still maps to `id` and the record is still unreadable
    ///
    /// The read lock is released between the failed read and this call, so a
    /// writer may have rewritten the slot in place meanwhile.
    fn evict_corrupt(&self, key: &CacheKey, id: DescriptorId) -> bool {
        let mut state = self.state.write();
        let still_corrupt = state.keys.peek(key) == Some(id)
            && self
                .read_locked(&state, key, id)
                .is_err_and(|e| e.is_corruption());
        if still_corrupt {
            debug!("{}: evicting key {}", self.name(), key);
            state.keys.remove(key);
            state.abandon(id);
        }
        still_corrupt
    }

    fn read_locked(&self, state: &IndexedState, key: &CacheKey, id: DescriptorId) -> Result<CacheElement> {
        let descriptor = state
            .descriptor(id)
            .map_err(|e| Error::corruption(0, e.to_string()))?;
        let element =
            self.codec
                .read_element(&self.data, descriptor.position, Some(descriptor.length))?;
        if &element.key != key {
            return Err(Error::corruption(
                descriptor.position,
                format!("record holds key {} instead of {}", element.key, key),
            ));
        }
        Ok(element)
    }

    /// Store an element; the flag asks for a deferred optimization
    fn update(&self, element: CacheElement) -> (UpdateOutcome, bool) {
        let payload = match self.codec.encode(&element) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{}: failed to encode key {}: {}", self.name(), element.key, e);
                self.discard(&element.key);
                return (UpdateOutcome::Failed(e.kind()), false);
            }
        };
        let length = match record_len(payload.len()) {
            Ok(length) => length,
            Err(e) => {
                warn!("{}: dropping key {}: {}", self.name(), element.key, e);
                self.discard(&element.key);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return (UpdateOutcome::Dropped, false);
            }
        };

        let mut state = self.state.write();
        if !state.is_alive() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return (UpdateOutcome::Dropped, false);
        }

        match self.write_locked(&mut state, element.key.clone(), &payload, length) {
            Ok(()) => {
                self.counters.puts.fetch_add(1, Ordering::Relaxed);
                (UpdateOutcome::Stored, self.should_optimize(&state))
            }
            Err(e) => {
                warn!("{}: failed to write key {}: {}", self.name(), element.key, e);
                if let Some(id) = state.keys.remove(&element.key) {
                    state.recycle(id);
                }
                if e.kind() == ErrorKind::Fatal {
                    self.disable(&mut state, &e);
                }
                (UpdateOutcome::Failed(e.kind()), false)
            }
        }
    }

    /// Forget `key` after a write for it was refused
    fn discard(&self, key: &CacheKey) {
        let mut state = self.state.write();
        if state.is_alive()
            && let Some(id) = state.keys.remove(key)
        {
            state.recycle(id);
        }
    }

    fn write_locked(
        &self,
        state: &mut IndexedState,
        key: CacheKey,
        payload: &[u8],
        length: u32,
    ) -> Result<()> {
        let current = state
            .keys
            .peek(&key)
            .and_then(|id| state.arena.get(id).map(|d| (id, *d)));

        let target = match current {
            Some((id, descriptor)) if descriptor.fits(length) => {
                self.codec
                    .write_record(&self.data, descriptor.position, payload)?;
                if let Some(slot) = state.arena.get_mut(id) {
                    slot.length = length;
                }
                id
            }
            _ => match state.recycle.take_best_fit(length) {
                Some(id) => {
                    let descriptor = state.descriptor(id)?;
                    if let Err(e) = self
                        .codec
                        .write_record(&self.data, descriptor.position, payload)
                    {
                        state.recycle.restore(id, &descriptor);
                        return Err(e);
                    }
                    if let Some(slot) = state.arena.get_mut(id) {
                        slot.length = length;
                    }
                    state.recycle_count += 1;
                    state.bytes_free = state.bytes_free.saturating_sub(descriptor.footprint());
                    id
                }
                None => {
                    let position = self.codec.append_record(&self.data, payload)?;
                    state
                        .arena
                        .insert(IndexedDiskElementDescriptor::new(position, length))
                }
            },
        };

        let insertion = state
            .keys
            .insert(key, target, framed_len(u64::from(length)));
        if let Some(replaced) = insertion.replaced
            && replaced != target
        {
            state.recycle(replaced);
        }
        for (evicted, id) in insertion.evicted {
            debug!("{}: evicted key {}", self.name(), evicted);
            state.recycle(id);
            state.remove_count += 1;
        }
        Ok(())
    }

    /// Remove a key; the second flag asks for a deferred optimization
    fn remove(&self, key: &CacheKey) -> (bool, bool) {
        let mut state = self.state.write();
        if !state.is_alive() {
            return (false, false);
        }

        let removed: Vec<DescriptorId> = if key.is_multi_key() {
            state
                .keys
                .remove_covered(key)
                .into_iter()
                .map(|(_, id)| id)
                .collect()
        } else {
            state.keys.remove(key).into_iter().collect()
        };

        for &id in &removed {
            state.recycle(id);
        }
        state.remove_count += removed.len() as u64;
        if !removed.is_empty() {
            debug!("{}: removed {} keys for {}", self.name(), removed.len(), key);
        }
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

    /// Rewrite the data file with live records packed from offset zero
    fn optimize_locked(&self, state: &mut IndexedState) -> Result<()> {
        if !state.is_alive() {
            return Err(Error::Disposed(self.name().to_string()));
        }

        let started = Instant::now();
        let before = self.data.length()?;
        let live: Vec<(CacheKey, DescriptorId)> = state
            .keys
            .iter()
            .map(|(key, id)| (key.clone(), id))
            .collect();

        let rewriter = FileRewriter::create(&self.data)?;
        let mut moved = Vec::with_capacity(live.len());
        let mut dropped = Vec::new();
        for (key, id) in live {
            let descriptor = state.descriptor(id)?;
            match self
                .codec
                .read_record(&self.data, descriptor.position, Some(descriptor.length))
            {
                Ok(payload) => {
                    let position = rewriter.append(&self.codec.frame(&payload)?)?;
                    moved.push((id, position));
                }
                Err(e) if e.is_corruption() => {
                    warn!("{}: dropping key {} during optimization: {}", self.name(), key, e);
                    dropped.push(key);
                }
                Err(e) => return Err(e),
            }
        }
        rewriter.commit(&self.data)?;

        for key in dropped {
            if let Some(id) = state.keys.remove(&key) {
                state.arena.remove(id);
            }
        }
        for (id, position) in moved {
            if let Some(slot) = state.arena.get_mut(id) {
                slot.position = position;
                slot.capacity = slot.length;
            }
        }
        let recycled: Vec<DescriptorId> = state.recycle.ids().collect();
        for id in recycled {
            state.arena.remove(id);
        }
        state.recycle.clear();
        state.bytes_free = 0;
        state.remove_count = 0;

        self.counters.optimizations.fetch_add(1, Ordering::Relaxed);
        info!(
            "{}: optimized data file from {} to {} bytes in {:?}",
            self.name(),
            before,
            self.data.length()?,
            started.elapsed()
        );
        Ok(())
    }

    fn save_keys_locked(&self, state: &IndexedState) -> Result<()> {
        let records: Vec<KeyRecord> = state
            .keys
            .iter()
            .filter_map(|(key, id)| state.arena.get(id).map(|d| (key.clone(), *d)))
            .collect();
        self.key_file.save(&records)?;
        debug!("{}: saved {} keys", self.name(), records.len());
        Ok(())
    }

    fn dispose(&self) {
        let mut state = self.state.write();
        if !state.is_alive() {
            return;
        }

        let reclaimable = state.bytes_free > 0 || !state.recycle.is_empty();
        if self.attrs.disk.optimize_on_shutdown && reclaimable {
            if let Err(e) = self.optimize_locked(&mut state) {
                if e.kind() == ErrorKind::Fatal {
                    self.disable(&mut state, &e);
                    return;
                }
                warn!("{}: optimization on dispose failed: {}", self.name(), e);
            }
        }

        if let Err(e) = self.save_keys_locked(&state) {
            error!("{}: failed to save keys on dispose: {}", self.name(), e);
        }
        if let Err(e) = self.data.close() {
            warn!("{}: failed to close data file: {}", self.name(), e);
        }
        state.status = CacheStatus::Disposed;
        info!("{}: disposed with {} keys", self.name(), state.keys.len());
    }

    fn stats(&self) -> DiskCacheStats {
        let state = self.state.read();
        DiskCacheStats {
            cache_name: self.name().to_string(),
            engine: ENGINE_NAME,
            status: state.status,
            key_count: state.keys.len(),
            data_file_size: self.data.length().unwrap_or(0),
            free_list_size: state.recycle.len(),
            recycle_count: state.recycle_count,
            bytes_free: state.bytes_free,
            remove_count: state.remove_count,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            dropped_writes: self.counters.dropped.load(Ordering::Relaxed),
            optimizations: self.counters.optimizations.load(Ordering::Relaxed),
            details: vec![
                ("key limit", format!("{:?}", state.keys.limit())),
                ("key bytes", state.keys.total_bytes().to_string()),
                (
                    "recycle bin max",
                    self.attrs.max_recycle_bin_size.to_string(),
                ),
            ],
        }
    }
}

impl DiskCache for IndexedDiskCache {
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

impl Drop for IndexedDiskCache {
    fn drop(&mut self) {
        DiskCache::dispose(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskcache_common::DiskLimitType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn attrs(dir: &Path) -> IndexedDiskCacheAttributes {
        IndexedDiskCacheAttributes::new("indexed", dir)
    }

    fn element(key: &str, value: &str) -> CacheElement {
        CacheElement::new("indexed", CacheKey::name(key), value.as_bytes().to_vec())
    }

    fn value_of(cache: &IndexedDiskCache, key: &str) -> Option<String> {
        cache
            .get(&CacheKey::name(key))
            .into_option()
            .map(|e| String::from_utf8(e.value.to_vec()).unwrap())
    }

    fn framed(element: &CacheElement) -> u64 {
        framed_len(RecordCodec::default().encode(element).unwrap().len() as u64)
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();

        assert_eq!(cache.update(element("a", "alpha")), UpdateOutcome::Stored);
        assert_eq!(cache.update(element("b", "beta")), UpdateOutcome::Stored);
        assert_eq!(value_of(&cache, "a").as_deref(), Some("alpha"));
        assert_eq!(cache.get(&CacheKey::name("missing")), Lookup::Miss);

        assert!(cache.remove(&CacheKey::name("a")));
        assert!(!cache.remove(&CacheKey::name("a")));
        assert_eq!(cache.get(&CacheKey::name("a")), Lookup::Miss);
        assert_eq!(cache.size(), 1);

        let stats = cache.stats();
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.remove_count, 1);
    }

    #[test]
    fn test_large_and_utf8_values() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();

        let large = "x".repeat(1 << 20);
        let text = "ключ → 値 ✓ 🚀";
        cache.update(element("large", &large));
        cache.update(element("text", text));

        assert_eq!(value_of(&cache, "large").unwrap().len(), 1 << 20);
        assert_eq!(value_of(&cache, "text").as_deref(), Some(text));
    }

    #[test]
    fn test_removed_slots_are_reused() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();

        for i in 0..10 {
            cache.update(element(&format!("key{:02}", i), &format!("value{:02}", i)));
        }
        let size = cache.stats().data_file_size;

        for i in (0..10).step_by(2) {
            cache.remove(&CacheKey::name(format!("key{:02}", i)));
        }
        assert_eq!(cache.stats().free_list_size, 5);

        for i in 10..15 {
            cache.update(element(&format!("key{:02}", i), &format!("value{:02}", i)));
        }

        let stats = cache.stats();
        assert_eq!(stats.recycle_count, 5);
        assert_eq!(stats.free_list_size, 0);
        assert_eq!(stats.bytes_free, 0);
        assert_eq!(stats.data_file_size, size);
        assert!(cache.check_for_overlaps());
        for i in 10..15 {
            assert_eq!(
                value_of(&cache, &format!("key{:02}", i)),
                Some(format!("value{:02}", i))
            );
        }
    }

    #[test]
    fn test_half_of_recycled_slots_are_reused() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();

        for i in 0..20 {
            cache.update(element(&format!("key{:02}", i), &format!("value{:02}", i)));
        }
        let size = cache.stats().data_file_size;
        let slot = framed(&element("key00", "value00"));

        for i in 0..10 {
            cache.remove(&CacheKey::name(format!("key{:02}", i)));
        }
        for i in 20..25 {
            cache.update(element(&format!("key{:02}", i), &format!("value{:02}", i)));
        }

        let stats = cache.stats();
        assert_eq!(stats.recycle_count, 5);
        assert_eq!(stats.free_list_size, 5);
        assert_eq!(stats.bytes_free, 5 * slot);
        assert_eq!(stats.data_file_size, size);
        assert_eq!(stats.key_count, 15);
        assert!(cache.check_for_overlaps());
    }

    #[test]
    fn test_overwrite_in_place_and_grow() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();

        cache.update(element("k", &"a".repeat(100)));
        let size = cache.stats().data_file_size;

        // Smaller value reuses the slot
        cache.update(element("k", "small"));
        assert_eq!(cache.stats().data_file_size, size);
        assert_eq!(value_of(&cache, "k").as_deref(), Some("small"));

        // Growing back up to the slot capacity still fits
        cache.update(element("k", &"b".repeat(100)));
        assert_eq!(cache.stats().data_file_size, size);

        // Larger than the slot moves the record and recycles the old slot
        cache.update(element("k", &"c".repeat(200)));
        let stats = cache.stats();
        assert!(stats.data_file_size > size);
        assert_eq!(stats.free_list_size, 1);
        assert_eq!(value_of(&cache, "k"), Some("c".repeat(200)));
        assert!(cache.check_for_overlaps());
    }

    #[test]
    fn test_optimize_packs_live_records() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();

        let elements: Vec<CacheElement> = (0..20)
            .map(|i| element(&format!("key{}", i), &"v".repeat(i * 10)))
            .collect();
        for e in &elements {
            cache.update(e.clone());
        }
        for e in elements.iter().filter(|e| e.value.len() % 20 == 0) {
            cache.remove(&e.key);
        }

        cache.optimize().unwrap();

        let expected: u64 = elements
            .iter()
            .filter(|e| e.value.len() % 20 != 0)
            .map(framed)
            .sum();
        let stats = cache.stats();
        assert_eq!(stats.data_file_size, expected);
        assert_eq!(stats.bytes_free, 0);
        assert_eq!(stats.free_list_size, 0);
        assert_eq!(stats.remove_count, 0);
        assert_eq!(stats.optimizations, 1);
        assert!(cache.check_for_overlaps());

        for e in elements.iter().filter(|e| e.value.len() % 20 != 0) {
            assert_eq!(cache.get(&e.key).into_option().unwrap().value, e.value);
        }
    }

    #[test]
    fn test_group_and_partial_removal() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();

        for (group, attr) in [("g1", "a"), ("g1", "b"), ("g2", "a")] {
            let key = CacheKey::member("indexed", group, attr);
            cache.update(CacheElement::new("indexed", key, b"member".to_vec()));
        }
        cache.update(element("user:1", "one"));
        cache.update(element("user:2", "two"));
        cache.update(element("other", "three"));

        assert!(cache.remove(&CacheKey::group("indexed", "g1")));
        assert_eq!(cache.size(), 4);
        assert!(
            cache
                .get(&CacheKey::member("indexed", "g2", "a"))
                .is_hit()
        );

        assert!(cache.remove(&CacheKey::name("user:")));
        assert_eq!(cache.size(), 2);
        assert!(cache.get(&CacheKey::name("other")).is_hit());
        assert_eq!(cache.stats().remove_count, 4);
    }

    #[test]
    fn test_reload_after_dispose() {
        init_logging();
        let dir = tempdir().unwrap();
        {
            let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
            for i in 0..50 {
                cache.update(element(&format!("key{}", i), &format!("value{}", i)));
            }
            for i in 0..10 {
                cache.remove(&CacheKey::name(format!("key{}", i)));
            }
            cache.dispose();
            assert_eq!(cache.status(), CacheStatus::Disposed);
            assert_eq!(cache.update(element("late", "x")), UpdateOutcome::Dropped);
        }

        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        assert_eq!(cache.size(), 40);
        assert_eq!(cache.stats().bytes_free, 0);
        assert_eq!(value_of(&cache, "key25").as_deref(), Some("value25"));
        assert_eq!(value_of(&cache, "key5"), None);
    }

    #[test]
    fn test_unclean_shutdown_reopens_empty() {
        init_logging();
        let dir = tempdir().unwrap();
        {
            let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
            cache.update(element("a", "old"));
            cache.update(element("b", "beta"));
            cache.dispose();
        }

        let key_path = attrs(dir.path()).disk.key_path();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        assert_eq!(value_of(&cache, "a").as_deref(), Some("old"));
        assert!(!key_path.exists());

        cache.update(element("a", &"n".repeat(150)));
        cache.remove(&CacheKey::name("b"));
        cache.optimize().unwrap();
        assert!(!key_path.exists());
        std::mem::forget(cache);

        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get(&CacheKey::name("a")), Lookup::Miss);
        assert_eq!(cache.get(&CacheKey::name("b")), Lookup::Miss);
        assert_eq!(cache.stats().data_file_size, 0);
    }

    #[test]
    fn test_reload_without_optimize_recycles_gaps() {
        let dir = tempdir().unwrap();
        let mut attributes = attrs(dir.path());
        attributes.disk.optimize_on_shutdown = false;
        {
            let cache = IndexedDiskCache::open(attributes.clone()).unwrap();
            for i in 0..5 {
                cache.update(element(&format!("key{}", i), "payload"));
            }
            cache.remove(&CacheKey::name("key1"));
            cache.remove(&CacheKey::name("key3"));
        }

        let cache = IndexedDiskCache::open(attributes).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.key_count, 3);
        assert_eq!(stats.free_list_size, 2);
        assert_eq!(stats.bytes_free, 2 * framed(&element("key1", "payload")));

        cache.update(element("key9", "payload"));
        assert_eq!(cache.stats().recycle_count, 1);
        assert!(cache.check_for_overlaps());
    }

    #[test]
    fn test_corrupt_key_file_resets() {
        init_logging();
        let dir = tempdir().unwrap();
        {
            let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
            cache.update(element("a", "alpha"));
        }

        let key_path = attrs(dir.path()).disk.key_path();
        let mut bytes = std::fs::read(&key_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&key_path, bytes).unwrap();

        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().data_file_size, 0);
        assert_eq!(cache.status(), CacheStatus::Alive);
    }

    #[test]
    fn test_data_without_key_file_is_discarded() {
        let dir = tempdir().unwrap();
        let attributes = attrs(dir.path());
        std::fs::write(attributes.disk.data_path(), b"stale bytes").unwrap();

        let cache = IndexedDiskCache::open(attributes).unwrap();
        assert_eq!(cache.stats().data_file_size, 0);
    }

    #[test]
    fn test_clear_disk_on_startup() {
        let dir = tempdir().unwrap();
        let mut attributes = attrs(dir.path());
        {
            let cache = IndexedDiskCache::open(attributes.clone()).unwrap();
            cache.update(element("a", "alpha"));
        }

        attributes.disk.clear_disk_on_startup = true;
        let cache = IndexedDiskCache::open(attributes).unwrap();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_corrupt_record_is_evicted() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        cache.update(element("good", "fine"));
        let offset = cache.stats().data_file_size;
        cache.update(element("bad", "soon broken"));

        // Scribble over the payload of the second record
        let file = RawFile::open(attrs(dir.path()).disk.data_path()).unwrap();
        file.write(offset + RECORD_HEADER_SIZE, &[0xFF; 8]).unwrap();

        assert_eq!(
            cache.get(&CacheKey::name("bad")),
            Lookup::Failed(ErrorKind::CorruptionDetected)
        );
        assert!(!cache.key_set().contains(&CacheKey::name("bad")));
        assert_eq!(cache.get(&CacheKey::name("bad")), Lookup::Miss);
        assert_eq!(value_of(&cache, "good").as_deref(), Some("fine"));

        cache.optimize().unwrap();
        assert_eq!(
            cache.stats().data_file_size,
            framed(&element("good", "fine"))
        );
    }

    #[test]
    fn test_rewritten_record_is_not_evicted() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        let key = CacheKey::name("k");
        cache.update(element("k", "original"));
        let id = cache.inner.state.read().keys.peek(&key).unwrap();

        // Same length, so the record is rewritten in the same slot
        cache.update(element("k", "replaced"));
        assert_eq!(cache.inner.state.read().keys.peek(&key), Some(id));
        assert!(!cache.inner.evict_corrupt(&key, id));
        assert_eq!(value_of(&cache, "k").as_deref(), Some("replaced"));

        let file = RawFile::open(attrs(dir.path()).disk.data_path()).unwrap();
        file.write(RECORD_HEADER_SIZE, &[0xFF; 8]).unwrap();
        assert!(cache.inner.evict_corrupt(&key, id));
        assert_eq!(cache.get(&key), Lookup::Miss);
        assert!(cache.key_set().is_empty());
    }

    #[test]
    fn test_count_limit_evicts_least_recently_used() {
        let dir = tempdir().unwrap();
        let mut attributes = attrs(dir.path());
        attributes.disk.max_key_size = 3;
        let cache = IndexedDiskCache::open(attributes).unwrap();

        cache.update(element("a", "1"));
        cache.update(element("b", "2"));
        cache.update(element("c", "3"));
        assert!(cache.get(&CacheKey::name("a")).is_hit());
        cache.update(element("d", "4"));

        assert_eq!(cache.size(), 3);
        assert_eq!(cache.get(&CacheKey::name("b")), Lookup::Miss);
        assert!(cache.get(&CacheKey::name("a")).is_hit());
        assert_eq!(cache.stats().free_list_size, 1);
    }

    #[test]
    fn test_size_limit_evicts_by_kilobytes() {
        let dir = tempdir().unwrap();
        let mut attributes = attrs(dir.path());
        attributes.disk.max_key_size = 2;
        attributes.disk.disk_limit_type = DiskLimitType::Size;
        let cache = IndexedDiskCache::open(attributes).unwrap();

        for i in 0..4 {
            cache.update(element(&format!("key{}", i), &"z".repeat(900)));
        }
        assert_eq!(cache.size(), 2);
        assert!(cache.get(&CacheKey::name("key3")).is_hit());
    }

    #[test]
    fn test_get_matching_and_multiple() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        cache.update(element("user:1", "one"));
        cache.update(element("user:2", "two"));
        cache.update(element("admin", "root"));

        let matched = cache.get_matching("user:.*");
        assert_eq!(matched.len(), 2);
        assert!(matched.contains_key(&CacheKey::name("user:2")));
        assert!(cache.get_matching("user").is_empty());
        assert!(cache.get_matching("(").is_empty());

        let found = cache.get_multiple(&[CacheKey::name("admin"), CacheKey::name("nobody")]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_deferred_optimization() {
        let dir = tempdir().unwrap();
        let mut attributes = attrs(dir.path());
        attributes.disk.optimize_at_remove_count = 3;
        let cache = IndexedDiskCache::open(attributes).unwrap();

        for i in 0..6 {
            cache.update(element(&format!("key{}", i), "payload"));
        }
        for i in 0..3 {
            cache.remove(&CacheKey::name(format!("key{}", i)));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.stats().optimizations == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = cache.stats();
        assert_eq!(stats.optimizations, 1);
        assert_eq!(stats.remove_count, 0);
        assert_eq!(stats.data_file_size, 3 * framed(&element("key3", "payload")));
        assert!(cache.get(&CacheKey::name("key4")).is_hit());
    }

    #[test]
    fn test_remove_all() {
        let dir = tempdir().unwrap();
        let cache = IndexedDiskCache::open(attrs(dir.path())).unwrap();
        cache.update(element("a", "alpha"));
        cache.update(element("b", "beta"));

        cache.remove_all();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().data_file_size, 0);
        assert_eq!(cache.status(), CacheStatus::Alive);

        cache.update(element("c", "gamma"));
        assert_eq!(value_of(&cache, "c").as_deref(), Some("gamma"));
    }

    struct RejectingSerializer;

    impl ElementSerializer for RejectingSerializer {
        fn serialize(&self, element: &CacheElement) -> Result<Vec<u8>> {
            if element.value.as_ref() == b"reject" {
                return Err(Error::Serialization("rejected".into()));
            }
            crate::codec::BincodeSerializer.serialize(element)
        }

        fn deserialize(&self, data: &[u8]) -> Result<CacheElement> {
            crate::codec::BincodeSerializer.deserialize(data)
        }
    }

    #[test]
    fn test_failed_write_leaves_key_absent() {
        let dir = tempdir().unwrap();
        let cache =
            IndexedDiskCache::open_with_serializer(attrs(dir.path()), Arc::new(RejectingSerializer))
                .unwrap();

        cache.update(element("k", "accepted"));
        assert_eq!(
            cache.update(element("k", "reject")),
            UpdateOutcome::Failed(ErrorKind::Misuse)
        );
        assert_eq!(cache.get(&CacheKey::name("k")), Lookup::Miss);
        assert_eq!(cache.stats().free_list_size, 1);
    }

    #[test]
    fn test_random_operations_stay_consistent() {
        init_logging();
        let dir = tempdir().unwrap();
        let mut attributes = attrs(dir.path());
        attributes.disk.optimize_on_shutdown = false;
        let cache = IndexedDiskCache::open(attributes.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut model: HashMap<String, String> = HashMap::new();

        for _ in 0..1000 {
            let key = format!("key{}", rng.gen_range(0..40));
            if rng.gen_bool(0.3) {
                cache.remove(&CacheKey::name(key.as_str()));
                model.remove(&key);
            } else {
                let value = "r".repeat(rng.gen_range(0..300));
                assert_eq!(cache.update(element(&key, &value)), UpdateOutcome::Stored);
                model.insert(key, value);
            }
        }

        assert!(cache.check_for_overlaps());
        let check = |cache: &IndexedDiskCache| {
            assert_eq!(cache.size(), model.len());
            for (key, value) in &model {
                assert_eq!(value_of(cache, key).as_ref(), Some(value));
            }
        };
        check(&cache);

        drop(cache);
        let cache = IndexedDiskCache::open(attributes).unwrap();
        assert!(cache.check_for_overlaps());
        check(&cache);

        cache.optimize().unwrap();
        check(&cache);
    }

    #[test]
    fn test_concurrent_access() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(IndexedDiskCache::open(attrs(dir.path())).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("t{}-{}", t, i);
                        cache.update(element(&key, &key));
                        assert!(cache.get(&CacheKey::name(key)).is_hit());
                        if i % 3 == 0 {
                            cache.remove(&CacheKey::name(format!("t{}-{}", t, i / 2)));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.check_for_overlaps());
        for key in cache.key_set() {
            let found = cache.get(&key).into_option().unwrap();
            assert_eq!(found.value.as_ref(), key.to_string().as_bytes());
        }
    }
}
