//! DiskCache Storage Engine - Disk-backed cache regions
//!
//! This crate implements the disk tier of a multi-tier cache:
//! - Random-access file I/O shared by both engines
//! - Record framing and pluggable element serialization
//! - Indexed engine (one record per element, recycled slots)
//! - Block engine (fixed-size blocks, free-block reuse, disk limits)
//! - Key file snapshots and defragmentation
//! - A registry owning open regions by name

pub mod block;
pub mod codec;
pub mod defrag;
pub mod facade;
pub mod indexed;
pub mod keyfile;
pub mod optimizer;
pub mod raw_io;
pub mod registry;

// Re-exports
pub use block::allocator::{BLOCK_HEADER_SIZE, BlockAllocator, block_offset, blocks_needed};
pub use block::key_store::BlockKeyStore;
pub use block::{BlockDiskCache, BlockLimit};
pub use codec::{BincodeSerializer, ElementSerializer, RECORD_HEADER_SIZE, RecordCodec};
pub use facade::{CacheStatus, DiskCache, DiskCacheStats, Lookup, UpdateOutcome};
pub use indexed::IndexedDiskCache;
pub use indexed::descriptor::{DescriptorId, IndexedDiskElementDescriptor};
pub use keyfile::KeyFile;
pub use raw_io::RawFile;
pub use registry::DiskCacheRegistry;
