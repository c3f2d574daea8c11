//! Block allocation for the block engine
//!
//! The data file is a sequence of fixed-size blocks; block `n` starts at
//! `n * block_size`. A value is written as one frame split across as many
//! blocks as it needs:
//!
//! ```text
//! block a              block b              block c
//! +-----+------------+ +------------------+ +--------+.....+
//! | len | payload... | | ...payload...    | | ...end | pad |
//! +-----+------------+ +------------------+ +--------+.....+
//!  4B (i32, BE)
//! ```
//!
//! Blocks of a value need not be adjacent. Freed blocks are kept in a free
//! set and handed out lowest first before the file is extended.

use crate::defrag::FileRewriter;
use crate::raw_io::RawFile;
use bytes::{Bytes, BytesMut};
use diskcache_common::{Error, Result};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// Length prefix stored at the front of a value's first block
pub const BLOCK_HEADER_SIZE: u32 = 4;

/// Byte offset of `block`
///
/// Computed in 64 bits so large block numbers never wrap.
#[must_use]
pub const fn block_offset(block: u32, block_size: u32) -> u64 {
    block as u64 * block_size as u64
}

/// Number of blocks a payload of `payload_len` bytes occupies
#[must_use]
pub const fn blocks_needed(payload_len: u64, block_size: u32) -> u64 {
    (payload_len + BLOCK_HEADER_SIZE as u64).div_ceil(block_size as u64)
}

/// One bit per block, set when a block is referenced
struct BlockBitmap {
    data: Vec<u8>,
}

impl BlockBitmap {
    fn new(total_blocks: u32) -> Self {
        Self {
            data: vec![0u8; total_blocks.div_ceil(8) as usize],
        }
    }

    fn is_set(&self, block: u32) -> bool {
        self.data[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    fn set(&mut self, block: u32) {
        self.data[(block / 8) as usize] |= 1 << (block % 8);
    }
}

/// Fixed-size block file with a free-block set
pub struct BlockAllocator {
    file: RawFile,
    block_size: u32,
    /// Blocks the file currently spans
    total_blocks: u32,
    free: BTreeSet<u32>,
}

impl BlockAllocator {
    /// Open the block file at `path`
    ///
    /// Every block starts out free; call [`rebuild_free_list`](Self::rebuild_free_list)
    /// once the referenced blocks are known.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = RawFile::open(path)?;
        let total_blocks = Self::blocks_spanned(file.length()?, block_size)?;
        Ok(Self {
            file,
            block_size,
            total_blocks,
            free: (0..total_blocks).collect(),
        })
    }

    fn blocks_spanned(file_len: u64, block_size: u32) -> Result<u32> {
        let blocks = file_len.div_ceil(u64::from(block_size));
        u32::try_from(blocks).map_err(|_| {
            Error::storage(format!("block file of {} bytes has too many blocks", file_len))
        })
    }

    /// The underlying file
    pub const fn file(&self) -> &RawFile {
        &self.file
    }

    /// Block size in bytes
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Blocks the file spans
    #[must_use]
    pub const fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Blocks in the free set
    #[must_use]
    pub fn free_count(&self) -> u32 {
        u32::try_from(self.free.len()).unwrap_or(u32::MAX)
    }

    /// Blocks holding live data
    #[must_use]
    pub fn used_count(&self) -> u32 {
        self.total_blocks - self.free_count()
    }

    /// Blocks needed for a payload of `payload_len` bytes
    #[must_use]
    pub const fn blocks_for(&self, payload_len: usize) -> u64 {
        blocks_needed(payload_len as u64, self.block_size)
    }

    /// Mark every block not in `referenced` as free
    ///
    /// Fails with a corruption error if a block is referenced twice or lies
    /// past the end of the file.
    pub fn rebuild_free_list<'a>(&mut self, referenced: impl IntoIterator<Item = &'a u32>) -> Result<()> {
        let mut bitmap = BlockBitmap::new(self.total_blocks);
        for &block in referenced {
            if block >= self.total_blocks {
                return Err(Error::corruption(
                    block_offset(block, self.block_size),
                    format!(
                        "block {} is past the end of the file ({} blocks)",
                        block, self.total_blocks
                    ),
                ));
            }
            if bitmap.is_set(block) {
                return Err(Error::corruption(
                    block_offset(block, self.block_size),
                    format!("block {} is referenced twice", block),
                ));
            }
            bitmap.set(block);
        }

        self.free = (0..self.total_blocks).filter(|&b| !bitmap.is_set(b)).collect();
        debug!(
            "Rebuilt free list: {} of {} blocks free",
            self.free.len(),
            self.total_blocks
        );
        Ok(())
    }

    /// Take `count` blocks, reusing free ones first
    ///
    /// Returns the blocks and how many of them came from the free set.
    fn allocate(&mut self, count: u64) -> Result<(Vec<u32>, usize)> {
        let count = usize::try_from(count)
            .map_err(|_| Error::storage(format!("cannot allocate {} blocks", count)))?;
        let mut blocks = Vec::with_capacity(count);
        while blocks.len() < count {
            match self.free.pop_first() {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        let reused = blocks.len();

        let extra = u32::try_from(count - reused)
            .ok()
            .and_then(|extra| self.total_blocks.checked_add(extra));
        let Some(new_total) = extra else {
            self.free.extend(blocks);
            return Err(Error::storage("block file cannot grow any further"));
        };
        blocks.extend(self.total_blocks..new_total);
        self.total_blocks = new_total;
        Ok((blocks, reused))
    }

    /// Build the frame stored across a value's blocks
    fn frame(payload: &[u8]) -> Result<Vec<u8>> {
        let len = i32::try_from(payload.len()).map_err(|_| {
            Error::Serialization(format!("value of {} bytes is too large", payload.len()))
        })?;
        let mut frame = Vec::with_capacity(payload.len() + BLOCK_HEADER_SIZE as usize);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Write a payload, returning its blocks and how many were reused
    ///
    /// On failure the allocated blocks go back to the free set.
    pub fn write(&mut self, payload: &[u8]) -> Result<(Vec<u32>, usize)> {
        let frame = Self::frame(payload)?;
        let (blocks, reused) = self.allocate(self.blocks_for(payload.len()))?;

        for (chunk, &block) in frame.chunks(self.block_size as usize).zip(&blocks) {
            if let Err(e) = self.file.write(block_offset(block, self.block_size), chunk) {
                self.free(&blocks);
                return Err(e);
            }
        }
        Ok((blocks, reused))
    }

    /// Write a payload into consecutive blocks of a rewrite, starting at `first`
    pub fn write_packed(&self, rewriter: &FileRewriter, first: u32, payload: &[u8]) -> Result<Vec<u32>> {
        let frame = Self::frame(payload)?;
        let mut blocks = Vec::new();
        let mut block = first;
        for chunk in frame.chunks(self.block_size as usize) {
            rewriter.write(block_offset(block, self.block_size), chunk)?;
            blocks.push(block);
            block = block
                .checked_add(1)
                .ok_or_else(|| Error::storage("block numbers exhausted"))?;
        }
        Ok(blocks)
    }

    /// Adopt a packed rewrite holding blocks `0..total_blocks`
    pub fn adopt_packed(&mut self, total_blocks: u32) {
        self.total_blocks = total_blocks;
        self.free.clear();
    }

    /// Read the declared payload length from a value's first block
    pub fn declared_length(&self, first: u32) -> Result<u32> {
        let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
        let offset = block_offset(first, self.block_size);
        self.file.read_at(offset, &mut header)?;
        let declared = i32::from_be_bytes(header);
        u32::try_from(declared)
            .map_err(|_| Error::corruption(offset, format!("negative value length {}", declared)))
    }

    /// Check a value's header against the number of blocks it owns
    pub fn verify(&self, blocks: &[u32]) -> Result<u32> {
        let first = *blocks
            .first()
            .ok_or_else(|| Error::corruption(0, "value owns no blocks"))?;
        let declared = self.declared_length(first)?;
        let needed = blocks_needed(u64::from(declared), self.block_size);
        if needed != blocks.len() as u64 {
            return Err(Error::corruption(
                block_offset(first, self.block_size),
                format!(
                    "value of {} bytes needs {} blocks but owns {}",
                    declared,
                    needed,
                    blocks.len()
                ),
            ));
        }
        Ok(declared)
    }

    /// Read the payload stored in `blocks`
    pub fn read(&self, blocks: &[u32]) -> Result<Bytes> {
        let declared = self.verify(blocks)? as usize;
        let mut payload = BytesMut::with_capacity(declared);
        let mut skip = BLOCK_HEADER_SIZE as usize;

        for &block in blocks {
            let remaining = declared - payload.len();
            if remaining == 0 {
                break;
            }
            let take = (self.block_size as usize - skip).min(remaining);
            let start = payload.len();
            payload.resize(start + take, 0);
            self.file.read_at(
                block_offset(block, self.block_size) + skip as u64,
                &mut payload[start..],
            )?;
            skip = 0;
        }

        Ok(payload.freeze())
    }

    /// Return blocks to the free set
    pub fn free(&mut self, blocks: &[u32]) {
        for &block in blocks {
            if block < self.total_blocks && !self.free.insert(block) {
                debug!("Block {} freed twice", block);
            }
        }
    }

    /// Truncate the file and forget every block
    pub fn reset(&mut self) -> Result<()> {
        self.free.clear();
        self.total_blocks = 0;
        self.file.truncate_and_reopen()
    }

    /// Sync and close the file
    pub fn close(&self) -> Result<()> {
        self.file.close()
    }
}
