//! Key-store persistence
//!
//! Both engines mirror their in-memory index into a side key file. The whole
//! map is written as one snapshot on every save; nothing is incremental.
//!
//! File format:
//! ```text
//! +--------+---------+--------+--------+--------+---------+
//! | Magic  | Version | Count  | Length | CRC32C | Payload |
//! | 4B     | 4B      | 8B     | 8B     | 4B     | var     |
//! +--------+---------+--------+--------+--------+---------+
//! ```
//!
//! The snapshot is written to a temporary file, synced and renamed over the
//! key file, so a crash leaves either the old or the new snapshot.

use diskcache_common::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Key file magic number
const KEY_FILE_MAGIC: u32 = 0x4443_4B46; // "DCKF"

/// Key file format version
const KEY_FILE_VERSION: u32 = 1;

/// Key file header size
pub const KEY_FILE_HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyFileHeader {
    version: u32,
    count: u64,
    length: u64,
    checksum: u32,
}

impl KeyFileHeader {
    fn to_bytes(self) -> [u8; KEY_FILE_HEADER_SIZE] {
        let mut buf = [0u8; KEY_FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&KEY_FILE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let field = |range: std::ops::Range<usize>| -> Result<&[u8]> {
            data.get(range)
                .ok_or_else(|| Error::corruption(0, "key file header truncated"))
        };
        let u32_at = |start: usize| -> Result<u32> {
            let bytes: [u8; 4] = field(start..start + 4)?
                .try_into()
                .map_err(|_| Error::corruption(0, "key file header truncated"))?;
            Ok(u32::from_le_bytes(bytes))
        };
        let u64_at = |start: usize| -> Result<u64> {
            let bytes: [u8; 8] = field(start..start + 8)?
                .try_into()
                .map_err(|_| Error::corruption(0, "key file header truncated"))?;
            Ok(u64::from_le_bytes(bytes))
        };

        if u32_at(0)? != KEY_FILE_MAGIC {
            return Err(Error::corruption(0, "invalid key file magic"));
        }
        let version = u32_at(4)?;
        if version != KEY_FILE_VERSION {
            return Err(Error::corruption(
                0,
                format!("unsupported key file version {}", version),
            ));
        }

        Ok(Self {
            version,
            count: u64_at(8)?,
            length: u64_at(16)?,
            checksum: u32_at(24)?,
        })
    }
}

/// Side file holding a snapshot of a key store
#[derive(Debug, Clone)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    /// Create a handle for the key file at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the key file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Check whether a non-empty key file exists
    pub fn exists(&self) -> bool {
        std::fs::metadata(&self.path).is_ok_and(|m| m.len() > 0)
    }

    /// Write `entries` as the new snapshot
    pub fn save<T: Serialize>(&self, entries: &[T]) -> Result<()> {
        let data = bincode::serialize(entries)
            .map_err(|e| Error::Serialization(format!("failed to serialize keys: {}", e)))?;

        let header = KeyFileHeader {
            version: KEY_FILE_VERSION,
            count: entries.len() as u64,
            length: data.len() as u64,
            checksum: crc32c::crc32c(&data),
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("failed to create key dir: {}", e)))?;
        }

        let temp_path = self.temp_path();
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| Error::Storage(format!("failed to create key file: {}", e)))?;

            let mut writer = BufWriter::new(file);
            writer
                .write_all(&header.to_bytes())
                .map_err(|e| Error::Storage(format!("failed to write key file header: {}", e)))?;
            writer
                .write_all(&data)
                .map_err(|e| Error::Storage(format!("failed to write key file data: {}", e)))?;
            writer
                .flush()
                .map_err(|e| Error::Storage(format!("failed to flush key file: {}", e)))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::Storage(format!("failed to sync key file: {}", e)))?;
        }

        // Atomic rename
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::Storage(format!("failed to rename key file: {}", e)))?;

        Ok(())
    }

    /// Load the snapshot
    ///
    /// Returns `Ok(None)` when there is no key file (or it is empty). A file
    /// that exists but fails validation is reported as corruption.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<Vec<T>>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Storage(format!("failed to read key file: {}", e))),
        };
        if bytes.is_empty() {
            return Ok(None);
        }

        let header = KeyFileHeader::from_bytes(&bytes)?;
        let payload = &bytes[KEY_FILE_HEADER_SIZE.min(bytes.len())..];
        if payload.len() as u64 != header.length {
            return Err(Error::corruption(
                0,
                format!(
                    "key file payload is {} bytes, header declares {}",
                    payload.len(),
                    header.length
                ),
            ));
        }

        let checksum = crc32c::crc32c(payload);
        if checksum != header.checksum {
            return Err(Error::corruption(
                0,
                format!(
                    "key file checksum mismatch: computed={:08x}, stored={:08x}",
                    checksum, header.checksum
                ),
            ));
        }

        let entries: Vec<T> = bincode::deserialize(payload)
            .map_err(|e| Error::Deserialization(format!("failed to deserialize keys: {}", e)))?;
        if entries.len() as u64 != header.count {
            return Err(Error::corruption(
                0,
                format!(
                    "key file holds {} entries, header declares {}",
                    entries.len(),
                    header.count
                ),
            ));
        }

        Ok(Some(entries))
    }

    /// Delete the key file
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("failed to remove key file: {}", e))),
        }
    }
}
