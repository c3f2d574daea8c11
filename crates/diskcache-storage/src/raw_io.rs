//! Random-access file I/O
//!
//! `RawFile` is the single point of I/O for a region's data and key files.
//! Every operation takes the handle's mutex, so a seek and the read or write
//! that follows it can never interleave with another thread's.

use diskcache_common::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts made to delete and recreate a file before giving up
pub const MAX_RESET_ATTEMPTS: u32 = 10;

/// Pause between reset attempts
const RESET_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Thread-safe random-access file handle
pub struct RawFile {
    file: Mutex<Option<File>>,
    path: PathBuf,
}

impl RawFile {
    /// Open a file for reading and writing, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("failed to create dir {}: {}", parent.display(), e))
            })?;
        }

        let file = Self::open_handle(&path)?;
        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
        })
    }

    fn open_handle(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path.display(), e)))
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the open handle
    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> std::io::Result<T>, op: &str) -> Result<T> {
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| Error::Storage(format!("{} on closed file {}", op, self.path.display())))?;
        f(file).map_err(|e| Error::Storage(format!("{} failed on {}: {}", op, self.path.display(), e)))
    }

    /// Current length of the file in bytes
    pub fn length(&self) -> Result<u64> {
        self.with_file(|file| file.metadata().map(|m| m.len()), "stat")
    }

    /// Read exactly `len` bytes at `offset`
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| {
            Error::Storage(format!("read on closed file {}", self.path.display()))
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(format!("seek failed on {}: {}", self.path.display(), e)))?;
        file.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::corruption(offset, format!("short read of {} bytes", buf.len()))
            } else {
                Error::Storage(format!("read failed on {}: {}", self.path.display(), e))
            }
        })
    }

    /// Write `data` at `offset`, extending the file if needed
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_file(
            |file| {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)
            },
            "write",
        )
    }

    /// Write the given parts back to back starting at `offset`
    pub fn write_vectored_at(&self, offset: u64, parts: &[&[u8]]) -> Result<()> {
        self.with_file(
            |file| {
                file.seek(SeekFrom::Start(offset))?;
                for part in parts {
                    file.write_all(part)?;
                }
                Ok(())
            },
            "write",
        )
    }

    /// Append `data` at the end of the file, returning the offset written
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        self.with_file(
            |file| {
                let offset = file.seek(SeekFrom::End(0))?;
                file.write_all(data)?;
                Ok(offset)
            },
            "append",
        )
    }

    /// Truncate or extend the file to `len` bytes
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.with_file(|file| file.set_len(len), "truncate")
    }

    /// Sync data and metadata to disk
    pub fn sync(&self) -> Result<()> {
        self.with_file(|file| file.sync_all(), "sync")
    }

    /// Delete the file and recreate it empty
    ///
    /// The handle is closed first. Deletion and creation are retried up to
    /// [`MAX_RESET_ATTEMPTS`] times; after that the file is left closed and a
    /// fatal error is returned.
    pub fn truncate_and_reopen(&self) -> Result<()> {
        let mut guard = self.file.lock();
        drop(guard.take());

        let mut last_error = None;
        for attempt in 1..=MAX_RESET_ATTEMPTS {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        "Failed to delete {} (attempt {}): {}",
                        self.path.display(),
                        attempt,
                        e
                    );
                    last_error = Some(e.to_string());
                    thread::sleep(RESET_RETRY_DELAY);
                    continue;
                }
            }

            match Self::open_handle(&self.path) {
                Ok(file) => {
                    *guard = Some(file);
                    debug!("Reset {}", self.path.display());
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Failed to recreate {} (attempt {}): {}",
                        self.path.display(),
                        attempt,
                        e
                    );
                    last_error = Some(e.to_string());
                    thread::sleep(RESET_RETRY_DELAY);
                }
            }
        }

        Err(Error::Fatal(format!(
            "could not reset {} after {} attempts: {}",
            self.path.display(),
            MAX_RESET_ATTEMPTS,
            last_error.unwrap_or_default()
        )))
    }

    /// Swap in the file now found at this handle's path
    ///
    /// Used after another file has been renamed over the path.
    pub fn reopen(&self) -> Result<()> {
        let mut guard = self.file.lock();
        drop(guard.take());
        *guard = Some(Self::open_handle(&self.path)?);
        Ok(())
    }

    /// Sync and close the handle; later operations fail
    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.take() {
            file.sync_all().map_err(|e| {
                Error::Storage(format!("sync failed on {}: {}", self.path.display(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_raw_file_write_and_read() {
        let dir = tempdir().unwrap();
        let file = RawFile::open(dir.path().join("test.data")).unwrap();

        file.write(0, b"hello world").unwrap();
        assert_eq!(file.length().unwrap(), 11);
        assert_eq!(file.read(6, 5).unwrap(), b"world");
    }

    #[test]
    fn test_raw_file_append() {
        let dir = tempdir().unwrap();
        let file = RawFile::open(dir.path().join("test.data")).unwrap();

        assert_eq!(file.append(b"abc").unwrap(), 0);
        assert_eq!(file.append(b"defg").unwrap(), 3);
        assert_eq!(file.length().unwrap(), 7);
        assert_eq!(file.read(0, 7).unwrap(), b"abcdefg");
    }

    #[test]
    fn test_raw_file_short_read_is_corruption() {
        let dir = tempdir().unwrap();
        let file = RawFile::open(dir.path().join("test.data")).unwrap();
        file.write(0, b"tiny").unwrap();

        let err = file.read(2, 10).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_raw_file_truncate_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("test.data");
        let file = RawFile::open(&path).unwrap();
        file.write(0, &[7u8; 128]).unwrap();

        file.truncate_and_reopen().unwrap();
        assert_eq!(file.length().unwrap(), 0);
        assert!(path.exists());

        file.append(b"again").unwrap();
        assert_eq!(file.read(0, 5).unwrap(), b"again");
    }

    #[test]
    fn test_raw_file_close() {
        let dir = tempdir().unwrap();
        let file = RawFile::open(dir.path().join("test.data")).unwrap();
        file.close().unwrap();
        assert!(file.write(0, b"x").is_err());
        assert!(file.read(0, 1).is_err());
    }
}
