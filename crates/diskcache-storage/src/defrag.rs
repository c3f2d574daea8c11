//! Data file rewriting for optimization
//!
//! Both engines defragment by streaming live data into a fresh file next to
//! the original, syncing it, and renaming it over the original. Until the
//! rename the original is untouched, so a failed rewrite loses nothing.

use crate::raw_io::RawFile;
use diskcache_common::{Error, Result};
use std::path::PathBuf;
use tracing::warn;

/// A fresh data file being filled with live data
pub struct FileRewriter {
    temp: RawFile,
    temp_path: PathBuf,
    committed: bool,
}

impl FileRewriter {
    /// Start a rewrite of `target`
    pub fn create(target: &RawFile) -> Result<Self> {
        let mut name = target.path().as_os_str().to_owned();
        name.push(".optimize");
        let temp_path = PathBuf::from(name);

        let temp = RawFile::open(&temp_path)?;
        temp.set_len(0)?;
        Ok(Self {
            temp,
            temp_path,
            committed: false,
        })
    }

    /// Append bytes to the new file, returning their offset
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        self.temp.append(data)
    }

    /// Write bytes at a fixed offset in the new file
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.temp.write(offset, data)
    }

    /// Sync the new file and rename it over `target`
    pub fn commit(mut self, target: &RawFile) -> Result<()> {
        self.temp.close()?;
        std::fs::rename(&self.temp_path, target.path()).map_err(|e| {
            Error::Storage(format!(
                "failed to rename {} over {}: {}",
                self.temp_path.display(),
                target.path().display(),
                e
            ))
        })?;
        self.committed = true;
        // The old handle points at the replaced file; without a fresh one the
        // region can't continue.
        target
            .reopen()
            .map_err(|e| Error::Fatal(format!("failed to reopen rewritten file: {}", e)))
    }
}

impl Drop for FileRewriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let _ = self.temp.close();
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            warn!(
                "Failed to remove abandoned rewrite file {}: {}",
                self.temp_path.display(),
                e
            );
        }
    }
}
