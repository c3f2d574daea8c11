//! Record encoding
//!
//! Elements are turned into bytes by an [`ElementSerializer`] and stored as
//! length-prefixed frames:
//!
//! ```text
//! +------------------+-------------------+
//! | Length (i32, BE) | Payload           |
//! | 4B               | Length bytes      |
//! +------------------+-------------------+
//! ```
//!
//! Before a payload is read the declared length is checked against the end
//! of the file, so a torn append is reported as corruption instead of being
//! read as garbage.

use crate::raw_io::RawFile;
use diskcache_common::{CacheElement, Error, Result};
use std::sync::Arc;

/// Size of the length prefix in front of every record
pub const RECORD_HEADER_SIZE: u64 = 4;

/// Turns elements into bytes and back
pub trait ElementSerializer: Send + Sync {
    /// Serialize an element
    fn serialize(&self, element: &CacheElement) -> Result<Vec<u8>>;

    /// Deserialize an element
    fn deserialize(&self, data: &[u8]) -> Result<CacheElement>;
}

/// Default serializer backed by bincode
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeSerializer;

impl ElementSerializer for BincodeSerializer {
    fn serialize(&self, element: &CacheElement) -> Result<Vec<u8>> {
        bincode::serialize(element)
            .map_err(|e| Error::Serialization(format!("failed to serialize element: {}", e)))
    }

    fn deserialize(&self, data: &[u8]) -> Result<CacheElement> {
        bincode::deserialize(data)
            .map_err(|e| Error::Deserialization(format!("failed to deserialize element: {}", e)))
    }
}

/// Build the length prefix for a payload
pub fn record_header(payload_len: usize) -> Result<[u8; RECORD_HEADER_SIZE as usize]> {
    let len = i32::try_from(payload_len).map_err(|_| {
        Error::Serialization(format!("record of {} bytes is too large", payload_len))
    })?;
    Ok(len.to_be_bytes())
}

/// Payload length as recorded in the header, or an error if it doesn't fit
pub fn record_len(payload_len: usize) -> Result<u32> {
    record_header(payload_len).map(u32::from_be_bytes)
}

/// Total on-disk size of a record with the given payload length
#[must_use]
pub const fn framed_len(payload_len: u64) -> u64 {
    RECORD_HEADER_SIZE + payload_len
}

/// Frames records and (de)serializes elements
#[derive(Clone)]
pub struct RecordCodec {
    serializer: Arc<dyn ElementSerializer>,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(Arc::new(BincodeSerializer))
    }
}

impl RecordCodec {
    /// Create a codec around the given serializer
    pub fn new(serializer: Arc<dyn ElementSerializer>) -> Self {
        Self { serializer }
    }

    /// Serialize an element into a record payload
    pub fn encode(&self, element: &CacheElement) -> Result<Vec<u8>> {
        self.serializer.serialize(element)
    }

    /// Deserialize a record payload
    pub fn decode(&self, payload: &[u8]) -> Result<CacheElement> {
        self.serializer.deserialize(payload)
    }

    /// Write a framed record at `offset`
    pub fn write_record(&self, file: &RawFile, offset: u64, payload: &[u8]) -> Result<()> {
        let header = record_header(payload.len())?;
        file.write_vectored_at(offset, &[&header, payload])
    }

    /// Build the framed form of a payload
    pub fn frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let header = record_header(payload.len())?;
        let mut frame = Vec::with_capacity(header.len() + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Append a framed record, returning its offset
    pub fn append_record(&self, file: &RawFile, payload: &[u8]) -> Result<u64> {
        file.append(&self.frame(payload)?)
    }

    /// Read only the declared payload length of the record at `offset`
    pub fn record_length(&self, file: &RawFile, offset: u64) -> Result<u32> {
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        file.read_at(offset, &mut header)?;
        let declared = i32::from_be_bytes(header);
        u32::try_from(declared)
            .map_err(|_| Error::corruption(offset, format!("negative record length {}", declared)))
    }

    /// Read the framed record at `offset`
    ///
    /// Fails with a corruption error if the declared length is negative,
    /// runs past the end of the file, or differs from `expected_len`.
    pub fn read_record(
        &self,
        file: &RawFile,
        offset: u64,
        expected_len: Option<u32>,
    ) -> Result<Vec<u8>> {
        let file_len = file.length()?;
        if offset + RECORD_HEADER_SIZE > file_len {
            return Err(Error::corruption(
                offset,
                format!("record header past end of file (length {})", file_len),
            ));
        }

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        file.read_at(offset, &mut header)?;
        let declared = i32::from_be_bytes(header);
        let declared = u32::try_from(declared)
            .map_err(|_| Error::corruption(offset, format!("negative record length {}", declared)))?;

        let end = offset + framed_len(u64::from(declared));
        if end > file_len {
            return Err(Error::corruption(
                offset,
                format!(
                    "record length {} exceeds file length {}",
                    declared, file_len
                ),
            ));
        }
        if let Some(expected) = expected_len
            && expected != declared
        {
            return Err(Error::corruption(
                offset,
                format!("record length {} does not match index length {}", declared, expected),
            ));
        }

        file.read(offset + RECORD_HEADER_SIZE, declared as usize)
    }

    /// Read and decode the element stored at `offset`
    pub fn read_element(
        &self,
        file: &RawFile,
        offset: u64,
        expected_len: Option<u32>,
    ) -> Result<CacheElement> {
        let payload = self.read_record(file, offset, expected_len)?;
        self.decode(&payload).map_err(|e| Error::corruption(offset, e.to_string()))
    }
}
