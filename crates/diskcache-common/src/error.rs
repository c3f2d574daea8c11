//! Error types for DiskCache
//!
//! This module defines the common error types used by the storage engine
//! and the taxonomy the facade reports to the surrounding cache tier.

use thiserror::Error;

/// Common result type for DiskCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for DiskCache
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corruption detected at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("disk limit exceeded: required {required}, limit {limit}")]
    CapacityExceeded { required: u64, limit: u64 },

    // Codec errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // Lifecycle errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("region is not alive: {0}")]
    Disposed(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Coarse classification of an [`Error`]
///
/// The facade reports failures to callers through this enum instead of the
/// full error so they can branch on the outcome without inspecting messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// File system error (seek/read/write/rename)
    IoFailure,
    /// A record or the key index failed validation
    CorruptionDetected,
    /// A write would exceed the configured disk limit
    CapacityExceeded,
    /// The region can no longer operate safely
    Fatal,
    /// Bad configuration or use after dispose
    Misuse,
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error for the record at `offset`
    pub fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Storage(_) => ErrorKind::IoFailure,
            Self::Corruption { .. } | Self::Deserialization(_) => ErrorKind::CorruptionDetected,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Serialization(_) | Self::Configuration(_) | Self::Disposed(_) => {
                ErrorKind::Misuse
            }
        }
    }

    /// Check if this error means the stored data can't be trusted
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self.kind(), ErrorKind::CorruptionDetected)
    }
}
