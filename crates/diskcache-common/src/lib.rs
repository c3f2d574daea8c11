//! DiskCache Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, region attributes and key/element
//! types shared by the disk cache engines and their collaborators.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BlockDiskCacheAttributes, DiskCacheAttributes, DiskLimitType, IndexedDiskCacheAttributes,
};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
