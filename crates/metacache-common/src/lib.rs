//! Metacache Common - Shared types and utilities
//!
//! This crate provides the address and memory-type vocabulary, encoding
//! widths, configuration and error definitions shared by the metadata
//! cache and the file-space allocator.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{compute_crc32c, split_checked, verify_crc32c, CHECKSUM_LEN};
pub use config::{
    CacheConfig, CacheImageConfig, FileSpaceConfig, FreeSpaceParams, FsStrategy, TypeMap,
};
pub use error::{Error, Result};
pub use types::*;
