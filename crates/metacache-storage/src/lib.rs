//! Metacache Storage - Metadata cache and file-space management
//!
//! This crate implements the storage side of a hierarchical data file:
//! - Address space and file drivers (in-memory and file-backed)
//! - Free-space managers with persisted header/section-info blocks
//! - Metadata and small-data aggregators, paged aggregation
//! - The file-space allocator and its file-space info message
//! - The metadata cache with flush-dependency ordered serialization
//! - Cache image build (bounded convergence loop) and load

pub mod address_space;
pub mod aggregator;
pub mod allocator;
pub mod cache;
pub mod cache_image;
pub mod driver;
pub mod file;
pub mod free_space;
pub mod fsinfo;
pub(crate) mod section_ops;
pub mod superblock;

// Re-exports
pub use address_space::AddressSpace;
pub use aggregator::{AggrKind, Aggregator};
pub use allocator::{Allocator, ManagerState};
pub use cache::{
    CacheClient, CacheEntry, CacheQuery, CacheQueryResult, CacheStats, CacheTotals, EntryInfo,
    EntryKey, EntryStatus, InsertOptions, MetadataCache, PreSerialize, SerializeContext,
};
pub use cache_image::{ImageEntry, decode_image, encode_image};
pub use driver::{DiskDriver, FileDriver, MemDriver};
pub use file::FileContext;
pub use free_space::{FreeSection, FreeSpace, SectionClass};
pub use fsinfo::FsInfoMessage;
pub use superblock::{CacheImageLocation, Superblock, SuperblockExtension};
