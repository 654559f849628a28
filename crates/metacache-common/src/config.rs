//! Configuration types for metacache
//!
//! This module defines the file-space and cache configuration used when a
//! file is created or opened.

use crate::error::{Error, Result};
use crate::types::ByteWidths;
use serde::{Deserialize, Serialize};

/// Default free-space section merge threshold
pub const DEFAULT_FS_THRESHOLD: u64 = 1;

/// Default file-space page size
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Smallest page size allowed for paged aggregation
pub const MIN_PAGE_SIZE: u64 = 512;

/// Default aggregator block size
pub const DEFAULT_AGGR_BLOCK_SIZE: u64 = 2048;

/// Default number of rounds allowed for cache image size convergence
pub const DEFAULT_CONVERGENCE_ROUNDS: u32 = 3;

/// File space handling strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsStrategy {
    /// Free-space managers plus metadata/small-data aggregators
    #[default]
    FsmAggr,
    /// Paged aggregation
    Page,
    /// Aggregators only, freed space is not tracked
    Aggr,
    /// Every allocation extends the file
    None,
}

impl FsStrategy {
    /// On-disk strategy code
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::FsmAggr => 0,
            Self::Page => 1,
            Self::Aggr => 2,
            Self::None => 3,
        }
    }

    /// Decode an on-disk strategy code
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::FsmAggr),
            1 => Some(Self::Page),
            2 => Some(Self::Aggr),
            3 => Some(Self::None),
            _ => None,
        }
    }

    /// Whether freed space is tracked by free-space managers
    #[must_use]
    pub const fn uses_managers(self) -> bool {
        matches!(self, Self::FsmAggr | Self::Page)
    }

    /// Whether the metadata and small-data aggregators are used
    #[must_use]
    pub const fn uses_aggregators(self) -> bool {
        matches!(self, Self::FsmAggr | Self::Aggr)
    }
}

/// How memory types share free-space managers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeMap {
    /// Metadata shares one manager, raw data another
    #[default]
    Dichotomy,
    /// One manager per memory type
    Separate,
    /// Everything shares one manager
    Together,
}

/// File space configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileSpaceConfig {
    /// Space handling strategy
    pub strategy: FsStrategy,
    /// Persist free-space managers across close/reopen
    pub persist: bool,
    /// Freed sections below this size are not tracked
    pub threshold: u64,
    /// Page size for paged aggregation (0 disables paging)
    pub page_size: u64,
    /// Small metadata sections this close to a page end are dropped or widened
    pub pgend_meta_threshold: u16,
    /// Allocation alignment (1 = none)
    pub alignment: u64,
    /// Requests at least this large are aligned
    pub alignment_threshold: u64,
    /// Metadata aggregator block size
    pub meta_block_size: u64,
    /// Small raw-data aggregator block size
    pub sdata_block_size: u64,
    /// Memory type to manager mapping
    pub type_map: TypeMap,
    /// Bytes per encoded address
    pub sizeof_addr: u8,
    /// Bytes per encoded length
    pub sizeof_size: u8,
    /// Optional cap on the address space (defaults to the address width)
    pub max_addr: Option<u64>,
}

impl FileSpaceConfig {
    /// Encoding widths
    pub fn widths(&self) -> Result<ByteWidths> {
        ByteWidths::new(self.sizeof_addr, self.sizeof_size).ok_or_else(|| {
            Error::invalid_config(format!(
                "address/length widths must be 2, 4 or 8 bytes (got {}/{})",
                self.sizeof_addr, self.sizeof_size
            ))
        })
    }

    /// Largest usable address
    pub fn effective_max_addr(&self) -> Result<u64> {
        let width_max = self.widths()?.max_addr();
        match self.max_addr {
            Some(cap) if cap > width_max => Err(Error::invalid_config(format!(
                "max_addr {cap:#x} exceeds the {}-byte address width",
                self.sizeof_addr
            ))),
            Some(0) => Err(Error::invalid_config("max_addr must be non-zero")),
            Some(cap) => Ok(cap),
            None => Ok(width_max),
        }
    }

    /// Whether paged aggregation is in effect
    #[must_use]
    pub const fn is_paged(&self) -> bool {
        matches!(self.strategy, FsStrategy::Page) && self.page_size > 0
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.effective_max_addr()?;

        if self.alignment == 0 {
            return Err(Error::invalid_config("alignment must be at least 1"));
        }
        if self.meta_block_size == 0 || self.sdata_block_size == 0 {
            return Err(Error::invalid_config("aggregator block sizes must be non-zero"));
        }
        if self.persist && !self.strategy.uses_managers() {
            return Err(Error::invalid_config(format!(
                "strategy {:?} has no free-space managers to persist",
                self.strategy
            )));
        }
        if matches!(self.strategy, FsStrategy::Page) && self.page_size > 0 {
            if self.page_size < MIN_PAGE_SIZE {
                return Err(Error::invalid_config(format!(
                    "page size {} is below the minimum {MIN_PAGE_SIZE}",
                    self.page_size
                )));
            }
            if u64::from(self.pgend_meta_threshold) >= self.page_size {
                return Err(Error::invalid_config(
                    "page end metadata threshold must be smaller than the page size",
                ));
            }
        }
        Ok(())
    }
}

impl Default for FileSpaceConfig {
    fn default() -> Self {
        Self {
            strategy: FsStrategy::default(),
            persist: false,
            threshold: DEFAULT_FS_THRESHOLD,
            page_size: DEFAULT_PAGE_SIZE,
            pgend_meta_threshold: 0,
            alignment: 1,
            alignment_threshold: 1,
            meta_block_size: DEFAULT_AGGR_BLOCK_SIZE,
            sdata_block_size: DEFAULT_AGGR_BLOCK_SIZE,
            type_map: TypeMap::default(),
            sizeof_addr: 8,
            sizeof_size: 8,
            max_addr: None,
        }
    }
}

/// Free-space manager creation parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceParams {
    /// Shrink the persisted section info below this fill percentage
    pub shrink_threshold_pct: u16,
    /// Headroom percentage added when the section info has to grow
    pub expand_threshold_pct: u16,
    /// Bits needed to encode any section address
    pub max_section_addr_bits: u16,
    /// Largest section size tracked
    pub max_section_size: u64,
}

impl FreeSpaceParams {
    /// Parameters for an address space ending at `max_addr`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn for_max_addr(max_addr: u64) -> Self {
        let log2 = if max_addr == 0 { 0 } else { 63 - max_addr.leading_zeros() };
        Self {
            shrink_threshold_pct: 80,
            expand_threshold_pct: 20,
            max_section_addr_bits: 1 + log2 as u16,
            max_section_size: max_addr,
        }
    }

    /// Validate the parameters
    pub fn validate(&self) -> Result<()> {
        if self.shrink_threshold_pct > 100 {
            return Err(Error::invalid_config(format!(
                "shrink threshold {}% is outside [0,100]",
                self.shrink_threshold_pct
            )));
        }
        if self.expand_threshold_pct > 100 {
            return Err(Error::invalid_config(format!(
                "expand threshold {}% is outside [0,100]",
                self.expand_threshold_pct
            )));
        }
        if self.max_section_size == 0 {
            return Err(Error::invalid_config("max section size must be non-zero"));
        }
        if self.max_section_addr_bits == 0 || self.max_section_addr_bits > 64 {
            return Err(Error::invalid_config(format!(
                "max section address bits {} is outside [1,64]",
                self.max_section_addr_bits
            )));
        }
        Ok(())
    }
}

/// Metadata cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of hash buckets in the index (power of two)
    pub hash_table_len: usize,
    /// Cache image settings
    pub image: CacheImageConfig,
}

impl CacheConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.hash_table_len == 0 || !self.hash_table_len.is_power_of_two() {
            return Err(Error::invalid_config(format!(
                "hash table length {} is not a power of two",
                self.hash_table_len
            )));
        }
        self.image.validate()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hash_table_len: 1024,
            image: CacheImageConfig::default(),
        }
    }
}

/// Cache image generation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheImageConfig {
    /// Build a cache image when the file is closed
    pub generate_image: bool,
    /// Record the image location in the superblock extension
    pub write_superblock_message: bool,
    /// Write the image block itself
    pub write_image_block: bool,
    /// Rounds allowed for the image length to settle
    pub max_convergence_rounds: u32,
}

impl CacheImageConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_convergence_rounds == 0 {
            return Err(Error::invalid_config("max_convergence_rounds must be at least 1"));
        }
        if self.generate_image && !(self.write_superblock_message || self.write_image_block) {
            return Err(Error::invalid_config(
                "cache image generation requested with nothing to write",
            ));
        }
        Ok(())
    }
}

impl Default for CacheImageConfig {
    fn default() -> Self {
        Self {
            generate_image: false,
            write_superblock_message: true,
            write_image_block: true,
            max_convergence_rounds: DEFAULT_CONVERGENCE_ROUNDS,
        }
    }
}
