//! File-space info message
//!
//! Records the space strategy and, when managers persist, where each
//! manager's header lives. Two wire versions exist:
//!
//! ```text
//! v1: ver=1 | strategy (legacy code) | threshold | [6 x header addr]
//! v2: ver=2 | strategy | persist | threshold | page size | page-end threshold
//!     | tail kind | [12 x header addr]
//! ```
//!
//! Header addresses are only present when managers persist. Version 1 has
//! no paging, and folds the persist flag into its strategy code.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use metacache_common::{
    ByteWidths, Error, FileSpaceConfig, FsCategory, FsStrategy, MemType, Result, TailKind,
    UNDEF_ADDR,
};

/// Message version without paging support
pub const FSINFO_VERSION_1: u8 = 1;

/// Message version with paging support
pub const FSINFO_VERSION_2: u8 = 2;

/// Persisted manager slots (every category but the default one)
pub const FSINFO_MANAGER_SLOTS: usize = FsCategory::NTYPES - 1;

const V1_MANAGER_SLOTS: usize = MemType::NTYPES - 1;

/// Decoded file-space info message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsInfoMessage {
    /// Wire version
    pub version: u8,
    /// Space handling strategy
    pub strategy: FsStrategy,
    /// Whether managers persist
    pub persist: bool,
    /// Free-space section threshold
    pub threshold: u64,
    /// Page size (0 when not paged)
    pub page_size: u64,
    /// Page-end metadata threshold
    pub pgend_meta_threshold: u16,
    /// Kind of section at the end of the file
    pub last_small: TailKind,
    /// Manager header addresses for categories 1..=12
    pub fs_addrs: [u64; FSINFO_MANAGER_SLOTS],
}

impl FsInfoMessage {
    /// Message describing `config`, with no persisted managers yet.
    ///
    /// Paged files need version 2; everything else is written as version 1.
    #[must_use]
    pub fn from_config(config: &FileSpaceConfig) -> Self {
        let paged = matches!(config.strategy, FsStrategy::Page);
        Self {
            version: if paged { FSINFO_VERSION_2 } else { FSINFO_VERSION_1 },
            strategy: config.strategy,
            persist: config.persist,
            threshold: config.threshold,
            page_size: if paged { config.page_size } else { 0 },
            pgend_meta_threshold: if paged { config.pgend_meta_threshold } else { 0 },
            last_small: TailKind::Large,
            fs_addrs: [UNDEF_ADDR; FSINFO_MANAGER_SLOTS],
        }
    }

    /// Header address recorded for a category
    #[must_use]
    pub fn fs_addr(&self, category: FsCategory) -> u64 {
        match category.index() {
            0 => UNDEF_ADDR,
            i => self.fs_addrs[i - 1],
        }
    }

    /// Record the header address for a category
    pub fn set_fs_addr(&mut self, category: FsCategory, addr: u64) {
        if let Some(slot) = category.index().checked_sub(1) {
            self.fs_addrs[slot] = addr;
        }
    }

    fn legacy_strategy(&self) -> Result<u8> {
        match (self.strategy, self.persist) {
            (FsStrategy::FsmAggr, false) => Ok(0),
            (FsStrategy::FsmAggr, true) => Ok(1),
            (FsStrategy::Aggr, _) => Ok(2),
            (FsStrategy::None, _) => Ok(3),
            (FsStrategy::Page, _) => Err(Error::invalid_config(
                "paged aggregation needs a version 2 file-space info message",
            )),
        }
    }

    /// Encoded length
    #[must_use]
    pub fn encoded_len(&self, widths: ByteWidths) -> usize {
        let addrs = |n: usize| if self.persist { n * widths.addr_len() } else { 0 };
        match self.version {
            FSINFO_VERSION_1 => 2 + widths.size_len() + addrs(V1_MANAGER_SLOTS),
            _ => 3 + 2 * widths.size_len() + 2 + 1 + addrs(FSINFO_MANAGER_SLOTS),
        }
    }

    /// Encode the message
    pub fn encode(&self, widths: ByteWidths) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len(widths));
        match self.version {
            FSINFO_VERSION_1 => {
                buf.put_u8(FSINFO_VERSION_1);
                buf.put_u8(self.legacy_strategy()?);
                widths.put_size(&mut buf, self.threshold)?;
                if self.persist {
                    for addr in &self.fs_addrs[..V1_MANAGER_SLOTS] {
                        widths.put_addr(&mut buf, *addr)?;
                    }
                }
            }
            FSINFO_VERSION_2 => {
                buf.put_u8(FSINFO_VERSION_2);
                buf.put_u8(self.strategy.as_u8());
                buf.put_u8(u8::from(self.persist));
                widths.put_size(&mut buf, self.threshold)?;
                widths.put_size(&mut buf, self.page_size)?;
                buf.put_u16_le(self.pgend_meta_threshold);
                buf.put_u8(self.last_small as u8);
                if self.persist {
                    for addr in &self.fs_addrs {
                        widths.put_addr(&mut buf, *addr)?;
                    }
                }
            }
            other => {
                return Err(Error::invalid_config(format!(
                    "unknown file-space info version {other}"
                )));
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a message
    pub fn decode(data: &[u8], widths: ByteWidths) -> Result<Self> {
        let truncated = || Error::cannot_open("file-space info message truncated");
        let mut buf = data;
        if buf.remaining() < 2 {
            return Err(truncated());
        }
        let version = buf.get_u8();
        let mut msg = match version {
            FSINFO_VERSION_1 => {
                let (strategy, persist) = match buf.get_u8() {
                    0 => (FsStrategy::FsmAggr, false),
                    1 => (FsStrategy::FsmAggr, true),
                    2 => (FsStrategy::Aggr, false),
                    3 => (FsStrategy::None, false),
                    other => {
                        return Err(Error::cannot_open(format!(
                            "unknown legacy file-space strategy {other}"
                        )));
                    }
                };
                if buf.remaining() < widths.size_len() {
                    return Err(truncated());
                }
                let threshold = widths.get_size(&mut buf);
                Self {
                    version,
                    strategy,
                    persist,
                    threshold,
                    page_size: 0,
                    pgend_meta_threshold: 0,
                    last_small: TailKind::Large,
                    fs_addrs: [UNDEF_ADDR; FSINFO_MANAGER_SLOTS],
                }
            }
            FSINFO_VERSION_2 => {
                if buf.remaining() < 2 + 2 * widths.size_len() + 3 {
                    return Err(truncated());
                }
                let code = buf.get_u8();
                let strategy = FsStrategy::from_u8(code).ok_or_else(|| {
                    Error::cannot_open(format!("unknown file-space strategy {code}"))
                })?;
                let persist = match buf.get_u8() {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(Error::cannot_open(format!("invalid persist flag {other}")));
                    }
                };
                let threshold = widths.get_size(&mut buf);
                let page_size = widths.get_size(&mut buf);
                let pgend_meta_threshold = buf.get_u16_le();
                let tail = buf.get_u8();
                let last_small = TailKind::from_u8(tail)
                    .ok_or_else(|| Error::cannot_open(format!("invalid tail kind {tail}")))?;
                Self {
                    version,
                    strategy,
                    persist,
                    threshold,
                    page_size,
                    pgend_meta_threshold,
                    last_small,
                    fs_addrs: [UNDEF_ADDR; FSINFO_MANAGER_SLOTS],
                }
            }
            other => {
                return Err(Error::cannot_open(format!(
                    "unsupported file-space info version {other}"
                )));
            }
        };

        if msg.persist {
            let slots = if version == FSINFO_VERSION_1 {
                V1_MANAGER_SLOTS
            } else {
                FSINFO_MANAGER_SLOTS
            };
            if buf.remaining() < slots * widths.addr_len() {
                return Err(truncated());
            }
            for addr in &mut msg.fs_addrs[..slots] {
                *addr = widths.get_addr(&mut buf);
            }
        }
        Ok(msg)
    }

    /// Rebuild the file-space configuration recorded in this message
    pub fn apply_to(&self, config: &mut FileSpaceConfig) {
        config.strategy = self.strategy;
        config.persist = self.persist;
        config.threshold = self.threshold;
        if matches!(self.strategy, FsStrategy::Page) {
            config.page_size = self.page_size;
            config.pgend_meta_threshold = self.pgend_meta_threshold;
        }
    }
}
