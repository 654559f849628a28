//! Core type definitions for metacache
//!
//! Addresses and lengths are plain `u64` values. The all-ones value is the
//! undefined address, both in memory and (truncated to the file's address
//! width) on disk.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The undefined address
pub const UNDEF_ADDR: u64 = u64::MAX;

/// Check whether an address is defined
#[inline]
#[must_use]
pub const fn addr_defined(addr: u64) -> bool {
    addr != UNDEF_ADDR
}

/// What a block of file space is used for.
///
/// The allocator routes requests by this type; global heaps are treated as
/// raw data everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemType {
    Default = 0,
    Super = 1,
    BTree = 2,
    Draw = 3,
    GHeap = 4,
    LHeap = 5,
    OHdr = 6,
}

impl MemType {
    /// Number of memory types
    pub const NTYPES: usize = 7;

    /// All memory types in index order
    pub const ALL: [Self; Self::NTYPES] = [
        Self::Default,
        Self::Super,
        Self::BTree,
        Self::Draw,
        Self::GHeap,
        Self::LHeap,
        Self::OHdr,
    ];

    /// Type used for free-space manager header blocks
    pub const FSPACE_HDR: Self = Self::OHdr;

    /// Type used for free-space section info blocks
    pub const FSPACE_SINFO: Self = Self::LHeap;

    /// Position of this type in per-type tables
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Look up a type by index
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::NTYPES {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// Raw data (and global heaps) as opposed to metadata
    #[must_use]
    pub const fn is_raw(self) -> bool {
        matches!(self, Self::Draw | Self::GHeap)
    }
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Super => "super",
            Self::BTree => "btree",
            Self::Draw => "draw",
            Self::GHeap => "gheap",
            Self::LHeap => "lheap",
            Self::OHdr => "ohdr",
        };
        f.write_str(name)
    }
}

/// Free-space manager category.
///
/// Without paging only the first seven slots are used, one per (mapped)
/// memory type. With paging, slots 1..=6 hold the small (sub-page) managers
/// and slots 7..=12 the large (page-multiple) ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FsCategory {
    Default = 0,
    Super = 1,
    BTree = 2,
    Draw = 3,
    GHeap = 4,
    LHeap = 5,
    OHdr = 6,
    LargeSuper = 7,
    LargeBTree = 8,
    LargeDraw = 9,
    LargeGHeap = 10,
    LargeLHeap = 11,
    LargeOHdr = 12,
}

impl FsCategory {
    /// Number of categories
    pub const NTYPES: usize = 13;

    /// All categories in index order
    pub const ALL: [Self; Self::NTYPES] = [
        Self::Default,
        Self::Super,
        Self::BTree,
        Self::Draw,
        Self::GHeap,
        Self::LHeap,
        Self::OHdr,
        Self::LargeSuper,
        Self::LargeBTree,
        Self::LargeDraw,
        Self::LargeGHeap,
        Self::LargeLHeap,
        Self::LargeOHdr,
    ];

    /// Small metadata pages
    pub const SMALL_META: Self = Self::Super;

    /// Small raw-data pages
    pub const SMALL_RAW: Self = Self::Draw;

    /// Page-multiple blocks of any type in a contiguous address space
    pub const LARGE_GENERIC: Self = Self::LargeSuper;

    /// Position of this category in per-category tables
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Look up a category by index
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::NTYPES {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// The small (or non-paged) category for a memory type
    #[must_use]
    pub const fn small(mem: MemType) -> Self {
        Self::ALL[mem.index()]
    }

    /// The large category for a memory type
    #[must_use]
    pub const fn large(mem: MemType) -> Self {
        match mem {
            MemType::Default | MemType::Super => Self::LargeSuper,
            _ => Self::ALL[mem.index() + MemType::NTYPES - 1],
        }
    }

    /// Whether this is one of the page-multiple categories
    #[must_use]
    pub const fn is_large(self) -> bool {
        self.index() >= MemType::NTYPES
    }

    /// The memory type space in this category is accounted to
    #[must_use]
    pub const fn alloc_type(self) -> MemType {
        let index = self.index();
        if index < MemType::NTYPES {
            MemType::ALL[index]
        } else {
            MemType::ALL[index % MemType::NTYPES + 1]
        }
    }
}

impl fmt::Display for FsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_large() {
            write!(f, "large-{}", self.alloc_type())
        } else {
            write!(f, "{}", self.alloc_type())
        }
    }
}

/// What kind of section sits at the end of the file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TailKind {
    /// Large (or non-paged) allocation
    #[default]
    Large = 0,
    /// Small metadata page
    SmallMeta = 1,
    /// Small raw-data page
    SmallRaw = 2,
}

impl TailKind {
    /// Decode from the on-disk byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Large),
            1 => Some(Self::SmallMeta),
            2 => Some(Self::SmallRaw),
            _ => None,
        }
    }
}

/// A free byte range reported to callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionInfo {
    /// Start address
    pub addr: u64,
    /// Length in bytes
    pub size: u64,
}

/// Byte width of an encoded field
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[display("{_0}")]
pub struct FieldWidth(u8);

impl FieldWidth {
    /// Create a width, accepting only 2, 4 or 8 bytes
    #[must_use]
    pub const fn new(bytes: u8) -> Option<Self> {
        match bytes {
            2 | 4 | 8 => Some(Self(bytes)),
            _ => None,
        }
    }

    /// Width in bytes
    #[must_use]
    pub const fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Largest value encodable in this width
    #[must_use]
    pub const fn max_value(self) -> u64 {
        if self.0 >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.0 as u32 * 8)) - 1
        }
    }
}

impl fmt::Debug for FieldWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldWidth({})", self.0)
    }
}

/// File-global encoding widths for addresses and lengths
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteWidths {
    /// Bytes per encoded address
    pub addr: FieldWidth,
    /// Bytes per encoded length
    pub size: FieldWidth,
}

impl ByteWidths {
    /// Create widths from raw byte counts
    #[must_use]
    pub const fn new(sizeof_addr: u8, sizeof_size: u8) -> Option<Self> {
        match (FieldWidth::new(sizeof_addr), FieldWidth::new(sizeof_size)) {
            (Some(addr), Some(size)) => Some(Self { addr, size }),
            _ => None,
        }
    }

    /// Bytes per encoded address
    #[must_use]
    pub const fn addr_len(&self) -> usize {
        self.addr.bytes()
    }

    /// Bytes per encoded length
    #[must_use]
    pub const fn size_len(&self) -> usize {
        self.size.bytes()
    }

    /// Largest defined address for this address width
    #[must_use]
    pub const fn max_addr(&self) -> u64 {
        self.addr.max_value() - 1
    }

    /// Append an address; undefined encodes as all ones.
    ///
    /// A defined address that does not fit the address width is rejected.
    pub fn put_addr(&self, buf: &mut impl BufMut, addr: u64) -> Result<()> {
        let value = if addr_defined(addr) {
            if addr > self.max_addr() {
                return Err(Error::invalid_argument(format!(
                    "address {addr:#x} does not fit in {} bytes",
                    self.addr
                )));
            }
            addr
        } else {
            self.addr.max_value()
        };
        buf.put_uint_le(value, self.addr_len());
        Ok(())
    }

    /// Append a length, rejecting one wider than the length width
    pub fn put_size(&self, buf: &mut impl BufMut, size: u64) -> Result<()> {
        self.check_size(size)?;
        buf.put_uint_le(size, self.size_len());
        Ok(())
    }

    /// Check that a length is encodable in the length width
    pub fn check_size(&self, size: u64) -> Result<()> {
        if size > self.size.max_value() {
            return Err(Error::invalid_argument(format!(
                "length {size} does not fit in {} bytes",
                self.size
            )));
        }
        Ok(())
    }

    /// Read an address; all ones decodes as undefined
    pub fn get_addr(&self, buf: &mut impl Buf) -> u64 {
        let value = buf.get_uint_le(self.addr_len());
        if value == self.addr.max_value() {
            UNDEF_ADDR
        } else {
            value
        }
    }

    /// Read a length
    pub fn get_size(&self, buf: &mut impl Buf) -> u64 {
        buf.get_uint_le(self.size_len())
    }
}

impl Default for ByteWidths {
    fn default() -> Self {
        Self {
            addr: FieldWidth(8),
            size: FieldWidth(8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_category_mapping() {
        assert_eq!(FsCategory::small(MemType::Draw), FsCategory::Draw);
        assert_eq!(FsCategory::large(MemType::Draw), FsCategory::LargeDraw);
        assert_eq!(FsCategory::large(MemType::Default), FsCategory::LargeSuper);
        assert_eq!(FsCategory::large(MemType::OHdr), FsCategory::LargeOHdr);
        assert!(FsCategory::LargeBTree.is_large());
        assert!(!FsCategory::OHdr.is_large());
    }

    #[test]
    fn test_category_alloc_type() {
        assert_eq!(FsCategory::LargeSuper.alloc_type(), MemType::Super);
        assert_eq!(FsCategory::LargeOHdr.alloc_type(), MemType::OHdr);
        assert_eq!(FsCategory::GHeap.alloc_type(), MemType::GHeap);
        assert_eq!(FsCategory::LargeDraw.to_string(), "large-draw");
    }

    #[test]
    fn test_field_width() {
        assert!(FieldWidth::new(3).is_none());
        assert_eq!(FieldWidth::new(2).map(FieldWidth::max_value), Some(0xffff));
        assert_eq!(FieldWidth::new(8).map(FieldWidth::max_value), Some(u64::MAX));
    }

    #[test]
    fn test_widths_undefined_address() {
        let widths = ByteWidths::new(4, 2).unwrap();
        let mut buf = BytesMut::new();
        widths.put_addr(&mut buf, UNDEF_ADDR).unwrap();
        widths.put_addr(&mut buf, 0x1234).unwrap();
        widths.put_size(&mut buf, 77).unwrap();
        assert_eq!(buf.len(), 10);
        assert_eq!(&buf[..4], &[0xff; 4]);

        let mut data = &buf[..];
        assert_eq!(widths.get_addr(&mut data), UNDEF_ADDR);
        assert_eq!(widths.get_addr(&mut data), 0x1234);
        assert_eq!(widths.get_size(&mut data), 77);
        assert_eq!(widths.max_addr(), 0xffff_fffe);
    }

    #[test]
    fn test_widths_reject_values_too_wide() {
        let widths = ByteWidths::new(4, 2).unwrap();
        let mut buf = BytesMut::new();
        assert!(matches!(
            widths.put_size(&mut buf, 70_000),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            widths.put_addr(&mut buf, 0xffff_ffff),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            widths.put_addr(&mut buf, 0x1_0000_0000),
            Err(Error::InvalidArgument(_))
        ));
        assert!(buf.is_empty());

        widths.put_size(&mut buf, 0xffff).unwrap();
        widths.put_addr(&mut buf, widths.max_addr()).unwrap();
        assert_eq!(buf.len(), 6);
        assert!(widths.check_size(0x1_0000).is_err());
    }
}
