//! Free-space managers
//!
//! A [`FreeSpace`] tracks the free byte ranges ("sections") of one
//! allocation category. Sections are indexed twice: by `(size, addr)` for
//! best-fit lookup and by address for merging with neighbours.
//!
//! What happens when a section is added, merged or shrunk depends on where
//! the manager lives, so those decisions are delegated to a
//! [`SectionPolicy`] supplied by the caller on every mutating call.
//!
//! Persisted layout:
//! ```text
//! header  "FSHD" | ver | client | tot_space | sect_count | shrink% | expand%
//!         | addr_bits | max_sect_size | sect_addr | sect_size
//!         | alloc_sect_size | alignment | crc32c
//! sinfo   "FSSE" | ver | header_addr | count | (addr | size | class)* | crc32c
//! ```

use crate::driver::FileDriver;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use metacache_common::{
    addr_defined, compute_crc32c, split_checked, ByteWidths, Error, FreeSpaceParams, FsCategory,
    Result, SectionInfo, CHECKSUM_LEN, UNDEF_ADDR,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use tracing::{debug, trace};

/// Free-space header signature
pub const HEADER_MAGIC: [u8; 4] = *b"FSHD";

/// Free-space section info signature
pub const SINFO_MAGIC: [u8; 4] = *b"FSSE";

/// Persisted format version
pub const FREE_SPACE_VERSION: u8 = 0;

/// How a section merges and shrinks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SectionClass {
    /// Non-paged allocation
    Simple = 0,
    /// Sub-page piece of a paged allocation
    Small = 1,
    /// Page-multiple paged allocation
    Large = 2,
}

impl SectionClass {
    /// Decode the on-disk class byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Simple),
            1 => Some(Self::Small),
            2 => Some(Self::Large),
            _ => None,
        }
    }
}

/// A free byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeSection {
    /// Start address
    pub addr: u64,
    /// Length in bytes
    pub size: u64,
    /// Merge/shrink class
    pub class: SectionClass,
}

impl FreeSection {
    /// Create a new section
    #[must_use]
    pub const fn new(addr: u64, size: u64, class: SectionClass) -> Self {
        Self { addr, size, class }
    }

    /// End address (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }
}

/// Outcome of the add hook
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddAction {
    /// Track the (possibly adjusted) section
    Keep,
    /// Drop the section without tracking it
    Drop,
}

/// Decisions a manager delegates to its owner.
///
/// The defaults merge address-adjacent sections of the same class and never
/// shrink anything.
pub trait SectionPolicy {
    /// Adjust or reject a section before it is linked
    fn on_add(&mut self, _sect: &mut FreeSection, _returned_space: bool) -> Result<AddAction> {
        Ok(AddAction::Keep)
    }

    /// Whether `first` (lower address) and `second` can merge
    fn can_merge(&self, first: &FreeSection, second: &FreeSection) -> bool {
        first.class == second.class && first.end() == second.addr
    }

    /// Merge two sections; `None` means the result was released elsewhere
    fn merge(&mut self, first: FreeSection, second: FreeSection) -> Result<Option<FreeSection>> {
        Ok(Some(FreeSection::new(
            first.addr,
            first.size + second.size,
            first.class,
        )))
    }

    /// Whether the section can be given back to the address space
    fn can_shrink(&mut self, _sect: &FreeSection) -> Result<bool> {
        Ok(false)
    }

    /// Give the section back; `Some` when a larger section remains to track
    fn shrink(&mut self, _sect: FreeSection) -> Result<Option<FreeSection>> {
        Ok(None)
    }
}

/// Policy that only merges adjacent sections
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeAdjacent;

impl SectionPolicy for MergeAdjacent {}

/// Where a persisted manager keeps its blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistedStorage {
    /// Header block address
    pub header_addr: u64,
    /// Header block size
    pub header_size: u64,
    /// Section info block address
    pub sect_addr: u64,
    /// Bytes allocated for the section info block
    pub alloc_sect_size: u64,
}

/// Free-space manager for one category
#[derive(Debug)]
pub struct FreeSpace {
    category: FsCategory,
    params: FreeSpaceParams,
    widths: ByteWidths,
    alignment: u64,
    alignment_threshold: u64,
    by_size: BTreeSet<(u64, u64)>,
    by_addr: BTreeMap<u64, FreeSection>,
    tot_space: u64,
    header_addr: u64,
    sect_addr: u64,
    alloc_sect_size: u64,
}

impl FreeSpace {
    /// Create an empty in-memory manager
    pub fn create(
        category: FsCategory,
        params: FreeSpaceParams,
        widths: ByteWidths,
        alignment: u64,
        alignment_threshold: u64,
    ) -> Result<Self> {
        params.validate()?;
        if alignment == 0 {
            return Err(Error::invalid_config("free-space alignment must be at least 1"));
        }
        debug!("Created free-space manager for {}", category);
        Ok(Self {
            category,
            params,
            widths,
            alignment,
            alignment_threshold,
            by_size: BTreeSet::new(),
            by_addr: BTreeMap::new(),
            tot_space: 0,
            header_addr: UNDEF_ADDR,
            sect_addr: UNDEF_ADDR,
            alloc_sect_size: 0,
        })
    }

    /// Load a persisted manager
    pub fn open(
        driver: &dyn FileDriver,
        category: FsCategory,
        header_addr: u64,
        widths: ByteWidths,
        alignment: u64,
        alignment_threshold: u64,
    ) -> Result<Self> {
        if !addr_defined(header_addr) {
            return Err(Error::cannot_open(format!(
                "{category} manager has no header address"
            )));
        }
        let header = Self::read_header(driver, category, header_addr, widths)?;
        let mut fs = Self::create(category, header.params, widths, alignment, alignment_threshold)
            .map_err(|e| Error::cannot_open(format!("{category} manager header: {e}")))?;
        fs.header_addr = header_addr;

        if header.sect_count > 0 {
            if !addr_defined(header.sect_addr) || header.sect_size == 0 {
                return Err(Error::cannot_open(format!(
                    "{category} manager has {} sections but no section info",
                    header.sect_count
                )));
            }
            if header.sect_size > header.alloc_sect_size {
                return Err(Error::cannot_open(format!(
                    "{category} section info size {} exceeds its allocation {}",
                    header.sect_size, header.alloc_sect_size
                )));
            }
            let len = usize::try_from(header.sect_size)
                .map_err(|_| Error::cannot_open("section info too large"))?;
            let mut buf = vec![0u8; len];
            driver.read_at(header.sect_addr, &mut buf)?;
            for sect in fs.decode_sinfo(&buf, header.sect_count)? {
                fs.link(sect);
            }
            if fs.tot_space != header.tot_space {
                return Err(Error::cannot_open(format!(
                    "{category} section total {} does not match header {}",
                    fs.tot_space, header.tot_space
                )));
            }
        }
        fs.sect_addr = header.sect_addr;
        fs.alloc_sect_size = header.alloc_sect_size;

        debug!(
            "Opened {} manager at {:#x} with {} sections",
            category,
            header_addr,
            fs.by_addr.len()
        );
        Ok(fs)
    }

    /// Read just the storage layout of a persisted manager
    pub fn read_storage(
        driver: &dyn FileDriver,
        category: FsCategory,
        header_addr: u64,
        widths: ByteWidths,
    ) -> Result<PersistedStorage> {
        let header = Self::read_header(driver, category, header_addr, widths)?;
        Ok(PersistedStorage {
            header_addr,
            header_size: Self::header_size(widths),
            sect_addr: header.sect_addr,
            alloc_sect_size: header.alloc_sect_size,
        })
    }

    /// Category this manager serves
    #[must_use]
    pub const fn category(&self) -> FsCategory {
        self.category
    }

    /// Creation parameters
    #[must_use]
    pub const fn params(&self) -> &FreeSpaceParams {
        &self.params
    }

    /// Total free space and number of sections
    #[must_use]
    pub fn sect_stats(&self) -> (u64, u64) {
        (self.tot_space, self.by_addr.len() as u64)
    }

    /// Number of sections
    #[must_use]
    pub fn sect_count(&self) -> usize {
        self.by_addr.len()
    }

    /// Whether no sections are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Section with the highest address
    #[must_use]
    pub fn last_section(&self) -> Option<FreeSection> {
        self.by_addr.values().next_back().copied()
    }

    /// Sections in address order
    pub fn sections(&self) -> impl Iterator<Item = &FreeSection> + '_ {
        self.by_addr.values()
    }

    /// Sections as plain ranges
    #[must_use]
    pub fn section_infos(&self) -> Vec<SectionInfo> {
        self.by_addr
            .values()
            .map(|s| SectionInfo {
                addr: s.addr,
                size: s.size,
            })
            .collect()
    }

    /// Header block address
    #[must_use]
    pub const fn header_addr(&self) -> u64 {
        self.header_addr
    }

    /// Section info block address
    #[must_use]
    pub const fn sect_addr(&self) -> u64 {
        self.sect_addr
    }

    /// Bytes allocated for the section info block
    #[must_use]
    pub const fn alloc_sect_size(&self) -> u64 {
        self.alloc_sect_size
    }

    /// Set the header block address
    pub fn set_header_addr(&mut self, addr: u64) {
        self.header_addr = addr;
    }

    /// Set the section info block storage
    pub fn set_sinfo_storage(&mut self, addr: u64, alloc_size: u64) {
        self.sect_addr = addr;
        self.alloc_sect_size = alloc_size;
    }

    /// Forget the persisted storage, returning what was held
    pub fn take_storage(&mut self) -> PersistedStorage {
        let storage = PersistedStorage {
            header_addr: self.header_addr,
            header_size: Self::header_size(self.widths),
            sect_addr: self.sect_addr,
            alloc_sect_size: self.alloc_sect_size,
        };
        self.header_addr = UNDEF_ADDR;
        self.sect_addr = UNDEF_ADDR;
        self.alloc_sect_size = 0;
        storage
    }

    /// Encoded header size
    #[must_use]
    pub const fn header_size(widths: ByteWidths) -> u64 {
        let size_len = widths.size_len() as u64;
        let addr_len = widths.addr_len() as u64;
        4 + 1 + 1 + 6 * size_len + 3 * 2 + addr_len + CHECKSUM_LEN as u64
    }

    /// Encoded section info size for the current sections
    #[must_use]
    pub fn serial_sinfo_size(&self) -> u64 {
        let addr_len = self.widths.addr_len() as u64;
        let size_len = self.widths.size_len() as u64;
        let per_sect = addr_len + size_len + 1;
        4 + 1 + addr_len + size_len + per_sect * self.by_addr.len() as u64 + CHECKSUM_LEN as u64
    }

    /// Section info allocation size with growth headroom
    #[must_use]
    pub fn sinfo_alloc_size(&self) -> u64 {
        let serial = self.serial_sinfo_size();
        serial * (100 + u64::from(self.params.expand_threshold_pct)) / 100
    }

    /// Whether the allocated section info block should be replaced
    #[must_use]
    pub fn sinfo_needs_realloc(&self) -> bool {
        let serial = self.serial_sinfo_size();
        if serial > self.alloc_sect_size {
            return true;
        }
        serial * 100 < self.alloc_sect_size * u64::from(self.params.shrink_threshold_pct)
    }

    /// Bytes of file metadata this manager accounts for
    #[must_use]
    pub fn meta_size(&self) -> u64 {
        Self::header_size(self.widths) + self.alloc_sect_size
    }

    fn link(&mut self, sect: FreeSection) {
        trace!(
            "link {} section {:#x}+{} ({:?})",
            self.category, sect.addr, sect.size, sect.class
        );
        self.by_size.insert((sect.size, sect.addr));
        self.tot_space += sect.size;
        self.by_addr.insert(sect.addr, sect);
    }

    fn unlink(&mut self, addr: u64) -> Option<FreeSection> {
        let sect = self.by_addr.remove(&addr)?;
        self.by_size.remove(&(sect.size, sect.addr));
        self.tot_space -= sect.size;
        Some(sect)
    }

    fn fragment_for(&self, addr: u64, size: u64) -> u64 {
        if self.alignment > 1 && size >= self.alignment_threshold {
            let rem = addr % self.alignment;
            if rem > 0 { self.alignment - rem } else { 0 }
        } else {
            0
        }
    }

    /// Take `size` bytes from the smallest adequate section.
    ///
    /// Ties go to the lowest address. The remainder is added back with
    /// merging; an alignment fragment in front of the block stays as its
    /// own section.
    pub fn find(&mut self, size: u64, policy: &mut dyn SectionPolicy) -> Result<Option<u64>> {
        if size == 0 {
            return Ok(None);
        }
        let found = self
            .by_size
            .range((size, 0)..)
            .map(|&(sect_size, addr)| (sect_size, addr, self.fragment_for(addr, size)))
            .find(|&(sect_size, _, frag)| sect_size >= size + frag);
        let Some((_, addr, frag)) = found else {
            return Ok(None);
        };
        let Some(sect) = self.unlink(addr) else {
            return Err(Error::inconsistent(format!(
                "{} size index names missing section {addr:#x}",
                self.category
            )));
        };

        if frag > 0 {
            self.link(FreeSection::new(sect.addr, frag, sect.class));
        }
        let block = sect.addr + frag;
        let used = frag + size;
        if sect.size > used {
            let remainder = FreeSection::new(block + size, sect.size - used, sect.class);
            self.add(remainder, true, policy)?;
        }
        trace!("{} found {} bytes at {:#x}", self.category, size, block);
        Ok(Some(block))
    }

    /// Add a section.
    ///
    /// Returned space is merged with its neighbours and may shrink the
    /// address space. Returns whether anything merged or shrank.
    pub fn add(
        &mut self,
        mut sect: FreeSection,
        returned_space: bool,
        policy: &mut dyn SectionPolicy,
    ) -> Result<bool> {
        if sect.size == 0 {
            return Err(Error::invalid_argument(format!(
                "zero-length section at {:#x}",
                sect.addr
            )));
        }
        if policy.on_add(&mut sect, returned_space)? == AddAction::Drop {
            trace!("{} dropped section {:#x}+{}", self.category, sect.addr, sect.size);
            return Ok(false);
        }
        if !returned_space {
            self.link(sect);
            return Ok(false);
        }
        let (rest, changed) = self.merge_and_shrink(sect, policy)?;
        if let Some(rest) = rest {
            self.link(rest);
        }
        Ok(changed)
    }

    /// Merge a sub-threshold section into its neighbours.
    ///
    /// Returns false when nothing merged; the caller then drops it.
    pub fn try_merge(&mut self, sect: FreeSection, policy: &mut dyn SectionPolicy) -> Result<bool> {
        let (rest, changed) = self.merge_and_shrink(sect, policy)?;
        match rest {
            None => Ok(true),
            Some(rest) if changed => {
                self.link(rest);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    fn merge_and_shrink(
        &mut self,
        mut sect: FreeSection,
        policy: &mut dyn SectionPolicy,
    ) -> Result<(Option<FreeSection>, bool)> {
        let original = sect;

        loop {
            let mut modified = false;

            let left = self.by_addr.range(..sect.addr).next_back().map(|(_, s)| *s);
            if let Some(left) = left
                && policy.can_merge(&left, &sect)
            {
                self.unlink(left.addr);
                match policy.merge(left, sect)? {
                    Some(merged) => sect = merged,
                    None => return Ok((None, true)),
                }
                modified = true;
            }

            let right = self
                .by_addr
                .range((Bound::Excluded(sect.addr), Bound::Unbounded))
                .next()
                .map(|(_, s)| *s);
            if let Some(right) = right
                && policy.can_merge(&sect, &right)
            {
                self.unlink(right.addr);
                match policy.merge(sect, right)? {
                    Some(merged) => sect = merged,
                    None => return Ok((None, true)),
                }
                modified = true;
            }

            if !modified {
                break;
            }
        }

        // Shrinking can expose another manager section at the new EOA
        let mut took_last = false;
        while policy.can_shrink(&sect)? {
            match policy.shrink(sect)? {
                Some(bigger) => sect = bigger,
                None => match self.last_section() {
                    Some(last) => {
                        self.unlink(last.addr);
                        sect = last;
                        took_last = true;
                    }
                    None => return Ok((None, true)),
                },
            }
        }
        if took_last {
            self.link(sect);
            return Ok((None, true));
        }

        let changed = sect != original;
        Ok((Some(sect), changed))
    }

    /// Extend the block `[addr, addr + size)` by `extra` bytes into the
    /// section that starts right after it
    pub fn try_extend(
        &mut self,
        addr: u64,
        size: u64,
        extra: u64,
        policy: &mut dyn SectionPolicy,
    ) -> Result<bool> {
        let end = addr + size;
        let Some(next) = self.by_addr.get(&end).copied() else {
            return Ok(false);
        };
        if next.size < extra {
            return Ok(false);
        }
        self.unlink(end);
        if next.size > extra {
            let mut rest = FreeSection::new(end + extra, next.size - extra, next.class);
            if policy.on_add(&mut rest, true)? == AddAction::Keep {
                self.link(rest);
            }
        }
        trace!("{} extended {:#x}+{} by {}", self.category, addr, size, extra);
        Ok(true)
    }

    /// Give the last section back to the address space if it sits at EOA
    pub fn try_shrink_eoa(&mut self, policy: &mut dyn SectionPolicy) -> Result<bool> {
        let Some(last) = self.last_section() else {
            return Ok(false);
        };
        if !policy.can_shrink(&last)? {
            return Ok(false);
        }
        self.unlink(last.addr);
        if let Some(rest) = policy.shrink(last)? {
            self.link(rest);
        }
        Ok(true)
    }

    /// Encode the header block
    pub fn encode_header(&self) -> Result<Bytes> {
        let w = self.widths;
        let mut buf = BytesMut::with_capacity(Self::header_size(w) as usize);
        buf.put_slice(&HEADER_MAGIC);
        buf.put_u8(FREE_SPACE_VERSION);
        buf.put_u8(self.category.index() as u8);
        w.put_size(&mut buf, self.tot_space)?;
        w.put_size(&mut buf, self.by_addr.len() as u64)?;
        buf.put_u16_le(self.params.shrink_threshold_pct);
        buf.put_u16_le(self.params.expand_threshold_pct);
        buf.put_u16_le(self.params.max_section_addr_bits);
        w.put_size(&mut buf, self.params.max_section_size)?;
        w.put_addr(&mut buf, self.sect_addr)?;
        w.put_size(
            &mut buf,
            if self.by_addr.is_empty() { 0 } else { self.serial_sinfo_size() },
        )?;
        w.put_size(&mut buf, self.alloc_sect_size)?;
        w.put_size(&mut buf, self.alignment)?;
        let crc = compute_crc32c(&buf);
        buf.put_u32_le(crc);
        Ok(buf.freeze())
    }

    /// Encode the section info block
    pub fn encode_sinfo(&self) -> Result<Bytes> {
        let w = self.widths;
        let mut buf = BytesMut::with_capacity(self.serial_sinfo_size() as usize);
        buf.put_slice(&SINFO_MAGIC);
        buf.put_u8(FREE_SPACE_VERSION);
        w.put_addr(&mut buf, self.header_addr)?;
        w.put_size(&mut buf, self.by_addr.len() as u64)?;
        for sect in self.by_addr.values() {
            w.put_addr(&mut buf, sect.addr)?;
            w.put_size(&mut buf, sect.size)?;
            buf.put_u8(sect.class as u8);
        }
        let crc = compute_crc32c(&buf);
        buf.put_u32_le(crc);
        Ok(buf.freeze())
    }

    /// Write the header and section info to their allocated storage
    pub fn write(&self, driver: &dyn FileDriver) -> Result<()> {
        if !addr_defined(self.header_addr) {
            return Err(Error::inconsistent(format!(
                "{} manager has no header storage",
                self.category
            )));
        }
        if !self.by_addr.is_empty() {
            let sinfo = self.encode_sinfo()?;
            if !addr_defined(self.sect_addr) || sinfo.len() as u64 > self.alloc_sect_size {
                return Err(Error::inconsistent(format!(
                    "{} section info needs {} bytes, {} allocated",
                    self.category,
                    sinfo.len(),
                    self.alloc_sect_size
                )));
            }
            driver.write_at(self.sect_addr, &sinfo)?;
        }
        driver.write_at(self.header_addr, &self.encode_header()?)?;
        debug!(
            "Wrote {} manager header at {:#x} ({} sections)",
            self.category,
            self.header_addr,
            self.by_addr.len()
        );
        Ok(())
    }

    fn read_header(
        driver: &dyn FileDriver,
        category: FsCategory,
        header_addr: u64,
        widths: ByteWidths,
    ) -> Result<DecodedHeader> {
        let mut buf = vec![0u8; Self::header_size(widths) as usize];
        driver.read_at(header_addr, &mut buf)?;
        let payload = split_checked(&buf).ok_or_else(|| {
            Error::cannot_open(format!("{category} header checksum mismatch at {header_addr:#x}"))
        })?;

        let mut data = payload;
        if data[..4] != HEADER_MAGIC {
            return Err(Error::cannot_open(format!(
                "bad free-space header signature at {header_addr:#x}"
            )));
        }
        data.advance(4);
        let version = data.get_u8();
        if version != FREE_SPACE_VERSION {
            return Err(Error::cannot_open(format!(
                "unsupported free-space header version {version}"
            )));
        }
        let client = data.get_u8();
        if usize::from(client) != category.index() {
            return Err(Error::cannot_open(format!(
                "header at {header_addr:#x} belongs to category {client}, expected {category}"
            )));
        }
        let tot_space = widths.get_size(&mut data);
        let sect_count = widths.get_size(&mut data);
        let shrink_threshold_pct = data.get_u16_le();
        let expand_threshold_pct = data.get_u16_le();
        let max_section_addr_bits = data.get_u16_le();
        let max_section_size = widths.get_size(&mut data);
        let sect_addr = widths.get_addr(&mut data);
        let sect_size = widths.get_size(&mut data);
        let alloc_sect_size = widths.get_size(&mut data);
        let _alignment = widths.get_size(&mut data);

        Ok(DecodedHeader {
            params: FreeSpaceParams {
                shrink_threshold_pct,
                expand_threshold_pct,
                max_section_addr_bits,
                max_section_size,
            },
            tot_space,
            sect_count,
            sect_addr,
            sect_size,
            alloc_sect_size,
        })
    }

    fn decode_sinfo(&self, buf: &[u8], expected: u64) -> Result<Vec<FreeSection>> {
        let category = self.category;
        let payload = split_checked(buf)
            .ok_or_else(|| Error::cannot_open(format!("{category} section info checksum mismatch")))?;
        let w = self.widths;
        let fixed = 4 + 1 + w.addr_len() + w.size_len();
        if payload.len() < fixed || payload[..4] != SINFO_MAGIC {
            return Err(Error::cannot_open(format!(
                "bad {category} section info signature"
            )));
        }
        let mut data = &payload[4..];
        let version = data.get_u8();
        if version != FREE_SPACE_VERSION {
            return Err(Error::cannot_open(format!(
                "unsupported section info version {version}"
            )));
        }
        let owner = w.get_addr(&mut data);
        if owner != self.header_addr {
            return Err(Error::cannot_open(format!(
                "section info owned by {owner:#x}, expected {:#x}",
                self.header_addr
            )));
        }
        let count = w.get_size(&mut data);
        if count != expected {
            return Err(Error::cannot_open(format!(
                "section info holds {count} sections, header says {expected}"
            )));
        }
        let per_sect = w.addr_len() + w.size_len() + 1;
        let needed = usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(per_sect))
            .ok_or_else(|| Error::cannot_open("section count overflows"))?;
        if data.remaining() < needed {
            return Err(Error::cannot_open(format!(
                "{category} section info truncated"
            )));
        }

        let mut sections = Vec::with_capacity(needed / per_sect);
        let mut prev_end = 0u64;
        for _ in 0..count {
            let addr = w.get_addr(&mut data);
            let size = w.get_size(&mut data);
            let class = SectionClass::from_u8(data.get_u8()).ok_or_else(|| {
                Error::cannot_open(format!("unknown section class at {addr:#x}"))
            })?;
            if size == 0 || !addr_defined(addr) {
                return Err(Error::cannot_open(format!(
                    "invalid section {addr:#x}+{size}"
                )));
            }
            if addr < prev_end {
                return Err(Error::cannot_open(format!(
                    "section at {addr:#x} overlaps its predecessor"
                )));
            }
            prev_end = addr
                .checked_add(size)
                .ok_or_else(|| Error::cannot_open(format!("section at {addr:#x} overflows")))?;
            sections.push(FreeSection::new(addr, size, class));
        }
        Ok(sections)
    }
}

struct DecodedHeader {
    params: FreeSpaceParams,
    tot_space: u64,
    sect_count: u64,
    sect_addr: u64,
    sect_size: u64,
    alloc_sect_size: u64,
}
