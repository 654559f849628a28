//! File-space allocator
//!
//! Hands out and takes back byte ranges of the file address space. Freed
//! space is tracked by one [`FreeSpace`] manager per category; small
//! requests are carved from two block aggregators (metadata and small raw
//! data) unless the file uses paged aggregation, in which case sub-page
//! requests share pages and page-multiple requests are page aligned.
//!
//! Managers can persist across close/reopen. Their header and section info
//! blocks are themselves file space, so closing a persisting file runs a
//! settle loop until every manager's storage is allocated and no longer
//! changes what the managers hold.

use crate::address_space::AddressSpace;
use crate::aggregator::{AggrKind, Aggregator};
use crate::driver::FileDriver;
use crate::free_space::{FreeSection, FreeSpace, SectionClass, SectionPolicy};
use crate::fsinfo::FsInfoMessage;
use crate::section_ops::{OpSettings, SectionOps};
use crate::superblock::{SUPERBLOCK_RESERVED, SuperblockExtension};
use metacache_common::{
    ByteWidths, Error, FileSpaceConfig, FreeSpaceParams, FsCategory, MemType, Result,
    SectionInfo, TailKind, TypeMap, UNDEF_ADDR, addr_defined,
};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// An aggregator at EOA serves an extension in place while the request is
/// at most this fraction (1/n) of its unused space
const EXTEND_THRESHOLD_DIVISOR: u64 = 10;

/// Rounds allowed for persisted manager storage to settle at close
const MAX_SETTLE_ROUNDS: usize = 8;

/// Lifecycle of one category's manager
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ManagerState {
    /// Not loaded
    #[default]
    Closed,
    /// Loaded or created
    Open,
    /// Persisted storage is being freed; frees to this category are dropped
    Deleting,
}

#[derive(Clone, Copy, Debug)]
struct ShrinkMode {
    allow_sect_absorb: bool,
    eoa_only: bool,
}

impl ShrinkMode {
    /// Space handed back by a caller
    const RETURNED: Self = Self {
        allow_sect_absorb: true,
        eoa_only: false,
    };
    /// A one-off check that must not reshape aggregators
    const CHECK_ONLY: Self = Self {
        allow_sect_absorb: false,
        eoa_only: false,
    };
    /// End-of-file trimming at close
    const CLOSING: Self = Self {
        allow_sect_absorb: false,
        eoa_only: true,
    };
}

/// File-space allocator for one open file
pub struct Allocator {
    driver: Arc<dyn FileDriver>,
    config: FileSpaceConfig,
    widths: ByteWidths,
    params: FreeSpaceParams,
    space: AddressSpace,
    meta_aggr: Aggregator,
    sdata_aggr: Aggregator,
    managers: [Option<FreeSpace>; FsCategory::NTYPES],
    fs_addr: [u64; FsCategory::NTYPES],
    fs_state: [ManagerState; FsCategory::NTYPES],
    last_small: TailKind,
    /// Manager storage is being laid out; aggregators stay out of it
    settling: bool,
}

impl Allocator {
    /// Allocator for a new file; the superblock region is already in use
    pub fn create(driver: Arc<dyn FileDriver>, config: FileSpaceConfig) -> Result<Self> {
        let alloc = Self::new(driver, config, SUPERBLOCK_RESERVED)?;
        info!(
            "Created allocator: strategy={:?} persist={} page_size={}",
            alloc.config.strategy, alloc.config.persist, alloc.config.page_size
        );
        Ok(alloc)
    }

    /// Allocator for an existing file.
    ///
    /// The file-space info message, when present, overrides the strategy,
    /// persistence, threshold and paging settings of `config`.
    pub fn open(
        driver: Arc<dyn FileDriver>,
        mut config: FileSpaceConfig,
        eoa: u64,
        fsinfo: Option<&FsInfoMessage>,
    ) -> Result<Self> {
        if let Some(msg) = fsinfo {
            msg.apply_to(&mut config);
        }
        let mut alloc = Self::new(driver, config, eoa)?;
        if let Some(msg) = fsinfo {
            if msg.persist {
                for cat in FsCategory::ALL {
                    alloc.fs_addr[cat.index()] = msg.fs_addr(cat);
                }
            }
            alloc.last_small = msg.last_small;
        }
        info!(
            "Opened allocator: eoa={:#x} strategy={:?} persisted managers={}",
            eoa,
            alloc.config.strategy,
            alloc.fs_addr.iter().filter(|a| addr_defined(**a)).count()
        );
        Ok(alloc)
    }

    fn new(driver: Arc<dyn FileDriver>, config: FileSpaceConfig, eoa: u64) -> Result<Self> {
        config.validate()?;
        let widths = config.widths()?;
        let max_addr = config.effective_max_addr()?;
        let (alignment, threshold) = if config.is_paged() {
            (config.page_size, 1)
        } else {
            (config.alignment, config.alignment_threshold)
        };
        let space = AddressSpace::new(eoa, max_addr, alignment, threshold)?;
        let aggrs = config.strategy.uses_aggregators();
        let mut params = FreeSpaceParams::for_max_addr(max_addr);
        params.max_section_size = params.max_section_size.min(widths.size.max_value());
        Ok(Self {
            driver,
            widths,
            params,
            space,
            meta_aggr: Aggregator::new(AggrKind::Meta, config.meta_block_size, aggrs),
            sdata_aggr: Aggregator::new(AggrKind::SmallData, config.sdata_block_size, aggrs),
            managers: [const { None }; FsCategory::NTYPES],
            fs_addr: [UNDEF_ADDR; FsCategory::NTYPES],
            fs_state: [ManagerState::Closed; FsCategory::NTYPES],
            last_small: TailKind::Large,
            settling: false,
            config,
        })
    }

    /// Effective file-space configuration
    #[must_use]
    pub const fn config(&self) -> &FileSpaceConfig {
        &self.config
    }

    /// Encoding widths
    #[must_use]
    pub const fn widths(&self) -> ByteWidths {
        self.widths
    }

    /// Current end of allocation
    #[must_use]
    pub const fn eoa(&self) -> u64 {
        self.space.eoa()
    }

    /// Driver the allocator reads persisted managers through
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn FileDriver> {
        &self.driver
    }

    /// Whether `addr` lies in the temporary region
    #[must_use]
    pub const fn is_tmp_addr(&self, addr: u64) -> bool {
        self.space.is_tmp_addr(addr)
    }

    /// Hand out temporary space from the top of the address space
    pub fn alloc_tmp(&mut self, size: u64) -> Result<u64> {
        let addr = self.space.alloc_tmp(size)?;
        trace!("alloc_tmp: {} bytes at {:#x}", size, addr);
        Ok(addr)
    }

    /// Persisted header address of a category's manager
    #[must_use]
    pub const fn fs_addr(&self, cat: FsCategory) -> u64 {
        self.fs_addr[cat.index()]
    }

    /// Lifecycle state of a category's manager
    #[must_use]
    pub const fn manager_state(&self, cat: FsCategory) -> ManagerState {
        self.fs_state[cat.index()]
    }

    /// Whether a category's manager is loaded
    #[must_use]
    pub const fn has_manager(&self, cat: FsCategory) -> bool {
        self.managers[cat.index()].is_some()
    }

    /// Kind of allocation last placed at the end of the file
    #[must_use]
    pub const fn last_small(&self) -> TailKind {
        self.last_small
    }

    /// Unused `(addr, size)` held by an aggregator
    #[must_use]
    pub const fn aggr_query(&self, kind: AggrKind) -> (u64, u64) {
        match kind {
            AggrKind::Meta => self.meta_aggr.query(),
            AggrKind::SmallData => self.sdata_aggr.query(),
        }
    }

    // ---- type mapping ----

    fn map_type(&self, mem: MemType) -> MemType {
        match self.config.type_map {
            TypeMap::Together => MemType::Super,
            TypeMap::Dichotomy if mem.is_raw() => MemType::Draw,
            TypeMap::Dichotomy => MemType::Super,
            TypeMap::Separate if mem == MemType::Default => MemType::Super,
            TypeMap::Separate => mem,
        }
    }

    fn category_for(&self, mem: MemType, size: u64) -> FsCategory {
        if self.config.is_paged() {
            if size >= self.config.page_size {
                FsCategory::LARGE_GENERIC
            } else if mem.is_raw() {
                FsCategory::SMALL_RAW
            } else {
                FsCategory::SMALL_META
            }
        } else {
            FsCategory::small(self.map_type(mem))
        }
    }

    fn section_class(&self, size: u64) -> SectionClass {
        if !self.config.is_paged() {
            SectionClass::Simple
        } else if size >= self.config.page_size {
            SectionClass::Large
        } else {
            SectionClass::Small
        }
    }

    /// Which aggregators sections of `mem` may merge into
    fn merge_flags(&self, mem: MemType) -> (bool, bool) {
        match self.config.type_map {
            TypeMap::Together => (true, true),
            TypeMap::Dichotomy => (!mem.is_raw(), mem.is_raw()),
            TypeMap::Separate => (false, mem.is_raw()),
        }
    }

    fn op_settings(&self, alloc_type: MemType, mode: ShrinkMode) -> OpSettings {
        let paged = self.config.is_paged();
        let (merge_meta, merge_raw) = self.merge_flags(alloc_type);
        OpSettings {
            page_size: if paged { self.config.page_size } else { 0 },
            pgend_thresh: if paged {
                u64::from(self.config.pgend_meta_threshold)
            } else {
                0
            },
            alloc_type,
            merge_meta,
            merge_raw,
            allow_sect_absorb: mode.allow_sect_absorb,
            eoa_only: mode.eoa_only,
        }
    }

    fn manager_alignment(&self, cat: FsCategory) -> (u64, u64) {
        if self.config.is_paged() {
            if cat.is_large() {
                (self.config.page_size, 1)
            } else {
                (1, 1)
            }
        } else {
            (self.config.alignment, self.config.alignment_threshold)
        }
    }

    const fn aggr(&self, kind: AggrKind) -> &Aggregator {
        match kind {
            AggrKind::Meta => &self.meta_aggr,
            AggrKind::SmallData => &self.sdata_aggr,
        }
    }

    const fn aggr_mut(&mut self, kind: AggrKind) -> &mut Aggregator {
        match kind {
            AggrKind::Meta => &mut self.meta_aggr,
            AggrKind::SmallData => &mut self.sdata_aggr,
        }
    }

    // ---- manager lifecycle ----

    fn create_fstype(&mut self, cat: FsCategory) -> Result<()> {
        let (alignment, threshold) = self.manager_alignment(cat);
        let fs = FreeSpace::create(cat, self.params, self.widths, alignment, threshold)?;
        self.managers[cat.index()] = Some(fs);
        self.fs_state[cat.index()] = ManagerState::Open;
        Ok(())
    }

    fn open_fstype(&mut self, cat: FsCategory) -> Result<()> {
        let (alignment, threshold) = self.manager_alignment(cat);
        let fs = FreeSpace::open(
            self.driver.as_ref(),
            cat,
            self.fs_addr[cat.index()],
            self.widths,
            alignment,
            threshold,
        )?;
        self.managers[cat.index()] = Some(fs);
        self.fs_state[cat.index()] = ManagerState::Open;
        Ok(())
    }

    fn start_fstype(&mut self, cat: FsCategory) -> Result<()> {
        if addr_defined(self.fs_addr[cat.index()]) {
            self.open_fstype(cat)
        } else {
            self.create_fstype(cat)
        }
    }

    fn ensure_manager(&mut self, cat: FsCategory) -> Result<()> {
        if self.managers[cat.index()].is_none() {
            self.start_fstype(cat)?;
        }
        Ok(())
    }

    /// Load a persisted manager that is not loaded yet; true if loaded now
    fn open_if_persisted(&mut self, cat: FsCategory) -> Result<bool> {
        if self.managers[cat.index()].is_none() && addr_defined(self.fs_addr[cat.index()]) {
            self.open_fstype(cat)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn manager_mut(&mut self, cat: FsCategory) -> Result<&mut FreeSpace> {
        self.managers[cat.index()]
            .as_mut()
            .ok_or_else(|| Error::inconsistent(format!("{cat} manager is not loaded")))
    }

    /// Free the persisted storage of a category's manager
    pub fn delete_fstype(&mut self, cat: FsCategory) -> Result<()> {
        let i = cat.index();
        let header_addr = self.fs_addr[i];
        self.fs_addr[i] = UNDEF_ADDR;
        self.fs_state[i] = ManagerState::Deleting;

        let result = FreeSpace::read_storage(self.driver.as_ref(), cat, header_addr, self.widths)
            .and_then(|storage| {
                self.xfree(MemType::FSPACE_HDR, storage.header_addr, storage.header_size)?;
                self.xfree(MemType::FSPACE_SINFO, storage.sect_addr, storage.alloc_sect_size)
            });
        self.fs_state[i] = ManagerState::Closed;
        debug!("Deleted {} manager storage at {:#x}", cat, header_addr);
        result
    }

    /// Drop a category's manager and free its persisted storage
    pub fn close_delete(&mut self, cat: FsCategory) -> Result<()> {
        let i = cat.index();
        if self.managers[i].take().is_some() {
            self.fs_state[i] = ManagerState::Closed;
        }
        if addr_defined(self.fs_addr[i]) {
            self.delete_fstype(cat)?;
        }
        Ok(())
    }

    /// Run `op` on a loaded manager with the allocator's section policy.
    ///
    /// Whole pages the policy released while merging small sections are
    /// freed afterwards. Returns `None` when the manager is not loaded.
    fn with_manager<T>(
        &mut self,
        cat: FsCategory,
        alloc_type: MemType,
        mode: ShrinkMode,
        op: impl FnOnce(&mut FreeSpace, &mut SectionOps<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        let settings = self.op_settings(alloc_type, mode);
        let Self {
            managers,
            space,
            meta_aggr,
            sdata_aggr,
            ..
        } = &mut *self;
        let Some(fs) = managers[cat.index()].as_mut() else {
            return Ok(None);
        };
        let mut ops = SectionOps::new(space, meta_aggr, sdata_aggr, settings);
        let out = op(fs, &mut ops)?;
        let released = ops.released;

        for (addr, size) in released {
            trace!("releasing assembled page {:#x}+{}", addr, size);
            self.xfree(alloc_type, addr, size)?;
        }
        Ok(Some(out))
    }

    // ---- allocation ----

    /// Allocate `size` bytes for `mem`
    pub fn allocate(&mut self, mem: MemType, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::invalid_argument(format!("zero-length {mem} allocation")));
        }
        self.widths.check_size(size)?;
        let cat = self.category_for(mem, size);

        if self.config.strategy.uses_managers() {
            self.open_if_persisted(cat)?;
            let found = self
                .with_manager(cat, mem, ShrinkMode::RETURNED, |fs, ops| fs.find(size, ops))?
                .flatten();
            if let Some(addr) = found {
                trace!("allocate: {} {} bytes from {} manager at {:#x}", mem, size, cat, addr);
                return Ok(addr);
            }
        }

        let addr = if self.config.is_paged() {
            self.alloc_pagefs(mem, size)?
        } else if self.settling || !self.config.strategy.uses_aggregators() {
            self.vfd_alloc(mem, size)?
        } else {
            self.aggr_vfd_alloc(mem, size)?
        };
        trace!("allocate: {} {} bytes at {:#x}, eoa={:#x}", mem, size, addr, self.space.eoa());
        Ok(addr)
    }

    /// Extend the EOA directly, freeing any alignment fragment
    fn vfd_alloc(&mut self, mem: MemType, size: u64) -> Result<u64> {
        let (addr, frag) = self.space.alloc(size)?;
        if let Some((frag_addr, frag_size)) = frag {
            self.xfree(mem, frag_addr, frag_size)?;
        }
        Ok(addr)
    }

    fn alloc_pagefs(&mut self, mem: MemType, size: u64) -> Result<u64> {
        let page = self.config.page_size;
        let cat = self.category_for(mem, size);

        if cat.is_large() {
            let tail = (page - size % page) % page;
            let addr = self.vfd_alloc(mem, size + tail)?;
            if tail > 0 {
                self.ensure_manager(cat)?;
                let sect = FreeSection::new(addr + size, tail, SectionClass::Large);
                self.with_manager(cat, mem, ShrinkMode::RETURNED, |fs, ops| {
                    fs.add(sect, true, ops)
                })?;
            }
            self.last_small = TailKind::Large;
            return Ok(addr);
        }

        if self.fs_state[cat.index()] == ManagerState::Deleting {
            return self.close_allocate(mem, size);
        }
        let page_addr = self.allocate(mem, page)?;
        self.ensure_manager(cat)?;
        let sect = FreeSection::new(page_addr + size, page - size, SectionClass::Small);
        self.with_manager(cat, mem, ShrinkMode::RETURNED, |fs, ops| fs.add(sect, true, ops))?;
        self.last_small = if mem.is_raw() {
            TailKind::SmallRaw
        } else {
            TailKind::SmallMeta
        };
        Ok(page_addr)
    }

    fn aggr_vfd_alloc(&mut self, mem: MemType, size: u64) -> Result<u64> {
        if mem.is_raw() {
            self.aggr_alloc(AggrKind::SmallData, MemType::Draw, size)
        } else {
            self.aggr_alloc(AggrKind::Meta, mem, size)
        }
    }

    fn aggr_alloc(&mut self, kind: AggrKind, mem: MemType, size: u64) -> Result<u64> {
        if !self.aggr(kind).is_enabled() {
            return self.vfd_alloc(mem, size);
        }
        let aggr = self.aggr(kind).clone();
        let aggr_frag = self.space.fragment_for(aggr.addr, size);
        let align_request =
            self.space.alignment() > 1 && size >= self.space.alignment_threshold();

        if aggr.size >= size + aggr_frag {
            let addr = self.aggr_mut(kind).take_front(size + aggr_frag) + aggr_frag;
            if aggr_frag > 0 {
                self.xfree(mem, aggr.addr, aggr_frag)?;
            }
            return Ok(addr);
        }

        let tmp = self.space.tmp_addr();
        let mut eoa_frag = None;
        let mut extended = false;

        let addr = if size >= aggr.alloc_size {
            // Too big for a block of its own: straight from EOA
            let ext = size + aggr_frag;
            if aggr.end().checked_add(ext).is_none_or(|end| end > tmp) {
                return Err(Error::out_of_space(ext, self.space.eoa(), tmp));
            }
            if aggr.addr > 0 && self.space.try_extend(aggr.end(), ext)? {
                let a = self.aggr_mut(kind);
                a.addr += ext;
                a.tot_size += ext;
                extended = true;
                aggr.addr + aggr_frag
            } else {
                self.release_other_if_worth(kind)?;
                let (addr, frag) = self.space.alloc(size)?;
                eoa_frag = frag;
                addr
            }
        } else {
            let mut ext = aggr.alloc_size;
            if aggr_frag > ext - size {
                ext += aggr_frag - (ext - size);
            }
            if aggr.end().checked_add(ext).is_none_or(|end| end > tmp) {
                return Err(Error::out_of_space(ext, self.space.eoa(), tmp));
            }
            if aggr.addr > 0 && self.space.try_extend(aggr.end(), ext)? {
                let a = self.aggr_mut(kind);
                a.addr += aggr_frag;
                a.size += ext - aggr_frag;
                a.tot_size += ext;
                extended = true;
            } else {
                self.release_other_if_worth(kind)?;
                let block = aggr.alloc_size;
                let (new_space, frag) = self.space.alloc(block)?;
                let a = self.aggr_mut(kind);
                let (old_addr, old_size) = a.reset();
                match frag {
                    // An unaligned request can use the alignment padding too
                    Some((frag_addr, frag_size)) if !align_request => {
                        a.addr = frag_addr;
                        a.size = block + frag_size;
                    }
                    _ => {
                        a.addr = new_space;
                        a.size = block;
                        eoa_frag = frag;
                    }
                }
                a.tot_size = a.size;
                if old_size > 0 {
                    self.xfree(mem, old_addr, old_size)?;
                }
                debug!("{:?} aggregator took a new block at {:#x}", kind, new_space);
            }
            self.aggr_mut(kind).take_front(size)
        };

        if let Some((frag_addr, frag_size)) = eoa_frag {
            self.xfree(mem, frag_addr, frag_size)?;
        }
        if extended && aggr_frag > 0 {
            self.xfree(mem, aggr.addr, aggr_frag)?;
        }
        Ok(addr)
    }

    /// Give the other aggregator's space back if it sits at EOA and has
    /// outgrown one block
    fn release_other_if_worth(&mut self, kind: AggrKind) -> Result<()> {
        let other = kind.other();
        if self.aggr(other).worth_releasing(self.space.eoa()) {
            self.aggr_free_eoa(other);
        }
        Ok(())
    }

    /// Empty an aggregator that sits at EOA, shrinking the EOA
    fn aggr_free_eoa(&mut self, kind: AggrKind) -> bool {
        let (addr, size) = self.aggr_mut(kind).reset();
        size > 0 && self.space.free(addr, size)
    }

    /// Return both aggregators' unused space, the later one first
    pub fn free_aggrs(&mut self) -> Result<()> {
        let (ma_addr, ma_size) = self.meta_aggr.query();
        let (sda_addr, sda_size) = self.sdata_aggr.query();
        let order = if ma_size > 0 && sda_size > 0 && ma_addr < sda_addr {
            [AggrKind::SmallData, AggrKind::Meta]
        } else {
            [AggrKind::Meta, AggrKind::SmallData]
        };
        for kind in order {
            let (addr, size) = self.aggr_mut(kind).reset();
            if size > 0 {
                self.xfree(kind.alloc_type(), addr, size)?;
            }
        }
        Ok(())
    }

    /// Empty any aggregator at EOA; true if the EOA moved
    fn aggrs_try_shrink_eoa(&mut self) -> bool {
        let eoa = self.space.eoa();
        let mut shrank = false;
        for kind in [AggrKind::Meta, AggrKind::SmallData] {
            if self.aggr(kind).at_eoa(eoa) || self.aggr(kind).at_eoa(self.space.eoa()) {
                shrank |= self.aggr_free_eoa(kind);
            }
        }
        shrank
    }

    /// Raw allocation at EOA for use while managers are being torn down.
    ///
    /// Ignores alignment. With paging, a block that fits in a page but
    /// would straddle a page boundary starts on the next page instead.
    pub fn close_allocate(&mut self, mem: MemType, size: u64) -> Result<u64> {
        let eoa = self.space.eoa();
        let page = self.config.page_size;
        let mut pad = 0;
        if self.config.is_paged() && size <= page {
            let rem = eoa % page;
            if rem > 0 && rem + size > page {
                pad = page - rem;
            }
        }
        let start = self.space.alloc_unaligned(pad + size)?;
        if pad > 0 {
            self.xfree(mem, start, pad)?;
        }
        Ok(start + pad)
    }

    // ---- free / extend ----

    /// Return `[addr, addr + size)` to the free space
    pub fn xfree(&mut self, mem: MemType, addr: u64, size: u64) -> Result<()> {
        if !addr_defined(addr) || size == 0 {
            return Ok(());
        }
        let tmp = self.space.tmp_addr();
        if addr >= tmp || addr.checked_add(size).is_none_or(|end| end > tmp) {
            return Err(Error::invalid_argument(format!(
                "freeing {addr:#x}+{size} reaches temporary space at {tmp:#x}"
            )));
        }

        let cat = self.category_for(mem, size);
        let i = cat.index();
        if self.managers[i].is_none() {
            if !addr_defined(self.fs_addr[i]) {
                if self.try_shrink(mem, addr, size)? {
                    return Ok(());
                }
                if size < self.config.threshold {
                    trace!("xfree: dropped {} bytes at {:#x} below threshold", size, addr);
                    return Ok(());
                }
            }
            if self.fs_state[i] == ManagerState::Deleting || !self.config.strategy.uses_managers()
            {
                trace!("xfree: dropped {} bytes at {:#x}", size, addr);
                return Ok(());
            }
            self.start_fstype(cat)?;
        }

        let sect = FreeSection::new(addr, size, self.section_class(size));
        if size >= self.config.threshold {
            self.with_manager(cat, mem, ShrinkMode::RETURNED, |fs, ops| {
                fs.add(sect, true, ops)
            })?;
        } else {
            let merged = self
                .with_manager(cat, mem, ShrinkMode::RETURNED, |fs, ops| fs.try_merge(sect, ops))?
                .unwrap_or(false);
            if !merged {
                trace!("xfree: dropped unmergeable {} bytes at {:#x}", size, addr);
            }
        }
        trace!("xfree: {} {} bytes at {:#x}, eoa={:#x}", mem, size, addr, self.space.eoa());
        Ok(())
    }

    /// Give `[addr, addr + size)` straight back to the EOA or an adjoining
    /// aggregator, without involving a manager
    pub fn try_shrink(&mut self, mem: MemType, addr: u64, size: u64) -> Result<bool> {
        let sect = FreeSection::new(addr, size, self.section_class(size));
        let settings = self.op_settings(mem, ShrinkMode::CHECK_ONLY);
        let Self {
            space,
            meta_aggr,
            sdata_aggr,
            ..
        } = &mut *self;
        let mut ops = SectionOps::new(space, meta_aggr, sdata_aggr, settings);
        if !ops.can_shrink(&sect)? {
            return Ok(false);
        }
        Ok(ops.shrink(sect)?.is_none())
    }

    /// Grow the block `[addr, addr + size)` in place by `extra` bytes
    pub fn try_extend(&mut self, mem: MemType, addr: u64, size: u64, extra: u64) -> Result<bool> {
        if extra == 0 {
            return Ok(true);
        }
        let map_type = if mem == MemType::GHeap { MemType::Draw } else { mem };
        let end = addr
            .checked_add(size)
            .ok_or_else(|| Error::invalid_argument(format!("block {addr:#x}+{size} overflows")))?;
        let Some(new_end) = end.checked_add(extra) else {
            return Ok(false);
        };
        let paged = self.config.is_paged();
        let page = self.config.page_size;

        // A small paged block stays inside its page
        if paged && size < page && addr / page != (new_end - 1) / page {
            return Ok(false);
        }

        if self.space.try_extend(end, extra)? {
            trace!("try_extend: {:#x}+{} by {} at eoa", addr, size, extra);
            return Ok(true);
        }

        if self.config.strategy.uses_aggregators() {
            let kind = if map_type == MemType::Draw {
                AggrKind::SmallData
            } else {
                AggrKind::Meta
            };
            if self.aggr_try_extend(kind, end, extra)? {
                trace!("try_extend: {:#x}+{} by {} from {:?} aggregator", addr, size, extra, kind);
                return Ok(true);
            }
        }

        if self.config.strategy.uses_managers() {
            let cat = self.category_for(mem, size);
            self.open_if_persisted(cat)?;
            let extended = self
                .with_manager(cat, mem, ShrinkMode::RETURNED, |fs, ops| {
                    fs.try_extend(addr, size, extra, ops)
                })?
                .unwrap_or(false);
            if extended {
                return Ok(true);
            }
        }

        if paged && !map_type.is_raw() && size < page {
            let rem = end % page;
            let prem = if rem == 0 { 0 } else { page - rem };
            if prem > 0 && prem <= u64::from(self.config.pgend_meta_threshold) && extra <= prem {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn aggr_try_extend(&mut self, kind: AggrKind, blk_end: u64, extra: u64) -> Result<bool> {
        let eoa = self.space.eoa();
        let aggr = self.aggr(kind);
        if !aggr.is_enabled() || aggr.addr != blk_end {
            return Ok(false);
        }
        let (addr, size, alloc_size) = (aggr.addr, aggr.size, aggr.alloc_size);

        if addr + size == eoa {
            if extra.saturating_mul(EXTEND_THRESHOLD_DIVISOR) <= size {
                let a = self.aggr_mut(kind);
                a.addr += extra;
                a.size -= extra;
                return Ok(true);
            }
            let grow = extra.max(alloc_size);
            if self.space.try_extend(addr + size, grow)? {
                let a = self.aggr_mut(kind);
                a.addr += extra;
                a.tot_size += grow;
                a.size = a.size + grow - extra;
                return Ok(true);
            }
            Ok(false)
        } else if size >= extra {
            let a = self.aggr_mut(kind);
            a.addr += extra;
            a.size -= extra;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---- close ----

    /// Trim free space at the end of the file until nothing more moves
    fn close_shrink_eoa(&mut self) -> Result<()> {
        loop {
            let mut shrank = false;
            for cat in FsCategory::ALL {
                let result = self.with_manager(cat, cat.alloc_type(), ShrinkMode::CLOSING, |fs, ops| {
                    fs.try_shrink_eoa(ops)
                })?;
                shrank |= result == Some(true);
            }
            if !self.config.is_paged() {
                shrank |= self.aggrs_try_shrink_eoa();
            }
            if !shrank {
                return Ok(());
            }
        }
    }

    /// Release every manager, deleting persisted storage
    pub fn try_close(&mut self) -> Result<()> {
        for cat in FsCategory::ALL {
            self.close_delete(cat)?;
        }
        Ok(())
    }

    /// Close the allocator, recording the file-space info in `ext`.
    ///
    /// With persistence, every manager that holds sections is written to
    /// newly settled storage and its address recorded; otherwise managers
    /// are dropped.
    pub fn close(&mut self, ext: &mut SuperblockExtension) -> Result<()> {
        debug!("Closing allocator at eoa {:#x}", self.space.eoa());
        if !self.config.is_paged() {
            self.free_aggrs()?;
        }
        self.close_shrink_eoa()?;

        if self.config.persist {
            self.settling = true;
            let result = self.persist_managers(ext);
            self.settling = false;
            result?;
        } else {
            for cat in FsCategory::ALL {
                self.close_delete(cat)?;
            }
            for (manager, state) in self.managers.iter_mut().zip(self.fs_state.iter_mut()) {
                *manager = None;
                *state = ManagerState::Closed;
            }
            let mut msg = FsInfoMessage::from_config(&self.config);
            msg.last_small = self.last_small;
            ext.fsinfo = Some(msg);
        }

        if !self.config.is_paged() {
            self.free_aggrs()?;
        }
        self.close_shrink_eoa()?;
        info!("Closed allocator at eoa {:#x}", self.space.eoa());
        Ok(())
    }

    fn persist_managers(&mut self, ext: &mut SuperblockExtension) -> Result<()> {
        for cat in FsCategory::ALL {
            self.open_if_persisted(cat)?;
        }

        // Old storage goes back to the free space before new storage is laid out
        for cat in FsCategory::ALL {
            let i = cat.index();
            let Some(fs) = self.managers[i].as_mut() else {
                continue;
            };
            let storage = fs.take_storage();
            self.fs_addr[i] = UNDEF_ADDR;
            self.xfree(MemType::FSPACE_HDR, storage.header_addr, storage.header_size)?;
            self.xfree(MemType::FSPACE_SINFO, storage.sect_addr, storage.alloc_sect_size)?;
        }
        self.close_shrink_eoa()?;
        self.alloc_fsm()?;

        let mut msg = FsInfoMessage::from_config(&self.config);
        msg.last_small = self.last_small;
        for cat in FsCategory::ALL {
            let i = cat.index();
            if let Some(fs) = self.managers[i].take() {
                if addr_defined(fs.header_addr()) {
                    fs.write(self.driver.as_ref())?;
                    self.fs_addr[i] = fs.header_addr();
                    msg.set_fs_addr(cat, fs.header_addr());
                }
            }
            self.fs_state[i] = ManagerState::Closed;
        }
        ext.fsinfo = Some(msg);
        Ok(())
    }

    /// Allocate header and section info storage for every manager that
    /// holds sections, repeating until no manager needs more
    fn alloc_fsm(&mut self) -> Result<()> {
        for round in 0..MAX_SETTLE_ROUNDS {
            let mut changed = false;
            for cat in FsCategory::ALL.into_iter().rev() {
                changed |= self.realloc_fs_for_persistence(cat)?;
            }
            if !changed {
                debug!("Manager storage settled after {} rounds", round + 1);
                return Ok(());
            }
        }
        Err(Error::inconsistent(format!(
            "free-space manager storage did not settle in {MAX_SETTLE_ROUNDS} rounds"
        )))
    }

    fn realloc_fs_for_persistence(&mut self, cat: FsCategory) -> Result<bool> {
        let Some(fs) = self.managers[cat.index()].as_ref() else {
            return Ok(false);
        };
        let mut changed = false;

        if !fs.is_empty() && !addr_defined(fs.header_addr()) {
            let addr = self.allocate(MemType::FSPACE_HDR, FreeSpace::header_size(self.widths))?;
            self.manager_mut(cat)?.set_header_addr(addr);
            changed = true;
        }

        let fs = self.manager_mut(cat)?;
        if !addr_defined(fs.header_addr()) || fs.is_empty() {
            return Ok(changed);
        }
        if !addr_defined(fs.sect_addr()) || fs.sinfo_needs_realloc() {
            let (old_addr, old_size) = (fs.sect_addr(), fs.alloc_sect_size());
            fs.set_sinfo_storage(UNDEF_ADDR, 0);
            self.xfree(MemType::FSPACE_SINFO, old_addr, old_size)?;

            let size = self.manager_mut(cat)?.sinfo_alloc_size();
            let addr = self.allocate(MemType::FSPACE_SINFO, size)?;
            self.manager_mut(cat)?.set_sinfo_storage(addr, size);
            changed = true;
        }
        Ok(changed)
    }

    // ---- queries ----

    fn open_temporarily(&mut self, cats: &[FsCategory]) -> Result<Vec<FsCategory>> {
        let mut started = Vec::new();
        for &cat in cats {
            if self.open_if_persisted(cat)? {
                started.push(cat);
            }
        }
        Ok(started)
    }

    fn close_temporarily_opened(&mut self, started: &[FsCategory]) {
        for cat in started {
            self.managers[cat.index()] = None;
            self.fs_state[cat.index()] = ManagerState::Closed;
        }
    }

    /// Total free space and the metadata the managers occupy.
    ///
    /// Free space that would be trimmed from the end of the file at close
    /// is not counted.
    pub fn get_freespace(&mut self) -> Result<(u64, u64)> {
        let (ma_addr, mut ma_size) = self.meta_aggr.query();
        let (sda_addr, mut sda_size) = self.sdata_aggr.query();
        let started = self.open_temporarily(&FsCategory::ALL)?;

        let mut tot_fs = 0;
        let mut tot_meta = 0;
        let mut lasts = Vec::new();
        for fs in self.managers.iter().flatten() {
            tot_fs += fs.sect_stats().0;
            tot_meta += fs.meta_size();
            lasts.extend(fs.last_section());
        }

        let mut eoa = self.space.eoa();
        loop {
            let mut shrank = false;
            lasts.retain(|sect: &FreeSection| {
                if sect.end() == eoa {
                    eoa = sect.addr;
                    tot_fs -= sect.size;
                    shrank = true;
                    false
                } else {
                    true
                }
            });
            if ma_size > 0 && ma_addr + ma_size == eoa {
                eoa = ma_addr;
                ma_size = 0;
                shrank = true;
            }
            if sda_size > 0 && sda_addr + sda_size == eoa {
                eoa = sda_addr;
                sda_size = 0;
                shrank = true;
            }
            if !shrank {
                break;
            }
        }

        self.close_temporarily_opened(&started);
        Ok((tot_fs + ma_size + sda_size, tot_meta))
    }

    /// Free sections holding space of `mem` (all types for `Default`)
    pub fn get_free_sections(&mut self, mem: MemType) -> Result<Vec<SectionInfo>> {
        let cats: Vec<FsCategory> = if mem == MemType::Default {
            FsCategory::ALL.to_vec()
        } else if self.config.is_paged() {
            vec![
                self.category_for(mem, 1),
                self.category_for(mem, self.config.page_size),
            ]
        } else {
            vec![self.category_for(mem, 1)]
        };
        let started = self.open_temporarily(&cats)?;
        let mut sections = Vec::new();
        for cat in &cats {
            if let Some(fs) = &self.managers[cat.index()] {
                sections.extend(fs.section_infos());
            }
        }
        self.close_temporarily_opened(&started);
        Ok(sections)
    }
}
