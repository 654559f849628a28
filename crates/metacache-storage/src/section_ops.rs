//! Section callbacks for the allocator's managers
//!
//! The allocator hands a [`SectionOps`] to every manager call. It decides
//! whether a freed section can give space back to the end of the file or
//! to one of the aggregators, and keeps paged sections inside their page.

use crate::address_space::AddressSpace;
use crate::aggregator::{AggrKind, Aggregator};
use crate::free_space::{AddAction, FreeSection, SectionClass, SectionPolicy};
use metacache_common::{MemType, Result};
use tracing::trace;

/// Per-call settings, computed by the allocator before borrowing its parts
#[derive(Clone, Copy, Debug)]
pub(crate) struct OpSettings {
    /// Page size when paging, else 0
    pub page_size: u64,
    /// Page-end metadata threshold
    pub pgend_thresh: u64,
    /// Type the space is accounted to
    pub alloc_type: MemType,
    /// Sections of this type may merge into the metadata aggregator
    pub merge_meta: bool,
    /// Sections of this type may merge into the small-data aggregator
    pub merge_raw: bool,
    /// A section may swallow an aggregator it touches
    pub allow_sect_absorb: bool,
    /// Only shrink the end of allocation, never into an aggregator
    pub eoa_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    Eoa,
    Aggr(AggrKind),
}

/// Section policy over the allocator's address space and aggregators
pub(crate) struct SectionOps<'a> {
    space: &'a mut AddressSpace,
    meta_aggr: &'a mut Aggregator,
    sdata_aggr: &'a mut Aggregator,
    settings: OpSettings,
    pending: Option<Pending>,
    /// Whole pages assembled from small sections, to be freed afterwards
    pub released: Vec<(u64, u64)>,
}

impl<'a> SectionOps<'a> {
    pub(crate) const fn new(
        space: &'a mut AddressSpace,
        meta_aggr: &'a mut Aggregator,
        sdata_aggr: &'a mut Aggregator,
        settings: OpSettings,
    ) -> Self {
        Self {
            space,
            meta_aggr,
            sdata_aggr,
            settings,
            pending: None,
            released: Vec::new(),
        }
    }

    fn aggr(&mut self, kind: AggrKind) -> &mut Aggregator {
        match kind {
            AggrKind::Meta => &mut *self.meta_aggr,
            AggrKind::SmallData => &mut *self.sdata_aggr,
        }
    }

    fn aggr_candidate(&self, sect: &FreeSection) -> Option<AggrKind> {
        if self.settings.eoa_only {
            return None;
        }
        if self.settings.merge_meta && self.meta_aggr.can_absorb(sect).is_some() {
            return Some(AggrKind::Meta);
        }
        if self.settings.merge_raw && self.sdata_aggr.can_absorb(sect).is_some() {
            return Some(AggrKind::SmallData);
        }
        None
    }

    const fn same_page(&self, first: &FreeSection, second: &FreeSection) -> bool {
        let page = self.settings.page_size;
        page > 0 && first.addr / page == (second.end() - 1) / page
    }
}

impl SectionPolicy for SectionOps<'_> {
    fn on_add(&mut self, sect: &mut FreeSection, returned_space: bool) -> Result<AddAction> {
        let page = self.settings.page_size;
        if sect.class != SectionClass::Small || page == 0 || self.settings.alloc_type.is_raw() {
            return Ok(AddAction::Keep);
        }
        let thresh = self.settings.pgend_thresh;
        let rem = sect.end() % page;
        if rem == 0 {
            if sect.size <= thresh && returned_space {
                trace!(addr = sect.addr, size = sect.size, "dropped page-end fragment");
                return Ok(AddAction::Drop);
            }
        } else {
            let prem = page - rem;
            if prem <= thresh {
                sect.size += prem;
            }
        }
        Ok(AddAction::Keep)
    }

    fn can_merge(&self, first: &FreeSection, second: &FreeSection) -> bool {
        if first.class != second.class || first.end() != second.addr {
            return false;
        }
        match first.class {
            SectionClass::Small => self.same_page(first, second),
            SectionClass::Simple | SectionClass::Large => true,
        }
    }

    fn merge(&mut self, first: FreeSection, second: FreeSection) -> Result<Option<FreeSection>> {
        let merged = FreeSection::new(first.addr, first.size + second.size, first.class);
        if merged.class == SectionClass::Small && merged.size == self.settings.page_size {
            self.released.push((merged.addr, merged.size));
            return Ok(None);
        }
        Ok(Some(merged))
    }

    fn can_shrink(&mut self, sect: &FreeSection) -> Result<bool> {
        let at_eoa = sect.end() == self.space.eoa();
        self.pending = match sect.class {
            SectionClass::Simple if at_eoa => Some(Pending::Eoa),
            SectionClass::Simple => self.aggr_candidate(sect).map(Pending::Aggr),
            SectionClass::Large => {
                (at_eoa && sect.size >= self.settings.page_size).then_some(Pending::Eoa)
            }
            SectionClass::Small => {
                (at_eoa && sect.size == self.settings.page_size).then_some(Pending::Eoa)
            }
        };
        Ok(self.pending.is_some())
    }

    fn shrink(&mut self, sect: FreeSection) -> Result<Option<FreeSection>> {
        match self.pending.take() {
            Some(Pending::Eoa) => {
                self.space.free(sect.addr, sect.size);
                Ok(None)
            }
            Some(Pending::Aggr(kind)) => {
                let allow = self.settings.allow_sect_absorb;
                let aggr = self.aggr(kind);
                if aggr.can_absorb(&sect).is_some() {
                    Ok(aggr.absorb(sect, allow))
                } else {
                    Ok(Some(sect))
                }
            }
            None => Ok(Some(sect)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(page_size: u64) -> OpSettings {
        OpSettings {
            page_size,
            pgend_thresh: 64,
            alloc_type: MemType::Super,
            merge_meta: true,
            merge_raw: false,
            allow_sect_absorb: true,
            eoa_only: false,
        }
    }

    #[test]
    fn test_simple_shrink_at_eoa() {
        let mut space = AddressSpace::new(4096, 1 << 30, 1, 1).unwrap();
        let mut meta = Aggregator::new(AggrKind::Meta, 2048, true);
        let mut sdata = Aggregator::new(AggrKind::SmallData, 2048, true);
        let mut ops = SectionOps::new(&mut space, &mut meta, &mut sdata, settings(0));

        let sect = FreeSection::new(4000, 96, SectionClass::Simple);
        assert!(ops.can_shrink(&sect).unwrap());
        assert_eq!(ops.shrink(sect).unwrap(), None);
        assert_eq!(space.eoa(), 4000);
    }

    #[test]
    fn test_simple_section_into_aggregator() {
        let mut space = AddressSpace::new(8192, 1 << 30, 1, 1).unwrap();
        let mut meta = Aggregator::new(AggrKind::Meta, 2048, true);
        meta.addr = 1000;
        meta.size = 100;
        let mut sdata = Aggregator::new(AggrKind::SmallData, 2048, true);

        let mut eoa_only = settings(0);
        eoa_only.eoa_only = true;
        let sect = FreeSection::new(900, 100, SectionClass::Simple);
        {
            let mut ops = SectionOps::new(&mut space, &mut meta, &mut sdata, eoa_only);
            assert!(!ops.can_shrink(&sect).unwrap());
        }

        let mut ops = SectionOps::new(&mut space, &mut meta, &mut sdata, settings(0));
        assert!(ops.can_shrink(&sect).unwrap());
        assert_eq!(ops.shrink(sect).unwrap(), None);
        assert_eq!((meta.addr, meta.size), (900, 200));
    }

    #[test]
    fn test_small_sections_merge_within_page() {
        let mut space = AddressSpace::new(1 << 16, 1 << 30, 4096, 1).unwrap();
        let mut meta = Aggregator::new(AggrKind::Meta, 2048, false);
        let mut sdata = Aggregator::new(AggrKind::SmallData, 2048, false);
        let mut ops = SectionOps::new(&mut space, &mut meta, &mut sdata, settings(4096));

        let a = FreeSection::new(4096, 1000, SectionClass::Small);
        let b = FreeSection::new(5096, 3096, SectionClass::Small);
        let across = FreeSection::new(8192, 10, SectionClass::Small);
        assert!(ops.can_merge(&a, &b));
        assert!(!ops.can_merge(&b, &across));

        // A full page goes back as a large block
        assert_eq!(ops.merge(a, b).unwrap(), None);
        assert_eq!(ops.released, vec![(4096, 4096)]);
    }

    #[test]
    fn test_small_page_end_threshold() {
        let mut space = AddressSpace::new(1 << 16, 1 << 30, 4096, 1).unwrap();
        let mut meta = Aggregator::new(AggrKind::Meta, 2048, false);
        let mut sdata = Aggregator::new(AggrKind::SmallData, 2048, false);
        let mut ops = SectionOps::new(&mut space, &mut meta, &mut sdata, settings(4096));

        // Ends 40 bytes short of the page end: widened to the boundary
        let mut sect = FreeSection::new(5000, 3152, SectionClass::Small);
        assert_eq!(ops.on_add(&mut sect, true).unwrap(), AddAction::Keep);
        assert_eq!(sect.end(), 8192);

        // 80 bytes short is past the threshold
        let mut sect = FreeSection::new(5000, 3112, SectionClass::Small);
        ops.on_add(&mut sect, true).unwrap();
        assert_eq!(sect.size, 3112);

        // Tiny piece right at the page end
        let mut sect = FreeSection::new(8192 - 32, 32, SectionClass::Small);
        assert_eq!(ops.on_add(&mut sect, true).unwrap(), AddAction::Drop);
        let mut sect = FreeSection::new(8192 - 32, 32, SectionClass::Small);
        assert_eq!(ops.on_add(&mut sect, false).unwrap(), AddAction::Keep);
    }
}
