//! Block aggregators
//!
//! An aggregator reserves a block at the end of the file and carves small
//! requests out of its front, so many tiny metadata (or small raw-data)
//! allocations cost one address-space extension. The allocator owns two:
//! one for metadata and one for small raw data.

use crate::free_space::FreeSection;
use metacache_common::MemType;

/// Which aggregator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggrKind {
    /// Metadata aggregator
    Meta,
    /// Small raw-data aggregator
    SmallData,
}

impl AggrKind {
    /// Memory type space taken from this aggregator is accounted to
    #[must_use]
    pub const fn alloc_type(self) -> MemType {
        match self {
            Self::Meta => MemType::Default,
            Self::SmallData => MemType::Draw,
        }
    }

    /// The other aggregator
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Meta => Self::SmallData,
            Self::SmallData => Self::Meta,
        }
    }
}

/// How an absorbable section meets an aggregator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Absorb {
    /// The aggregator grows to cover the section
    AggrTakesSection,
    /// The section grows to cover the aggregator, which is emptied
    SectionTakesAggr,
}

/// Unused space reserved at the end of an allocation block
#[derive(Clone, Debug)]
pub struct Aggregator {
    kind: AggrKind,
    enabled: bool,
    /// Size of a fresh block
    pub alloc_size: u64,
    /// Total bytes reserved since the aggregator was last reset
    pub tot_size: u64,
    /// Start of the unused space (0 when never used)
    pub addr: u64,
    /// Bytes of unused space
    pub size: u64,
}

impl Aggregator {
    /// Create an empty aggregator
    #[must_use]
    pub const fn new(kind: AggrKind, alloc_size: u64, enabled: bool) -> Self {
        Self {
            kind,
            enabled,
            alloc_size,
            tot_size: 0,
            addr: 0,
            size: 0,
        }
    }

    /// Which aggregator this is
    #[must_use]
    pub const fn kind(&self) -> AggrKind {
        self.kind
    }

    /// Whether the file's strategy uses this aggregator
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// End of the unused space
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }

    /// Whether the unused space reaches `eoa`
    #[must_use]
    pub const fn at_eoa(&self, eoa: u64) -> bool {
        self.enabled && self.size > 0 && self.addr + self.size == eoa
    }

    /// Whether this aggregator has handed out more than one block's worth
    /// and holds at least a block of leftover
    #[must_use]
    pub const fn worth_releasing(&self, eoa: u64) -> bool {
        self.size > 0
            && self.addr + self.size == eoa
            && self.tot_size > self.size
            && self.tot_size - self.size >= self.alloc_size
    }

    /// How `sect` could be absorbed, if it touches the unused space
    #[must_use]
    pub const fn can_absorb(&self, sect: &FreeSection) -> Option<Absorb> {
        if !self.enabled {
            return None;
        }
        if sect.addr + sect.size != self.addr && self.addr + self.size != sect.addr {
            return None;
        }
        if self.size + sect.size >= self.alloc_size {
            Some(Absorb::SectionTakesAggr)
        } else {
            Some(Absorb::AggrTakesSection)
        }
    }

    /// Absorb `sect`.
    ///
    /// When the combined space reaches a block and the section may take the
    /// aggregator, the enlarged section is returned and the aggregator is
    /// emptied; otherwise the aggregator grows and `None` is returned.
    pub fn absorb(&mut self, mut sect: FreeSection, allow_sect_absorb: bool) -> Option<FreeSection> {
        if allow_sect_absorb && self.size + sect.size >= self.alloc_size {
            if sect.addr + sect.size != self.addr {
                sect.addr = self.addr;
            }
            sect.size += self.size;
            self.reset();
            Some(sect)
        } else {
            if sect.addr + sect.size == self.addr {
                self.addr -= sect.size;
            }
            self.size += sect.size;
            None
        }
    }

    /// Hand out `size` bytes from the front of the unused space
    pub fn take_front(&mut self, size: u64) -> u64 {
        let addr = self.addr;
        self.addr += size;
        self.size -= size;
        addr
    }

    /// Empty the aggregator, returning the unused `(addr, size)` it held
    pub fn reset(&mut self) -> (u64, u64) {
        let held = (self.addr, self.size);
        self.addr = 0;
        self.size = 0;
        self.tot_size = 0;
        held
    }

    /// Unused space as `(addr, size)`; zero size when disabled
    #[must_use]
    pub const fn query(&self) -> (u64, u64) {
        if self.enabled {
            (self.addr, self.size)
        } else {
            (0, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free_space::SectionClass;

    fn aggr(addr: u64, size: u64) -> Aggregator {
        let mut aggr = Aggregator::new(AggrKind::Meta, 2048, true);
        aggr.addr = addr;
        aggr.size = size;
        aggr.tot_size = size;
        aggr
    }

    #[test]
    fn test_can_absorb_adjacent_only() {
        let a = aggr(1000, 100);
        let before = FreeSection::new(900, 100, SectionClass::Simple);
        let after = FreeSection::new(1100, 50, SectionClass::Simple);
        let apart = FreeSection::new(1200, 50, SectionClass::Simple);
        assert_eq!(a.can_absorb(&before), Some(Absorb::AggrTakesSection));
        assert_eq!(a.can_absorb(&after), Some(Absorb::AggrTakesSection));
        assert_eq!(a.can_absorb(&apart), None);

        let big = FreeSection::new(1100, 4000, SectionClass::Simple);
        assert_eq!(a.can_absorb(&big), Some(Absorb::SectionTakesAggr));

        let disabled = Aggregator::new(AggrKind::SmallData, 2048, false);
        assert_eq!(disabled.can_absorb(&before), None);
    }

    #[test]
    fn test_aggregator_takes_section() {
        let mut a = aggr(1000, 100);
        let taken = a.absorb(FreeSection::new(900, 100, SectionClass::Simple), true);
        assert!(taken.is_none());
        assert_eq!((a.addr, a.size), (900, 200));

        let taken = a.absorb(FreeSection::new(1100, 10, SectionClass::Simple), true);
        assert!(taken.is_none());
        assert_eq!((a.addr, a.size), (900, 210));
    }

    #[test]
    fn test_section_takes_aggregator() {
        let mut a = aggr(1000, 100);
        let sect = a
            .absorb(FreeSection::new(1100, 3000, SectionClass::Simple), true)
            .unwrap();
        assert_eq!((sect.addr, sect.size), (1000, 3100));
        assert_eq!(a.query(), (0, 0));

        // Not allowed: the aggregator grows instead
        let mut a = aggr(1000, 100);
        assert!(a.absorb(FreeSection::new(1100, 3000, SectionClass::Simple), false).is_none());
        assert_eq!((a.addr, a.size), (1000, 3100));
    }

    #[test]
    fn test_take_front_and_reset() {
        let mut a = aggr(4096, 2048);
        assert_eq!(a.take_front(48), 4096);
        assert_eq!((a.addr, a.size), (4144, 2000));
        assert!(a.at_eoa(6144));
        assert_eq!(a.reset(), (4144, 2000));
        assert!(!a.at_eoa(6144));
    }
}
