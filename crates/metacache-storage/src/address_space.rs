//! File address space
//!
//! Tracks the end of allocation (EOA) and the temporary allocation region
//! that grows down from the top of the address space. Temporary addresses
//! are handed out while a cache image is being laid out and are never
//! written or freed.

use metacache_common::{Error, Result};
use tracing::trace;

/// The byte-addressable extent of one file
#[derive(Clone, Debug)]
pub struct AddressSpace {
    /// End of allocation
    eoa: u64,
    /// Lowest temporary address handed out so far
    tmp_addr: u64,
    /// Top of the address space
    max_addr: u64,
    /// Allocation alignment (1 = none)
    alignment: u64,
    /// Requests at least this large are aligned
    alignment_threshold: u64,
}

impl AddressSpace {
    /// Create an address space with the given initial EOA
    pub fn new(eoa: u64, max_addr: u64, alignment: u64, alignment_threshold: u64) -> Result<Self> {
        if alignment == 0 {
            return Err(Error::invalid_config("alignment must be at least 1"));
        }
        if eoa > max_addr {
            return Err(Error::out_of_space(0, eoa, max_addr));
        }
        Ok(Self {
            eoa,
            tmp_addr: max_addr,
            max_addr,
            alignment,
            alignment_threshold,
        })
    }

    /// Current end of allocation
    #[must_use]
    pub const fn eoa(&self) -> u64 {
        self.eoa
    }

    /// Lowest temporary address handed out so far
    #[must_use]
    pub const fn tmp_addr(&self) -> u64 {
        self.tmp_addr
    }

    /// Top of the address space
    #[must_use]
    pub const fn max_addr(&self) -> u64 {
        self.max_addr
    }

    /// Allocation alignment
    #[must_use]
    pub const fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Alignment threshold
    #[must_use]
    pub const fn alignment_threshold(&self) -> u64 {
        self.alignment_threshold
    }

    /// Whether `addr` lies in the temporary region
    #[must_use]
    pub const fn is_tmp_addr(&self, addr: u64) -> bool {
        addr >= self.tmp_addr
    }

    /// Bytes needed to align `addr` for a request of `size` bytes
    #[must_use]
    pub const fn fragment_for(&self, addr: u64, size: u64) -> u64 {
        if self.alignment > 1 && size >= self.alignment_threshold {
            let rem = addr % self.alignment;
            if rem > 0 { self.alignment - rem } else { 0 }
        } else {
            0
        }
    }

    /// Extend the EOA by `size` bytes.
    ///
    /// Returns the new block's address and, when alignment padded the
    /// start, the skipped `(addr, size)` fragment for the caller to free.
    pub fn alloc(&mut self, size: u64) -> Result<(u64, Option<(u64, u64)>)> {
        let frag = self.fragment_for(self.eoa, size);
        let addr = self.eoa + frag;
        let end = addr
            .checked_add(size)
            .filter(|end| *end <= self.tmp_addr)
            .ok_or_else(|| Error::out_of_space(size, self.eoa, self.tmp_addr))?;

        let fragment = (frag > 0).then_some((self.eoa, frag));
        trace!(addr, size, frag, "extended eoa to {end}");
        self.eoa = end;
        Ok((addr, fragment))
    }

    /// Extend the EOA by `size` bytes, ignoring alignment
    pub fn alloc_unaligned(&mut self, size: u64) -> Result<u64> {
        let addr = self.eoa;
        let end = addr
            .checked_add(size)
            .filter(|end| *end <= self.tmp_addr)
            .ok_or_else(|| Error::out_of_space(size, self.eoa, self.tmp_addr))?;
        self.eoa = end;
        Ok(addr)
    }

    /// Extend the block ending at `end` by `extra` bytes if it sits at EOA
    pub fn try_extend(&mut self, end: u64, extra: u64) -> Result<bool> {
        if end != self.eoa {
            return Ok(false);
        }
        let new_eoa = self
            .eoa
            .checked_add(extra)
            .filter(|new_eoa| *new_eoa <= self.tmp_addr)
            .ok_or_else(|| Error::out_of_space(extra, self.eoa, self.tmp_addr))?;
        self.eoa = new_eoa;
        Ok(true)
    }

    /// Give back `[addr, addr + size)` if it ends at EOA
    pub fn free(&mut self, addr: u64, size: u64) -> bool {
        if addr.checked_add(size) == Some(self.eoa) {
            self.eoa = addr;
            trace!(addr, size, "shrank eoa");
            true
        } else {
            false
        }
    }

    /// Hand out a temporary address below the previous one
    pub fn alloc_tmp(&mut self, size: u64) -> Result<u64> {
        match self.tmp_addr.checked_sub(size) {
            Some(addr) if addr > self.eoa => {
                self.tmp_addr = addr;
                Ok(addr)
            }
            _ => Err(Error::out_of_space(size, self.eoa, self.tmp_addr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free_at_eoa() {
        let mut space = AddressSpace::new(512, 1 << 20, 1, 1).unwrap();
        let (a, frag) = space.alloc(100).unwrap();
        assert_eq!((a, frag), (512, None));
        let (b, _) = space.alloc(50).unwrap();
        assert_eq!(b, 612);

        // Not at EOA
        assert!(!space.free(a, 100));
        assert!(space.free(b, 50));
        assert_eq!(space.eoa(), 612);
    }

    #[test]
    fn test_aligned_alloc_returns_fragment() {
        let mut space = AddressSpace::new(100, 1 << 20, 64, 32).unwrap();

        // Below the threshold nothing is aligned
        let (a, frag) = space.alloc(10).unwrap();
        assert_eq!((a, frag), (100, None));

        let (b, frag) = space.alloc(40).unwrap();
        assert_eq!(b, 128);
        assert_eq!(frag, Some((110, 18)));
        assert_eq!(space.eoa(), 168);

        assert_eq!(space.alloc_unaligned(40).unwrap(), 168);
        assert_eq!(space.eoa(), 208);
    }

    #[test]
    fn test_try_extend() {
        let mut space = AddressSpace::new(0, 1000, 1, 1).unwrap();
        let (a, _) = space.alloc(100).unwrap();
        assert!(!space.try_extend(a + 50, 10).unwrap());
        assert!(space.try_extend(a + 100, 10).unwrap());
        assert_eq!(space.eoa(), 110);
        assert!(matches!(
            space.try_extend(110, 1000),
            Err(Error::OutOfSpace { .. })
        ));
    }

    #[test]
    fn test_tmp_region_limits_eoa() {
        let mut space = AddressSpace::new(0, 1000, 1, 1).unwrap();
        let tmp = space.alloc_tmp(200).unwrap();
        assert_eq!(tmp, 800);
        assert!(space.is_tmp_addr(850));
        assert!(!space.is_tmp_addr(799));

        space.alloc(700).unwrap();
        assert!(matches!(space.alloc(200), Err(Error::OutOfSpace { .. })));
        assert!(space.alloc_tmp(100).is_err());
    }

    #[test]
    fn test_alloc_overflow() {
        let mut space = AddressSpace::new(10, u64::MAX - 1, 1, 1).unwrap();
        assert!(space.alloc(u64::MAX).is_err());
        assert_eq!(space.eoa(), 10);
    }
}
