//! File context
//!
//! Ties one file's driver, superblock, allocator and metadata cache
//! together. This is the surface the object layer above works against:
//! it allocates and frees file space, inserts and protects cache entries,
//! and at close builds the cache image and persists the free-space state.

use crate::allocator::Allocator;
use crate::cache::{CacheClient, EntryKey, InsertOptions, MetadataCache};
use crate::driver::FileDriver;
use crate::superblock::{SUPERBLOCK_RESERVED, Superblock};
use metacache_common::{
    CacheConfig, Error, FileSpaceConfig, MemType, Result, SectionInfo, addr_defined,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An open file
pub struct FileContext {
    driver: Arc<dyn FileDriver>,
    alloc: Allocator,
    cache: MetadataCache,
    superblock: Superblock,
    read_only: bool,
}

impl FileContext {
    /// Create a new file on `driver`, discarding anything it held
    pub fn create(
        driver: Arc<dyn FileDriver>,
        fs_config: FileSpaceConfig,
        cache_config: CacheConfig,
    ) -> Result<Self> {
        let widths = fs_config.widths()?;
        driver.set_len(0)?;
        let superblock = Superblock::new(widths);
        driver.write_at(0, &superblock.to_bytes()?)?;

        let alloc = Allocator::create(driver.clone(), fs_config)?;
        let cache = MetadataCache::new(cache_config)?;
        info!("Created file: eoa={:#x}", alloc.eoa());
        Ok(Self {
            driver,
            alloc,
            cache,
            superblock,
            read_only: false,
        })
    }

    /// Open an existing file.
    ///
    /// The encoding widths come from the superblock. A recorded cache image
    /// is loaded on the first protect or insert.
    pub fn open(
        driver: Arc<dyn FileDriver>,
        mut fs_config: FileSpaceConfig,
        cache_config: CacheConfig,
        read_only: bool,
    ) -> Result<Self> {
        let mut raw = vec![0; SUPERBLOCK_RESERVED as usize];
        driver.read_at(0, &mut raw)?;
        let superblock = Superblock::from_bytes(&raw)?;
        fs_config.sizeof_addr = superblock.widths.addr.into();
        fs_config.sizeof_size = superblock.widths.size.into();

        let alloc = Allocator::open(
            driver.clone(),
            fs_config,
            superblock.eoa,
            superblock.ext.fsinfo.as_ref(),
        )?;
        let mut cache = MetadataCache::new(cache_config)?;
        if let Some(image) = superblock.ext.cache_image {
            if addr_defined(image.addr) && addr_defined(image.len) {
                cache.load_image_on_next_protect(image.addr, image.len, !read_only);
            } else {
                warn!("Ignoring unfinished cache image message");
            }
        }
        info!(
            "Opened file: eoa={:#x} read_only={} cache_image={}",
            superblock.eoa,
            read_only,
            cache.image_load_pending()
        );
        Ok(Self {
            driver,
            alloc,
            cache,
            superblock,
            read_only,
        })
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub const fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    pub const fn allocator_mut(&mut self) -> &mut Allocator {
        &mut self.alloc
    }

    #[must_use]
    pub const fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub const fn cache_mut(&mut self) -> &mut MetadataCache {
        &mut self.cache
    }

    #[must_use]
    pub const fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::invalid_argument("file is open read-only"));
        }
        Ok(())
    }

    // ---- file space ----

    /// Allocate `size` bytes for `mem`
    pub fn allocate(&mut self, mem: MemType, size: u64) -> Result<u64> {
        self.check_writable()?;
        self.alloc.allocate(mem, size)
    }

    /// Return space to the allocator
    pub fn free(&mut self, mem: MemType, addr: u64, size: u64) -> Result<()> {
        self.check_writable()?;
        self.alloc.xfree(mem, addr, size)
    }

    /// Grow the block at `addr` in place by `extra` bytes
    pub fn try_extend(&mut self, mem: MemType, addr: u64, size: u64, extra: u64) -> Result<bool> {
        self.check_writable()?;
        self.alloc.try_extend(mem, addr, size, extra)
    }

    /// Temporary address for an object not yet placed in the file
    pub fn alloc_tmp(&mut self, size: u64) -> Result<u64> {
        self.alloc.alloc_tmp(size)
    }

    /// Total free space and the space free-space metadata occupies
    pub fn get_free_space_summary(&mut self) -> Result<(u64, u64)> {
        self.alloc.get_freespace()
    }

    /// Free sections for `mem`, or for every type with [`MemType::Default`]
    pub fn get_free_sections(&mut self, mem: MemType) -> Result<Vec<SectionInfo>> {
        self.alloc.get_free_sections(mem)
    }

    // ---- metadata cache ----

    fn load_pending_image(&mut self) -> Result<()> {
        if !self.cache.image_load_pending() {
            return Ok(());
        }
        self.cache.load_image(&mut self.alloc, &mut self.superblock.ext)?;
        if !self.read_only && self.superblock.ext.cache_image.is_none() {
            // The image block is free now and may be reused before close
            self.driver.write_at(0, &self.superblock.to_bytes()?)?;
            debug!("Removed cache image message from the superblock");
        }
        Ok(())
    }

    /// Insert a new dirty entry
    pub fn insert(
        &mut self,
        addr: u64,
        size: usize,
        client: Box<dyn CacheClient>,
        options: InsertOptions,
    ) -> Result<EntryKey> {
        self.check_writable()?;
        self.alloc.widths().check_size(size as u64)?;
        self.load_pending_image()?;
        self.cache.insert(addr, size, client, options)
    }

    /// Protect the entry at `addr`, loading a pending cache image first
    pub fn protect(&mut self, addr: u64) -> Result<EntryKey> {
        self.load_pending_image()?;
        self.cache.protect(addr)
    }

    /// Release a protected entry
    pub fn unprotect(&mut self, key: EntryKey, dirtied: bool) -> Result<()> {
        if dirtied {
            self.check_writable()?;
        }
        self.cache.unprotect(key, dirtied)
    }

    /// Bring every entry's image up to date
    pub fn serialize_cache(&mut self) -> Result<()> {
        self.cache.serialize_cache(&mut self.alloc)
    }

    /// Write every dirty entry
    pub fn flush(&mut self) -> Result<usize> {
        self.check_writable()?;
        self.cache.flush(&mut self.alloc, self.driver.as_ref())
    }

    /// Build the cache image, if configured, and write it
    pub fn build_and_persist_cache_image(&mut self) -> Result<()> {
        self.check_writable()?;
        self.cache
            .prepare_for_close(&mut self.alloc, &mut self.superblock.ext)?;
        self.cache.write_image(&self.alloc)
    }

    /// Close the file.
    ///
    /// A writable file gets its cache image, its dirty entries, its
    /// free-space state and finally its superblock written. Any failure
    /// fails the close; a superblock left unwritten means the next open
    /// sees no cache image.
    pub fn close(mut self) -> Result<()> {
        if self.read_only {
            self.cache.close();
            debug!("Closed read-only file");
            return Ok(());
        }

        self.build_and_persist_cache_image()?;
        self.flush()?;
        self.cache.close();
        self.alloc.close(&mut self.superblock.ext)?;

        self.superblock.eoa = self.alloc.eoa();
        let bytes = self.superblock.to_bytes()?;
        let result = self
            .driver
            .write_at(0, &bytes)
            .and_then(|()| self.driver.set_len(self.superblock.eoa))
            .and_then(|()| self.driver.sync());
        if let Err(e) = &result {
            warn!("Failed to write superblock at close: {}", e);
        }
        result?;
        info!("Closed file: eoa={:#x}", self.superblock.eoa);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::Blob;
    use crate::driver::MemDriver;
    use metacache_common::CacheImageConfig;

    #[test]
    fn test_create_close_reopen() {
        let driver = MemDriver::new();
        let mut file = FileContext::create(
            Arc::new(driver.clone()),
            FileSpaceConfig::default(),
            CacheConfig::default(),
        )
        .unwrap();
        let addr = file.allocate(MemType::OHdr, 40).unwrap();
        file.insert(addr, 40, Box::new(Blob { tag: 0x77 }), InsertOptions::default())
            .unwrap();
        file.close().unwrap();

        let mut buf = [0u8; 40];
        driver.read_at(addr, &mut buf).unwrap();
        assert_eq!(buf, [0x77; 40]);

        let file = FileContext::open(
            Arc::new(driver.clone()),
            FileSpaceConfig::default(),
            CacheConfig::default(),
            true,
        )
        .unwrap();
        assert!(file.is_read_only());
        assert!(!file.cache().image_load_pending());
        assert!(file.superblock().eoa >= addr + 40);
        assert_eq!(driver.len().unwrap(), file.superblock().eoa);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let driver = MemDriver::new();
        FileContext::create(
            Arc::new(driver.clone()),
            FileSpaceConfig::default(),
            CacheConfig::default(),
        )
        .unwrap()
        .close()
        .unwrap();

        let mut file = FileContext::open(
            Arc::new(driver),
            FileSpaceConfig::default(),
            CacheConfig::default(),
            true,
        )
        .unwrap();
        assert!(matches!(
            file.allocate(MemType::Draw, 8),
            Err(Error::InvalidArgument(_))
        ));
        assert!(file.flush().is_err());
        file.close().unwrap();
    }

    fn image_config() -> CacheConfig {
        CacheConfig {
            image: CacheImageConfig {
                generate_image: true,
                ..CacheImageConfig::default()
            },
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_loaded_image_is_dropped_from_superblock() {
        let driver = MemDriver::new();
        let open = |read_only| {
            FileContext::open(
                Arc::new(driver.clone()),
                FileSpaceConfig::default(),
                image_config(),
                read_only,
            )
            .unwrap()
        };

        let mut file = FileContext::create(
            Arc::new(driver.clone()),
            FileSpaceConfig::default(),
            image_config(),
        )
        .unwrap();
        let addr = file.allocate(MemType::OHdr, 40).unwrap();
        file.insert(addr, 40, Box::new(Blob { tag: 0x11 }), InsertOptions::default())
            .unwrap();
        file.close().unwrap();

        let image = open(true).superblock().ext.cache_image.unwrap();
        assert!(addr_defined(image.addr));

        let mut file = open(false);
        let key = file.protect(addr).unwrap();
        file.unprotect(key, false).unwrap();
        assert!(!open(true).cache().image_load_pending());

        // Reuse the freed image block, then go away without closing
        let reused = file.allocate(MemType::OHdr, image.len).unwrap();
        let len = usize::try_from(image.len).unwrap();
        file.insert(reused, len, Box::new(Blob { tag: 0x22 }), InsertOptions::default())
            .unwrap();
        file.flush().unwrap();
        drop(file);

        let mut file = open(false);
        assert!(!file.cache().image_load_pending());
        assert!(matches!(file.protect(addr), Err(Error::EntryNotFound(_))));
    }

    #[test]
    fn test_lengths_must_fit_encoding() {
        let mut file = FileContext::create(
            Arc::new(MemDriver::new()),
            FileSpaceConfig {
                sizeof_size: 2,
                ..FileSpaceConfig::default()
            },
            image_config(),
        )
        .unwrap();
        assert!(matches!(
            file.allocate(MemType::OHdr, 70_000),
            Err(Error::InvalidArgument(_))
        ));
        let addr = file.allocate(MemType::OHdr, 64).unwrap();
        assert!(matches!(
            file.insert(addr, 70_000, Box::new(Blob { tag: 1 }), InsertOptions::default()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(file.cache().is_empty());
        file.insert(addr, 64, Box::new(Blob { tag: 1 }), InsertOptions::default())
            .unwrap();
        file.close().unwrap();
    }

    #[test]
    fn test_open_rejects_garbage() {
        let driver = MemDriver::new();
        driver.write_at(0, b"not a superblock").unwrap();
        assert!(matches!(
            FileContext::open(
                Arc::new(driver),
                FileSpaceConfig::default(),
                CacheConfig::default(),
                false,
            ),
            Err(Error::CannotOpen(_))
        ));
    }
}
