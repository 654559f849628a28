//! Cache image
//!
//! At close, the whole metadata cache can be written as one contiguous
//! block so that the next open can prefetch every entry with a single read.
//! Allocating that block may itself change entries that describe file
//! space, so its length is settled by a bounded fixed-point loop.
//!
//! Block layout (little-endian, widths are the file's):
//! ```text
//! "MDCI" | version u8 | entry count u32
//! per entry:
//!   "MDEI" | type u8 | flags u8 | fd child count u16 | LRU rank i32
//!   | fd parent addr (addr) | entry addr (addr) | entry length (size)
//!   | payload
//! ```

use crate::allocator::Allocator;
use crate::cache::{CacheEntry, EntryKey, EntryKind, MetadataCache};
use crate::superblock::{CacheImageLocation, SuperblockExtension};
use bytes::{Buf, BufMut};
use metacache_common::{ByteWidths, Error, MemType, Result, UNDEF_ADDR, addr_defined};
use tracing::{debug, info};

/// Image block signature
pub const IMAGE_MAGIC: &[u8; 4] = b"MDCI";

/// Per-entry signature
pub const ENTRY_MAGIC: &[u8; 4] = b"MDEI";

/// Image block format version
pub const IMAGE_VERSION: u8 = 0;

/// Entry was dirty when the image was taken
pub const FLAG_DIRTY: u8 = 0x01;
/// Entry was on the LRU list
pub const FLAG_IN_LRU: u8 = 0x02;
/// Entry has flush-dependency children
pub const FLAG_IS_FD_PARENT: u8 = 0x04;
/// Entry has a flush-dependency parent
pub const FLAG_IS_FD_CHILD: u8 = 0x08;

const IMAGE_HEADER_LEN: usize = 4 + 1 + 4;

/// Bytes of per-entry header for the given widths
#[must_use]
pub const fn entry_header_len(widths: ByteWidths) -> usize {
    4 + 1 + 1 + 2 + 4 + 2 * widths.addr_len() + widths.size_len()
}

/// One entry of a cache image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageEntry {
    pub addr: u64,
    pub type_id: u8,
    pub dirty: bool,
    /// 1-based LRU position, -1 when not on the LRU list
    pub lru_rank: i32,
    pub fd_parent_addr: u64,
    pub fd_child_count: u16,
    /// Flush-dependency height; orders the block, not encoded
    pub fd_height: usize,
    pub image: Vec<u8>,
}

impl ImageEntry {
    const fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.dirty {
            flags |= FLAG_DIRTY;
        }
        if self.lru_rank > 0 {
            flags |= FLAG_IN_LRU;
        }
        if self.fd_child_count > 0 {
            flags |= FLAG_IS_FD_PARENT;
        }
        if addr_defined(self.fd_parent_addr) {
            flags |= FLAG_IS_FD_CHILD;
        }
        flags
    }
}

/// Encode a cache image block
pub fn encode_image(entries: &[ImageEntry], widths: ByteWidths) -> Result<Vec<u8>> {
    let count = u32::try_from(entries.len())
        .map_err(|_| Error::invalid_argument("too many entries for one cache image"))?;
    let payload: usize = entries.iter().map(|e| e.image.len()).sum();
    let mut buf =
        Vec::with_capacity(IMAGE_HEADER_LEN + entries.len() * entry_header_len(widths) + payload);
    buf.put_slice(IMAGE_MAGIC);
    buf.put_u8(IMAGE_VERSION);
    buf.put_u32_le(count);
    for entry in entries {
        buf.put_slice(ENTRY_MAGIC);
        buf.put_u8(entry.type_id);
        buf.put_u8(entry.flags());
        buf.put_u16_le(entry.fd_child_count);
        buf.put_i32_le(entry.lru_rank);
        widths.put_addr(&mut buf, entry.fd_parent_addr)?;
        widths.put_addr(&mut buf, entry.addr)?;
        widths.put_size(&mut buf, entry.image.len() as u64)?;
        buf.put_slice(&entry.image);
    }
    Ok(buf)
}

/// Decode a cache image block
pub fn decode_image(data: &[u8], widths: ByteWidths) -> Result<Vec<ImageEntry>> {
    let mut buf = data;
    if buf.remaining() < IMAGE_HEADER_LEN || &buf[..4] != IMAGE_MAGIC {
        return Err(Error::cannot_load("bad cache image signature"));
    }
    buf.advance(4);
    let version = buf.get_u8();
    if version != IMAGE_VERSION {
        return Err(Error::cannot_load(format!(
            "unsupported cache image version {version}"
        )));
    }
    let count = buf.get_u32_le();

    let header_len = entry_header_len(widths);
    let mut entries = Vec::new();
    for i in 0..count {
        if buf.remaining() < header_len || &buf[..4] != ENTRY_MAGIC {
            return Err(Error::cannot_load(format!("bad header for image entry {i}")));
        }
        buf.advance(4);
        let type_id = buf.get_u8();
        let flags = buf.get_u8();
        let fd_child_count = buf.get_u16_le();
        let lru_rank = buf.get_i32_le();
        let fd_parent_addr = widths.get_addr(&mut buf);
        let addr = widths.get_addr(&mut buf);
        let len = usize::try_from(widths.get_size(&mut buf))
            .map_err(|_| Error::cannot_load(format!("image entry {i} too large")))?;
        if buf.remaining() < len {
            return Err(Error::cannot_load(format!("image entry {i} is truncated")));
        }

        let in_lru = flags & FLAG_IN_LRU != 0;
        if in_lru != (lru_rank > 0)
            || (flags & FLAG_IS_FD_PARENT != 0) != (fd_child_count > 0)
            || (flags & FLAG_IS_FD_CHILD != 0) != addr_defined(fd_parent_addr)
            || !addr_defined(addr)
            || len == 0
        {
            return Err(Error::cannot_load(format!(
                "image entry {i} at {addr:#x} is inconsistent"
            )));
        }

        entries.push(ImageEntry {
            addr,
            type_id,
            dirty: flags & FLAG_DIRTY != 0,
            lru_rank,
            fd_parent_addr,
            fd_child_count,
            fd_height: 0,
            image: buf[..len].to_vec(),
        });
        buf.advance(len);
    }
    if buf.has_remaining() {
        return Err(Error::cannot_load(format!(
            "{} trailing bytes after cache image entries",
            buf.remaining()
        )));
    }
    Ok(entries)
}

/// Cache image bookkeeping held by the cache
#[derive(Debug)]
pub(crate) struct ImageState {
    /// Image block address, undefined when none is allocated
    pub addr: u64,
    /// Allocated block length
    pub len: u64,
    /// Length the current entries need
    pub computed_len: u64,
    /// Read the image before the next protect or insert
    pub load_pending: bool,
    /// Remove the image message and free the block once loaded
    pub delete_on_load: bool,
    /// Build an image at close
    pub generate: bool,
    /// Entries laid out by the last prepare
    pub entries: Vec<ImageEntry>,
}

impl ImageState {
    pub const fn new(generate: bool) -> Self {
        Self {
            addr: UNDEF_ADDR,
            len: 0,
            computed_len: 0,
            load_pending: false,
            delete_on_load: false,
            generate,
            entries: Vec::new(),
        }
    }
}

impl MetadataCache {
    /// Build or cancel the cache image ahead of close.
    ///
    /// A pending image is loaded first. Entries are serialized and the image
    /// block is allocated until its length stops changing; failing to settle
    /// within the configured rounds is an internal inconsistency.
    pub fn prepare_for_close(
        &mut self,
        alloc: &mut Allocator,
        ext: &mut SuperblockExtension,
    ) -> Result<()> {
        if self.image.load_pending {
            self.load_image(alloc, ext)?;
        }
        self.close_warning_received = true;
        if !self.image.generate {
            return Ok(());
        }

        let result = self.settle_image(alloc, ext);
        if result.is_err() {
            self.image.entries.clear();
        }
        result
    }

    fn settle_image(&mut self, alloc: &mut Allocator, ext: &mut SuperblockExtension) -> Result<()> {
        let write_message = self.config().image.write_superblock_message;
        if write_message {
            ext.cache_image = Some(CacheImageLocation::placeholder());
        }
        self.serialize_cache(alloc)?;
        let mut included = self.scan_entries(alloc.widths())?;
        if included == 0 {
            return self.cancel_image(alloc, ext);
        }

        let max_rounds = self.config().image.max_convergence_rounds;
        let mut converged = false;
        for round in 1..=max_rounds {
            let old_len = self.image.computed_len;
            self.release_block(alloc)?;
            let addr = alloc.allocate(MemType::Super, old_len)?;
            self.image.addr = addr;
            self.image.len = old_len;
            if write_message {
                ext.cache_image = Some(CacheImageLocation { addr, len: old_len });
            }

            let stale = self.invalidate_file_space_entries()?;
            self.serialize_cache(alloc)?;
            included = self.scan_entries(alloc.widths())?;
            debug!(
                "cache image round {}: {:#x}+{} -> {} bytes ({} entries re-serialized)",
                round, addr, old_len, self.image.computed_len, stale
            );
            if self.image.computed_len == old_len {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(Error::inconsistent(format!(
                "cache image length did not converge within {max_rounds} rounds"
            )));
        }
        if included == 0 {
            return self.cancel_image(alloc, ext);
        }

        self.image.entries = self.collect_image_entries()?;
        self.stats_mut().images_created += 1;
        info!(
            "Built cache image: {} entries, {} bytes at {:#x}",
            self.image.entries.len(),
            self.image.len,
            self.image.addr
        );
        Ok(())
    }

    /// No entries to save: drop the block and the message
    fn cancel_image(&mut self, alloc: &mut Allocator, ext: &mut SuperblockExtension) -> Result<()> {
        self.release_block(alloc)?;
        ext.cache_image = None;
        self.image.generate = false;
        self.image.entries.clear();
        debug!("cache image cancelled: no entries");
        Ok(())
    }

    fn release_block(&mut self, alloc: &mut Allocator) -> Result<()> {
        if addr_defined(self.image.addr) {
            alloc.xfree(MemType::Super, self.image.addr, self.image.len)?;
            self.image.addr = UNDEF_ADDR;
            self.image.len = 0;
        }
        Ok(())
    }

    /// Record image bookkeeping on every entry and compute the image length.
    ///
    /// Returns the number of entries the image will hold.
    fn scan_entries(&mut self, widths: ByteWidths) -> Result<usize> {
        let lru = self.lru_keys();
        let keys: Vec<EntryKey> = self.keys().collect();

        let mut ranks = Vec::with_capacity(lru.len());
        let mut rank = 0i32;
        for key in lru {
            // Markers take a rank so that gaps show where they were
            rank += 1;
            if self.entry(key).is_some_and(|e| !e.is_epoch_marker()) {
                ranks.push((key, rank));
            }
        }

        let mut len = IMAGE_HEADER_LEN as u64;
        let header = entry_header_len(widths) as u64;
        for &key in &keys {
            let entry = self.entry(key).ok_or_else(|| Error::inconsistent("stale index key"))?;
            let fd_parent_addr = match entry.flush_dep_parent() {
                Some(parent) => {
                    let parent = self.entry(parent).ok_or_else(|| {
                        Error::inconsistent(format!("flush-dependency parent of {key} missing"))
                    })?;
                    if !parent.is_pinned() {
                        return Err(Error::inconsistent(format!(
                            "flush-dependency parent at {:#x} is not pinned",
                            parent.addr()
                        )));
                    }
                    parent.addr()
                }
                None => UNDEF_ADDR,
            };
            let fd_child_count = u16::try_from(entry.flush_dep_top_children()).map_err(|_| {
                Error::inconsistent(format!("too many flush-dependency children on {key}"))
            })?;
            len += header + entry.on_disk_size() as u64;

            let e = self.entry_mut(key)?;
            e.include_in_image = true;
            e.image_dirty = e.is_dirty;
            e.lru_rank = -1;
            e.fd_parent_addr = fd_parent_addr;
            e.fd_child_count = fd_child_count;
        }
        for (key, rank) in ranks {
            self.entry_mut(key)?.lru_rank = rank;
        }
        self.image.computed_len = len;
        Ok(keys.len())
    }

    fn collect_image_entries(&self) -> Result<Vec<ImageEntry>> {
        let mut entries = Vec::new();
        for key in self.keys() {
            let Some(entry) = self.entry(key).filter(|e| e.include_in_image()) else {
                continue;
            };
            let image = entry
                .image()
                .filter(|_| entry.image_up_to_date())
                .ok_or_else(|| {
                    Error::inconsistent(format!("entry at {:#x} has no current image", entry.addr()))
                })?;
            entries.push(ImageEntry {
                addr: entry.addr(),
                type_id: entry.type_id(),
                dirty: entry.image_dirty(),
                lru_rank: entry.lru_rank(),
                fd_parent_addr: entry.fd_parent_addr(),
                fd_child_count: entry.fd_child_count(),
                fd_height: entry.flush_dep_height(),
                image: image.to_vec(),
            });
        }
        // Parents first, then LRU order, then entries off the LRU list
        entries.sort_by_key(|e| {
            (
                std::cmp::Reverse(e.fd_height),
                e.lru_rank <= 0,
                e.lru_rank,
                e.addr,
            )
        });
        Ok(entries)
    }

    /// Write the image block prepared by
    /// [`prepare_for_close`](Self::prepare_for_close)
    pub fn write_image(&mut self, alloc: &Allocator) -> Result<()> {
        if !self.image.generate || self.image.entries.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.image.entries);
        if !self.config().image.write_image_block {
            return Ok(());
        }
        let block = encode_image(&entries, alloc.widths())?;
        if block.len() as u64 != self.image.len {
            return Err(Error::inconsistent(format!(
                "cache image encodes to {} bytes, {} allocated",
                block.len(),
                self.image.len
            )));
        }
        alloc.driver().write_at(self.image.addr, &block)?;
        debug!("wrote cache image at {:#x}", self.image.addr);
        Ok(())
    }

    /// Load the image at `addr` before the next protect or insert.
    ///
    /// For a writable file the image is consumed: its message is removed
    /// and its block freed once loaded.
    pub fn load_image_on_next_protect(&mut self, addr: u64, len: u64, rw: bool) {
        self.image.addr = addr;
        self.image.len = len;
        self.image.load_pending = true;
        self.image.delete_on_load = rw;
    }

    /// Whether an image is waiting to be loaded
    #[must_use]
    pub const fn image_load_pending(&self) -> bool {
        self.image.load_pending
    }

    /// Read the pending image and rebuild its entries as prefetched entries
    pub fn load_image(
        &mut self,
        alloc: &mut Allocator,
        ext: &mut SuperblockExtension,
    ) -> Result<()> {
        if !self.image.load_pending {
            return Ok(());
        }
        self.image.load_pending = false;
        let rw = self.image.delete_on_load;
        if rw {
            ext.cache_image = None;
        }

        let len = usize::try_from(self.image.len)
            .map_err(|_| Error::cannot_load(format!("image length {} too large", self.image.len)))?;
        let mut block = vec![0; len];
        alloc.driver().read_at(self.image.addr, &mut block)?;
        let entries = decode_image(&block, alloc.widths())?;

        let mut loaded = Vec::with_capacity(entries.len());
        let mut dirty = 0u64;
        for image_entry in entries {
            let mut entry = CacheEntry::new(
                image_entry.addr,
                image_entry.image.len(),
                image_entry.type_id,
                EntryKind::Prefetched,
            );
            // A read-only file never writes these back
            entry.is_dirty = image_entry.dirty && rw;
            entry.image_dirty = image_entry.dirty;
            entry.lru_rank = image_entry.lru_rank;
            entry.fd_parent_addr = image_entry.fd_parent_addr;
            entry.fd_child_count = image_entry.fd_child_count;
            entry.image = Some(image_entry.image);
            if entry.is_dirty {
                dirty += 1;
            }
            let key = self.insert_prefetched(entry).map_err(|e| {
                Error::cannot_load(format!("image entry at {:#x}: {e}", image_entry.addr))
            })?;
            loaded.push((key, image_entry.lru_rank));
        }

        self.restore_lru_order(&loaded)?;
        self.restore_flush_dependencies(&loaded)?;

        let count = loaded.len() as u64;
        let stats = self.stats_mut();
        stats.images_loaded += 1;
        stats.prefetches += count;
        stats.dirty_prefetches += dirty;
        info!(
            "Loaded cache image: {} entries ({} dirty) from {:#x}",
            count, dirty, self.image.addr
        );

        if rw {
            alloc.xfree(MemType::Super, self.image.addr, self.image.len)?;
        }
        self.image.addr = UNDEF_ADDR;
        self.image.len = 0;
        Ok(())
    }

    /// Put loaded entries at the LRU tail in their recorded order
    fn restore_lru_order(&mut self, loaded: &[(EntryKey, i32)]) -> Result<()> {
        let mut ranked: Vec<(i32, EntryKey)> = loaded
            .iter()
            .filter(|(_, rank)| *rank > 0)
            .map(|(key, rank)| (*rank, *key))
            .collect();
        ranked.sort_unstable();
        if ranked.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::cannot_load("duplicate LRU rank in cache image"));
        }
        let unranked = loaded.iter().filter(|(_, rank)| *rank <= 0).map(|(key, _)| *key);
        let order: Vec<EntryKey> = ranked.into_iter().map(|(_, key)| key).chain(unranked).collect();
        self.move_to_lru_tail(&order);
        Ok(())
    }

    fn restore_flush_dependencies(&mut self, loaded: &[(EntryKey, i32)]) -> Result<()> {
        for &(child, _) in loaded {
            let Some(entry) = self.entry(child) else {
                continue;
            };
            let parent_addr = entry.fd_parent_addr();
            if !addr_defined(parent_addr) {
                continue;
            }
            let parent = self.lookup(parent_addr).ok_or_else(|| {
                Error::cannot_load(format!(
                    "flush-dependency parent at {parent_addr:#x} is not in the image"
                ))
            })?;
            self.create_flush_dependency(parent, child)
                .map_err(|e| Error::cannot_load(format!("flush dependency: {e}")))?;
        }
        for &(key, _) in loaded {
            if let Some(entry) = self.entry(key)
                && entry.flush_dep_top_children() != u32::from(entry.fd_child_count())
            {
                return Err(Error::cannot_load(format!(
                    "entry at {:#x} recorded {} flush-dependency children at height {}, found {}",
                    entry.addr(),
                    entry.fd_child_count(),
                    entry.flush_dep_height().saturating_sub(1),
                    entry.flush_dep_top_children()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{Blob, test_allocator};
    use crate::cache::{CacheClient, EntryInfo, InsertOptions, PreSerialize, SerializeContext};
    use metacache_common::{CacheConfig, CacheImageConfig};

    fn image_cache() -> MetadataCache {
        MetadataCache::new(CacheConfig {
            hash_table_len: 16,
            image: CacheImageConfig {
                generate_image: true,
                ..CacheImageConfig::default()
            },
        })
        .unwrap()
    }

    /// Describes file space; grows by `step` bytes each of the first
    /// `growths` times it is re-serialized after being invalidated
    struct SpaceMap {
        size: usize,
        step: usize,
        growths: u32,
        seen: u32,
    }

    impl CacheClient for SpaceMap {
        fn entry_type(&self) -> u8 {
            9
        }

        fn pre_serialize(
            &mut self,
            _ctx: &mut SerializeContext<'_>,
            _entry: &EntryInfo,
        ) -> Result<PreSerialize> {
            self.seen += 1;
            // The first pass sizes the entry as inserted
            if self.seen > 1 && self.growths > 0 {
                self.growths -= 1;
                self.size += self.step;
                return Ok(PreSerialize {
                    new_size: Some(self.size),
                    ..PreSerialize::unchanged()
                });
            }
            Ok(PreSerialize::unchanged())
        }

        fn serialize(&self, image: &mut [u8]) -> Result<()> {
            image.fill(0x5a);
            Ok(())
        }

        fn depends_on_file_space(&self) -> bool {
            true
        }
    }

    fn sample_entries() -> Vec<ImageEntry> {
        vec![
            ImageEntry {
                addr: 0x1000,
                type_id: 3,
                dirty: true,
                lru_rank: -1,
                fd_parent_addr: UNDEF_ADDR,
                fd_child_count: 1,
                fd_height: 1,
                image: vec![1, 2, 3],
            },
            ImageEntry {
                addr: 0x2000,
                type_id: 4,
                dirty: false,
                lru_rank: 2,
                fd_parent_addr: 0x1000,
                fd_child_count: 0,
                fd_height: 0,
                image: vec![9; 10],
            },
        ]
    }

    #[test]
    fn test_image_codec() {
        let widths = ByteWidths::new(4, 2).unwrap();
        let entries = sample_entries();
        let block = encode_image(&entries, widths).unwrap();
        assert_eq!(
            block.len(),
            IMAGE_HEADER_LEN + 2 * entry_header_len(widths) + 13
        );
        assert_eq!(&block[..4], IMAGE_MAGIC);

        let decoded = decode_image(&block, widths).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].fd_parent_addr, UNDEF_ADDR);
        assert_eq!(decoded[1].fd_parent_addr, 0x1000);
        assert_eq!(decoded[1].lru_rank, 2);
        assert!(decoded[0].dirty);
        assert_eq!(decoded[1].image, vec![9; 10]);
    }

    #[test]
    fn test_image_codec_rejects_oversized_entry() {
        let widths = ByteWidths::new(8, 2).unwrap();
        let mut entries = sample_entries();
        entries[1].image = vec![0; 70_000];
        assert!(matches!(
            encode_image(&entries, widths),
            Err(Error::InvalidArgument(_))
        ));
        entries[1].image.truncate(0xffff);
        let block = encode_image(&entries, widths).unwrap();
        assert_eq!(decode_image(&block, widths).unwrap()[1].image.len(), 0xffff);
    }

    #[test]
    fn test_image_codec_rejects_bad_input() {
        let widths = ByteWidths::default();
        let block = encode_image(&sample_entries(), widths).unwrap();

        let mut bad_magic = block.clone();
        bad_magic[0] = b'X';
        assert!(matches!(decode_image(&bad_magic, widths), Err(Error::CannotLoad(_))));

        assert!(matches!(
            decode_image(&block[..block.len() - 1], widths),
            Err(Error::CannotLoad(_))
        ));

        let mut trailing = block.clone();
        trailing.push(0);
        assert!(decode_image(&trailing, widths).is_err());

        let mut bad_version = block;
        bad_version[4] = 7;
        assert!(decode_image(&bad_version, widths).is_err());
    }

    #[test]
    fn test_image_round_trip_through_cache() {
        let mut alloc = test_allocator();
        let mut ext = SuperblockExtension::default();
        let mut cache = image_cache();

        let a_addr = alloc.allocate(MemType::OHdr, 32).unwrap();
        let b_addr = alloc.allocate(MemType::OHdr, 16).unwrap();
        let p_addr = alloc.allocate(MemType::BTree, 24).unwrap();
        let opts = InsertOptions::default();
        let a = cache.insert(a_addr, 32, Box::new(Blob { tag: 0xa }), opts).unwrap();
        let b = cache.insert(b_addr, 16, Box::new(Blob { tag: 0xb }), opts).unwrap();
        let p = cache.insert(p_addr, 24, Box::new(Blob { tag: 0xc }), opts).unwrap();
        cache.create_flush_dependency(p, a).unwrap();
        cache.insert_epoch_marker().unwrap();
        let driver = alloc.driver().clone();
        cache.flush(&mut alloc, driver.as_ref()).unwrap();

        // b becomes the only dirty entry and moves ahead of the marker
        let key = cache.protect(b_addr).unwrap();
        cache.unprotect(key, true).unwrap();

        cache.prepare_for_close(&mut alloc, &mut ext).unwrap();
        let location = ext.cache_image.unwrap();
        assert!(addr_defined(location.addr));
        assert_eq!(cache.stats().images_created, 1);
        assert_eq!(cache.entry(b).unwrap().lru_rank(), 1);
        assert_eq!(cache.entry(a).unwrap().lru_rank(), 3);
        assert_eq!(cache.entry(p).unwrap().lru_rank(), -1);
        assert_eq!(cache.entry(p).unwrap().fd_child_count(), 1);
        cache.write_image(&alloc).unwrap();

        let mut reloaded = image_cache();
        reloaded.load_image_on_next_protect(location.addr, location.len, true);
        assert!(reloaded.image_load_pending());
        reloaded.load_image(&mut alloc, &mut ext).unwrap();
        assert!(ext.cache_image.is_none());
        assert_eq!(reloaded.len(), 3);

        let a2 = reloaded.lookup(a_addr).unwrap();
        let b2 = reloaded.lookup(b_addr).unwrap();
        let p2 = reloaded.lookup(p_addr).unwrap();
        assert_eq!(reloaded.lru_keys(), vec![b2, a2]);
        assert_eq!(reloaded.entry(a2).unwrap().flush_dep_parent(), Some(p2));
        assert_eq!(reloaded.entry(p2).unwrap().flush_dep_height(), 1);
        assert!(reloaded.entry(p2).unwrap().is_pinned());
        assert!(reloaded.entry(b2).unwrap().is_dirty());
        assert!(!reloaded.entry(a2).unwrap().is_dirty());
        assert!(reloaded.entry(a2).unwrap().is_prefetched());
        assert_eq!(reloaded.entry(b2).unwrap().image(), Some(&[0xb; 16][..]));
        assert_eq!(reloaded.dirty_addrs(), vec![b_addr]);

        let stats = reloaded.stats();
        assert_eq!(stats.images_loaded, 1);
        assert_eq!(stats.prefetches, 3);
        assert_eq!(stats.dirty_prefetches, 1);

        let wrong_type = SpaceMap {
            size: 16,
            step: 0,
            growths: 0,
            seen: 0,
        };
        assert!(reloaded.deserialize_prefetched(b2, Box::new(wrong_type)).is_err());
        reloaded.deserialize_prefetched(b2, Box::new(Blob { tag: 0xb })).unwrap();
        assert!(!reloaded.entry(b2).unwrap().is_prefetched());
        assert_eq!(reloaded.client::<Blob>(b2).unwrap().tag, 0xb);
    }

    #[test]
    fn test_child_count_is_top_height_only() {
        let mut alloc = test_allocator();
        let mut ext = SuperblockExtension::default();
        let mut cache = image_cache();

        let mut addrs = Vec::new();
        for _ in 0..4 {
            addrs.push(alloc.allocate(MemType::OHdr, 16).unwrap());
        }
        let opts = InsertOptions::default();
        let mut keys = Vec::new();
        for (i, &addr) in addrs.iter().enumerate() {
            let blob = Blob { tag: i as u8 + 1 };
            keys.push(cache.insert(addr, 16, Box::new(blob), opts).unwrap());
        }
        // root -> mid -> leaf, and root -> side directly
        let (root, mid, leaf, side) = (keys[0], keys[1], keys[2], keys[3]);
        cache.create_flush_dependency(mid, leaf).unwrap();
        cache.create_flush_dependency(root, mid).unwrap();
        cache.create_flush_dependency(root, side).unwrap();
        assert_eq!(cache.entry(root).unwrap().flush_dep_height(), 2);
        assert_eq!(cache.entry(root).unwrap().flush_dep_children(), 2);

        cache.prepare_for_close(&mut alloc, &mut ext).unwrap();
        assert_eq!(cache.entry(root).unwrap().fd_child_count(), 1);
        assert_eq!(cache.entry(mid).unwrap().fd_child_count(), 1);
        assert_eq!(cache.entry(side).unwrap().fd_child_count(), 0);
        cache.write_image(&alloc).unwrap();

        let location = ext.cache_image.unwrap();
        let mut block = vec![0; location.len as usize];
        alloc.driver().read_at(location.addr, &mut block).unwrap();
        let decoded = decode_image(&block, alloc.widths()).unwrap();
        let root_image = decoded.iter().find(|e| e.addr == addrs[0]).unwrap();
        assert_eq!(root_image.fd_child_count, 1);

        let mut reloaded = image_cache();
        reloaded.load_image_on_next_protect(location.addr, location.len, true);
        reloaded.load_image(&mut alloc, &mut ext).unwrap();
        let root2 = reloaded.lookup(addrs[0]).unwrap();
        assert_eq!(reloaded.entry(root2).unwrap().flush_dep_height(), 2);
        assert_eq!(reloaded.entry(root2).unwrap().flush_dep_children(), 2);
        assert_eq!(reloaded.entry(root2).unwrap().fd_child_count(), 1);
    }

    #[test]
    fn test_read_only_load_keeps_image() {
        let mut alloc = test_allocator();
        let mut ext = SuperblockExtension::default();
        let mut cache = image_cache();
        let addr = alloc.allocate(MemType::OHdr, 8).unwrap();
        cache.insert(addr, 8, Box::new(Blob { tag: 1 }), InsertOptions::default()).unwrap();
        cache.prepare_for_close(&mut alloc, &mut ext).unwrap();
        cache.write_image(&alloc).unwrap();
        let location = ext.cache_image.unwrap();

        let mut reloaded = image_cache();
        reloaded.load_image_on_next_protect(location.addr, location.len, false);
        reloaded.load_image(&mut alloc, &mut ext).unwrap();
        assert_eq!(ext.cache_image, Some(location));
        let key = reloaded.lookup(addr).unwrap();
        assert!(reloaded.entry(key).unwrap().image_dirty());
        assert!(!reloaded.entry(key).unwrap().is_dirty());
        assert!(reloaded.dirty_addrs().is_empty());
    }

    #[test]
    fn test_image_length_converges() {
        let mut alloc = test_allocator();
        let mut ext = SuperblockExtension::default();
        let mut cache = image_cache();
        let addr = alloc.allocate(MemType::Super, 8).unwrap();
        let client = SpaceMap {
            size: 8,
            step: 8,
            growths: 1,
            seen: 0,
        };
        let key = cache.insert(addr, 8, Box::new(client), InsertOptions::default()).unwrap();

        cache.prepare_for_close(&mut alloc, &mut ext).unwrap();
        let widths = alloc.widths();
        let expected = (IMAGE_HEADER_LEN + entry_header_len(widths) + 16) as u64;
        assert_eq!(ext.cache_image.unwrap().len, expected);
        assert_eq!(cache.entry(key).unwrap().size(), 16);
        cache.write_image(&alloc).unwrap();
    }

    #[test]
    fn test_image_length_that_never_settles_fails() {
        let mut alloc = test_allocator();
        let mut ext = SuperblockExtension::default();
        let mut cache = image_cache();
        let addr = alloc.allocate(MemType::Super, 8).unwrap();
        let client = SpaceMap {
            size: 8,
            step: 8,
            growths: u32::MAX,
            seen: 0,
        };
        cache.insert(addr, 8, Box::new(client), InsertOptions::default()).unwrap();

        assert!(matches!(
            cache.prepare_for_close(&mut alloc, &mut ext),
            Err(Error::InconsistentState(_))
        ));
    }

    #[test]
    fn test_empty_cache_cancels_image() {
        let mut alloc = test_allocator();
        let mut ext = SuperblockExtension::default();
        let mut cache = image_cache();
        let eoa = alloc.eoa();
        cache.prepare_for_close(&mut alloc, &mut ext).unwrap();
        assert!(ext.cache_image.is_none());
        assert_eq!(cache.stats().images_created, 0);
        assert_eq!(alloc.eoa(), eoa);
        cache.write_image(&alloc).unwrap();
    }
}
