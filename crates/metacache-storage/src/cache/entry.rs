//! Cache entries
//!
//! Entries live in an arena owned by the cache and refer to each other by
//! [`EntryKey`]. A key carries a generation so that a key kept past the
//! entry's expunge is rejected instead of aliasing whatever reuses the slot.

use super::SerializeContext;
use metacache_common::{Error, Result, UNDEF_ADDR};
use std::any::Any;
use std::fmt;

/// Number of distinct flush-dependency heights
pub const NUM_FLUSH_DEP_HEIGHTS: usize = 6;

/// Type id recorded for epoch markers
pub const EPOCH_MARKER_TYPE: u8 = u8::MAX;

/// Stable handle to a cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// What a pre-serialize hook changed about its own entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreSerialize {
    /// The entry now lives here
    pub new_addr: Option<u64>,
    /// The entry's uncompressed size changed
    pub new_size: Option<usize>,
    /// The entry's compressed size changed
    pub new_compressed_size: Option<usize>,
}

impl PreSerialize {
    /// Nothing changed
    #[must_use]
    pub const fn unchanged() -> Self {
        Self {
            new_addr: None,
            new_size: None,
            new_compressed_size: None,
        }
    }
}

/// Snapshot of an entry handed to its own hooks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: EntryKey,
    pub addr: u64,
    pub size: usize,
    pub compressed_size: Option<usize>,
    pub is_dirty: bool,
}

/// A metadata object held by the cache.
///
/// Implemented once per kind of metadata by the layer above the cache.
pub trait CacheClient: Any {
    /// Type id recorded in the cache image
    fn entry_type(&self) -> u8;

    /// Settle address and size before the image is computed.
    ///
    /// May allocate or free file space and insert, move, resize or dirty
    /// other entries through `ctx`.
    fn pre_serialize(
        &mut self,
        _ctx: &mut SerializeContext<'_>,
        _entry: &EntryInfo,
    ) -> Result<PreSerialize> {
        Ok(PreSerialize::unchanged())
    }

    /// Fill `image`, whose length is the entry's on-disk size
    fn serialize(&self, image: &mut [u8]) -> Result<()>;

    /// Whether the entry describes file space, so that allocating the cache
    /// image block leaves its image stale
    fn depends_on_file_space(&self) -> bool {
        false
    }

    /// The cache is being torn down
    fn notify_close(&mut self) {}
}

pub(crate) enum EntryKind {
    Client(Box<dyn CacheClient>),
    /// Client taken out while one of its hooks runs
    InHook,
    /// Loaded from a cache image, not yet claimed by its owner
    Prefetched,
    EpochMarker,
}

impl fmt::Debug for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(_) => f.write_str("Client"),
            Self::InHook => f.write_str("InHook"),
            Self::Prefetched => f.write_str("Prefetched"),
            Self::EpochMarker => f.write_str("EpochMarker"),
        }
    }
}

/// One cached metadata object and its bookkeeping
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) addr: u64,
    pub(crate) size: usize,
    pub(crate) compressed_size: Option<usize>,
    pub(crate) type_id: u8,
    pub(crate) image: Option<Vec<u8>>,
    pub(crate) image_up_to_date: bool,
    pub(crate) is_dirty: bool,
    pub(crate) is_protected: bool,
    pub(crate) pinned_from_client: bool,
    pub(crate) pinned_from_cache: bool,
    pub(crate) flush_me_last: bool,
    pub(crate) flush_in_progress: bool,
    pub(crate) in_lru: bool,
    pub(crate) in_slist: bool,
    pub(crate) flush_dep_parent: Option<EntryKey>,
    pub(crate) flush_dep_height: usize,
    pub(crate) child_flush_dep_height_rc: [u32; NUM_FLUSH_DEP_HEIGHTS],

    // Cache image bookkeeping
    pub(crate) include_in_image: bool,
    pub(crate) lru_rank: i32,
    pub(crate) image_dirty: bool,
    pub(crate) fd_parent_addr: u64,
    pub(crate) fd_child_count: u16,
    pub(crate) prefetched: bool,

    pub(crate) kind: EntryKind,
}

impl CacheEntry {
    pub(crate) fn new(addr: u64, size: usize, type_id: u8, kind: EntryKind) -> Self {
        Self {
            addr,
            size,
            compressed_size: None,
            type_id,
            image: None,
            image_up_to_date: false,
            is_dirty: false,
            is_protected: false,
            pinned_from_client: false,
            pinned_from_cache: false,
            flush_me_last: false,
            flush_in_progress: false,
            in_lru: false,
            in_slist: false,
            flush_dep_parent: None,
            flush_dep_height: 0,
            child_flush_dep_height_rc: [0; NUM_FLUSH_DEP_HEIGHTS],
            include_in_image: false,
            lru_rank: -1,
            image_dirty: false,
            fd_parent_addr: UNDEF_ADDR,
            fd_child_count: 0,
            prefetched: false,
            kind,
        }
    }

    pub(crate) fn epoch_marker() -> Self {
        Self::new(UNDEF_ADDR, 0, EPOCH_MARKER_TYPE, EntryKind::EpochMarker)
    }

    /// File address
    #[must_use]
    pub const fn addr(&self) -> u64 {
        self.addr
    }

    /// Uncompressed size
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Compressed size, for compressed entries
    #[must_use]
    pub const fn compressed_size(&self) -> Option<usize> {
        self.compressed_size
    }

    /// Bytes the entry occupies on disk
    #[must_use]
    pub fn on_disk_size(&self) -> usize {
        self.compressed_size.unwrap_or(self.size)
    }

    /// Type id
    #[must_use]
    pub const fn type_id(&self) -> u8 {
        self.type_id
    }

    /// Serialized image, once computed
    #[must_use]
    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    #[must_use]
    pub const fn image_up_to_date(&self) -> bool {
        self.image_up_to_date
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    #[must_use]
    pub const fn is_protected(&self) -> bool {
        self.is_protected
    }

    /// Pinned by its owner or by the cache (as a flush-dependency parent)
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pinned_from_client || self.pinned_from_cache
    }

    #[must_use]
    pub const fn flush_me_last(&self) -> bool {
        self.flush_me_last
    }

    #[must_use]
    pub const fn flush_dep_parent(&self) -> Option<EntryKey> {
        self.flush_dep_parent
    }

    /// 0 for a leaf, else one more than the tallest child
    #[must_use]
    pub const fn flush_dep_height(&self) -> usize {
        self.flush_dep_height
    }

    /// Number of direct children
    #[must_use]
    pub fn flush_dep_children(&self) -> u32 {
        self.child_flush_dep_height_rc.iter().sum()
    }

    /// Direct children one height below this entry
    #[must_use]
    pub fn flush_dep_top_children(&self) -> u32 {
        self.flush_dep_height
            .checked_sub(1)
            .map_or(0, |h| self.child_flush_dep_height_rc[h])
    }

    /// 1-based LRU position assigned by the last image scan, -1 if not on
    /// the LRU list
    #[must_use]
    pub const fn lru_rank(&self) -> i32 {
        self.lru_rank
    }

    /// Dirtiness recorded for the cache image
    #[must_use]
    pub const fn image_dirty(&self) -> bool {
        self.image_dirty
    }

    /// Whether the last image scan included this entry
    #[must_use]
    pub const fn include_in_image(&self) -> bool {
        self.include_in_image
    }

    /// Whether the entry was reconstructed from a cache image
    #[must_use]
    pub const fn is_prefetched(&self) -> bool {
        self.prefetched
    }

    /// Flush-dependency parent address recorded in the cache image
    #[must_use]
    pub const fn fd_parent_addr(&self) -> u64 {
        self.fd_parent_addr
    }

    /// Child count recorded in the cache image
    #[must_use]
    pub const fn fd_child_count(&self) -> u16 {
        self.fd_child_count
    }

    #[must_use]
    pub const fn is_epoch_marker(&self) -> bool {
        matches!(self.kind, EntryKind::EpochMarker)
    }

    /// On the LRU list: not protected and not pinned
    pub(crate) const fn lru_eligible(&self) -> bool {
        !self.is_protected && !self.is_pinned()
    }

    pub(crate) fn info(&self, key: EntryKey) -> EntryInfo {
        EntryInfo {
            key,
            addr: self.addr,
            size: self.size,
            compressed_size: self.compressed_size,
            is_dirty: self.is_dirty,
        }
    }

    pub(crate) fn client(&self) -> Option<&dyn CacheClient> {
        match &self.kind {
            EntryKind::Client(client) => Some(client.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn client_mut(&mut self) -> Option<&mut dyn CacheClient> {
        match &mut self.kind {
            EntryKind::Client(client) => Some(client.as_mut()),
            _ => None,
        }
    }

    /// Recompute the height from the child counters; true if it changed
    pub(crate) fn recompute_height(&mut self) -> bool {
        let height = self
            .child_flush_dep_height_rc
            .iter()
            .rposition(|count| *count > 0)
            .map_or(0, |h| h + 1);
        let changed = height != self.flush_dep_height;
        self.flush_dep_height = height;
        changed
    }
}

/// Slot in the entry arena
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub generation: u32,
    pub entry: Option<CacheEntry>,
}

/// Arena of entries with generation-checked keys
#[derive(Debug, Default)]
pub(crate) struct EntryArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl EntryArena {
    pub fn insert(&mut self, entry: CacheEntry) -> Result<EntryKey> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = Some(entry);
            return Ok(EntryKey {
                index,
                generation: slot.generation,
            });
        }
        let index = slot_index(self.slots.len())?;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Ok(EntryKey {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, key: EntryKey) -> Option<&CacheEntry> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, key: EntryKey) -> Option<&mut CacheEntry> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn remove(&mut self, key: EntryKey) -> Option<CacheEntry> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)?;
        let entry = slot.entry.take()?;
        self.free.push(key.index);
        Some(entry)
    }

    pub fn clear(&mut self) -> Vec<CacheEntry> {
        self.free.clear();
        let mut out = Vec::new();
        for (i, slot) in (0u32..).zip(self.slots.iter_mut()) {
            if let Some(entry) = slot.entry.take() {
                out.push(entry);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(i);
        }
        out
    }
}

fn slot_index(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::inconsistent(format!("entry arena is full at {len} slots")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_rejects_stale_keys() {
        let mut arena = EntryArena::default();
        let a = arena.insert(CacheEntry::epoch_marker()).unwrap();
        assert!(arena.get(a).is_some());
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());

        // Slot is reused under a new generation
        let b = arena.insert(CacheEntry::epoch_marker()).unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert!(arena.get_mut(b).is_some());
        assert_eq!(arena.clear().len(), 1);
        assert!(arena.get(b).is_none());
    }

    #[test]
    fn test_slot_index_limit() {
        assert_eq!(slot_index(7).unwrap(), 7);
        assert_eq!(slot_index(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            slot_index(u32::MAX as usize + 1),
            Err(Error::InconsistentState(_))
        ));
    }

    #[test]
    fn test_recompute_height() {
        let mut entry = CacheEntry::epoch_marker();
        assert!(!entry.recompute_height());
        entry.child_flush_dep_height_rc[0] = 2;
        entry.child_flush_dep_height_rc[2] = 1;
        assert!(entry.recompute_height());
        assert_eq!(entry.flush_dep_height(), 3);
        assert_eq!(entry.flush_dep_children(), 3);

        entry.child_flush_dep_height_rc[2] = 0;
        assert!(entry.recompute_height());
        assert_eq!(entry.flush_dep_height(), 1);
    }
}
