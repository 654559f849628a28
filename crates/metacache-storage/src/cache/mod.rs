//! Metadata cache
//!
//! Holds the file's metadata objects between reads and writes and produces
//! their on-disk images in flush-dependency order.
//!
//! # Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     MetadataCache                        │
//! │  arena ── EntryKey ──┬── hash index (addr >> 3, chained) │
//! │                      ├── LRU list (head = most recent)   │
//! │                      └── dirty list (by address)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Epoch markers live only on the LRU list. Protected and pinned entries
//! are off the LRU list.
//!
//! # Serialization
//!
//! [`MetadataCache::serialize_cache`] walks the index once per
//! flush-dependency height, lowest first, so that a child's image is final
//! before its parent's is computed. A pre-serialize hook may restructure
//! the cache through its [`SerializeContext`]; when it inserts or loads an
//! entry, moves an entry other than itself, or changes a flush-dependency
//! height, the whole walk starts over. When it only moves itself, just its
//! hash bucket is rescanned.

mod entry;

pub use entry::{
    CacheClient, CacheEntry, EPOCH_MARKER_TYPE, EntryInfo, EntryKey, NUM_FLUSH_DEP_HEIGHTS,
    PreSerialize,
};
pub(crate) use entry::EntryKind;

use crate::allocator::Allocator;
use crate::cache_image::ImageState;
use crate::driver::FileDriver;
use entry::EntryArena;
use metacache_common::{CacheConfig, Error, Result, addr_defined};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

/// Options for a newly inserted entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// Pin the entry on behalf of its owner
    pub pin: bool,
    /// Serialize the entry after everything else
    pub flush_me_last: bool,
    /// On-disk size of a compressed entry
    pub compressed_size: Option<usize>,
}

/// Entry counts and byte totals
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheTotals {
    pub index_len: usize,
    pub index_size: usize,
    pub clean_size: usize,
    pub dirty_size: usize,
    pub dirty_len: usize,
    /// Entries on the LRU list, epoch markers included
    pub lru_len: usize,
    pub lru_size: usize,
    pub pinned_len: usize,
    pub pinned_size: usize,
}

impl CacheTotals {
    fn apply(&mut self, entry: &CacheEntry, add: bool) {
        if entry.is_epoch_marker() {
            return;
        }
        let adj = |total: &mut usize, delta: usize| {
            if add {
                *total += delta;
            } else {
                *total -= delta;
            }
        };
        let size = entry.size;
        adj(&mut self.index_len, 1);
        adj(&mut self.index_size, size);
        if entry.is_dirty {
            adj(&mut self.dirty_len, 1);
            adj(&mut self.dirty_size, size);
        } else {
            adj(&mut self.clean_size, size);
        }
        if entry.lru_eligible() {
            adj(&mut self.lru_size, size);
        }
        if entry.is_pinned() {
            adj(&mut self.pinned_len, 1);
            adj(&mut self.pinned_size, size);
        }
    }
}

/// Cache statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub insertions: u64,
    pub moves: u64,
    pub entries_serialized: u64,
    pub entries_flushed: u64,
    /// Serialization walks restarted from the lowest height
    pub index_scan_restarts: u64,
    /// Hash buckets rescanned after their entry moved
    pub bucket_scan_restarts: u64,
    pub images_created: u64,
    pub images_loaded: u64,
    pub prefetches: u64,
    pub dirty_prefetches: u64,
}

/// Status of one entry, as returned by [`CacheQuery::EntryStatus`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryStatus {
    pub key: EntryKey,
    pub size: usize,
    pub is_dirty: bool,
    pub is_protected: bool,
    pub is_pinned: bool,
    pub image_up_to_date: bool,
    pub flush_dep_height: usize,
    pub is_prefetched: bool,
}

/// Typed cache queries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheQuery {
    EntryStatus(u64),
    Totals,
    ImageLocation,
    SerializationInProgress,
}

/// Answer to a [`CacheQuery`], in the matching variant
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheQueryResult {
    EntryStatus(Option<EntryStatus>),
    Totals(CacheTotals),
    ImageLocation(Option<(u64, u64)>),
    SerializationInProgress(bool),
}

/// Changes a hook made that can invalidate the serialization walk
#[derive(Clone, Copy, Debug, Default)]
struct RestartCounters {
    loaded: u32,
    inserted: u32,
    relocated: u32,
    height_changes: u32,
}

/// The cache and allocator as seen from a pre-serialize hook.
///
/// Every structural change goes through here so that the walk can tell
/// whether it has to restart.
pub struct SerializeContext<'a> {
    cache: &'a mut MetadataCache,
    alloc: &'a mut Allocator,
    counters: RestartCounters,
}

impl SerializeContext<'_> {
    /// File-space allocator
    pub fn allocator(&mut self) -> &mut Allocator {
        self.alloc
    }

    /// Look up an entry by key
    #[must_use]
    pub fn entry(&self, key: EntryKey) -> Option<&CacheEntry> {
        self.cache.entry(key)
    }

    /// Look up an entry by address
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<EntryKey> {
        self.cache.lookup(addr)
    }

    /// Insert a new dirty entry
    pub fn insert(
        &mut self,
        addr: u64,
        size: usize,
        client: Box<dyn CacheClient>,
        options: InsertOptions,
    ) -> Result<EntryKey> {
        let key = self.cache.insert(addr, size, client, options)?;
        self.counters.inserted += 1;
        Ok(key)
    }

    /// Insert an entry read from the file
    pub fn load(
        &mut self,
        addr: u64,
        client: Box<dyn CacheClient>,
        image: Vec<u8>,
    ) -> Result<EntryKey> {
        let key = self.cache.insert_loaded(addr, client, image)?;
        self.counters.loaded += 1;
        Ok(key)
    }

    /// Move an entry to a new address
    pub fn move_entry(&mut self, old_addr: u64, new_addr: u64) -> Result<()> {
        self.cache.move_entry(old_addr, new_addr)?;
        self.counters.relocated += 1;
        Ok(())
    }

    /// Resize a pinned or protected entry
    pub fn resize(&mut self, key: EntryKey, new_size: usize) -> Result<()> {
        self.cache.resize(key, new_size)
    }

    /// Dirty a pinned or protected entry
    pub fn mark_dirty(&mut self, key: EntryKey) -> Result<()> {
        self.cache.mark_dirty(key)
    }

    pub fn pin(&mut self, key: EntryKey) -> Result<()> {
        self.cache.pin(key)
    }

    pub fn unpin(&mut self, key: EntryKey) -> Result<()> {
        self.cache.unpin(key)
    }

    pub fn create_flush_dependency(&mut self, parent: EntryKey, child: EntryKey) -> Result<()> {
        self.counters.height_changes += self.cache.add_flush_dep(parent, child)?;
        Ok(())
    }

    pub fn destroy_flush_dependency(&mut self, parent: EntryKey, child: EntryKey) -> Result<()> {
        self.counters.height_changes += self.cache.remove_flush_dep(parent, child)?;
        Ok(())
    }
}

/// In-memory metadata cache for one file
pub struct MetadataCache {
    config: CacheConfig,
    arena: EntryArena,
    buckets: Vec<Vec<EntryKey>>,
    lru: VecDeque<EntryKey>,
    slist: BTreeMap<u64, EntryKey>,
    totals: CacheTotals,
    stats: CacheStats,
    serialization_in_progress: bool,
    pub(crate) close_warning_received: bool,
    pub(crate) image: ImageState,
}

impl MetadataCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let image = ImageState::new(config.image.generate_image);
        Ok(Self {
            buckets: vec![Vec::new(); config.hash_table_len],
            config,
            arena: EntryArena::default(),
            lru: VecDeque::new(),
            slist: BTreeMap::new(),
            totals: CacheTotals::default(),
            stats: CacheStats::default(),
            serialization_in_progress: false,
            close_warning_received: false,
            image,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub(crate) const fn stats_mut(&mut self) -> &mut CacheStats {
        &mut self.stats
    }

    /// Entry counts and sizes
    #[must_use]
    pub fn totals(&self) -> CacheTotals {
        let mut totals = self.totals;
        totals.lru_len = self.lru.len();
        totals
    }

    /// Number of entries in the index
    #[must_use]
    pub const fn len(&self) -> usize {
        self.totals.index_len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.totals.index_len == 0
    }

    #[must_use]
    pub const fn serialization_in_progress(&self) -> bool {
        self.serialization_in_progress
    }

    #[must_use]
    pub fn entry(&self, key: EntryKey) -> Option<&CacheEntry> {
        self.arena.get(key)
    }

    /// Entry at `addr`
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<EntryKey> {
        self.buckets[self.bucket_of(addr)]
            .iter()
            .copied()
            .find(|key| self.arena.get(*key).is_some_and(|e| e.addr == addr))
    }

    /// The client object of an entry, if it is a `T`
    #[must_use]
    pub fn client<T: CacheClient>(&self, key: EntryKey) -> Option<&T> {
        let client: &dyn Any = self.arena.get(key)?.client()?;
        client.downcast_ref::<T>()
    }

    /// Mutable access to the client object of an entry, if it is a `T`
    pub fn client_mut<T: CacheClient>(&mut self, key: EntryKey) -> Option<&mut T> {
        let client: &mut dyn Any = self.arena.get_mut(key)?.client_mut()?;
        client.downcast_mut::<T>()
    }

    /// Keys on the LRU list, most recently used first
    #[must_use]
    pub fn lru_keys(&self) -> Vec<EntryKey> {
        self.lru.iter().copied().collect()
    }

    /// Addresses of dirty entries in ascending order
    #[must_use]
    pub fn dirty_addrs(&self) -> Vec<u64> {
        self.slist.keys().copied().collect()
    }

    /// Every indexed entry key, bucket by bucket
    pub fn keys(&self) -> impl Iterator<Item = EntryKey> + '_ {
        self.buckets.iter().flatten().copied()
    }

    /// Answer a typed query
    #[must_use]
    pub fn query(&self, query: CacheQuery) -> CacheQueryResult {
        match query {
            CacheQuery::EntryStatus(addr) => {
                CacheQueryResult::EntryStatus(self.lookup(addr).and_then(|key| {
                    self.arena.get(key).map(|e| EntryStatus {
                        key,
                        size: e.size,
                        is_dirty: e.is_dirty,
                        is_protected: e.is_protected,
                        is_pinned: e.is_pinned(),
                        image_up_to_date: e.image_up_to_date,
                        flush_dep_height: e.flush_dep_height,
                        is_prefetched: e.prefetched,
                    })
                }))
            }
            CacheQuery::Totals => CacheQueryResult::Totals(self.totals()),
            CacheQuery::ImageLocation => CacheQueryResult::ImageLocation(
                addr_defined(self.image.addr).then_some((self.image.addr, self.image.len)),
            ),
            CacheQuery::SerializationInProgress => {
                CacheQueryResult::SerializationInProgress(self.serialization_in_progress)
            }
        }
    }

    // ---- index, LRU and dirty list primitives ----

    #[allow(clippy::cast_possible_truncation)]
    fn bucket_of(&self, addr: u64) -> usize {
        ((addr >> 3) as usize) & (self.buckets.len() - 1)
    }

    fn get(&self, key: EntryKey) -> Result<&CacheEntry> {
        self.arena
            .get(key)
            .ok_or_else(|| Error::invalid_argument(format!("stale entry key {key}")))
    }

    /// Mutable access for bookkeeping that feeds neither totals nor lists
    pub(crate) fn entry_mut(&mut self, key: EntryKey) -> Result<&mut CacheEntry> {
        self.arena
            .get_mut(key)
            .ok_or_else(|| Error::invalid_argument(format!("stale entry key {key}")))
    }

    /// Move LRU members to the tail, in the given order
    pub(crate) fn move_to_lru_tail(&mut self, keys: &[EntryKey]) {
        for key in keys {
            if self.arena.get(*key).is_some_and(|e| e.in_lru) {
                self.lru.retain(|k| k != key);
                self.lru.push_back(*key);
            }
        }
    }

    /// Apply `f` to an entry, keeping totals and list membership in step
    fn update<R>(&mut self, key: EntryKey, f: impl FnOnce(&mut CacheEntry) -> R) -> Result<R> {
        let Self {
            arena,
            totals,
            lru,
            slist,
            ..
        } = self;
        let entry = arena
            .get_mut(key)
            .ok_or_else(|| Error::invalid_argument(format!("stale entry key {key}")))?;
        totals.apply(entry, false);
        let out = f(entry);
        totals.apply(entry, true);

        let want_lru = entry.lru_eligible();
        if want_lru != entry.in_lru {
            if want_lru {
                lru.push_front(key);
            } else {
                lru.retain(|k| *k != key);
            }
            entry.in_lru = want_lru;
        }
        if entry.is_dirty != entry.in_slist {
            if entry.is_dirty {
                slist.insert(entry.addr, key);
            } else {
                slist.remove(&entry.addr);
            }
            entry.in_slist = entry.is_dirty;
        }
        Ok(out)
    }

    fn index_insert(&mut self, key: EntryKey, addr: u64) {
        let bucket = self.bucket_of(addr);
        self.buckets[bucket].insert(0, key);
    }

    fn index_remove(&mut self, key: EntryKey, addr: u64) {
        let bucket = self.bucket_of(addr);
        self.buckets[bucket].retain(|k| *k != key);
    }

    /// Re-key an entry under a new address
    fn relocate(&mut self, key: EntryKey, new_addr: u64) -> Result<()> {
        let entry = self.get(key)?;
        let (old_addr, in_slist) = (entry.addr, entry.in_slist);
        self.index_remove(key, old_addr);
        if in_slist {
            self.slist.remove(&old_addr);
        }
        if let Some(entry) = self.arena.get_mut(key) {
            entry.addr = new_addr;
        }
        self.index_insert(key, new_addr);
        if in_slist {
            self.slist.insert(new_addr, key);
        }
        self.stats.moves += 1;
        Ok(())
    }

    fn add_entry(&mut self, entry: CacheEntry) -> Result<EntryKey> {
        let addr = entry.addr;
        self.totals.apply(&entry, true);
        let key = self.arena.insert(entry)?;
        self.index_insert(key, addr);
        self.update(key, |_| ())?;
        Ok(key)
    }

    fn check_new_addr(&self, addr: u64, size: usize) -> Result<()> {
        if !addr_defined(addr) {
            return Err(Error::invalid_argument("entry address is undefined"));
        }
        if size == 0 {
            return Err(Error::invalid_argument(format!("zero-size entry at {addr:#x}")));
        }
        if self.lookup(addr).is_some() {
            return Err(Error::invalid_argument(format!(
                "an entry already exists at {addr:#x}"
            )));
        }
        Ok(())
    }

    // ---- entry operations ----

    /// Insert a new, dirty entry
    pub fn insert(
        &mut self,
        addr: u64,
        size: usize,
        client: Box<dyn CacheClient>,
        options: InsertOptions,
    ) -> Result<EntryKey> {
        self.check_new_addr(addr, size)?;
        if options.compressed_size == Some(0) {
            return Err(Error::invalid_argument("zero compressed size"));
        }
        let mut entry = CacheEntry::new(addr, size, client.entry_type(), EntryKind::Client(client));
        entry.is_dirty = true;
        entry.pinned_from_client = options.pin;
        entry.flush_me_last = options.flush_me_last;
        entry.compressed_size = options.compressed_size;
        let key = self.add_entry(entry)?;
        self.stats.insertions += 1;
        trace!("insert: {} at {:#x}, {} bytes", key, addr, size);
        Ok(key)
    }

    /// Insert a clean entry whose current image was just read from the file
    pub fn insert_loaded(
        &mut self,
        addr: u64,
        client: Box<dyn CacheClient>,
        image: Vec<u8>,
    ) -> Result<EntryKey> {
        self.check_new_addr(addr, image.len())?;
        let mut entry =
            CacheEntry::new(addr, image.len(), client.entry_type(), EntryKind::Client(client));
        entry.image = Some(image);
        entry.image_up_to_date = true;
        let key = self.add_entry(entry)?;
        trace!("load: {} at {:#x}", key, addr);
        Ok(key)
    }

    /// Insert an entry reconstructed from a cache image, at the LRU tail
    pub(crate) fn insert_prefetched(&mut self, mut entry: CacheEntry) -> Result<EntryKey> {
        self.check_new_addr(entry.addr, entry.size)?;
        entry.kind = EntryKind::Prefetched;
        entry.prefetched = true;
        entry.image_up_to_date = true;
        let key = self.add_entry(entry)?;
        if self.arena.get(key).is_some_and(|e| e.in_lru) {
            self.lru.retain(|k| *k != key);
            self.lru.push_back(key);
        }
        Ok(key)
    }

    /// Take exclusive access to the entry at `addr`
    pub fn protect(&mut self, addr: u64) -> Result<EntryKey> {
        let key = self.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        if self.get(key)?.is_protected {
            return Err(Error::invalid_argument(format!(
                "entry at {addr:#x} is already protected"
            )));
        }
        if self.close_warning_received {
            warn!("protect of {:#x} after the close warning", addr);
        }
        self.update(key, |e| e.is_protected = true)
            .map(|()| key)
    }

    /// Release an entry taken with [`protect`](Self::protect)
    pub fn unprotect(&mut self, key: EntryKey, dirtied: bool) -> Result<()> {
        if !self.get(key)?.is_protected {
            return Err(Error::invalid_argument(format!("{key} is not protected")));
        }
        self.update(key, |e| {
            e.is_protected = false;
            if dirtied {
                e.is_dirty = true;
                e.image_up_to_date = false;
            }
        })
    }

    /// Pin on behalf of the entry's owner
    pub fn pin(&mut self, key: EntryKey) -> Result<()> {
        if self.get(key)?.pinned_from_client {
            return Err(Error::invalid_argument(format!("{key} is already pinned")));
        }
        self.update(key, |e| e.pinned_from_client = true)
    }

    /// Drop the owner's pin
    pub fn unpin(&mut self, key: EntryKey) -> Result<()> {
        if !self.get(key)?.pinned_from_client {
            return Err(Error::invalid_argument(format!("{key} is not pinned")));
        }
        self.update(key, |e| e.pinned_from_client = false)
    }

    fn require_held(&self, key: EntryKey, op: &str) -> Result<()> {
        let entry = self.get(key)?;
        if entry.is_protected || entry.is_pinned() || entry.flush_in_progress {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "{op} of {key} requires it to be pinned or protected"
            )))
        }
    }

    /// Mark a pinned or protected entry dirty
    pub fn mark_dirty(&mut self, key: EntryKey) -> Result<()> {
        self.require_held(key, "mark_dirty")?;
        self.update(key, |e| {
            e.is_dirty = true;
            e.image_up_to_date = false;
        })
    }

    /// Mark a pinned or protected entry clean
    pub fn mark_clean(&mut self, key: EntryKey) -> Result<()> {
        self.require_held(key, "mark_clean")?;
        self.update(key, |e| e.is_dirty = false)
    }

    /// Change the size of a pinned or protected entry, dirtying it
    pub fn resize(&mut self, key: EntryKey, new_size: usize) -> Result<()> {
        self.require_held(key, "resize")?;
        if new_size == 0 {
            return Err(Error::invalid_argument(format!("resize of {key} to zero")));
        }
        if self.get(key)?.prefetched {
            return Err(Error::invalid_argument(format!(
                "{key} must be deserialized before it is resized"
            )));
        }
        self.update(key, |e| {
            e.size = new_size;
            e.is_dirty = true;
            e.image_up_to_date = false;
        })
    }

    /// Move the entry at `old_addr` to `new_addr`.
    ///
    /// The entry is dirtied unless its own serialization is under way.
    pub fn move_entry(&mut self, old_addr: u64, new_addr: u64) -> Result<()> {
        let key = self.lookup(old_addr).ok_or(Error::EntryNotFound(old_addr))?;
        if old_addr == new_addr {
            return Ok(());
        }
        if !addr_defined(new_addr) || self.lookup(new_addr).is_some() {
            return Err(Error::invalid_argument(format!(
                "cannot move {old_addr:#x} to {new_addr:#x}"
            )));
        }
        if self.get(key)?.is_protected {
            return Err(Error::invalid_argument(format!(
                "cannot move protected entry at {old_addr:#x}"
            )));
        }
        self.relocate(key, new_addr)?;
        self.update(key, |e| {
            if !e.flush_in_progress {
                e.is_dirty = true;
                e.image_up_to_date = false;
            }
        })?;
        debug!("moved entry {:#x} -> {:#x}", old_addr, new_addr);
        Ok(())
    }

    /// Remove the entry at `addr` without writing it
    pub fn expunge(&mut self, addr: u64) -> Result<Option<Box<dyn CacheClient>>> {
        let key = self.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        let entry = self.get(key)?;
        if entry.is_protected || entry.is_pinned() || entry.flush_in_progress {
            return Err(Error::invalid_argument(format!(
                "cannot expunge entry at {addr:#x}: protected, pinned or being serialized"
            )));
        }
        if entry.flush_dep_parent.is_some() {
            return Err(Error::invalid_argument(format!(
                "entry at {addr:#x} still has a flush-dependency parent"
            )));
        }
        let in_lru = entry.in_lru;
        if let Some(entry) = self.arena.get(key) {
            self.totals.apply(entry, false);
        }
        self.index_remove(key, addr);
        if in_lru {
            self.lru.retain(|k| *k != key);
        }
        self.slist.remove(&addr);
        let entry = self
            .arena
            .remove(key)
            .ok_or_else(|| Error::inconsistent(format!("{key} vanished during expunge")))?;
        trace!("expunge: {} at {:#x}", key, addr);
        Ok(match entry.kind {
            EntryKind::Client(client) => Some(client),
            _ => None,
        })
    }

    /// Hand a prefetched entry to its owner
    pub fn deserialize_prefetched(
        &mut self,
        key: EntryKey,
        client: Box<dyn CacheClient>,
    ) -> Result<()> {
        let entry = self.get(key)?;
        if !entry.prefetched {
            return Err(Error::invalid_argument(format!("{key} is not prefetched")));
        }
        if client.entry_type() != entry.type_id {
            return Err(Error::invalid_argument(format!(
                "{key} was prefetched as type {}, not {}",
                entry.type_id,
                client.entry_type()
            )));
        }
        self.update(key, |e| {
            e.kind = EntryKind::Client(client);
            e.prefetched = false;
        })
    }

    /// Add an epoch marker at the head of the LRU list
    pub fn insert_epoch_marker(&mut self) -> Result<EntryKey> {
        let mut marker = CacheEntry::epoch_marker();
        marker.in_lru = true;
        let key = self.arena.insert(marker)?;
        self.lru.push_front(key);
        Ok(key)
    }

    /// Remove an epoch marker
    pub fn remove_epoch_marker(&mut self, key: EntryKey) -> Result<()> {
        if !self.get(key)?.is_epoch_marker() {
            return Err(Error::invalid_argument(format!("{key} is not an epoch marker")));
        }
        self.lru.retain(|k| *k != key);
        self.arena.remove(key);
        Ok(())
    }

    // ---- flush dependencies ----

    /// Make `child`'s image a prerequisite of `parent`'s.
    ///
    /// The parent is pinned for as long as it has children.
    pub fn create_flush_dependency(&mut self, parent: EntryKey, child: EntryKey) -> Result<()> {
        self.add_flush_dep(parent, child).map(|_| ())
    }

    /// Undo [`create_flush_dependency`](Self::create_flush_dependency)
    pub fn destroy_flush_dependency(&mut self, parent: EntryKey, child: EntryKey) -> Result<()> {
        self.remove_flush_dep(parent, child).map(|_| ())
    }

    /// Returns how many entries changed height
    fn add_flush_dep(&mut self, parent: EntryKey, child: EntryKey) -> Result<u32> {
        if parent == child {
            return Err(Error::invalid_argument(format!("{parent} cannot depend on itself")));
        }
        let child_entry = self.get(child)?;
        if child_entry.is_epoch_marker() || self.get(parent)?.is_epoch_marker() {
            return Err(Error::invalid_argument("epoch markers take no flush dependencies"));
        }
        if child_entry.flush_dep_parent.is_some() {
            return Err(Error::invalid_argument(format!("{child} already has a parent")));
        }
        let child_height = child_entry.flush_dep_height;

        // Walk up from the parent: no cycle, and no height past the limit
        let mut depth = 0;
        let mut cursor = Some(parent);
        while let Some(key) = cursor {
            if key == child {
                return Err(Error::invalid_argument(format!(
                    "flush dependency {parent} -> {child} would form a cycle"
                )));
            }
            depth += 1;
            cursor = self.get(key)?.flush_dep_parent;
        }
        if child_height + depth >= NUM_FLUSH_DEP_HEIGHTS {
            return Err(Error::invalid_argument(format!(
                "flush dependency {parent} -> {child} exceeds height {}",
                NUM_FLUSH_DEP_HEIGHTS - 1
            )));
        }

        self.update(parent, |e| {
            e.pinned_from_cache = true;
            e.child_flush_dep_height_rc[child_height] += 1;
        })?;
        self.update(child, |e| e.flush_dep_parent = Some(parent))?;
        self.propagate_height(parent)
    }

    fn remove_flush_dep(&mut self, parent: EntryKey, child: EntryKey) -> Result<u32> {
        let child_entry = self.get(child)?;
        if child_entry.flush_dep_parent != Some(parent) {
            return Err(Error::invalid_argument(format!(
                "{child} is not a flush-dependency child of {parent}"
            )));
        }
        let child_height = child_entry.flush_dep_height;
        self.update(child, |e| e.flush_dep_parent = None)?;
        self.update(parent, |e| e.child_flush_dep_height_rc[child_height] -= 1)?;
        let changes = self.propagate_height(parent)?;
        if self.get(parent)?.flush_dep_children() == 0 {
            self.update(parent, |e| e.pinned_from_cache = false)?;
        }
        Ok(changes)
    }

    /// Recompute heights from `key` upward; returns how many changed
    fn propagate_height(&mut self, mut key: EntryKey) -> Result<u32> {
        let mut changes = 0;
        loop {
            let entry = self
                .arena
                .get_mut(key)
                .ok_or_else(|| Error::inconsistent(format!("{key} missing from arena")))?;
            let old = entry.flush_dep_height;
            if !entry.recompute_height() {
                return Ok(changes);
            }
            changes += 1;
            let new = entry.flush_dep_height;
            let Some(parent) = entry.flush_dep_parent else {
                return Ok(changes);
            };
            let parent_entry = self
                .arena
                .get_mut(parent)
                .ok_or_else(|| Error::inconsistent(format!("parent {parent} of {key} missing")))?;
            parent_entry.child_flush_dep_height_rc[old] -= 1;
            parent_entry.child_flush_dep_height_rc[new] += 1;
            key = parent;
        }
    }

    // ---- serialization ----

    /// Bring every entry's image up to date, in flush-dependency order
    pub fn serialize_cache(&mut self, alloc: &mut Allocator) -> Result<()> {
        if self.serialization_in_progress {
            return Err(Error::inconsistent("serialize_cache re-entered"));
        }
        self.serialization_in_progress = true;
        let result = self.serialize_all(alloc);
        self.serialization_in_progress = false;
        result
    }

    fn serialize_all(&mut self, alloc: &mut Allocator) -> Result<()> {
        let mut passes = 0u32;
        let mut restart_scan = true;
        while restart_scan {
            restart_scan = false;
            passes += 1;
            'heights: for height in 0..NUM_FLUSH_DEP_HEIGHTS {
                for bucket in 0..self.buckets.len() {
                    let mut pos = 0;
                    while let Some(&key) = self.buckets[bucket].get(pos) {
                        let entry = self.get(key)?;
                        let mut restart_bucket = false;
                        if !entry.flush_me_last
                            && entry.flush_dep_height == height
                            && !entry.image_up_to_date
                        {
                            let (scan, bucket_only) = self.serialize_one(alloc, key)?;
                            if scan {
                                self.stats.index_scan_restarts += 1;
                                restart_scan = true;
                                break 'heights;
                            }
                            if bucket_only {
                                self.stats.bucket_scan_restarts += 1;
                                restart_bucket = true;
                            }
                        }
                        pos = if restart_bucket {
                            0
                        } else {
                            self.buckets[bucket]
                                .iter()
                                .position(|k| *k == key)
                                .map_or(0, |p| p + 1)
                        };
                    }
                }
            }
        }

        // Flush-me-last entries may not restructure anything
        let last: Vec<EntryKey> = self
            .keys()
            .filter(|key| {
                self.arena
                    .get(*key)
                    .is_some_and(|e| e.flush_me_last && !e.image_up_to_date)
            })
            .collect();
        for key in last {
            let (scan, bucket_only) = self.serialize_one(alloc, key)?;
            if scan || bucket_only {
                return Err(Error::inconsistent(format!(
                    "serializing flush-me-last entry {key} restructured the cache"
                )));
            }
        }
        debug!("serialize_cache: done after {} passes", passes);
        Ok(())
    }

    /// Serialize one entry; returns `(restart_scan, restart_bucket)`
    fn serialize_one(&mut self, alloc: &mut Allocator, key: EntryKey) -> Result<(bool, bool)> {
        let result = self.serialize_one_inner(alloc, key);
        if let Some(entry) = self.arena.get_mut(key) {
            entry.flush_in_progress = false;
        }
        result
    }

    fn serialize_one_inner(&mut self, alloc: &mut Allocator, key: EntryKey) -> Result<(bool, bool)> {
        let entry = self
            .arena
            .get_mut(key)
            .ok_or_else(|| Error::inconsistent(format!("{key} vanished before serialization")))?;
        if entry.is_protected {
            return Err(Error::inconsistent(format!(
                "protected entry at {:#x} cannot be serialized",
                entry.addr
            )));
        }
        entry.flush_in_progress = true;
        let old_addr = entry.addr;
        if entry.image.is_none() {
            entry.image = Some(vec![0; entry.on_disk_size()]);
        }
        let info = entry.info(key);
        let kind = std::mem::replace(&mut entry.kind, EntryKind::InHook);

        let mut ctx = SerializeContext {
            cache: self,
            alloc,
            counters: RestartCounters::default(),
        };
        let (kind, pre) = match kind {
            EntryKind::Client(mut client) => {
                let pre = client.pre_serialize(&mut ctx, &info);
                (EntryKind::Client(client), pre)
            }
            other => (other, Ok(PreSerialize::unchanged())),
        };
        let mut counters = ctx.counters;
        let entry = self
            .arena
            .get_mut(key)
            .ok_or_else(|| Error::inconsistent(format!("{key} vanished during pre-serialize")))?;
        entry.kind = kind;
        let pre = pre?;

        if let Some(new_size) = pre.new_size {
            if new_size == 0 {
                return Err(Error::inconsistent(format!("{key} resized to zero")));
            }
            self.update(key, |e| e.size = new_size)?;
        }
        if let Some(compressed) = pre.new_compressed_size {
            self.update(key, |e| e.compressed_size = Some(compressed))?;
        }

        let mut target_moved = false;
        if let Some(new_addr) = pre.new_addr.filter(|addr| *addr != old_addr) {
            target_moved = true;
            let current = self.get(key)?.addr;
            if current == old_addr {
                if self.lookup(new_addr).is_some() {
                    return Err(Error::inconsistent(format!(
                        "{key} moved onto occupied address {new_addr:#x}"
                    )));
                }
                self.relocate(key, new_addr)?;
                counters.relocated += 1;
            } else if current != new_addr {
                return Err(Error::inconsistent(format!(
                    "{key} reported a move to {new_addr:#x} but sits at {current:#x}"
                )));
            }
        }

        let entry = self
            .arena
            .get_mut(key)
            .ok_or_else(|| Error::inconsistent(format!("{key} vanished during serialization")))?;
        let len = entry.on_disk_size();
        let mut image = entry.image.take().unwrap_or_default();
        image.resize(len, 0);
        let written = match &entry.kind {
            EntryKind::Client(client) => client.serialize(&mut image),
            // A prefetched image is kept byte for byte
            _ => Ok(()),
        };
        entry.image = Some(image);
        written?;
        entry.image_up_to_date = true;
        self.stats.entries_serialized += 1;

        let restart_scan = counters.loaded > 0
            || counters.inserted > 0
            || counters.relocated > 1
            || (counters.relocated > 0 && !target_moved)
            || counters.height_changes > 0;
        if restart_scan {
            debug!("serialize: {} restructured the cache ({:?})", key, counters);
        }
        Ok((restart_scan, target_moved))
    }

    /// Serialize, then write every dirty entry in address order
    pub fn flush(&mut self, alloc: &mut Allocator, driver: &dyn FileDriver) -> Result<usize> {
        self.serialize_cache(alloc)?;
        let dirty: Vec<(u64, EntryKey)> = self.slist.iter().map(|(a, k)| (*a, *k)).collect();
        for &(addr, key) in &dirty {
            if alloc.is_tmp_addr(addr) {
                return Err(Error::inconsistent(format!(
                    "dirty entry at temporary address {addr:#x}"
                )));
            }
            let entry = self.get(key)?;
            if entry.is_protected {
                return Err(Error::inconsistent(format!(
                    "flush of protected entry at {addr:#x}"
                )));
            }
            let image = entry
                .image
                .as_deref()
                .filter(|_| entry.image_up_to_date)
                .ok_or_else(|| Error::inconsistent(format!("no current image for {addr:#x}")))?;
            driver.write_at(addr, image)?;
            self.update(key, |e| e.is_dirty = false)?;
        }
        self.stats.entries_flushed += dirty.len() as u64;
        debug!("flush: wrote {} entries", dirty.len());
        Ok(dirty.len())
    }

    /// Tear down every entry, telling clients first
    pub fn close(&mut self) {
        for mut entry in self.arena.clear() {
            if let Some(client) = entry.client_mut() {
                client.notify_close();
            }
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.lru.clear();
        self.slist.clear();
        self.totals = CacheTotals::default();
    }

    /// Mark stale every entry whose client tracks file space
    pub(crate) fn invalidate_file_space_entries(&mut self) -> Result<usize> {
        let keys: Vec<EntryKey> = self
            .keys()
            .filter(|key| {
                self.arena
                    .get(*key)
                    .and_then(CacheEntry::client)
                    .is_some_and(|client| client.depends_on_file_space())
            })
            .collect();
        for key in &keys {
            self.update(*key, |e| {
                e.is_dirty = true;
                e.image_up_to_date = false;
            })?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::driver::MemDriver;
    use metacache_common::FileSpaceConfig;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    /// Fixed-size entry that writes its tag into every byte
    pub struct Blob {
        pub tag: u8,
    }

    impl CacheClient for Blob {
        fn entry_type(&self) -> u8 {
            1
        }

        fn serialize(&self, image: &mut [u8]) -> Result<()> {
            image.fill(self.tag);
            Ok(())
        }
    }

    type Log = Rc<RefCell<Vec<u64>>>;

    /// Records its address into a shared log when serialized
    struct Logged {
        addr: u64,
        log: Log,
    }

    impl CacheClient for Logged {
        fn entry_type(&self) -> u8 {
            2
        }

        fn serialize(&self, image: &mut [u8]) -> Result<()> {
            self.log.borrow_mut().push(self.addr);
            image.fill(0xab);
            Ok(())
        }
    }

    /// Inserts a new entry the first time it is pre-serialized
    struct Spawner {
        spawn_at: Option<u64>,
    }

    impl CacheClient for Spawner {
        fn entry_type(&self) -> u8 {
            3
        }

        fn pre_serialize(
            &mut self,
            ctx: &mut SerializeContext<'_>,
            _entry: &EntryInfo,
        ) -> Result<PreSerialize> {
            if let Some(addr) = self.spawn_at.take() {
                ctx.insert(addr, 16, Box::new(Blob { tag: 7 }), InsertOptions::default())?;
            }
            Ok(PreSerialize::unchanged())
        }

        fn serialize(&self, image: &mut [u8]) -> Result<()> {
            image.fill(3);
            Ok(())
        }
    }

    /// Moves and grows itself on its first pre-serialize
    struct Mover {
        to: Option<(u64, usize)>,
    }

    impl CacheClient for Mover {
        fn entry_type(&self) -> u8 {
            4
        }

        fn pre_serialize(
            &mut self,
            _ctx: &mut SerializeContext<'_>,
            _entry: &EntryInfo,
        ) -> Result<PreSerialize> {
            Ok(self.to.take().map_or(PreSerialize::unchanged(), |(addr, size)| PreSerialize {
                new_addr: Some(addr),
                new_size: Some(size),
                new_compressed_size: None,
            }))
        }

        fn serialize(&self, image: &mut [u8]) -> Result<()> {
            image.fill(4);
            Ok(())
        }
    }

    pub fn test_allocator() -> Allocator {
        Allocator::create(Arc::new(MemDriver::new()), FileSpaceConfig::default()).unwrap()
    }

    fn cache(hash_table_len: usize) -> MetadataCache {
        MetadataCache::new(CacheConfig {
            hash_table_len,
            ..CacheConfig::default()
        })
        .unwrap()
    }

    fn blob(tag: u8) -> Box<dyn CacheClient> {
        Box::new(Blob { tag })
    }

    #[test]
    fn test_insert_lookup_and_totals() {
        let mut cache = cache(8);
        let a = cache.insert(0x100, 32, blob(1), InsertOptions::default()).unwrap();
        let b = cache.insert(0x200, 64, blob(2), InsertOptions::default()).unwrap();
        assert_eq!(cache.lookup(0x100), Some(a));
        assert_eq!(cache.lookup(0x200), Some(b));
        assert_eq!(cache.lookup(0x300), None);
        assert_eq!(cache.client::<Blob>(b).unwrap().tag, 2);

        let totals = cache.totals();
        assert_eq!(totals.index_len, 2);
        assert_eq!(totals.index_size, 96);
        assert_eq!(totals.dirty_size, 96);
        assert_eq!(totals.lru_len, 2);
        assert_eq!(cache.lru_keys(), vec![b, a]);
        assert_eq!(cache.dirty_addrs(), vec![0x100, 0x200]);

        assert!(matches!(
            cache.insert(0x100, 8, blob(3), InsertOptions::default()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(cache.insert(0x400, 0, blob(3), InsertOptions::default()).is_err());
    }

    #[test]
    fn test_protect_pin_and_lru() {
        let mut cache = cache(8);
        let a = cache.insert(0x100, 32, blob(1), InsertOptions::default()).unwrap();
        let b = cache.insert(0x200, 32, blob(2), InsertOptions::default()).unwrap();

        let key = cache.protect(0x100).unwrap();
        assert_eq!(key, a);
        assert!(cache.protect(0x100).is_err());
        assert_eq!(cache.lru_keys(), vec![b]);
        cache.unprotect(a, false).unwrap();
        assert_eq!(cache.lru_keys(), vec![a, b]);

        cache.pin(b).unwrap();
        assert_eq!(cache.lru_keys(), vec![a]);
        assert_eq!(cache.totals().pinned_len, 1);
        cache.mark_clean(b).unwrap();
        assert_eq!(cache.dirty_addrs(), vec![0x100]);
        cache.unpin(b).unwrap();
        assert!(cache.unpin(b).is_err());
        assert_eq!(cache.totals().pinned_len, 0);

        // Neither pinned nor protected
        assert!(cache.mark_dirty(b).is_err());
        assert!(matches!(cache.protect(0x999), Err(Error::EntryNotFound(0x999))));
    }

    #[test]
    fn test_move_resize_and_expunge() {
        let mut cache = cache(8);
        let pinned = InsertOptions {
            pin: true,
            ..InsertOptions::default()
        };
        let a = cache.insert(0x100, 32, blob(1), pinned).unwrap();
        cache.move_entry(0x100, 0x800).unwrap();
        assert_eq!(cache.lookup(0x800), Some(a));
        assert_eq!(cache.lookup(0x100), None);
        assert_eq!(cache.dirty_addrs(), vec![0x800]);

        cache.resize(a, 100).unwrap();
        assert_eq!(cache.totals().index_size, 100);
        assert_eq!(cache.totals().pinned_size, 100);

        assert!(cache.expunge(0x800).is_err());
        cache.unpin(a).unwrap();
        let client = cache.expunge(0x800).unwrap().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.totals(), CacheTotals::default());
        assert!(cache.entry(a).is_none());
        drop(client);
    }

    #[test]
    fn test_flush_dependency_heights() {
        let mut cache = cache(8);
        let top = cache.insert(0x100, 8, blob(1), InsertOptions::default()).unwrap();
        let mid = cache.insert(0x200, 8, blob(2), InsertOptions::default()).unwrap();
        let leaf = cache.insert(0x300, 8, blob(3), InsertOptions::default()).unwrap();

        cache.create_flush_dependency(mid, leaf).unwrap();
        cache.create_flush_dependency(top, mid).unwrap();
        assert_eq!(cache.entry(top).unwrap().flush_dep_height(), 2);
        assert_eq!(cache.entry(mid).unwrap().flush_dep_height(), 1);
        assert!(cache.entry(top).unwrap().is_pinned());
        assert_eq!(cache.lru_keys(), vec![leaf]);

        // One parent per child, no cycles
        assert!(cache.create_flush_dependency(top, leaf).is_err());
        assert!(cache.create_flush_dependency(leaf, top).is_err());
        assert!(cache.expunge(0x300).is_err());

        cache.destroy_flush_dependency(mid, leaf).unwrap();
        assert_eq!(cache.entry(mid).unwrap().flush_dep_height(), 0);
        assert_eq!(cache.entry(top).unwrap().flush_dep_height(), 1);
        assert!(!cache.entry(mid).unwrap().is_pinned());
        assert!(cache.destroy_flush_dependency(mid, leaf).is_err());
    }

    #[test]
    fn test_serialize_children_before_parents() {
        let log: Log = Rc::default();
        let mut cache = cache(4);
        let mut alloc = test_allocator();
        let mut keys = Vec::new();
        for addr in [0x100u64, 0x208, 0x310, 0x418] {
            let client = Box::new(Logged {
                addr,
                log: log.clone(),
            });
            keys.push(cache.insert(addr, 16, client, InsertOptions::default()).unwrap());
        }
        // 0x100 <- 0x208 <- 0x310, and 0x418 standalone
        cache.create_flush_dependency(keys[0], keys[1]).unwrap();
        cache.create_flush_dependency(keys[1], keys[2]).unwrap();

        cache.serialize_cache(&mut alloc).unwrap();
        let order = log.borrow().clone();
        assert_eq!(order.len(), 4);
        let pos = |addr| order.iter().position(|a| *a == addr).unwrap();
        assert!(pos(0x310) < pos(0x208));
        assert!(pos(0x208) < pos(0x100));
        assert!(keys.iter().all(|k| cache.entry(*k).unwrap().image_up_to_date()));
        assert_eq!(cache.entry(keys[3]).unwrap().image(), Some(&[0xab; 16][..]));

        // Nothing stale: a second pass serializes nothing
        cache.serialize_cache(&mut alloc).unwrap();
        assert_eq!(log.borrow().len(), 4);
    }

    #[test]
    fn test_serialize_tallest_chain() {
        let log: Log = Rc::default();
        let mut cache = cache(4);
        let mut alloc = test_allocator();
        let addrs: Vec<u64> = (1..=NUM_FLUSH_DEP_HEIGHTS as u64).map(|i| i * 0x100).collect();
        let mut keys = Vec::new();
        for &addr in &addrs {
            let client = Box::new(Logged {
                addr,
                log: log.clone(),
            });
            keys.push(cache.insert(addr, 8, client, InsertOptions::default()).unwrap());
        }
        for pair in keys.windows(2) {
            cache.create_flush_dependency(pair[1], pair[0]).unwrap();
        }
        let top = keys[NUM_FLUSH_DEP_HEIGHTS - 1];
        assert_eq!(cache.entry(top).unwrap().flush_dep_height(), NUM_FLUSH_DEP_HEIGHTS - 1);
        let extra = cache.insert(0x8000, 8, blob(9), InsertOptions::default()).unwrap();
        assert!(cache.create_flush_dependency(extra, top).is_err());

        cache.serialize_cache(&mut alloc).unwrap();
        assert_eq!(*log.borrow(), addrs);
        assert!(cache.entry(top).unwrap().image_up_to_date());
    }

    #[test]
    fn test_insert_in_hook_restarts_scan() {
        let mut cache = cache(4);
        let mut alloc = test_allocator();
        cache
            .insert(
                0x100,
                8,
                Box::new(Spawner {
                    spawn_at: Some(0x900),
                }),
                InsertOptions::default(),
            )
            .unwrap();
        cache.serialize_cache(&mut alloc).unwrap();

        assert_eq!(cache.stats().index_scan_restarts, 1);
        let spawned = cache.lookup(0x900).unwrap();
        assert!(cache.entry(spawned).unwrap().image_up_to_date());
        assert_eq!(cache.entry(spawned).unwrap().image(), Some(&[7u8; 16][..]));
    }

    #[test]
    fn test_self_move_restarts_bucket_only() {
        let mut cache = cache(4);
        let mut alloc = test_allocator();
        let key = cache
            .insert(
                0x100,
                8,
                Box::new(Mover {
                    to: Some((0x2000, 24)),
                }),
                InsertOptions::default(),
            )
            .unwrap();
        cache.insert(0x108, 8, blob(9), InsertOptions::default()).unwrap();
        cache.serialize_cache(&mut alloc).unwrap();

        assert_eq!(cache.stats().index_scan_restarts, 0);
        assert_eq!(cache.stats().bucket_scan_restarts, 1);
        assert_eq!(cache.lookup(0x2000), Some(key));
        let entry = cache.entry(key).unwrap();
        assert_eq!(entry.size(), 24);
        assert_eq!(entry.image().unwrap().len(), 24);
        assert_eq!(cache.totals().index_size, 32);
        assert_eq!(cache.dirty_addrs(), vec![0x108, 0x2000]);
    }

    #[test]
    fn test_protected_entry_fails_serialization() {
        let mut cache = cache(4);
        let mut alloc = test_allocator();
        cache.insert(0x100, 8, blob(1), InsertOptions::default()).unwrap();
        cache.protect(0x100).unwrap();
        assert!(matches!(
            cache.serialize_cache(&mut alloc),
            Err(Error::InconsistentState(_))
        ));
        assert!(!cache.serialization_in_progress());
    }

    #[test]
    fn test_flush_writes_dirty_entries() {
        let driver = MemDriver::new();
        let mut cache = cache(4);
        let mut alloc = test_allocator();
        cache.insert(0x1000, 4, blob(0x11), InsertOptions::default()).unwrap();
        cache.insert(0x800, 2, blob(0x22), InsertOptions::default()).unwrap();
        assert_eq!(cache.flush(&mut alloc, &driver).unwrap(), 2);
        assert!(cache.dirty_addrs().is_empty());

        let mut buf = [0u8; 4];
        driver.read_at(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0x11; 4]);
        driver.read_at(0x800, &mut buf[..2]).unwrap();
        assert_eq!(&buf[..2], &[0x22; 2]);
        assert_eq!(cache.flush(&mut alloc, &driver).unwrap(), 0);
    }

    #[test]
    fn test_query_and_epoch_markers() {
        let mut cache = cache(4);
        let a = cache.insert(0x100, 8, blob(1), InsertOptions::default()).unwrap();
        let marker = cache.insert_epoch_marker().unwrap();
        assert_eq!(cache.lru_keys(), vec![marker, a]);
        assert_eq!(cache.totals().lru_len, 2);
        assert_eq!(cache.len(), 1);

        match cache.query(CacheQuery::EntryStatus(0x100)) {
            CacheQueryResult::EntryStatus(Some(status)) => {
                assert_eq!(status.key, a);
                assert!(status.is_dirty);
                assert!(!status.image_up_to_date);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            cache.query(CacheQuery::ImageLocation),
            CacheQueryResult::ImageLocation(None)
        );
        assert!(cache.remove_epoch_marker(a).is_err());
        cache.remove_epoch_marker(marker).unwrap();
        assert_eq!(cache.lru_keys(), vec![a]);
    }
}
