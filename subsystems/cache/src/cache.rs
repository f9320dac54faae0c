//! # Page Cache
//!
//! A keyed cache of page-sized buffers, one instance per block device or
//! file.
//!
//! ## Locking
//!
//! Each cache has one spinlock over its key map, address map and LRU list.
//! Page and range allocation, frame release and client callbacks all run
//! outside it. The timer sweep only ever try-locks, so a busy cache is
//! skipped for a tick rather than spun on in interrupt context.
//!
//! ## Page lifetime
//!
//! ```text
//! insert ──► refcount 1 ──release──► refcount 0 ──evict/trim/compact──► freed
//!                ▲                       │
//!                └──────lookup/pin───────┘
//! ```
//!
//! Dirty pages get a [`CallbackCause::Eviction`] callback before their frame
//! is freed.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use hashbrown::HashMap;
use helix_memory::{pages_for, PageAllocator, VirtualAddress, VirtualRangeAllocator, PAGE_SIZE};
use spin::{Mutex, RwLock};

use crate::checksum::Fletcher16;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::guard::CachePageGuard;
use crate::manager::CacheManager;
use crate::page::{CachePage, PageArena, PageFlags, SlotId};
use crate::writeback::{
    CallbackCause, Dispatched, Enqueued, JobOrigin, WriteBack, WriteBackFn, WriteBackJob,
    WriteBackQueue,
};

// =============================================================================
// Identity and Dependencies
// =============================================================================

/// Cache identifier, unique per manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(u64);

impl CacheId {
    pub(crate) const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache#{}", self.0)
    }
}

/// Allocators a cache draws its pages from
#[derive(Clone)]
pub struct MemoryBackend {
    /// Physical page frames
    pub frames: Arc<dyn PageAllocator>,
    /// Virtual address space for the frames
    pub ranges: Arc<dyn VirtualRangeAllocator>,
}

impl MemoryBackend {
    /// Bundle a frame allocator and a range allocator
    pub fn new(frames: Arc<dyn PageAllocator>, ranges: Arc<dyn VirtualRangeAllocator>) -> Self {
        Self { frames, ranges }
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Pages currently cached
    pub pages: usize,
    /// Lookups that found their key
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Pages inserted
    pub inserts: u64,
    /// Pages evicted
    pub evictions: u64,
    /// Write-back callbacks run
    pub writebacks: u64,
    /// Eviction callbacks run for dirty pages
    pub eviction_writebacks: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    eviction_writebacks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// What one timer sweep did to a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepOutcome {
    /// Lock contended; retried next tick
    Busy,
    /// Inside a start_atomic/end_atomic section
    Critical,
    /// Nothing to do (no callback, or unregistered)
    Idle,
    /// Checksums compared
    Swept {
        queued: usize,
        coalesced: usize,
    },
}

// =============================================================================
// Cache State
// =============================================================================

struct CacheState {
    /// Key to page
    index: HashMap<u64, SlotId>,
    /// Page address to page
    mapped: HashMap<u64, SlotId>,
    /// Pages in LRU order
    arena: PageArena,
    /// Serial for the next inserted page
    next_serial: u64,
}

impl CacheState {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            mapped: HashMap::new(),
            arena: PageArena::new(),
            next_serial: 0,
        }
    }

    fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    fn page(&self, key: u64) -> Option<&CachePage> {
        self.index.get(&key).and_then(|&id| self.arena.get(id))
    }

    fn page_mut(&mut self, key: u64) -> Option<&mut CachePage> {
        let id = *self.index.get(&key)?;
        self.arena.get_mut(id)
    }

    fn page_at(&self, address: VirtualAddress) -> Option<&CachePage> {
        self.mapped
            .get(&address.align_down().as_u64())
            .and_then(|&id| self.arena.get(id))
    }

    fn link(&mut self, page: CachePage) {
        let key = page.key();
        let location = page.location();
        let id = self.arena.insert(page);
        self.index.insert(key, id);
        self.mapped.insert(location.as_u64(), id);
    }

    fn unlink(&mut self, id: SlotId) -> CachePage {
        let page = self.arena.remove(id);
        self.index.remove(&page.key());
        self.mapped.remove(&page.location().as_u64());
        page
    }

    /// Unlink the first `limit` LRU pages that pass `filter`
    fn take_lru(&mut self, limit: usize, filter: impl Fn(&CachePage) -> bool) -> Vec<CachePage> {
        let victims: Vec<SlotId> = self
            .arena
            .lru()
            .filter(|(_, page)| filter(page))
            .map(|(id, _)| id)
            .take(limit)
            .collect();
        victims.into_iter().map(|id| self.unlink(id)).collect()
    }
}

/// Whether trim and compaction may take a page
fn evictable(page: &CachePage) -> bool {
    page.refcount() == 0 && !page.checksum_in_flux()
}

/// Key of the `index`th page of an insert at `key`
fn page_key(key: u64, index: usize) -> Option<u64> {
    (index as u64)
        .checked_mul(PAGE_SIZE as u64)
        .and_then(|offset| key.checked_add(offset))
}

/// Split `[address, address + len)` into per-page pieces:
/// (page address, offset in page, range in the caller's buffer)
fn spans(
    address: VirtualAddress,
    len: usize,
) -> impl Iterator<Item = (VirtualAddress, usize, Range<usize>)> {
    let mut done = 0;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let at = address + done as u64;
        let offset = at.page_offset();
        let chunk = (PAGE_SIZE - offset).min(len - done);
        let span = (at.align_down(), offset, done..done + chunk);
        done += chunk;
        Some(span)
    })
}

// =============================================================================
// Cache
// =============================================================================

/// A page cache
pub struct Cache {
    id: CacheId,
    config: CacheConfig,
    manager: Arc<CacheManager>,
    memory: MemoryBackend,
    state: Mutex<CacheState>,
    callback: RwLock<Option<Arc<WriteBackFn>>>,
    /// Nesting depth of start_atomic
    critical: AtomicUsize,
    registered: AtomicBool,
    /// Manager tick of the last insert or lookup
    last_activity: AtomicU64,
    self_ref: Weak<Cache>,
    counters: Counters,
}

impl Cache {
    /// Create a cache and register it with `manager`
    pub fn new(manager: &Arc<CacheManager>, memory: MemoryBackend, config: CacheConfig) -> Arc<Self> {
        let id = manager.next_cache_id();
        let cache = Arc::new_cyclic(|self_ref| Self {
            id,
            config,
            manager: manager.clone(),
            memory,
            state: Mutex::new(CacheState::new()),
            callback: RwLock::new(None),
            critical: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            last_activity: AtomicU64::new(manager.now()),
            self_ref: self_ref.clone(),
            counters: Counters::default(),
        });
        manager.register_cache(&cache);
        log::debug!("Cache: created '{}' ({})", cache.config.name, id);
        cache
    }

    /// Identifier
    pub fn id(&self) -> CacheId {
        self.id
    }

    /// Name from the configuration
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Manager this cache reports to
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Pages currently cached
    pub fn len(&self) -> usize {
        self.state.lock().arena.len()
    }

    /// Check if no page is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if `key` is cached, without touching it
    pub fn contains(&self, key: u64) -> bool {
        self.state.lock().index.contains_key(&key)
    }

    /// Current holders of `key`'s page
    pub fn refcount(&self, key: u64) -> Option<u32> {
        self.state.lock().page(key).map(CachePage::refcount)
    }

    /// Check if the manager still sweeps and trims this cache
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    /// Wait out any sweep holding the lock, then forget queued write-backs
    pub(crate) fn quiesce(&self) {
        let mut state = self.state.lock();
        for page in state.arena.pages_mut() {
            page.set_flags(PageFlags::CHECKSUM_IN_FLUX, false);
        }
    }

    pub(crate) fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn note_activity(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    /// Get statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            pages: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            writebacks: self.counters.writebacks.load(Ordering::Relaxed),
            eviction_writebacks: self.counters.eviction_writebacks.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Lookup and insertion
    // =========================================================================

    /// Find `key`'s page
    ///
    /// On a hit the page becomes most recently used and gains a holder; the
    /// caller must [`release`](Self::release) it.
    pub fn lookup(&self, key: u64) -> Option<VirtualAddress> {
        let now = self.manager.now();
        let location = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.index.get(&key).copied() {
                Some(id) => {
                    state.arena.promote(id);
                    state.arena.get_mut(id).map(|page| {
                        page.acquire();
                        page.touch(now);
                        page.location()
                    })
                },
                None => None,
            }
        };

        match location {
            Some(_) => {
                Counters::bump(&self.counters.hits, 1);
                self.note_activity(now);
            },
            None => Counters::bump(&self.counters.misses, 1),
        }
        location
    }

    /// [`lookup`](Self::lookup) returning a guard that releases on drop
    pub fn lookup_guarded(&self, key: u64) -> Option<CachePageGuard<'_>> {
        self.lookup(key)
            .map(|location| CachePageGuard::new(self, key, location))
    }

    /// Cache a new zeroed page under `key`
    ///
    /// The page starts with one holder.
    ///
    /// # Panics
    ///
    /// Panics if `key` is already cached. Callers look up first.
    pub fn insert(&self, key: u64) -> CacheResult<VirtualAddress> {
        self.insert_pages(key, 1, PageFlags::empty())
    }

    /// [`insert`](Self::insert) returning a guard that releases on drop
    pub fn insert_guarded(&self, key: u64) -> CacheResult<CachePageGuard<'_>> {
        self.insert(key)
            .map(|location| CachePageGuard::new(self, key, location))
    }

    /// Cache `size` bytes as one contiguous buffer
    ///
    /// Backs `pages_for(size)` frames with one virtual range. Page `i` is
    /// keyed `key + i * PAGE_SIZE` and each starts with one holder.
    ///
    /// # Panics
    ///
    /// Panics if any of the covered keys is already cached.
    pub fn insert_bulk(&self, key: u64, size: usize) -> CacheResult<VirtualAddress> {
        if size == 0 {
            return Err(CacheError::InvalidSize);
        }
        let count = pages_for(size);
        page_key(key, count - 1).ok_or(CacheError::InvalidSize)?;
        self.insert_pages(key, count, PageFlags::BULK)
    }

    fn insert_pages(&self, key: u64, count: usize, flags: PageFlags) -> CacheResult<VirtualAddress> {
        let keys = move || (0..count).filter_map(move |i| page_key(key, i));

        {
            let state = self.state.lock();
            if let Some(dup) = keys().find(|k| state.index.contains_key(k)) {
                drop(state);
                panic!("Cache: '{}' key {:#x} inserted twice", self.config.name, dup);
            }
        }

        if let Some(max) = self.config.max_pages {
            let len = self.len();
            if len + count > max {
                self.trim(len + count - max);
            }
        }

        // Allocation may block; the lock is not held
        let base = self.memory.ranges.reserve(count)?;
        let frames = match self.memory.frames.allocate_many(count) {
            Ok(frames) => frames,
            Err(e) => {
                log::debug!("Cache: '{}' insert of {:#x} failed: {}", self.config.name, key, e);
                self.release_range(base, count);
                return Err(e.into());
            },
        };
        for frame in &frames {
            frame.fill(0);
        }

        let now = self.manager.now();
        let mut state = self.state.lock();
        if keys().any(|k| state.index.contains_key(&k)) {
            drop(state);
            log::warn!("Cache: '{}' lost insert race for {:#x}", self.config.name, key);
            for frame in frames {
                self.memory.frames.free(frame);
            }
            self.release_range(base, count);
            return Err(CacheError::AlreadyCached);
        }

        for ((i, frame), page_key) in frames.into_iter().enumerate().zip(keys()) {
            let serial = state.next_serial();
            let mut page = CachePage::new(page_key, serial, base.page(i), frame, now);
            page.set_flags(flags, true);
            state.link(page);
        }
        drop(state);

        Counters::bump(&self.counters.inserts, count as u64);
        self.note_activity(now);
        log::trace!("Cache: '{}' inserted {:#x} x{} at {}", self.config.name, key, count, base);
        Ok(base)
    }

    /// Check that every page covering `[key, key + length)` is cached
    pub fn exists(&self, key: u64, length: usize) -> bool {
        let count = pages_for(length).max(1);
        let state = self.state.lock();
        (0..count).all(|i| page_key(key, i).is_some_and(|k| state.index.contains_key(&k)))
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Add a holder without changing LRU order
    ///
    /// Returns false if `key` is not cached.
    pub fn pin(&self, key: u64) -> bool {
        match self.state.lock().page_mut(key) {
            Some(page) => {
                page.acquire();
                true
            },
            None => false,
        }
    }

    /// Drop a holder
    ///
    /// # Panics
    ///
    /// Panics if the page has no holders.
    pub fn release(&self, key: u64) -> CacheResult<()> {
        let mut state = self.state.lock();
        match state.page_mut(key) {
            Some(page) => {
                if !page.release() {
                    drop(state);
                    panic!("Cache: '{}' release of {:#x} with no holders", self.config.name, key);
                }
                Ok(())
            },
            None => {
                drop(state);
                log::warn!("Cache: '{}' release of uncached key {:#x}", self.config.name, key);
                Err(CacheError::NotCached)
            },
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evict `key`'s page if nobody holds it
    pub fn evict(&self, key: u64) -> bool {
        let page = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(id) = state.index.get(&key).copied() else {
                return false;
            };
            if state.arena.get(id).is_some_and(|page| page.refcount() > 0) {
                log::trace!("Cache: '{}' evict of held key {:#x} refused", self.config.name, key);
                return false;
            }
            state.unlink(id)
        };
        self.retire(page);
        true
    }

    /// Evict every page, held or not
    pub fn empty(&self) -> usize {
        let pages: Vec<CachePage> = {
            let mut state = self.state.lock();
            state.index.clear();
            state.mapped.clear();
            state.arena.drain()
        };

        let held = pages.iter().filter(|page| page.refcount() > 0).count();
        if held > 0 {
            log::debug!("Cache: '{}' emptied with {} held pages", self.config.name, held);
        }
        let count = pages.len();
        pages.into_iter().for_each(|page| self.retire(page));
        count
    }

    /// Evict up to `count` least recently used pages nobody holds
    ///
    /// Pages with a write-back in flight are skipped.
    pub fn trim(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let victims = self.state.lock().take_lru(count, evictable);
        let evicted = victims.len();
        victims.into_iter().for_each(|page| self.retire(page));
        evicted
    }

    /// Evict pages untouched for the configured age
    ///
    /// With `force`, if no page is old enough, up to `force_evict_count`
    /// least recently used pages are evicted anyway.
    pub fn compact(&self, force: bool) -> usize {
        let now = self.manager.now();
        let threshold = self.config.age_threshold_ticks;

        let victims = {
            let mut state = self.state.lock();
            let old = state.take_lru(usize::MAX, |page| {
                evictable(page) && now.saturating_sub(page.last_touched()) >= threshold
            });
            if old.is_empty() && force {
                state.take_lru(self.config.force_evict_count, evictable)
            } else {
                old
            }
        };

        let evicted = victims.len();
        victims.into_iter().for_each(|page| self.retire(page));
        if evicted > 0 {
            log::debug!("Cache: '{}' compacted {} pages", self.config.name, evicted);
        }
        evicted
    }

    /// Free an unlinked page, writing it back first if dirty
    fn retire(&self, page: CachePage) {
        if page.is_dirty() {
            if let Some(callback) = self.callback() {
                let contents = page.frame().snapshot();
                callback(&WriteBack {
                    cause: CallbackCause::Eviction,
                    key: page.key(),
                    location: page.location(),
                    contents: &contents,
                });
                Counters::bump(&self.counters.eviction_writebacks, 1);
            }
        }

        let location = page.location();
        self.memory.frames.free(page.into_frame());
        self.release_range(location, 1);
        Counters::bump(&self.counters.evictions, 1);
    }

    fn release_range(&self, base: VirtualAddress, pages: usize) {
        if let Err(e) = self.memory.ranges.release(base, pages) {
            log::error!("Cache: '{}' failed to release {} x{}: {}", self.config.name, base, pages, e);
        }
    }

    // =========================================================================
    // Page access
    // =========================================================================

    fn check_mapped(state: &CacheState, address: VirtualAddress, len: usize) -> CacheResult<()> {
        address
            .as_u64()
            .checked_add(len as u64)
            .ok_or(CacheError::NotMapped)?;
        if spans(address, len).all(|(page, _, _)| state.page_at(page).is_some()) {
            Ok(())
        } else {
            Err(CacheError::NotMapped)
        }
    }

    /// Copy cached bytes at `address` into `buf`
    ///
    /// The range may cross page boundaries, as long as every page it
    /// touches is cached.
    pub fn read(&self, address: VirtualAddress, buf: &mut [u8]) -> CacheResult<()> {
        let state = self.state.lock();
        Self::check_mapped(&state, address, buf.len())?;
        for (page, offset, range) in spans(address, buf.len()) {
            let page = state.page_at(page).ok_or(CacheError::NotMapped)?;
            page.frame().read(offset, &mut buf[range])?;
        }
        Ok(())
    }

    /// Copy `data` into cached pages at `address`
    ///
    /// Nothing is written unless every page the range touches is cached.
    pub fn write(&self, address: VirtualAddress, data: &[u8]) -> CacheResult<()> {
        let state = self.state.lock();
        Self::check_mapped(&state, address, data.len())?;
        for (page, offset, range) in spans(address, data.len()) {
            let page = state.page_at(page).ok_or(CacheError::NotMapped)?;
            page.frame().write(offset, &data[range])?;
        }
        Ok(())
    }

    // =========================================================================
    // Checksums
    // =========================================================================

    /// Record the current contents of `key`'s page as clean
    pub fn trigger_checksum(&self, key: u64) -> CacheResult<()> {
        let mut state = self.state.lock();
        let page = state.page_mut(key).ok_or(CacheError::NotCached)?;
        let checksum = page.calculate_checksum();
        page.set_checksum(checksum);
        Ok(())
    }

    /// Check whether `key`'s page is unchanged since its last checkpoint
    ///
    /// With `replace` the current contents become the new checkpoint.
    pub fn verify_checksum(&self, key: u64, replace: bool) -> CacheResult<bool> {
        let mut state = self.state.lock();
        let page = state.page_mut(key).ok_or(CacheError::NotCached)?;
        Ok(page.verify_checksum(replace))
    }

    /// Suspend timer-driven write-back for this cache
    ///
    /// Nests; explicit [`sync`](Self::sync) is unaffected.
    pub fn start_atomic(&self) {
        self.critical.fetch_add(1, Ordering::AcqRel);
    }

    /// End a [`start_atomic`](Self::start_atomic) section
    pub fn end_atomic(&self) {
        let ended = self
            .critical
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match ended {
            // Jobs held back during the section can run now
            Ok(1) => self.manager.wake_writeback(),
            Ok(_) => {},
            Err(_) => {
                log::warn!("Cache: '{}' end_atomic without start_atomic", self.config.name);
            },
        }
    }

    /// Check if a start_atomic section is open
    pub fn in_critical_section(&self) -> bool {
        self.critical.load(Ordering::Acquire) > 0
    }

    // =========================================================================
    // Write-back
    // =========================================================================

    /// Install the write-back callback
    ///
    /// Whatever the closure captures is the client's context.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&WriteBack<'_>) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Remove the write-back callback
    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Check if a write-back callback is installed
    pub fn has_callback(&self) -> bool {
        self.callback.read().is_some()
    }

    fn callback(&self) -> Option<Arc<WriteBackFn>> {
        self.callback.read().clone()
    }

    /// Write `key`'s page back through the callback
    ///
    /// Runs the callback on the calling thread, or with `deferred` hands
    /// the page to the manager's write-back queue (which needs the cache to
    /// be registered). Without a callback this does nothing.
    pub fn sync(&self, key: u64, deferred: bool) -> CacheResult<()> {
        if !self.has_callback() {
            return Ok(());
        }
        if !deferred {
            return self
                .write_back(key, None, CallbackCause::WriteBack)
                .map(|_| ());
        }

        let mut state = self.state.lock();
        if !self.is_registered() {
            return Err(CacheError::Unregistered);
        }
        let page = state.page_mut(key).ok_or(CacheError::NotCached)?;
        let job = WriteBackJob {
            cache: self.self_ref.clone(),
            cache_id: self.id,
            key,
            serial: page.serial(),
            location: page.location(),
            cause: CallbackCause::WriteBack,
            origin: JobOrigin::Sync,
        };
        if self.manager.queue_write_back(job).will_dispatch() {
            page.set_flags(PageFlags::CHECKSUM_IN_FLUX, true);
        }
        Ok(())
    }

    /// Run the callback for one page and re-baseline its checksum
    ///
    /// `expect` pins the serial of the page a queued job was created for;
    /// a page inserted under the key since is left alone.
    fn write_back(&self, key: u64, expect: Option<u64>, cause: CallbackCause) -> CacheResult<bool> {
        let callback = self.callback();

        let (serial, location, contents) = {
            let mut state = self.state.lock();
            let page = state.page_mut(key).ok_or(CacheError::NotCached)?;
            if expect.is_some_and(|serial| serial != page.serial()) {
                return Ok(false);
            }
            if callback.is_none() {
                page.set_flags(PageFlags::CHECKSUM_IN_FLUX, false);
                return Ok(false);
            }
            page.set_flags(PageFlags::CHECKSUM_IN_FLUX, true);
            (page.serial(), page.location(), page.frame().snapshot())
        };

        let checksum = Fletcher16::hash(&contents);
        if let Some(callback) = callback {
            callback(&WriteBack {
                cause,
                key,
                location,
                contents: &contents,
            });
        }

        if let Some(page) = self.state.lock().page_mut(key) {
            if page.serial() == serial {
                page.set_checksum(checksum);
                page.set_flags(PageFlags::CHECKSUM_IN_FLUX, false);
            }
        }
        Counters::bump(&self.counters.writebacks, 1);
        Ok(true)
    }

    /// Run a job taken off the manager's queue
    ///
    /// Jobs the sweep queued wait out an atomic section; `sync` jobs do not.
    pub(crate) fn dispatch(&self, job: &WriteBackJob) -> Dispatched {
        if !self.is_registered() {
            return Dispatched::Dropped;
        }
        if job.origin == JobOrigin::Sweep && self.in_critical_section() {
            return Dispatched::Deferred;
        }
        match self.write_back(job.key, Some(job.serial), job.cause) {
            Ok(true) => Dispatched::Ran,
            Ok(false) => Dispatched::Dropped,
            Err(e) => {
                log::trace!("Cache: '{}' dropped job for {:#x}: {}", self.config.name, job.key, e);
                Dispatched::Dropped
            },
        }
    }

    /// Queue write-backs for pages whose checksum changed
    ///
    /// Runs in timer context: never blocks, and skips the cache when
    /// either of its locks is contended.
    pub(crate) fn sweep(&self, queue: &mut WriteBackQueue) -> SweepOutcome {
        if self.in_critical_section() {
            return SweepOutcome::Critical;
        }
        match self.callback.try_read() {
            Some(callback) if callback.is_some() => {},
            Some(_) => return SweepOutcome::Idle,
            None => return SweepOutcome::Busy,
        }
        let Some(mut state) = self.state.try_lock() else {
            return SweepOutcome::Busy;
        };
        if !self.is_registered() {
            return SweepOutcome::Idle;
        }

        let (mut queued, mut coalesced) = (0, 0);
        for page in state.arena.pages_mut() {
            if page.checksum_in_flux() || page.calculate_checksum() == page.checksum() {
                continue;
            }
            let outcome = queue.push(WriteBackJob {
                cache: self.self_ref.clone(),
                cache_id: self.id,
                key: page.key(),
                serial: page.serial(),
                location: page.location(),
                cause: CallbackCause::WriteBack,
                origin: JobOrigin::Sweep,
            });
            match outcome {
                Enqueued::Queued => queued += 1,
                Enqueued::Coalesced | Enqueued::InFlight => coalesced += 1,
            }
            if outcome.will_dispatch() {
                page.set_flags(PageFlags::CHECKSUM_IN_FLUX, true);
            }
        }
        SweepOutcome::Swept { queued, coalesced }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.manager.unregister_cache(self);
        let evicted = self.empty();
        log::debug!("Cache: destroyed '{}' ({} pages freed)", self.config.name, evicted);
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("registered", &self.is_registered())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use helix_memory::{HeapFrameAllocator, MemoryResult, PageHandle, RangeAllocator};
    use std::sync::Mutex as StdMutex;
    use std::vec;
    use std::vec::Vec;

    struct Fixture {
        manager: Arc<CacheManager>,
        frames: Arc<HeapFrameAllocator>,
        ranges: Arc<RangeAllocator>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_frames(HeapFrameAllocator::new())
        }

        fn with_frames(frames: HeapFrameAllocator) -> Self {
            Self {
                manager: CacheManager::new(ManagerConfig::default()),
                frames: Arc::new(frames),
                ranges: Arc::new(RangeAllocator::for_cache()),
            }
        }

        fn cache(&self, config: CacheConfig) -> Arc<Cache> {
            let memory = MemoryBackend::new(self.frames.clone(), self.ranges.clone());
            Cache::new(&self.manager, memory, config)
        }
    }

    fn recording(cache: &Cache) -> Arc<StdMutex<Vec<(CallbackCause, u64, u8)>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        cache.set_callback(move |wb| {
            sink.lock().unwrap().push((wb.cause, wb.key, wb.contents[0]));
        });
        log
    }

    #[test]
    fn test_insert_evict_lifecycle() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());

        let addr = cache.insert(42).unwrap();
        cache.write(addr, &[0xAA; PAGE_SIZE]).unwrap();
        cache.trigger_checksum(42).unwrap();

        assert!(!cache.evict(42));
        cache.release(42).unwrap();
        assert!(cache.evict(42));
        assert_eq!(cache.lookup(42), None);
        assert_eq!(fx.frames.outstanding(), 0);
        assert_eq!(fx.ranges.stats().reserved, 0);
    }

    #[test]
    fn test_trim_evicts_least_recently_used() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        for key in 1..=3 {
            cache.insert(key).unwrap();
            cache.release(key).unwrap();
        }

        cache.lookup(1).unwrap();
        cache.release(1).unwrap();

        assert_eq!(cache.trim(1), 1);
        assert_eq!(cache.lookup(2), None);
        assert!(cache.lookup(1).is_some());
        assert!(cache.lookup(3).is_some());
    }

    #[test]
    fn test_pinned_pages_survive_trim() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        for key in 0..4 {
            cache.insert(key).unwrap();
        }
        for key in [0, 2, 3] {
            cache.release(key).unwrap();
        }
        // Pin does not change LRU order; key 1 still has its insert holder
        assert!(cache.pin(0));
        assert!(!cache.pin(99));

        assert_eq!(cache.trim(100), 2);
        assert!(cache.contains(0));
        assert!(cache.contains(1));
        assert_eq!(cache.refcount(0), Some(1));

        cache.empty();
        assert!(cache.is_empty());
        assert_eq!(fx.frames.outstanding(), 0);
    }

    #[test]
    fn test_pin_keeps_lru_position() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        for key in 1..=2 {
            cache.insert(key).unwrap();
            cache.release(key).unwrap();
        }
        assert!(cache.pin(1));
        cache.release(1).unwrap();

        // 1 is still the oldest
        assert_eq!(cache.trim(1), 1);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn test_double_insert_panics() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        cache.insert(7).unwrap();
        let _ = cache.insert(7);
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn test_bulk_insert_over_cached_key_panics() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        cache.insert(PAGE_SIZE as u64).unwrap();
        let _ = cache.insert_bulk(0, 3 * PAGE_SIZE);
    }

    /// Lets a rival insert of the same key finish while the first one is
    /// still allocating
    struct RacingFrames {
        inner: HeapFrameAllocator,
        rival: StdMutex<Option<(Weak<Cache>, u64)>>,
    }

    impl PageAllocator for RacingFrames {
        fn allocate(&self) -> MemoryResult<PageHandle> {
            let rival = self.rival.lock().unwrap().take();
            if let Some((cache, key)) = rival {
                let cache = cache.upgrade().unwrap();
                cache.insert(key).unwrap();
            }
            self.inner.allocate()
        }

        fn free(&self, page: PageHandle) {
            self.inner.free(page);
        }
    }

    #[test]
    fn test_lost_insert_race_returns_memory() {
        let fx = Fixture::new();
        let frames = Arc::new(RacingFrames {
            inner: HeapFrameAllocator::new(),
            rival: StdMutex::new(None),
        });
        let memory = MemoryBackend::new(frames.clone(), fx.ranges.clone());
        let cache = Cache::new(&fx.manager, memory, CacheConfig::default());
        *frames.rival.lock().unwrap() = Some((Arc::downgrade(&cache), 7));

        assert_eq!(cache.insert(7), Err(CacheError::AlreadyCached));
        // Only the winner's page and address remain
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.refcount(7), Some(1));
        assert_eq!(frames.inner.outstanding(), 1);
        assert_eq!(fx.ranges.stats().reserved, PAGE_SIZE as u64);

        cache.release(7).unwrap();
        assert!(cache.evict(7));
        assert_eq!(frames.inner.outstanding(), 0);
        assert_eq!(fx.ranges.stats().reserved, 0);
    }

    #[test]
    #[should_panic(expected = "no holders")]
    fn test_release_underflow_panics() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        cache.insert(7).unwrap();
        cache.release(7).unwrap();
        let _ = cache.release(7);
    }

    #[test]
    fn test_recoverable_misses() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        assert_eq!(cache.lookup(5), None);
        assert!(!cache.evict(5));
        assert_eq!(cache.release(5), Err(CacheError::NotCached));
        assert_eq!(cache.trigger_checksum(5), Err(CacheError::NotCached));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_exhaustion_propagates() {
        let fx = Fixture::with_frames(HeapFrameAllocator::with_limit(2));
        let cache = fx.cache(CacheConfig::default());
        cache.insert(1).unwrap();
        cache.insert(2).unwrap();

        let err = cache.insert(3).unwrap_err();
        assert_eq!(err, CacheError::OutOfMemory);
        assert!(err.is_exhaustion());
        assert!(!cache.contains(3));

        // Only the two live pages hold address space
        assert_eq!(fx.ranges.stats().reserved, 2 * PAGE_SIZE as u64);

        // Caller frees room and retries
        cache.release(1).unwrap();
        assert_eq!(cache.trim(1), 1);
        cache.insert(3).unwrap();
    }

    #[test]
    fn test_max_pages_trims_before_insert() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default().with_max_pages(2));
        for key in 1..=3 {
            cache.insert(key).unwrap();
            cache.release(key).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_bulk_insert_is_contiguous() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let size = 3 * PAGE_SIZE - 100;
        let base = cache.insert_bulk(0x10_0000, size).unwrap();

        assert!(cache.exists(0x10_0000, size));
        assert!(cache.exists(0x10_0000 + PAGE_SIZE as u64, 1));
        assert!(!cache.exists(0x10_0000, 4 * PAGE_SIZE));

        let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        cache.write(base, &data).unwrap();
        let mut back = vec![0u8; size];
        cache.read(base, &mut back).unwrap();
        assert_eq!(back, data);

        // A read straddling the second page boundary
        let mut straddle = [0u8; 8];
        cache.read(base + (2 * PAGE_SIZE - 4) as u64, &mut straddle).unwrap();
        assert_eq!(&straddle[..], &data[2 * PAGE_SIZE - 4..2 * PAGE_SIZE + 4]);

        // Each page is its own cache entry
        let second = cache.lookup(0x10_0000 + PAGE_SIZE as u64).unwrap();
        assert_eq!(second, base.page(1));
        cache.release(0x10_0000 + PAGE_SIZE as u64).unwrap();

        assert_eq!(cache.empty(), 3);
        assert_eq!(fx.ranges.stats().reserved, 0);
    }

    #[test]
    fn test_bulk_insert_rejects_bad_sizes() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        assert_eq!(cache.insert_bulk(0, 0), Err(CacheError::InvalidSize));
        assert_eq!(cache.insert_bulk(u64::MAX - 10, 2 * PAGE_SIZE), Err(CacheError::InvalidSize));
    }

    #[test]
    fn test_write_outside_cache_is_rejected() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let addr = cache.insert(1).unwrap();

        // Spills into the next, uncached page: nothing is written
        let result = cache.write(addr + (PAGE_SIZE - 2) as u64, &[1, 2, 3, 4]);
        assert_eq!(result, Err(CacheError::NotMapped));
        let mut tail = [0u8; 2];
        cache.read(addr + (PAGE_SIZE - 2) as u64, &mut tail).unwrap();
        assert_eq!(tail, [0, 0]);

        assert_eq!(
            cache.read(VirtualAddress::new(0x1000), &mut tail),
            Err(CacheError::NotMapped)
        );
    }

    #[test]
    fn test_checksum_tracks_changes() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let addr = cache.insert(1).unwrap();
        cache.write(addr, b"hello").unwrap();

        cache.trigger_checksum(1).unwrap();
        assert_eq!(cache.verify_checksum(1, false), Ok(true));

        cache.write(addr, b"world").unwrap();
        assert_eq!(cache.verify_checksum(1, true), Ok(false));
        assert_eq!(cache.verify_checksum(1, false), Ok(true));
    }

    #[test]
    fn test_sync_runs_callback() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        // No callback: nothing to do
        cache.sync(1, false).unwrap();

        let log = recording(&cache);
        let addr = cache.insert(1).unwrap();
        cache.write(addr, &[9]).unwrap();
        assert_eq!(cache.verify_checksum(1, false), Ok(false));

        cache.sync(1, false).unwrap();
        assert_eq!(*log.lock().unwrap(), [(CallbackCause::WriteBack, 1, 9)]);
        // Re-baselined from the written snapshot
        assert_eq!(cache.verify_checksum(1, false), Ok(true));
        assert_eq!(cache.sync(2, false), Err(CacheError::NotCached));
        assert_eq!(cache.stats().writebacks, 1);
    }

    #[test]
    fn test_dirty_eviction_calls_back() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        let log = recording(&cache);

        let clean = cache.insert(1).unwrap();
        cache.write(clean, &[1]).unwrap();
        cache.trigger_checksum(1).unwrap();
        let dirty = cache.insert(2).unwrap();
        cache.write(dirty, &[2]).unwrap();
        cache.release(1).unwrap();
        cache.release(2).unwrap();

        assert_eq!(cache.trim(2), 2);
        assert_eq!(*log.lock().unwrap(), [(CallbackCause::Eviction, 2, 2)]);
        assert_eq!(cache.stats().eviction_writebacks, 1);
    }

    #[test]
    fn test_compact_by_age() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default().with_age_threshold(3).with_force_evict_count(1));
        for key in 1..=3 {
            cache.insert(key).unwrap();
            cache.release(key).unwrap();
        }

        // Nothing old enough yet
        assert_eq!(cache.compact(false), 0);
        assert_eq!(cache.compact(true), 1);
        assert!(!cache.contains(1));

        for _ in 0..3 {
            fx.manager.timer_tick();
        }
        cache.lookup(3).unwrap();
        cache.release(3).unwrap();

        // Key 2 aged out, key 3 was touched this tick
        assert_eq!(cache.compact(false), 1);
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_guards_release_on_drop() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        {
            let guard = cache.insert_guarded(5).unwrap();
            guard.write(0, b"abc").unwrap();
            assert_eq!(cache.refcount(5), Some(1));
        }
        assert_eq!(cache.refcount(5), Some(0));

        let read = |cache: &Cache| -> Option<[u8; 3]> {
            let guard = cache.lookup_guarded(5)?;
            let mut buf = [0u8; 3];
            guard.read(0, &mut buf).ok()?;
            Some(buf)
        };
        assert_eq!(read(&cache), Some(*b"abc"));
        assert_eq!(cache.refcount(5), Some(0));
        assert!(cache.lookup_guarded(6).is_none());
    }

    #[test]
    fn test_drop_unregisters_and_frees() {
        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        cache.insert(1).unwrap();
        assert_eq!(fx.manager.cache_count(), 1);

        drop(cache);
        assert_eq!(fx.manager.cache_count(), 0);
        assert_eq!(fx.frames.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_holders_balance() {
        use std::sync::Barrier;
        use std::thread;

        const THREADS: u64 = 4;
        const ROUNDS: usize = 500;

        let fx = Fixture::new();
        let cache = fx.cache(CacheConfig::default());
        cache.insert(0).unwrap();
        cache.release(0).unwrap();

        let barrier = Arc::new(Barrier::new(THREADS as usize));
        let handles: Vec<_> = (1..=THREADS)
            .map(|id| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let addr = cache.insert(id).unwrap();
                    cache.write(addr, &[id as u8]).unwrap();
                    for _ in 0..ROUNDS {
                        let shared = cache.lookup(0).unwrap();
                        let mut byte = [0u8];
                        cache.read(shared, &mut byte).unwrap();
                        cache.release(0).unwrap();
                    }
                    cache.release(id).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), THREADS as usize + 1);
        for key in 0..=THREADS {
            assert_eq!(cache.refcount(key), Some(0));
        }
        assert_eq!(cache.trim(usize::MAX), THREADS as usize + 1);
        assert_eq!(fx.frames.outstanding(), 0);
    }
}
