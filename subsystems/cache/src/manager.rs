//! # Cache Manager
//!
//! Coordinates every page cache in the system.
//!
//! ## Responsibilities
//!
//! - Registry of live caches
//! - Periodic checksum sweep (timer context, never blocks)
//! - Write-back queue drained by the write-back worker
//! - Trim requests from the memory-pressure side, served by the trim worker
//! - Periodic age-based compaction
//!
//! The registry lock is only held to mutate or snapshot the list. Sweeps
//! and trims work on a snapshot of strong handles taken under it, so a slow
//! cache never holds up registration of another.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once, RwLock};

use crate::cache::{Cache, CacheId, SweepOutcome};
use crate::config::ManagerConfig;
use crate::timer::TimerFacility;
use crate::writeback::{Dispatched, Enqueued, WriteBackJob, WriteBackQueue};

/// Process-wide manager, for callers that cannot be handed one
static INSTANCE: Once<Arc<CacheManager>> = Once::new();

/// Worker wake-up hook
pub type Waker = Box<dyn Fn() + Send + Sync>;

// =============================================================================
// Reports and Statistics
// =============================================================================

/// What one timer tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tick number
    pub tick: u64,
    /// The whole sweep was skipped because the registry or queue was busy
    pub skipped: bool,
    /// Caches visited
    pub visited: usize,
    /// Caches skipped because their lock was contended
    pub busy: usize,
    /// Caches skipped because they were in an atomic section
    pub critical: usize,
    /// Write-back jobs queued
    pub queued: usize,
    /// Write-back requests folded into an existing job
    pub coalesced: usize,
}

/// Manager statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Registered caches
    pub caches: usize,
    /// Timer ticks seen
    pub ticks: u64,
    /// Ticks whose sweep was skipped
    pub sweeps_skipped: u64,
    /// Write-back jobs queued
    pub jobs_queued: u64,
    /// Write-back requests coalesced
    pub jobs_coalesced: u64,
    /// Write-back jobs that ran a callback
    pub jobs_dispatched: u64,
    /// Trim requests accepted
    pub trim_requests: u64,
    /// Pages evicted by trim requests and compaction
    pub pages_trimmed: u64,
}

#[derive(Default)]
struct Counters {
    sweeps_skipped: AtomicU64,
    jobs_queued: AtomicU64,
    jobs_coalesced: AtomicU64,
    jobs_dispatched: AtomicU64,
    trim_requests: AtomicU64,
    pages_trimmed: AtomicU64,
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Page cache coordinator
pub struct CacheManager {
    config: ManagerConfig,
    caches: RwLock<Vec<(CacheId, Weak<Cache>)>>,
    next_id: AtomicU64,
    ticks: AtomicU64,
    /// Tick of the last background compaction
    last_compact: AtomicU64,
    writeback: Mutex<WriteBackQueue>,
    trim_requests: Mutex<VecDeque<usize>>,
    /// Handles taken by the timer sweep; dropped by the workers so cache
    /// teardown never runs in timer context
    retired: Mutex<Vec<Arc<Cache>>>,
    trim_waker: RwLock<Option<Waker>>,
    writeback_waker: RwLock<Option<Waker>>,
    self_ref: Weak<CacheManager>,
    counters: Counters,
}

impl CacheManager {
    /// Create a manager
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            caches: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ticks: AtomicU64::new(0),
            last_compact: AtomicU64::new(0),
            writeback: Mutex::new(WriteBackQueue::new()),
            trim_requests: Mutex::new(VecDeque::new()),
            retired: Mutex::new(Vec::new()),
            trim_waker: RwLock::new(None),
            writeback_waker: RwLock::new(None),
            self_ref: self_ref.clone(),
            counters: Counters::default(),
        })
    }

    /// Publish `manager` as the process-wide instance
    ///
    /// The first installed manager wins; later calls return it unchanged.
    pub fn install(manager: Arc<Self>) -> &'static Arc<Self> {
        let installed = INSTANCE.call_once(|| manager.clone());
        if !Arc::ptr_eq(installed, &manager) {
            log::warn!("CacheManager: instance already installed");
        }
        installed
    }

    /// The process-wide instance, if one was installed
    pub fn instance() -> Option<&'static Arc<Self>> {
        INSTANCE.get()
    }

    /// Hook the write-back sweep into a periodic timer
    pub fn initialise(&self, timer: &dyn TimerFacility) {
        let manager = self.self_ref.clone();
        timer.register_periodic(
            self.config.writeback_interval_ms,
            Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.timer_tick();
                }
            }),
        );
        log::info!(
            "CacheManager: initialised, sweeping every {} ms",
            self.config.writeback_interval_ms
        );
    }

    /// Configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current tick
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub(crate) fn next_cache_id(&self) -> CacheId {
        CacheId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Add a cache to the sweep and trim rotation
    pub fn register_cache(&self, cache: &Arc<Cache>) {
        if !core::ptr::eq(Arc::as_ptr(cache.manager()), self) {
            log::warn!("CacheManager: '{}' belongs to another manager", cache.name());
            return;
        }
        let mut caches = self.caches.write();
        if caches.iter().any(|(id, _)| *id == cache.id()) {
            return;
        }
        caches.push((cache.id(), Arc::downgrade(cache)));
        cache.set_registered(true);
        drop(caches);
        log::debug!("CacheManager: registered '{}' ({})", cache.name(), cache.id());
    }

    /// Remove a cache from the rotation
    ///
    /// Returns once no sweep is inside the cache. Its queued jobs are
    /// discarded and its pages leave the write-back state, so a later
    /// sweep sees them as dirty again.
    pub fn unregister_cache(&self, cache: &Cache) -> bool {
        let removed = {
            let mut caches = self.caches.write();
            let before = caches.len();
            caches.retain(|(id, _)| *id != cache.id());
            caches.len() != before
        };
        cache.set_registered(false);
        cache.quiesce();
        let purged = self.writeback.lock().purge(cache.id());

        if removed {
            log::debug!(
                "CacheManager: unregistered '{}' ({}), {} jobs dropped",
                cache.name(),
                cache.id(),
                purged
            );
        }
        removed
    }

    /// Registered caches
    pub fn cache_count(&self) -> usize {
        self.caches.read().len()
    }

    /// Strong handles to every live registered cache
    fn live_caches(&self) -> Vec<Arc<Cache>> {
        self.caches
            .read()
            .iter()
            .filter_map(|(_, cache)| cache.upgrade())
            .collect()
    }

    /// Park a handle taken in timer context
    ///
    /// The retired list keeps one handle per cache. A duplicate is dropped
    /// on the spot, which is safe because the parked one outlives it.
    fn retire(retired: &mut Vec<Arc<Cache>>, cache: Arc<Cache>) {
        if retired.iter().any(|held| Arc::ptr_eq(held, &cache)) {
            drop(cache);
        } else {
            retired.push(cache);
        }
    }

    fn drop_retired(&self) {
        let retired = core::mem::take(&mut *self.retired.lock());
        drop(retired);
    }

    // =========================================================================
    // Timer sweep
    // =========================================================================

    /// One timer tick: advance the clock and queue write-backs for every
    /// cache whose pages changed
    ///
    /// Never blocks. Contended locks skip the cache (or the whole sweep)
    /// until the next tick.
    pub fn timer_tick(&self) -> SweepReport {
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        let mut report = SweepReport {
            tick,
            ..SweepReport::default()
        };

        // Every handle upgraded below ends up on the retired list, so the
        // sweep never drops the last one
        let Some(mut retired) = self.retired.try_lock() else {
            return self.skip_sweep(report);
        };
        let handles: Vec<Arc<Cache>> = match self.caches.try_read() {
            Some(caches) => caches.iter().filter_map(|(_, c)| c.upgrade()).collect(),
            None => return self.skip_sweep(report),
        };

        let swept = match self.writeback.try_lock() {
            Some(mut queue) => {
                for cache in &handles {
                    report.visited += 1;
                    match cache.sweep(&mut queue) {
                        SweepOutcome::Busy => report.busy += 1,
                        SweepOutcome::Critical => report.critical += 1,
                        SweepOutcome::Idle => {},
                        SweepOutcome::Swept { queued, coalesced } => {
                            report.queued += queued;
                            report.coalesced += coalesced;
                        },
                    }
                }
                true
            },
            None => false,
        };
        handles
            .into_iter()
            .for_each(|cache| Self::retire(&mut retired, cache));
        drop(retired);
        if !swept {
            return self.skip_sweep(report);
        }

        self.counters
            .jobs_queued
            .fetch_add(report.queued as u64, Ordering::Relaxed);
        self.counters
            .jobs_coalesced
            .fetch_add(report.coalesced as u64, Ordering::Relaxed);
        if report.queued > 0 {
            self.wake(&self.writeback_waker);
        }
        report
    }

    fn skip_sweep(&self, mut report: SweepReport) -> SweepReport {
        self.counters.sweeps_skipped.fetch_add(1, Ordering::Relaxed);
        report.skipped = true;
        report
    }

    // =========================================================================
    // Write-back
    // =========================================================================

    pub(crate) fn queue_write_back(&self, job: WriteBackJob) -> Enqueued {
        let outcome = self.writeback.lock().push(job);
        match outcome {
            Enqueued::Queued => {
                self.counters.jobs_queued.fetch_add(1, Ordering::Relaxed);
                self.wake(&self.writeback_waker);
            },
            Enqueued::Coalesced | Enqueued::InFlight => {
                self.counters.jobs_coalesced.fetch_add(1, Ordering::Relaxed);
            },
        }
        outcome
    }

    /// Run every queued write-back job
    ///
    /// Body of the write-back worker. Returns the number of callbacks run.
    /// Jobs of a cache inside an atomic section stay queued for a later
    /// round.
    pub fn dispatch_write_backs(&self) -> usize {
        self.drop_retired();

        let mut dispatched = 0;
        let mut deferred = Vec::new();
        loop {
            let next = self.writeback.lock().pop();
            let Some(job) = next else {
                break;
            };
            let outcome = match job.cache.upgrade() {
                Some(cache) => cache.dispatch(&job),
                None => Dispatched::Dropped,
            };
            match outcome {
                Dispatched::Deferred => deferred.push(job),
                Dispatched::Ran => {
                    dispatched += 1;
                    self.writeback.lock().complete(&job.job_key());
                },
                Dispatched::Dropped => self.writeback.lock().complete(&job.job_key()),
            }
        }
        if !deferred.is_empty() {
            let mut queue = self.writeback.lock();
            deferred.into_iter().for_each(|job| queue.requeue(job));
        }
        self.counters
            .jobs_dispatched
            .fetch_add(dispatched as u64, Ordering::Relaxed);
        dispatched
    }

    /// Jobs waiting for dispatch
    pub fn pending_write_backs(&self) -> usize {
        self.writeback.lock().len()
    }

    // =========================================================================
    // Trimming
    // =========================================================================

    /// Evict up to `count` pages across all caches
    ///
    /// Caches are visited least recently active first, one page each per
    /// round, until `count` pages are gone or a full round evicts nothing.
    /// Returns whether the target was met.
    pub fn trim_all(&self, count: usize) -> bool {
        if count == 0 {
            return true;
        }
        let mut caches = self.live_caches();
        caches.sort_by_key(|cache| cache.last_activity());

        let mut evicted = 0;
        while evicted < count {
            let mut progress = false;
            for cache in caches.iter().filter(|cache| cache.is_registered()) {
                if evicted == count {
                    break;
                }
                let n = cache.trim(1);
                if n > 0 {
                    evicted += n;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        self.counters
            .pages_trimmed
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted < count {
            log::debug!("CacheManager: trimmed {} of {} pages", evicted, count);
        }
        evicted >= count
    }

    /// Ask the trim worker to evict `count` pages
    ///
    /// Returns false if the request queue is full.
    pub fn request_trim(&self, count: usize) -> bool {
        {
            let mut requests = self.trim_requests.lock();
            if requests.len() >= self.config.trim_queue_depth {
                log::warn!("CacheManager: trim queue full, dropping request for {}", count);
                return false;
            }
            requests.push_back(count);
        }
        self.counters.trim_requests.fetch_add(1, Ordering::Relaxed);
        self.wake(&self.trim_waker);
        true
    }

    /// Serve every queued trim request
    ///
    /// Body of the trim worker; may block in the page allocator. Returns
    /// the number of pages evicted.
    pub fn process_trim_requests(&self) -> usize {
        self.drop_retired();

        let before = self.counters.pages_trimmed.load(Ordering::Relaxed);
        loop {
            let next = self.trim_requests.lock().pop_front();
            let Some(count) = next else {
                break;
            };
            if !self.trim_all(count) {
                log::debug!("CacheManager: trim request for {} pages fell short", count);
            }
        }
        (self.counters.pages_trimmed.load(Ordering::Relaxed) - before) as usize
    }

    /// Evict aged pages from every cache
    pub fn compact_all(&self, force: bool) -> usize {
        let evicted: usize = self
            .live_caches()
            .iter()
            .filter(|cache| cache.is_registered())
            .map(|cache| cache.compact(force))
            .sum();
        self.counters
            .pages_trimmed
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// One trim worker iteration: serve trim requests, and compact when
    /// enough ticks have passed since the last compaction
    pub fn run_trim_cycle(&self) -> usize {
        let mut evicted = self.process_trim_requests();

        let now = self.now();
        let last = self.last_compact.load(Ordering::Acquire);
        if now.saturating_sub(last) >= self.config.compact_interval_ticks
            && self
                .last_compact
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            evicted += self.compact_all(false);
        }
        evicted
    }

    // =========================================================================
    // Worker hooks
    // =========================================================================

    /// Called when trim requests arrive
    pub fn set_trim_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.trim_waker.write() = Some(Box::new(waker));
    }

    /// Called when write-back jobs are queued; may run in timer context
    pub fn set_writeback_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.writeback_waker.write() = Some(Box::new(waker));
    }

    /// Remove both wakers
    pub fn clear_wakers(&self) {
        *self.trim_waker.write() = None;
        *self.writeback_waker.write() = None;
    }

    pub(crate) fn wake_writeback(&self) {
        self.wake(&self.writeback_waker);
    }

    fn wake(&self, waker: &RwLock<Option<Waker>>) {
        if let Some(waker) = waker.try_read() {
            if let Some(wake) = waker.as_ref() {
                wake();
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> ManagerStats {
        let c = &self.counters;
        ManagerStats {
            caches: self.cache_count(),
            ticks: self.now(),
            sweeps_skipped: c.sweeps_skipped.load(Ordering::Relaxed),
            jobs_queued: c.jobs_queued.load(Ordering::Relaxed),
            jobs_coalesced: c.jobs_coalesced.load(Ordering::Relaxed),
            jobs_dispatched: c.jobs_dispatched.load(Ordering::Relaxed),
            trim_requests: c.trim_requests.load(Ordering::Relaxed),
            pages_trimmed: c.pages_trimmed.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
