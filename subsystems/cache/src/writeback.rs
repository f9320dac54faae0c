//! # Write-back
//!
//! Callback types handed to clients and the coalescing job queue that
//! carries write-back work from the timer sweep to the write-back worker.
//!
//! The queue holds at most one job per `(cause, cache, page address)`.
//! A key stays pending from the moment it is queued until its dispatch
//! completes, so a page that changes again while its write-back runs is
//! picked up by a later sweep rather than queued twice.
//!
//! Jobs name their page by serial as well as address. Address space is
//! reused, so a job that outlives its page must not reach the page
//! inserted at the same address afterwards.

use alloc::collections::VecDeque;
use alloc::sync::Weak;

use hashbrown::HashSet;
use helix_memory::VirtualAddress;

use crate::cache::{Cache, CacheId};

// =============================================================================
// Callback Types
// =============================================================================

/// Why a callback was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackCause {
    /// Page changed since its last checkpoint
    WriteBack,
    /// Dirty page is about to be discarded
    Eviction,
}

/// One write-back request as seen by the client callback
#[derive(Debug)]
pub struct WriteBack<'a> {
    /// Why the callback runs
    pub cause: CallbackCause,
    /// Cache key of the page
    pub key: u64,
    /// Address of the page
    pub location: VirtualAddress,
    /// Page contents at dispatch time
    pub contents: &'a [u8],
}

/// Client write-back callback
///
/// Runs on the write-back worker, on the caller of `sync`, or on whichever
/// thread evicts a dirty page. Never runs with a cache lock held, but must
/// not call back into the same cache's eviction paths for the page it was
/// handed.
pub type WriteBackFn = dyn Fn(&WriteBack<'_>) + Send + Sync;

// =============================================================================
// Jobs
// =============================================================================

/// Coalescing key of a job
pub(crate) type JobKey = (CallbackCause, CacheId, VirtualAddress);

/// Who asked for a queued write-back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOrigin {
    /// The timer sweep saw the checksum change
    Sweep,
    /// A client called `sync` with `deferred`
    Sync,
}

/// Queued write-back work
#[derive(Debug, Clone)]
pub(crate) struct WriteBackJob {
    pub(crate) cache: Weak<Cache>,
    pub(crate) cache_id: CacheId,
    pub(crate) key: u64,
    /// Serial of the page the job was queued for
    pub(crate) serial: u64,
    pub(crate) location: VirtualAddress,
    pub(crate) cause: CallbackCause,
    pub(crate) origin: JobOrigin,
}

impl WriteBackJob {
    pub(crate) fn job_key(&self) -> JobKey {
        (self.cause, self.cache_id, self.location)
    }
}

/// Result of offering a job to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    /// New job queued
    Queued,
    /// Replaced a job for the same page that had not been dispatched yet
    Coalesced,
    /// A job for the same page is being dispatched; the request was dropped
    InFlight,
}

impl Enqueued {
    /// Whether a job for the page will still be dispatched
    pub(crate) fn will_dispatch(self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

/// What became of a job handed to its cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// The callback ran
    Ran,
    /// The page or cache is gone, or there is no callback
    Dropped,
    /// The cache is in an atomic section; retry later
    Deferred,
}

// =============================================================================
// Queue
// =============================================================================

/// FIFO of write-back jobs with per-page de-duplication
#[derive(Debug, Default)]
pub(crate) struct WriteBackQueue {
    jobs: VecDeque<WriteBackJob>,
    /// Keys queued or being dispatched
    pending: HashSet<JobKey>,
}

impl WriteBackQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, job: WriteBackJob) -> Enqueued {
        let key = job.job_key();
        if self.pending.insert(key) {
            self.jobs.push_back(job);
            return Enqueued::Queued;
        }
        match self.jobs.iter_mut().find(|queued| queued.job_key() == key) {
            Some(queued) => {
                let origin = match queued.origin {
                    JobOrigin::Sync => JobOrigin::Sync,
                    JobOrigin::Sweep => job.origin,
                };
                *queued = WriteBackJob { origin, ..job };
                Enqueued::Coalesced
            },
            None => Enqueued::InFlight,
        }
    }

    /// Take the oldest job; its key stays pending until [`Self::complete`]
    pub(crate) fn pop(&mut self) -> Option<WriteBackJob> {
        self.jobs.pop_front()
    }

    pub(crate) fn complete(&mut self, key: &JobKey) {
        self.pending.remove(key);
    }

    /// Put a popped job back at the end; its key is still pending
    pub(crate) fn requeue(&mut self, job: WriteBackJob) {
        self.jobs.push_back(job);
    }

    /// Drop every queued job of a cache
    pub(crate) fn purge(&mut self, cache_id: CacheId) -> usize {
        let before = self.jobs.len();
        let pending = &mut self.pending;
        self.jobs.retain(|job| {
            if job.cache_id == cache_id {
                pending.remove(&job.job_key());
                false
            } else {
                true
            }
        });
        before - self.jobs.len()
    }

    /// Jobs waiting for dispatch
    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }
}
