//! # Page Frames
//!
//! Ownership tokens for physical page frames and the allocator seam the
//! page cache consumes.
//!
//! A [`PageHandle`] is move-only: whoever holds it owns the frame, and
//! giving it back to [`PageAllocator::free`] is the only way to release
//! it. Frame contents are exposed as a slice of [`AtomicU8`], so a
//! background reader (the cache's checksum sweep) can scan a page while a
//! client writes it without forming a data race. The bytes it observes
//! may be torn; callers treat such scans as heuristics.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;
use static_assertions::{assert_impl_all, assert_not_impl_any, const_assert_eq};

use crate::addr::{PhysicalAddress, PAGE_SIZE};
use crate::error::{MemoryError, MemoryResult};

const_assert_eq!(core::mem::size_of::<AtomicU8>(), core::mem::size_of::<u8>());

// =============================================================================
// Page Handle
// =============================================================================

/// Exclusive ownership of one `PAGE_SIZE` frame
pub struct PageHandle {
    /// Physical address of the frame
    phys: PhysicalAddress,
    /// Kernel-accessible mapping of the frame
    base: NonNull<u8>,
}

// SAFETY: the handle is the unique owner of the frame and all content
// access goes through atomics.
unsafe impl Send for PageHandle {}
unsafe impl Sync for PageHandle {}

assert_impl_all!(PageHandle: Send, Sync);
assert_not_impl_any!(PageHandle: Clone, Copy);

impl PageHandle {
    /// Wrap a frame produced by an allocator
    ///
    /// # Safety
    ///
    /// `base` must be page aligned and valid for reads and writes of
    /// `PAGE_SIZE` bytes until the handle is returned to the allocator that
    /// produced it. No other `PageHandle` may refer to the same frame.
    #[inline]
    pub const unsafe fn from_raw(phys: PhysicalAddress, base: NonNull<u8>) -> Self {
        Self { phys, base }
    }

    /// Give up the handle, returning the raw parts
    #[inline]
    pub fn into_raw(self) -> (PhysicalAddress, NonNull<u8>) {
        (self.phys, self.base)
    }

    /// Physical address of the frame
    #[inline]
    pub fn physical(&self) -> PhysicalAddress {
        self.phys
    }

    /// Frame contents
    #[inline]
    pub fn bytes(&self) -> &[AtomicU8] {
        // SAFETY: `from_raw` guarantees PAGE_SIZE valid bytes for the
        // lifetime of the handle, and AtomicU8 has the layout of u8.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr().cast::<AtomicU8>(), PAGE_SIZE) }
    }

    /// Copy bytes out of the frame starting at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> MemoryResult<()> {
        let src = self.window(offset, buf.len())?;
        for (dst, byte) in buf.iter_mut().zip(src) {
            *dst = byte.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy bytes into the frame starting at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> MemoryResult<()> {
        let dst = self.window(offset, data.len())?;
        for (byte, &value) in dst.iter().zip(data) {
            byte.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Set every byte of the frame to `value`
    pub fn fill(&self, value: u8) {
        for byte in self.bytes() {
            byte.store(value, Ordering::Relaxed);
        }
    }

    /// Copy the whole frame
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes().iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    fn window(&self, offset: usize, len: usize) -> MemoryResult<&[AtomicU8]> {
        let end = offset.checked_add(len).ok_or(MemoryError::InvalidRange)?;
        if end > PAGE_SIZE {
            return Err(MemoryError::InvalidRange);
        }
        Ok(&self.bytes()[offset..end])
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("phys", &self.phys)
            .finish()
    }
}

// =============================================================================
// Allocator Trait
// =============================================================================

/// Source of page frames
///
/// Implementations may block (waiting for memory pressure relief), so
/// callers must not hold spinlocks across these calls.
pub trait PageAllocator: Send + Sync {
    /// Allocate one frame
    fn allocate(&self) -> MemoryResult<PageHandle>;

    /// Return a frame
    fn free(&self, page: PageHandle);

    /// Allocate `count` frames, not necessarily contiguous
    ///
    /// On failure every frame obtained so far is returned before the error
    /// propagates.
    fn allocate_many(&self, count: usize) -> MemoryResult<Vec<PageHandle>> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate() {
                Ok(page) => pages.push(page),
                Err(e) => {
                    for page in pages.drain(..) {
                        self.free(page);
                    }
                    return Err(e);
                },
            }
        }
        Ok(pages)
    }
}

// =============================================================================
// Heap Frame Allocator
// =============================================================================

/// Frame allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames handed out
    pub allocated: u64,
    /// Frames returned
    pub freed: u64,
    /// Failed allocations
    pub failures: u64,
    /// Frames currently owned by callers
    pub outstanding: usize,
}

/// Frame allocator backed by the global heap
///
/// Frames are page aligned and zeroed; the "physical" address is the
/// identity of the kernel mapping. An optional limit caps the number of
/// frames outstanding at once, which is how memory pressure is modelled
/// before the physical memory manager is available.
pub struct HeapFrameAllocator {
    /// Maximum outstanding frames
    limit: Option<usize>,
    /// Frames currently handed out
    live: Mutex<BTreeSet<usize>>,
    /// Outstanding counter (checked against the limit)
    outstanding: AtomicUsize,
    allocated: AtomicU64,
    freed: AtomicU64,
    failures: AtomicU64,
}

impl HeapFrameAllocator {
    /// Create an unbounded allocator
    pub const fn new() -> Self {
        Self::with_limit_opt(None)
    }

    /// Create an allocator that hands out at most `limit` frames at once
    pub const fn with_limit(limit: usize) -> Self {
        Self::with_limit_opt(Some(limit))
    }

    const fn with_limit_opt(limit: Option<usize>) -> Self {
        Self {
            limit,
            live: Mutex::new(BTreeSet::new()),
            outstanding: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn layout() -> Layout {
        // PAGE_SIZE is a non-zero power of two
        match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => unreachable!(),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }

    /// Frames currently owned by callers
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn claim(&self) -> bool {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }
}

impl Default for HeapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for HeapFrameAllocator {
    fn allocate(&self) -> MemoryResult<PageHandle> {
        if !self.claim() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            log::trace!("HeapFrameAllocator: limit reached");
            return Err(MemoryError::OutOfMemory);
        }

        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        let Some(base) = NonNull::new(ptr) else {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.failures.fetch_add(1, Ordering::Relaxed);
            log::error!("HeapFrameAllocator: heap exhausted");
            return Err(MemoryError::OutOfMemory);
        };

        self.live.lock().insert(base.as_ptr() as usize);
        self.allocated.fetch_add(1, Ordering::Relaxed);

        // SAFETY: freshly allocated, page aligned, PAGE_SIZE bytes, and the
        // only handle to it.
        Ok(unsafe { PageHandle::from_raw(PhysicalAddress::new(ptr as u64), base) })
    }

    fn free(&self, page: PageHandle) {
        let (phys, base) = page.into_raw();
        if !self.live.lock().remove(&(base.as_ptr() as usize)) {
            // Not ours. Leaking is the only safe option.
            log::error!("HeapFrameAllocator: free of foreign frame {}", phys);
            return;
        }

        // SAFETY: the pointer came from `alloc_zeroed` with this layout and
        // was still live.
        unsafe { dealloc(base.as_ptr(), Self::layout()) };
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.freed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for HeapFrameAllocator {
    fn drop(&mut self) {
        let live = self.live.get_mut();
        if !live.is_empty() {
            log::warn!("HeapFrameAllocator: dropped with {} frames outstanding", live.len());
        }
    }
}

impl fmt::Debug for HeapFrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapFrameAllocator")
            .field("limit", &self.limit)
            .field("stats", &self.stats())
            .finish()
    }
}
