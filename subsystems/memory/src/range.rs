//! # Virtual Range Allocation
//!
//! Reservation of kernel virtual address space for cached pages.
//!
//! The allocator manages one window of address space as a sorted list of
//! free extents. Reservations are carved first-fit; releases are merged
//! back with their neighbours. Any page-aligned piece of a reservation may
//! be released on its own, so a multi-page reservation can be given back
//! one page at a time.

use alloc::vec::Vec;

use spin::Mutex;

use crate::addr::{VirtualAddress, PAGE_SIZE};
use crate::error::{MemoryError, MemoryResult};

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range of virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: VirtualAddress,
    /// End address (exclusive)
    pub end: VirtualAddress,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: VirtualAddress, size: u64) -> Self {
        Self {
            start,
            end: VirtualAddress::new(start.as_u64() + size),
        }
    }

    /// Get range size in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Check if ranges overlap
    fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// CACHE WINDOWS
// =============================================================================

/// Cache window on x86_64 (256 MiB below the top of the address space)
pub const CACHE_WINDOW_X86_64: VaRange =
    VaRange::new(VirtualAddress::new(0xFFFF_FFFF_D000_0000), 0x1000_0000);

/// Cache window on 32-bit targets
pub const CACHE_WINDOW_X86: VaRange = VaRange::new(VirtualAddress::new(0xE000_0000), 0x1000_0000);

// =============================================================================
// ALLOCATOR TRAIT
// =============================================================================

/// Source of virtual address ranges
pub trait VirtualRangeAllocator: Send + Sync {
    /// Reserve `pages` contiguous pages of address space
    fn reserve(&self, pages: usize) -> MemoryResult<VirtualAddress>;

    /// Give back `pages` pages starting at `base`
    fn release(&self, base: VirtualAddress, pages: usize) -> MemoryResult<()>;
}

// =============================================================================
// RANGE ALLOCATOR
// =============================================================================

/// Range allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeStats {
    /// Number of reservations
    pub reserves: u64,
    /// Number of releases
    pub releases: u64,
    /// Bytes currently reserved
    pub reserved: u64,
}

struct RangeState {
    /// Free extents, sorted by start, never adjacent
    free: Vec<VaRange>,
    stats: RangeStats,
}

/// First-fit virtual range allocator over a fixed window
pub struct RangeAllocator {
    /// Managed window
    window: VaRange,
    state: Mutex<RangeState>,
}

impl RangeAllocator {
    /// Create an allocator managing `window`
    pub fn new(window: VaRange) -> Self {
        debug_assert!(window.start.is_page_aligned() && window.end.is_page_aligned());
        Self {
            window,
            state: Mutex::new(RangeState {
                free: alloc::vec![window],
                stats: RangeStats::default(),
            }),
        }
    }

    /// Allocator over the cache window of the build target
    pub fn for_cache() -> Self {
        #[cfg(target_pointer_width = "64")]
        let window = CACHE_WINDOW_X86_64;
        #[cfg(not(target_pointer_width = "64"))]
        let window = CACHE_WINDOW_X86;
        Self::new(window)
    }

    /// Get statistics
    pub fn stats(&self) -> RangeStats {
        self.state.lock().stats
    }

    /// Free space in bytes
    pub fn free_space(&self) -> u64 {
        self.state.lock().free.iter().map(VaRange::size).sum()
    }

    /// Largest contiguous free region in bytes
    pub fn largest_free(&self) -> u64 {
        self.state
            .lock()
            .free
            .iter()
            .map(VaRange::size)
            .max()
            .unwrap_or(0)
    }
}

impl VirtualRangeAllocator for RangeAllocator {
    fn reserve(&self, pages: usize) -> MemoryResult<VirtualAddress> {
        if pages == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let size = (pages as u64)
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(MemoryError::OutOfAddressSpace)?;

        let mut state = self.state.lock();
        let index = state
            .free
            .iter()
            .position(|extent| extent.size() >= size)
            .ok_or(MemoryError::OutOfAddressSpace)?;

        let extent = &mut state.free[index];
        let base = extent.start;
        extent.start += size;
        if extent.start == extent.end {
            state.free.remove(index);
        }

        state.stats.reserves += 1;
        state.stats.reserved += size;
        Ok(base)
    }

    fn release(&self, base: VirtualAddress, pages: usize) -> MemoryResult<()> {
        if pages == 0 {
            return Err(MemoryError::ZeroSize);
        }
        if !base.is_page_aligned() {
            return Err(MemoryError::Misaligned);
        }
        let range = VaRange::new(base, pages as u64 * PAGE_SIZE as u64);
        if range.start < self.window.start || range.end > self.window.end {
            return Err(MemoryError::InvalidRange);
        }

        let mut state = self.state.lock();
        let index = state.free.partition_point(|extent| extent.start < range.start);

        let overlaps_prev = index > 0 && state.free[index - 1].overlaps(&range);
        let overlaps_next = index < state.free.len() && state.free[index].overlaps(&range);
        if overlaps_prev || overlaps_next {
            log::warn!("RangeAllocator: release of free range {:?}", range);
            return Err(MemoryError::InvalidRange);
        }

        state.free.insert(index, range);

        // Merge with the following extent, then with the preceding one
        if index + 1 < state.free.len() && state.free[index].end == state.free[index + 1].start {
            state.free[index].end = state.free[index + 1].end;
            state.free.remove(index + 1);
        }
        if index > 0 && state.free[index - 1].end == state.free[index].start {
            state.free[index - 1].end = state.free[index].end;
            state.free.remove(index);
        }

        state.stats.releases += 1;
        state.stats.reserved -= range.size();
        Ok(())
    }
}

impl core::fmt::Debug for RangeAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RangeAllocator")
            .field("window", &self.window)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> RangeAllocator {
        RangeAllocator::new(VaRange::new(VirtualAddress::new(0x10_0000), 8 * PAGE_SIZE as u64))
    }

    #[test]
    fn test_reserve_first_fit() {
        let ranges = small();
        let a = ranges.reserve(2).unwrap();
        let b = ranges.reserve(1).unwrap();
        assert_eq!(a, VirtualAddress::new(0x10_0000));
        assert_eq!(b, a.page(2));
        assert_eq!(ranges.stats().reserved, 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_exhaustion() {
        let ranges = small();
        ranges.reserve(8).unwrap();
        assert_eq!(ranges.reserve(1), Err(MemoryError::OutOfAddressSpace));
        assert_eq!(ranges.reserve(0), Err(MemoryError::ZeroSize));
    }

    #[test]
    fn test_release_pieces_and_merge() {
        let ranges = small();
        let base = ranges.reserve(4).unwrap();

        // Give the reservation back one page at a time, out of order
        ranges.release(base.page(2), 1).unwrap();
        ranges.release(base, 1).unwrap();
        ranges.release(base.page(3), 1).unwrap();
        ranges.release(base.page(1), 1).unwrap();

        assert_eq!(ranges.free_space(), 8 * PAGE_SIZE as u64);
        assert_eq!(ranges.largest_free(), 8 * PAGE_SIZE as u64);
        assert_eq!(ranges.stats().reserved, 0);
    }

    #[test]
    fn test_release_rejects_bad_ranges() {
        let ranges = small();
        let base = ranges.reserve(1).unwrap();

        assert_eq!(ranges.release(base.offset(1), 1), Err(MemoryError::Misaligned));
        assert_eq!(ranges.release(base.page(1), 1), Err(MemoryError::InvalidRange));
        assert_eq!(
            ranges.release(VirtualAddress::new(0x1000), 1),
            Err(MemoryError::InvalidRange)
        );

        ranges.release(base, 1).unwrap();
        assert_eq!(ranges.release(base, 1), Err(MemoryError::InvalidRange));
    }

    #[test]
    fn test_reuse_after_release() {
        let ranges = small();
        let a = ranges.reserve(8).unwrap();
        ranges.release(a.page(5), 2).unwrap();
        assert_eq!(ranges.reserve(2).unwrap(), a.page(5));
    }
}
