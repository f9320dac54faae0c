//! # Address Types
//!
//! Physical and virtual addresses used by the frame and range allocators.
//! Only the 4 KiB page granularity matters to this subsystem.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use static_assertions::const_assert;

// =============================================================================
// Page Size
// =============================================================================

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
const PAGE_SHIFT: u32 = 12;

const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1usize << PAGE_SHIFT == PAGE_SIZE);

/// Number of pages needed to hold `bytes` bytes
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

// =============================================================================
// Physical Address
// =============================================================================

/// A physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is page-aligned (4KB)
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & !PAGE_MASK == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Virtual Address
// =============================================================================

/// A virtual (linear) memory address
///
/// Cache pages are handed to clients as virtual addresses inside the
/// cache window; the address is a name for the page, not something this
/// crate dereferences.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is page-aligned (4KB)
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & !PAGE_MASK == 0
    }

    /// Align the address down to a page boundary
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & PAGE_MASK)
    }

    /// Align the address up to a page boundary
    #[inline]
    pub const fn align_up(self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & PAGE_MASK)
    }

    /// Offset within the containing page
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & !PAGE_MASK) as usize
    }

    /// Add a byte offset to this address
    #[inline]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Address of the `index`-th page after this one
    #[inline]
    pub const fn page(self, index: usize) -> Self {
        Self(self.0 + ((index as u64) << PAGE_SHIFT))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<VirtualAddress> for VirtualAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: VirtualAddress) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(pages_for(3 * PAGE_SIZE), 3);
    }

    #[test]
    fn test_virtual_alignment() {
        let addr = VirtualAddress::new(0xFFFF_FFFF_D000_1234);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.align_down(), VirtualAddress::new(0xFFFF_FFFF_D000_1000));
        assert_eq!(addr.align_up(), VirtualAddress::new(0xFFFF_FFFF_D000_2000));
        assert_eq!(addr.page_offset(), 0x234);
    }

    #[test]
    fn test_page_stride() {
        let base = VirtualAddress::new(0x1000);
        assert_eq!(base.page(3), VirtualAddress::new(0x4000));
        assert_eq!(base.page(3) - base, 3 * PAGE_SIZE as u64);
    }
}
