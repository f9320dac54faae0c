//! Memory subsystem errors.

use core::fmt;

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No physical frame available
    OutOfMemory,
    /// No virtual range large enough
    OutOfAddressSpace,
    /// Range is not (fully) reserved, or overlaps free space
    InvalidRange,
    /// Address is not page aligned
    Misaligned,
    /// Zero-sized request
    ZeroSize,
}

impl MemoryError {
    /// Get error message
    pub const fn message(self) -> &'static str {
        match self {
            Self::OutOfMemory => "Out of physical memory",
            Self::OutOfAddressSpace => "Out of virtual address space",
            Self::InvalidRange => "Invalid range",
            Self::Misaligned => "Address not page aligned",
            Self::ZeroSize => "Zero-sized request",
        }
    }

    /// Check if waiting for memory pressure relief could help
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, Self::OutOfMemory | Self::OutOfAddressSpace)
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}
