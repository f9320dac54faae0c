//! Page cache errors.

use core::fmt;

use helix_memory::MemoryError;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Recoverable cache errors
///
/// Programming errors (inserting a key that is already cached, releasing a
/// page whose refcount is already zero) are not represented here: they
/// panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The page allocator is exhausted
    OutOfMemory,
    /// The cache window has no room left
    OutOfAddressSpace,
    /// No page is cached under the key
    NotCached,
    /// The address is not backed by a cached page
    NotMapped,
    /// Another caller inserted the key while this one was allocating
    AlreadyCached,
    /// Zero or overflowing size
    InvalidSize,
    /// The cache is no longer registered with its manager
    Unregistered,
}

impl CacheError {
    /// Get error message
    pub const fn message(self) -> &'static str {
        match self {
            Self::OutOfMemory => "Out of memory",
            Self::OutOfAddressSpace => "Out of cache address space",
            Self::NotCached => "Key not cached",
            Self::NotMapped => "Address not mapped by cache",
            Self::AlreadyCached => "Key already cached",
            Self::InvalidSize => "Invalid size",
            Self::Unregistered => "Cache not registered",
        }
    }

    /// Check if trimming caches and retrying could help
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, Self::OutOfMemory | Self::OutOfAddressSpace)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl From<MemoryError> for CacheError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::OutOfMemory => Self::OutOfMemory,
            MemoryError::OutOfAddressSpace => Self::OutOfAddressSpace,
            MemoryError::ZeroSize => Self::InvalidSize,
            MemoryError::InvalidRange | MemoryError::Misaligned => Self::NotMapped,
        }
    }
}
