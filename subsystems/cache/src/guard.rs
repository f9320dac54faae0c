//! Scoped page references.

use core::fmt;

use helix_memory::{VirtualAddress, PAGE_SIZE};

use crate::cache::Cache;
use crate::error::{CacheError, CacheResult};

/// One holder of a cached page, released on drop
///
/// Wraps a reference the caller already acquired through `lookup`, `pin`
/// or `insert`; constructing a guard does not take another.
pub struct CachePageGuard<'a> {
    cache: &'a Cache,
    key: u64,
    location: VirtualAddress,
}

impl<'a> CachePageGuard<'a> {
    /// Take over a reference to `key`'s page at `location`
    pub fn new(cache: &'a Cache, key: u64, location: VirtualAddress) -> Self {
        Self {
            cache,
            key,
            location,
        }
    }

    /// Cache key
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Page address
    pub fn location(&self) -> VirtualAddress {
        self.location
    }

    /// Owning cache
    pub fn cache(&self) -> &'a Cache {
        self.cache
    }

    /// Copy bytes from `offset` within the page
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> CacheResult<()> {
        self.check(offset, buf.len())?;
        self.cache.read(self.location + offset as u64, buf)
    }

    /// Copy bytes to `offset` within the page
    pub fn write(&self, offset: usize, data: &[u8]) -> CacheResult<()> {
        self.check(offset, data.len())?;
        self.cache.write(self.location + offset as u64, data)
    }

    fn check(&self, offset: usize, len: usize) -> CacheResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(()),
            _ => Err(CacheError::NotMapped),
        }
    }
}

impl Drop for CachePageGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.cache.release(self.key) {
            log::error!("CachePageGuard: release of {:#x} failed: {}", self.key, e);
        }
    }
}

impl fmt::Debug for CachePageGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePageGuard")
            .field("cache", &self.cache.id())
            .field("key", &self.key)
            .field("location", &self.location)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::config::{CacheConfig, ManagerConfig};
    use crate::manager::CacheManager;
    use helix_memory::{HeapFrameAllocator, RangeAllocator};
    use std::sync::Arc;

    fn cache() -> Arc<Cache> {
        let manager = CacheManager::new(ManagerConfig::default());
        let memory = MemoryBackend::new(
            Arc::new(HeapFrameAllocator::new()),
            Arc::new(RangeAllocator::for_cache()),
        );
        Cache::new(&manager, memory, CacheConfig::file("guard"))
    }

    fn fill(guard: &CachePageGuard<'_>, early: bool) -> CacheResult<()> {
        guard.write(0, &[1, 2, 3])?;
        if early {
            return Ok(());
        }
        guard.write(PAGE_SIZE, &[4])?;
        Ok(())
    }

    #[test]
    fn test_release_on_every_exit_path() {
        let cache = cache();
        cache.insert(1).unwrap();
        cache.release(1).unwrap();

        for early in [true, false] {
            let guard = cache.lookup_guarded(1).unwrap();
            assert_eq!(cache.refcount(1), Some(1));
            let result = fill(&guard, early);
            assert_eq!(result.is_err(), !early);
            drop(guard);
            assert_eq!(cache.refcount(1), Some(0));
        }
        assert!(cache.evict(1));
    }

    #[test]
    fn test_wraps_pin() {
        let cache = cache();
        let location = cache.insert(9).unwrap();
        assert!(cache.pin(9));
        {
            let guard = CachePageGuard::new(&cache, 9, location);
            assert_eq!(guard.location(), location);
            assert_eq!(cache.refcount(9), Some(2));
        }
        assert_eq!(cache.refcount(9), Some(1));
    }

    #[test]
    fn test_offsets_stay_in_page() {
        let cache = cache();
        let guard = cache.insert_guarded(3).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(guard.read(PAGE_SIZE - 1, &mut buf), Err(CacheError::NotMapped));
        guard.write(PAGE_SIZE - 2, &[7, 8]).unwrap();
        guard.read(PAGE_SIZE - 2, &mut buf).unwrap();
        assert_eq!(buf, [7, 8]);
    }
}
