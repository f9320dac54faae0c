//! # Cache Configuration
//!
//! Policy knobs for individual caches and for the manager that drives them.

// =============================================================================
// Cache Configuration
// =============================================================================

/// Per-cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name for logging
    pub name: &'static str,
    /// Pages evicted by a forced compaction when none are old enough
    pub force_evict_count: usize,
    /// Ticks a page must go untouched before compaction may evict it
    pub age_threshold_ticks: u64,
    /// Soft cap on cached pages; inserting past it trims the LRU page first
    pub max_pages: Option<usize>,
}

impl CacheConfig {
    /// Default configuration
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            force_evict_count: 2,
            age_threshold_ticks: 30,
            max_pages: None,
        }
    }

    /// Configuration for a block device cache
    pub const fn block_device(name: &'static str) -> Self {
        Self {
            name,
            force_evict_count: 8,
            age_threshold_ticks: 60,
            max_pages: None,
        }
    }

    /// Configuration for a single file's cache
    pub const fn file(name: &'static str) -> Self {
        Self::new(name)
    }

    /// Set the soft page cap
    pub const fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Set the compaction age threshold
    pub const fn with_age_threshold(mut self, ticks: u64) -> Self {
        self.age_threshold_ticks = ticks;
        self
    }

    /// Set the forced eviction count
    pub const fn with_force_evict_count(mut self, count: usize) -> Self {
        self.force_evict_count = count;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new("cache")
    }
}

// =============================================================================
// Manager Configuration
// =============================================================================

/// Cache manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Period of the write-back sweep
    pub writeback_interval_ms: u64,
    /// Sweep ticks between background compactions
    pub compact_interval_ticks: u64,
    /// Maximum queued trim requests
    pub trim_queue_depth: usize,
}

impl ManagerConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            writeback_interval_ms: 1000,
            compact_interval_ticks: 10,
            trim_queue_depth: 64,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.force_evict_count, 2);
        assert!(config.age_threshold_ticks > 0);
        assert!(config.max_pages.is_none());

        let manager = ManagerConfig::default();
        assert!(manager.writeback_interval_ms > 0);
        assert!(manager.trim_queue_depth > 0);
    }

    #[test]
    fn test_builders() {
        let config = CacheConfig::block_device("hda")
            .with_max_pages(128)
            .with_age_threshold(5)
            .with_force_evict_count(1);
        assert_eq!(config.name, "hda");
        assert_eq!(config.max_pages, Some(128));
        assert_eq!(config.age_threshold_ticks, 5);
        assert_eq!(config.force_evict_count, 1);
    }
}
