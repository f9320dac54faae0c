//! # Helix Page Cache
//!
//! Keyed caches of page-sized buffers for block devices and files.
//!
//! ## Components
//!
//! - **Cache**: One keyed page cache with LRU eviction and reference counts
//! - **CacheManager**: Registry of caches, trimming under memory pressure
//!   and the periodic write-back sweep
//! - **Checksums**: Fletcher-16 change detection over page contents
//! - **Write-back**: Client callbacks and the coalescing job queue
//! - **CachePageGuard**: Scoped page references
//!
//! ## Write-back
//!
//! Pages are not write-protected. A timer sweep compares each page's
//! checksum to the one recorded at its last checkpoint and queues a
//! write-back for every page that changed. The write-back worker runs the
//! client's callback and records the checksum of what it wrote. Dirty pages
//! are also handed to the callback just before eviction.
//!
//! ## Example
//!
//! ```ignore
//! let manager = CacheManager::new(ManagerConfig::default());
//! let memory = MemoryBackend::new(frames, ranges);
//! let cache = Cache::new(&manager, memory, CacheConfig::block_device("hda"));
//!
//! let page = match cache.lookup_guarded(block) {
//!     Some(page) => page,
//!     None => {
//!         let page = cache.insert_guarded(block)?;
//!         read_block(block, &page)?;
//!         cache.trigger_checksum(block)?;
//!         page
//!     },
//! };
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod cache;
pub mod checksum;
pub mod config;
pub mod error;
pub mod guard;
pub mod manager;
pub mod page;
pub mod timer;
#[cfg(feature = "std")]
pub mod worker;
pub mod writeback;

pub use cache::{Cache, CacheId, CacheStats, MemoryBackend};
pub use checksum::{calculate_checksum, Fletcher16};
pub use config::{CacheConfig, ManagerConfig};
pub use error::{CacheError, CacheResult};
pub use guard::CachePageGuard;
pub use manager::{CacheManager, ManagerStats, SweepReport, Waker};
pub use page::{CachePage, PageFlags};
pub use timer::{ManualTimer, TimerFacility, TimerHandler};
#[cfg(feature = "std")]
pub use worker::{spawn_workers, Workers};
pub use writeback::{CallbackCause, WriteBack, WriteBackFn};

use static_assertions::assert_impl_all;

assert_impl_all!(Cache: Send, Sync);
assert_impl_all!(CacheManager: Send, Sync);
assert_impl_all!(CachePage: Send);
