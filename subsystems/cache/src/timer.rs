//! # Timer Facility
//!
//! The periodic timer seam the cache manager hooks its write-back sweep
//! into. Handlers may run in interrupt context and must not block.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

/// Periodic timer callback
pub type TimerHandler = Box<dyn Fn() + Send + Sync>;

/// Source of periodic callbacks
pub trait TimerFacility {
    /// Call `handler` every `interval_ms` milliseconds
    fn register_periodic(&self, interval_ms: u64, handler: TimerHandler);
}

/// Timer driven by hand
///
/// Used before a hardware timer is available and in tests: every
/// [`ManualTimer::fire`] runs each registered handler once.
#[derive(Default)]
pub struct ManualTimer {
    handlers: Mutex<Vec<(u64, TimerHandler)>>,
}

impl ManualTimer {
    /// Create a timer with no handlers
    pub const fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Run every handler once
    pub fn fire(&self) {
        for (_, handler) in self.handlers.lock().iter() {
            handler();
        }
    }

    /// Registered handler count
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Interval of the `index`th handler
    pub fn interval(&self, index: usize) -> Option<u64> {
        self.handlers.lock().get(index).map(|(interval, _)| *interval)
    }
}

impl core::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ManualTimer")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl TimerFacility for ManualTimer {
    fn register_periodic(&self, interval_ms: u64, handler: TimerHandler) {
        log::debug!("ManualTimer: handler registered every {} ms", interval_ms);
        self.handlers.lock().push((interval_ms, handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fire_runs_handlers() {
        let timer = ManualTimer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        timer.register_periodic(
            250,
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );

        assert_eq!(timer.handler_count(), 1);
        assert_eq!(timer.interval(0), Some(250));
        timer.fire();
        timer.fire();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
