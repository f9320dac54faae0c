//! # Worker Threads
//!
//! Hosted rendition of the manager's two background workers on
//! `std::thread`:
//!
//! - **trim**: serves trim requests and runs periodic compaction
//! - **write-back**: drains the write-back queue
//!
//! Both park between rounds and are unparked through the manager's waker
//! hooks, with the write-back interval as a fallback timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::manager::CacheManager;

/// Handles to running workers
///
/// Dropping stops them, like [`Workers::shutdown`].
pub struct Workers {
    manager: Arc<CacheManager>,
    stop: Arc<AtomicBool>,
    trim: Option<JoinHandle<()>>,
    writeback: Option<JoinHandle<()>>,
}

/// Start the trim and write-back workers for `manager`
pub fn spawn_workers(manager: Arc<CacheManager>) -> std::io::Result<Workers> {
    let stop = Arc::new(AtomicBool::new(false));
    let period = Duration::from_millis(manager.config().writeback_interval_ms.max(1));

    let trim = spawn("cache-trim", &manager, &stop, period, |m| {
        m.run_trim_cycle();
    })?;
    let writeback = match spawn("cache-writeback", &manager, &stop, period, |m| {
        m.dispatch_write_backs();
    }) {
        Ok(handle) => handle,
        Err(e) => {
            stop.store(true, Ordering::Release);
            trim.thread().unpark();
            let _ = trim.join();
            return Err(e);
        },
    };

    let t = trim.thread().clone();
    manager.set_trim_waker(move || t.unpark());
    let w = writeback.thread().clone();
    manager.set_writeback_waker(move || w.unpark());

    log::info!("CacheWorkers: started");
    Ok(Workers {
        manager,
        stop,
        trim: Some(trim),
        writeback: Some(writeback),
    })
}

fn spawn(
    name: &str,
    manager: &Arc<CacheManager>,
    stop: &Arc<AtomicBool>,
    period: Duration,
    body: fn(&CacheManager),
) -> std::io::Result<JoinHandle<()>> {
    let manager = manager.clone();
    let stop = stop.clone();
    thread::Builder::new().name(name.into()).spawn(move || {
        while !stop.load(Ordering::Acquire) {
            body(&manager);
            thread::park_timeout(period);
        }
    })
}

impl Workers {
    /// Stop both workers and wait for them
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.manager.clear_wakers();
        for handle in [self.trim.take(), self.writeback.take()].into_iter().flatten() {
            let thread = handle.thread().clone();
            thread.unpark();
            if handle.join().is_err() {
                log::error!("CacheWorkers: {} panicked", thread.name().unwrap_or("worker"));
            }
        }
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("running", &self.trim.is_some())
            .finish()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        if self.trim.is_some() || self.writeback.is_some() {
            self.stop_and_join();
            log::info!("CacheWorkers: stopped");
        }
    }
}
