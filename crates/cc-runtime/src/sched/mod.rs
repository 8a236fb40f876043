// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber scheduling.
//!
//! Components:
//! - `scheduler`: worker threads, runnable queue, stats, idle heuristic
//! - `task`: type-erased fiber records and their pool
//! - `handle`: typed `FiberHandle` (join/cancel)
//!
//! A process-wide scheduler is created lazily from the environment on
//! first use; explicit [`Scheduler`] instances can run alongside it.

mod handle;
mod scheduler;
mod task;

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::{lock, Result};

pub use handle::FiberHandle;
pub(crate) use scheduler::park_current;
pub use scheduler::{Scheduler, SchedulerStats};

static GLOBAL: Mutex<Option<Arc<Scheduler>>> = Mutex::new(None);

/// Start the global scheduler with `workers` threads (0 = environment
/// default). A no-op when it is already running.
pub fn init(workers: usize) -> Result<()> {
    let mut global = lock(&GLOBAL);
    if global.as_ref().is_some_and(|s| s.is_running()) {
        return Ok(());
    }
    let mut config = RuntimeConfig::from_env();
    if workers > 0 {
        config = config.workers(workers);
    }
    *global = Some(Scheduler::new(config)?);
    Ok(())
}

/// The global scheduler, started on first use.
pub fn global() -> Result<Arc<Scheduler>> {
    let mut global = lock(&GLOBAL);
    if let Some(s) = global.as_ref().filter(|s| s.is_running()) {
        return Ok(s.clone());
    }
    let s = Scheduler::new(RuntimeConfig::from_env())?;
    *global = Some(s.clone());
    Ok(s)
}

/// The scheduler of the calling worker, else the global one.
pub fn current_or_global() -> Result<Arc<Scheduler>> {
    match Scheduler::current() {
        Some(s) => Ok(s),
        None => global(),
    }
}

/// Spawn a fiber on [`current_or_global`].
pub fn spawn<T, F>(f: F) -> Result<FiberHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    current_or_global()?.spawn(f)
}

/// Stop the global scheduler and join its workers. A later spawn starts a
/// fresh one.
pub fn shutdown() {
    let taken = lock(&GLOBAL).take();
    if let Some(s) = taken {
        debug!("global scheduler shutdown requested");
        s.shutdown();
    }
}

/// Stats of the global scheduler; all zero when it is not running.
pub fn stats() -> SchedulerStats {
    lock(&GLOBAL)
        .as_ref()
        .map(|s| s.stats())
        .unwrap_or_default()
}

/// Cooperative yield point. Fibers run to completion, so this yields the
/// worker thread to the OS scheduler.
pub fn yield_now() {
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global scheduler is process-wide; keep every assertion about it
    // in one test.
    #[test]
    fn global_lifecycle() {
        init(2).unwrap();
        init(4).unwrap();
        let s = global().unwrap();
        assert_eq!(s.config().workers, 2);
        assert_eq!(spawn(|| 3).unwrap().join().unwrap(), 3);
        assert!(stats().completed >= 1);
        drop(s);
        shutdown();
        assert_eq!(stats(), SchedulerStats::default());
        assert_eq!(spawn(|| 4).unwrap().join().unwrap(), 4);
        shutdown();
    }
}
