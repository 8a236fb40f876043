// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded thread pool for blocking closures.
//!
//! Backs FUTURE tasks so that closures which block in the OS do not tie up
//! scheduler workers. Jobs wait in one FIFO queue; a full queue rejects the
//! submit instead of growing.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{lock, Error, Result};

type PoolJob = Box<dyn FnOnce() + Send + 'static>;

/// Snapshot of a [`BlockingPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_cap: usize,
    pub queue_len: usize,
    /// Submits rejected because the queue was full or the pool stopped.
    pub submit_failures: u64,
}

struct Queue {
    jobs: VecDeque<PoolJob>,
    running: bool,
}

struct PoolShared {
    queue: Mutex<Queue>,
    available: Condvar,
    cap: usize,
    submit_failures: AtomicU64,
}

pub struct BlockingPool {
    shared: Arc<PoolShared>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockingPool {
    pub fn new(workers: usize, queue_cap: usize) -> Result<Self> {
        let workers = workers.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(queue_cap.max(1)),
                running: true,
            }),
            available: Condvar::new(),
            cap: queue_cap.max(1),
            submit_failures: AtomicU64::new(0),
        });
        let pool = Self {
            shared,
            workers,
            handles: Mutex::new(Vec::with_capacity(workers)),
        };
        for n in 0..workers {
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("cc-blocking-{}", n))
                .spawn(move || worker_loop(shared))
                .map_err(|e| Error::failed(format!("cannot start blocking worker: {}", e)))?;
            lock(&pool.handles).push(handle);
        }
        debug!(workers, queue_cap = pool.shared.cap, "blocking pool started");
        Ok(pool)
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Self::new(config.blocking_workers, config.blocking_queue_cap)
    }

    /// Queue `job`. Fails with `QueueFull` when the queue is at capacity and
    /// `Closed` after shutdown.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let err = {
            let mut q = lock(&self.shared.queue);
            if !q.running {
                Error::Closed
            } else if q.jobs.len() >= self.shared.cap {
                Error::QueueFull
            } else {
                q.jobs.push_back(Box::new(job));
                drop(q);
                self.shared.available.notify_one();
                return Ok(());
            }
        };
        self.shared.submit_failures.fetch_add(1, Ordering::Relaxed);
        warn!(error = %err, cap = self.shared.cap, "blocking pool rejected a job");
        Err(err)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            queue_cap: self.shared.cap,
            queue_len: lock(&self.shared.queue).jobs.len(),
            submit_failures: self.shared.submit_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs, run what is queued, join the workers.
    pub fn shutdown(&self) {
        {
            let mut q = lock(&self.shared.queue);
            if !q.running {
                return;
            }
            q.running = false;
        }
        self.shared.available.notify_all();
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        let me = thread::current().id();
        for h in handles {
            if h.thread().id() != me {
                let _ = h.join();
            }
        }
        debug!("blocking pool stopped");
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPool").field("stats", &self.stats()).finish()
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut q = lock(&shared.queue);
            loop {
                if let Some(job) = q.jobs.pop_front() {
                    break job;
                }
                if !q.running {
                    return;
                }
                q = shared
                    .available
                    .wait(q)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };
        // Jobs report their own panics; keep the worker alive regardless.
        let _ = panic::catch_unwind(AssertUnwindSafe(job));
    }
}

static GLOBAL_POOL: OnceLock<BlockingPool> = OnceLock::new();

/// The process-wide pool, sized from the environment on first use.
pub fn global() -> Result<&'static BlockingPool> {
    if let Some(pool) = GLOBAL_POOL.get() {
        return Ok(pool);
    }
    let pool = BlockingPool::from_config(&RuntimeConfig::from_env())?;
    // A racing initializer may win; the spare pool shuts down on drop.
    Ok(GLOBAL_POOL.get_or_init(|| pool))
}
