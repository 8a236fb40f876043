// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber scheduler: worker threads draining one bounded lock-free queue.
//!
//! Fibers are stackless closures that run to completion on a worker. When a
//! fiber blocks at a suspension point (channel wait, join, sleep) its worker
//! is handed off: it stops counting as active and the parked count rises. If
//! runnable fibers would otherwise be stranded because every worker thread
//! is parked, a spare worker is started; spares exit as soon as they find
//! nothing to do.
//!
//! Worker loop: pop, spin briefly, yield while fibers are running elsewhere,
//! otherwise sleep on the idle condvar until a spawn wakes it.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::cancel::{self, CancelToken};
use crate::config::RuntimeConfig;
use crate::error::{lock, Error, Result};
use crate::ring::Ring;
use crate::wake::{SPIN_FAST_ITERS, SPIN_YIELD_ITERS};

use super::handle::FiberHandle;
use super::task::{FiberTask, Job, TaskPool};

/// Upper bound on concurrently running spare workers.
const MAX_SPARE_WORKERS: usize = 256;
/// Enqueue attempts (with a yield in between) before reporting `QueueFull`.
const PUSH_RETRIES: usize = 64;
/// Idle workers re-check their loop at least this often.
const IDLE_WAIT: Duration = Duration::from_millis(50);

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static WORKER: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
    static PARK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Configured worker count.
    pub workers: usize,
    /// Live worker threads, spares included.
    pub threads: usize,
    pub active: usize,
    pub sleeping: usize,
    /// `workers - active - sleeping`, floored at zero.
    pub idle: usize,
    pub queued: usize,
    pub parked: usize,
    /// Spawned and not yet completed.
    pub pending: usize,
    pub completed: u64,
}

/// A pool of worker threads running fibers.
///
/// Dropping the last handle shuts the workers down.
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// State shared between workers, spawners and fiber handles.
pub(crate) struct Shared {
    id: usize,
    this: Weak<Scheduler>,
    config: RuntimeConfig,
    queue: Ring<Arc<FiberTask>>,
    pub(crate) pool: TaskPool,
    running: AtomicBool,
    pending: AtomicUsize,
    active: AtomicUsize,
    sleeping: AtomicUsize,
    queued: AtomicUsize,
    parked: AtomicUsize,
    threads: AtomicUsize,
    spares: AtomicUsize,
    completed: AtomicU64,
    idle: (Mutex<()>, Condvar),
    handles: Mutex<Vec<JoinHandle<()>>>,
    deadlock_reported: AtomicBool,
}

impl Scheduler {
    /// Start `config.workers` worker threads.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let id = NEXT_SCHEDULER_ID.fetch_add(1, SeqCst);
        let sched = Arc::new_cyclic(|this| Scheduler {
            shared: Arc::new(Shared {
                id,
                this: this.clone(),
                queue: Ring::new(config.task_queue_size),
                pool: TaskPool::new(config.task_pool_size),
                running: AtomicBool::new(true),
                pending: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                sleeping: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                parked: AtomicUsize::new(0),
                threads: AtomicUsize::new(0),
                spares: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                idle: (Mutex::new(()), Condvar::new()),
                handles: Mutex::new(Vec::with_capacity(config.workers)),
                deadlock_reported: AtomicBool::new(false),
                config,
            }),
        });

        let shared = &sched.shared;
        for n in 0..shared.config.workers {
            shared.threads.fetch_add(1, SeqCst);
            if let Err(e) = Shared::start_worker(shared, Some(n)) {
                shared.threads.fetch_sub(1, SeqCst);
                error!(scheduler = id, "failed to start worker thread: {}", e);
                sched.shutdown();
                return Err(Error::OutOfMemory);
            }
        }
        debug!(
            scheduler = id,
            workers = shared.config.workers,
            queue = shared.config.task_queue_size,
            pool = shared.config.task_pool_size,
            "scheduler started"
        );
        Ok(sched)
    }

    /// Scheduler with `workers` threads and otherwise environment defaults.
    pub fn with_workers(workers: usize) -> Result<Arc<Self>> {
        Self::new(RuntimeConfig::from_env().workers(workers))
    }

    /// The scheduler owning the calling worker thread.
    pub fn current() -> Option<Arc<Scheduler>> {
        WORKER.with(|w| w.borrow().as_ref().and_then(|s| s.this.upgrade()))
    }

    /// Run `f` as a fiber. Its cancellation token is a child of the caller's
    /// current token, if any.
    pub fn spawn<T, F>(&self, f: F) -> Result<FiberHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let token = match cancel::current() {
            Some(parent) => parent.child(),
            None => Arc::new(CancelToken::new()),
        };
        self.spawn_with_token(f, token)
    }

    /// Run `f` as a fiber under an explicit cancellation token.
    pub fn spawn_with_token<T, F>(&self, f: F, token: Arc<CancelToken>) -> Result<FiberHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let job: Job = Box::new(move || Box::new(f()) as Box<dyn std::any::Any + Send>);
        let task = self.shared.submit(job, token.clone())?;
        Ok(FiberHandle::new(task, self.shared.clone(), token))
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(SeqCst)
    }

    /// Whether the idle-time deadlock heuristic has fired. It fires at most
    /// once per scheduler.
    pub fn deadlock_reported(&self) -> bool {
        self.shared.deadlock_reported.load(SeqCst)
    }

    /// Stop accepting fibers, let workers drain the queue, then join them.
    /// Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.running.swap(false, SeqCst) {
            debug!(scheduler = shared.id, "scheduler shutting down");
        }
        {
            let _g = lock(&shared.idle.0);
            shared.idle.1.notify_all();
        }
        let handles = std::mem::take(&mut *lock(&shared.handles));
        let me = thread::current().id();
        for h in handles {
            // Shutdown from inside a fiber: this worker exits on its own.
            if h.thread().id() != me {
                let _ = h.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Shared {
    fn start_worker(shared: &Arc<Shared>, index: Option<usize>) -> std::io::Result<()> {
        let name = match index {
            Some(n) => format!("cc-sched{}-worker-{}", shared.id, n),
            None => format!("cc-sched{}-spare", shared.id),
        };
        let spare = index.is_none();
        let s = shared.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(s, spare))?;
        let mut handles = lock(&shared.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    pub(crate) fn submit(self: &Arc<Self>, job: Job, token: Arc<CancelToken>) -> Result<Arc<FiberTask>> {
        if !self.running.load(SeqCst) {
            return Err(Error::Closed);
        }
        let task = self.pool.acquire();
        task.prepare(job, token);

        self.pending.fetch_add(1, SeqCst);
        self.queued.fetch_add(1, SeqCst);
        if self.enqueue(task.clone()).is_err() {
            self.queued.fetch_sub(1, SeqCst);
            self.pending.fetch_sub(1, SeqCst);
            error!(
                scheduler = self.id,
                capacity = self.queue.capacity(),
                "fiber queue full, spawn rejected"
            );
            self.pool.release(task);
            return Err(Error::QueueFull);
        }
        self.notify_idle();
        self.ensure_runner();
        Ok(task)
    }

    fn enqueue(&self, mut task: Arc<FiberTask>) -> std::result::Result<(), Arc<FiberTask>> {
        for _ in 0..PUSH_RETRIES {
            match self.queue.push(task) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    task = back;
                    thread::yield_now();
                }
            }
        }
        Err(task)
    }

    fn pop(&self) -> Option<Arc<FiberTask>> {
        let task = self.queue.pop()?;
        self.queued.fetch_sub(1, SeqCst);
        Some(task)
    }

    fn run(&self, task: Arc<FiberTask>) {
        self.active.fetch_add(1, SeqCst);
        let outcome = task.execute();
        self.active.fetch_sub(1, SeqCst);
        self.completed.fetch_add(1, SeqCst);
        self.pending.fetch_sub(1, SeqCst);
        task.publish(outcome);
    }

    fn notify_idle(&self) {
        if self.sleeping.load(SeqCst) > 0 {
            let _g = lock(&self.idle.0);
            self.idle.1.notify_one();
        }
    }

    /// Start a spare worker when fibers are queued and every worker thread
    /// is parked inside a fiber.
    fn ensure_runner(self: &Arc<Self>) {
        loop {
            if !self.running.load(SeqCst) || self.queued.load(SeqCst) == 0 {
                return;
            }
            let threads = self.threads.load(SeqCst);
            if threads > self.parked.load(SeqCst) {
                return;
            }
            if self.spares.load(SeqCst) >= MAX_SPARE_WORKERS {
                warn!(scheduler = self.id, "spare worker limit reached; queued fibers wait");
                return;
            }
            if self
                .threads
                .compare_exchange(threads, threads + 1, SeqCst, SeqCst)
                .is_err()
            {
                continue;
            }
            self.spares.fetch_add(1, SeqCst);
            match Shared::start_worker(self, None) {
                Ok(()) => debug!(scheduler = self.id, threads = threads + 1, "spare worker started"),
                Err(e) => {
                    self.spares.fetch_sub(1, SeqCst);
                    self.threads.fetch_sub(1, SeqCst);
                    error!(scheduler = self.id, "failed to start spare worker: {}", e);
                }
            }
            return;
        }
    }

    /// A spare with nothing to do leaves. Returns `false` if work showed up
    /// while it was leaving.
    fn retire_spare(&self) -> bool {
        self.threads.fetch_sub(1, SeqCst);
        if self.queued.load(SeqCst) > 0 && self.running.load(SeqCst) {
            self.threads.fetch_add(1, SeqCst);
            return false;
        }
        self.spares.fetch_sub(1, SeqCst);
        self.check_deadlock();
        true
    }

    fn sleep(&self) {
        let (mtx, cvar) = &self.idle;
        let mut guard = lock(mtx);
        self.sleeping.fetch_add(1, SeqCst);
        self.check_deadlock();
        while self.queued.load(SeqCst) == 0 && self.running.load(SeqCst) {
            let (g, res) = cvar
                .wait_timeout(guard, IDLE_WAIT)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
            if res.timed_out() {
                break;
            }
        }
        self.sleeping.fetch_sub(1, SeqCst);
    }

    /// Every fiber is parked, nothing is queued or running, and every free
    /// worker is asleep: only a thread outside the scheduler can still make
    /// progress.
    fn deadlock_suspected(&self) -> bool {
        let parked = self.parked.load(SeqCst);
        parked > 0
            && self.queued.load(SeqCst) == 0
            && self.active.load(SeqCst) == 0
            && self.sleeping.load(SeqCst) >= self.threads.load(SeqCst).saturating_sub(parked)
    }

    fn check_deadlock(&self) {
        if self.deadlock_suspected() && !self.deadlock_reported.swap(true, SeqCst) {
            let s = self.stats();
            warn!(
                scheduler = self.id,
                workers = s.workers,
                threads = s.threads,
                parked = s.parked,
                sleeping = s.sleeping,
                pending = s.pending,
                completed = s.completed,
                "deadlock suspected: all fibers parked with no runnable work"
            );
        }
    }

    fn stats(&self) -> SchedulerStats {
        let workers = self.config.workers;
        let active = self.active.load(SeqCst);
        let sleeping = self.sleeping.load(SeqCst);
        SchedulerStats {
            workers,
            threads: self.threads.load(SeqCst),
            active,
            sleeping,
            idle: workers.saturating_sub(active + sleeping),
            queued: self.queued.load(SeqCst),
            parked: self.parked.load(SeqCst),
            pending: self.pending.load(SeqCst),
            completed: self.completed.load(SeqCst),
        }
    }
}

fn worker_loop(shared: Arc<Shared>, spare: bool) {
    WORKER.with(|w| *w.borrow_mut() = Some(shared.clone()));
    let mut yields = 0;
    'run: loop {
        if let Some(task) = shared.pop() {
            shared.run(task);
            yields = 0;
            continue;
        }
        for _ in 0..SPIN_FAST_ITERS {
            std::hint::spin_loop();
            if shared.queued.load(SeqCst) > 0 {
                continue 'run;
            }
        }
        if !shared.running.load(SeqCst) {
            shared.threads.fetch_sub(1, SeqCst);
            if spare {
                shared.spares.fetch_sub(1, SeqCst);
            }
            break;
        }
        if spare {
            if shared.retire_spare() {
                debug!(scheduler = shared.id, "spare worker exiting");
                break;
            }
            continue;
        }
        // Fibers still running elsewhere may spawn more work shortly.
        let runnable = shared
            .pending
            .load(SeqCst)
            .saturating_sub(shared.parked.load(SeqCst));
        if runnable > 0 && yields < SPIN_YIELD_ITERS {
            yields += 1;
            thread::yield_now();
            continue;
        }
        shared.sleep();
        yields = 0;
    }
    WORKER.with(|w| w.borrow_mut().take());
}

/// Marks the calling fiber parked for as long as it lives. Only the
/// outermost guard on a worker thread counts; elsewhere it is inert.
pub(crate) struct ParkGuard {
    shared: Option<Arc<Shared>>,
}

/// Enter a suspension point. `timed` waits are skipped by the deadlock
/// heuristic because their deadline will end them.
pub(crate) fn park_current(timed: bool) -> ParkGuard {
    let outer = PARK_DEPTH.with(|d| {
        let depth = d.get();
        d.set(depth + 1);
        depth == 0
    });
    let shared = if outer {
        WORKER.with(|w| w.borrow().clone())
    } else {
        None
    };
    if let Some(s) = &shared {
        s.parked.fetch_add(1, SeqCst);
        s.active.fetch_sub(1, SeqCst);
        s.ensure_runner();
        if !timed {
            s.check_deadlock();
        }
    }
    ParkGuard { shared }
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        if let Some(s) = self.shared.take() {
            s.active.fetch_add(1, SeqCst);
            s.parked.fetch_sub(1, SeqCst);
        }
        PARK_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
