// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured concurrency scopes.
//!
//! A [`Nursery`] owns the fibers spawned through it and does not let them
//! outlive it: [`Nursery::wait`] joins every child, and dropping a nursery
//! that was never waited on waits implicitly. The first child error is
//! recorded and cancels the rest.
//!
//! ```
//! use cc_runtime::{Nursery, Scheduler};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let sched = Scheduler::with_workers(2).unwrap();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let nursery = Nursery::with_scheduler(&sched);
//! for _ in 0..4 {
//!     let hits = hits.clone();
//!     nursery.spawn(move || {
//!         hits.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }).unwrap();
//! }
//! nursery.wait().unwrap();
//! assert_eq!(hits.load(Ordering::SeqCst), 4);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cancel::{self, CancelToken};
use crate::channel::Channel;
use crate::error::{lock, Error, Result};
use crate::sched::{self, FiberHandle, Scheduler};
use crate::time::Deadline;

type Closer = Box<dyn FnOnce() + Send + 'static>;

pub struct Nursery {
    sched: Arc<Scheduler>,
    token: Arc<CancelToken>,
    children: Mutex<Vec<FiberHandle<()>>>,
    first_error: Arc<Mutex<Option<Error>>>,
    closers: Mutex<Vec<Closer>>,
    waited: AtomicBool,
}

impl Nursery {
    /// Nursery on the current worker's scheduler, or the global one.
    pub fn new() -> Result<Self> {
        Ok(Self::with_scheduler(&sched::current_or_global()?))
    }

    /// Nursery whose children run on `sched`. Its token is a child of the
    /// caller's current token, so an outer cancellation reaches it.
    pub fn with_scheduler(sched: &Arc<Scheduler>) -> Self {
        let token = match cancel::current() {
            Some(parent) => parent.child(),
            None => Arc::new(CancelToken::new()),
        };
        Self {
            sched: sched.clone(),
            token,
            children: Mutex::new(Vec::new()),
            first_error: Arc::new(Mutex::new(None)),
            closers: Mutex::new(Vec::new()),
            waited: AtomicBool::new(false),
        }
    }

    /// Run `body` with a fresh nursery, then wait for its children.
    pub fn scope<R>(body: impl FnOnce(&Nursery) -> R) -> Result<R> {
        let nursery = Nursery::new()?;
        let r = body(&nursery);
        nursery.wait()?;
        Ok(r)
    }

    /// Start a child fiber. A child returning `Err` records the error (if it
    /// is the first) and cancels the nursery. A failed spawn is recorded the
    /// same way and also returned.
    pub fn spawn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let first_error = self.first_error.clone();
        let token = self.token.clone();
        let spawned = self.sched.spawn_with_token(
            move || {
                if let Err(e) = f() {
                    record(&first_error, e);
                    token.cancel();
                }
            },
            self.token.clone(),
        );
        match spawned {
            Ok(h) => {
                lock(&self.children).push(h);
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Join every child, close registered channels, and report the first
    /// child error. Calling it again returns the same result.
    pub fn wait(&self) -> Result<()> {
        loop {
            let batch: Vec<_> = lock(&self.children).drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for child in batch {
                // Panics and never-started children show up here.
                if let Err(e) = child.join() {
                    self.fail(e);
                }
            }
        }
        if !self.waited.swap(true, Ordering::SeqCst) {
            let closers: Vec<_> = lock(&self.closers).drain(..).collect();
            for close in closers {
                close();
            }
        }
        match lock(&self.first_error).clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel every child cooperatively.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// After `deadline` the nursery counts as cancelled; cancellable waits in
    /// its children wake no later than it.
    pub fn set_deadline(&self, deadline: Deadline) {
        self.token.set_deadline(deadline);
    }

    /// Close `ch` once every child has been joined.
    pub fn close_on_exit<T: Send + 'static>(&self, ch: &Channel<T>) {
        let ch = ch.clone();
        lock(&self.closers).push(Box::new(move || ch.close()));
    }

    pub fn cancel_token(&self) -> &Arc<CancelToken> {
        &self.token
    }

    fn fail(&self, e: Error) {
        record(&self.first_error, e);
        self.token.cancel();
    }
}

fn record(slot: &Mutex<Option<Error>>, e: Error) {
    let mut slot = lock(slot);
    if slot.is_none() {
        *slot = Some(e);
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        if !self.waited.load(Ordering::SeqCst) {
            let _ = self.wait();
        }
    }
}

impl fmt::Debug for Nursery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nursery")
            .field("children", &lock(&self.children).len())
            .field("cancelled", &self.is_cancelled())
            .field("error", &*lock(&self.first_error))
            .finish()
    }
}
