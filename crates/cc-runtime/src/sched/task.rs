// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber task records and their free-list pool.
//!
//! A record is type-erased: the body returns `Box<dyn Any + Send>` and the
//! typed handle downcasts on join. That lets one pool serve fibers of every
//! result type.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cancel::{self, CancelToken};
use crate::error::{lock, Error, Result};
use crate::ring::Ring;
use crate::time::Deadline;
use crate::wake::SpinCondvar;

pub(crate) type Job = Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>;
pub(crate) type Outcome = Result<Box<dyn Any + Send>>;

#[derive(Default)]
pub(crate) struct FiberTask {
    job: Mutex<Option<Job>>,
    token: Mutex<Option<Arc<CancelToken>>>,
    result: Mutex<Option<Outcome>>,
    done: AtomicBool,
    joined: SpinCondvar,
}

impl FiberTask {
    pub(crate) fn prepare(&self, job: Job, token: Arc<CancelToken>) {
        *lock(&self.job) = Some(job);
        *lock(&self.token) = Some(token);
    }

    /// Run the body under the task's cancellation token. A task cancelled
    /// before it starts never runs.
    pub(crate) fn execute(&self) -> Outcome {
        let job = lock(&self.job).take();
        let token = lock(&self.token).clone();
        let Some(job) = job else {
            return Err(Error::Cancelled);
        };
        if token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        cancel::scope(token, || catch_unwind(AssertUnwindSafe(job))).map_err(Error::from_panic)
    }

    pub(crate) fn publish(&self, outcome: Outcome) {
        *lock(&self.result) = Some(outcome);
        self.done.store(true, Ordering::Release);
        self.joined.notify_all();
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spin, yield, then park until the task is done.
    pub(crate) fn wait(&self) {
        self.joined.wait_for(|| self.is_done());
    }

    pub(crate) fn wait_until(&self, deadline: Deadline) -> bool {
        self.joined.wait_for_until(deadline, || self.is_done())
    }

    pub(crate) fn take_result(&self) -> Option<Outcome> {
        lock(&self.result).take()
    }

    fn reset(&self) {
        *lock(&self.job) = None;
        *lock(&self.token) = None;
        *lock(&self.result) = None;
        self.done.store(false, Ordering::Release);
    }
}

/// Recycles task records. Backed by a [`Ring`], so concurrent take/give
/// never sees a recycled node twice.
pub(crate) struct TaskPool {
    free: Ring<Arc<FiberTask>>,
}

impl TaskPool {
    pub(crate) fn new(size: usize) -> Self {
        let free = Ring::new(size);
        for _ in 0..size {
            if free.push(Arc::new(FiberTask::default())).is_err() {
                break;
            }
        }
        Self { free }
    }

    pub(crate) fn acquire(&self) -> Arc<FiberTask> {
        self.free.pop().unwrap_or_default()
    }

    /// Return a finished record. Records still referenced elsewhere (a
    /// worker that has not let go yet) are simply dropped.
    pub(crate) fn release(&self, mut task: Arc<FiberTask>) {
        if Arc::get_mut(&mut task).is_none() {
            return;
        }
        task.reset();
        let _ = self.free.push(task);
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Job {
        Box::new(move || Box::new(f()) as Box<dyn Any + Send>)
    }

    #[test]
    fn execute_and_publish() {
        let t = FiberTask::default();
        t.prepare(job(|| 41 + 1), Arc::new(CancelToken::new()));
        let out = t.execute();
        assert!(!t.is_done());
        t.publish(out);
        t.wait();
        let v = t.take_result().unwrap().unwrap();
        assert_eq!(*v.downcast::<i32>().unwrap(), 42);
    }

    #[test]
    fn cancelled_before_start_does_not_run() {
        let t = FiberTask::default();
        let token = Arc::new(CancelToken::new());
        token.cancel();
        t.prepare(job(|| -> u8 { panic!("must not run") }), token);
        assert!(matches!(t.execute(), Err(Error::Cancelled)));
    }

    #[test]
    fn body_sees_its_token() {
        let t = FiberTask::default();
        let token = Arc::new(CancelToken::new());
        t.prepare(job(|| cancel::current().is_some()), token);
        let v = t.execute().unwrap();
        assert!(*v.downcast::<bool>().unwrap());
    }

    #[test]
    fn panics_are_captured() {
        let t = FiberTask::default();
        t.prepare(job(|| -> u8 { panic!("boom") }), Arc::new(CancelToken::new()));
        match t.execute() {
            Err(Error::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn pool_recycles_unique_records() {
        let pool = TaskPool::new(2);
        assert_eq!(pool.available(), 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.available(), 0);
        let extra = a.clone();
        pool.release(a);
        assert_eq!(pool.available(), 0, "shared record must not be recycled");
        drop(extra);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn single_record_pool() {
        let pool = TaskPool::new(1);
        assert_eq!(pool.available(), 1);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 1);
        let _ = pool.acquire();
        assert_eq!(pool.available(), 0);
    }
}
