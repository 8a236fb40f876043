// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Typed handle to a spawned fiber.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::deadlock::{self, BlockReason};
use crate::error::{Error, Result};
use crate::time::Deadline;

use super::scheduler::{park_current, Shared};
use super::task::{FiberTask, Outcome};

/// Handle to a fiber returning `T`.
///
/// Joined by at most one waiter. Dropping the handle detaches the fiber;
/// it still runs to completion.
pub struct FiberHandle<T> {
    task: Option<Arc<FiberTask>>,
    shared: Arc<Shared>,
    token: Arc<CancelToken>,
    _result: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> FiberHandle<T> {
    pub(crate) fn new(task: Arc<FiberTask>, shared: Arc<Shared>, token: Arc<CancelToken>) -> Self {
        Self {
            task: Some(task),
            shared,
            token,
            _result: PhantomData,
        }
    }

    /// Wait for the fiber and take its result. Inside a fiber this is a
    /// suspension point.
    pub fn join(mut self) -> Result<T> {
        let Some(task) = self.task.take() else {
            return Err(Error::InvalidArgument("fiber already joined"));
        };
        if !task.is_done() {
            let _blocked = deadlock::enter(BlockReason::TaskWait);
            let _park = park_current(false);
            task.wait();
        }
        let out = task.take_result();
        self.shared.pool.release(task);
        deadlock::progress();
        downcast(out)
    }

    /// Take the result if the fiber has finished.
    pub fn try_join(&mut self) -> Option<Result<T>> {
        if !self.is_done() {
            return None;
        }
        let task = self.task.take()?;
        let out = task.take_result();
        self.shared.pool.release(task);
        Some(downcast(out))
    }

    /// Wait until the fiber finishes or the deadline passes, without taking
    /// the result. Returns whether it finished.
    pub fn wait_until(&self, deadline: Deadline) -> bool {
        let Some(task) = &self.task else {
            return true;
        };
        if task.is_done() {
            return true;
        }
        let _blocked = deadlock::enter(BlockReason::TaskWait);
        let _park = park_current(!deadline.is_none());
        task.wait_until(deadline)
    }

    pub fn is_done(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_done())
    }

    /// Request cooperative cancellation. A fiber that has not started yet
    /// never runs and joins with `Err(Cancelled)`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_token(&self) -> &Arc<CancelToken> {
        &self.token
    }
}

impl<T> Drop for FiberHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if task.is_done() {
                self.shared.pool.release(task);
            }
        }
    }
}

impl<T> std::fmt::Debug for FiberHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle")
            .field("done", &self.task.as_ref().map_or(true, |t| t.is_done()))
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

fn downcast<T: 'static>(out: Option<Outcome>) -> Result<T> {
    match out {
        Some(Ok(value)) => value
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Error::InvalidArgument("fiber result type mismatch")),
        Some(Err(e)) => Err(e),
        None => Err(Error::InvalidArgument("fiber result already taken")),
    }
}
