// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Waiting on several tasks at once.
//!
//! Each combinator runs one nursery child per task; the child blocks on its
//! task and reports `(index, result)` over a channel. The nursery guarantees
//! no child outlives the call. Losing tasks are cancelled before returning.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::nursery::Nursery;

use super::{Task, TaskCanceller};

type Report<T> = (usize, Result<T>);

struct Running<T> {
    nursery: Nursery,
    reports: Channel<Report<T>>,
    cancellers: Vec<TaskCanceller>,
    count: usize,
}

impl<T: Send + 'static> Running<T> {
    fn start(tasks: Vec<Task<T>>) -> Result<Self> {
        let nursery = Nursery::new()?;
        let count = tasks.len();
        let reports = Channel::new(count.max(1));
        let cancellers = tasks.iter().map(Task::canceller).collect();
        for (idx, task) in tasks.into_iter().enumerate() {
            let reports = reports.clone();
            nursery.spawn(move || {
                let r = task.block_on();
                // Capacity covers every child, so this never blocks.
                let _ = reports.try_send((idx, r));
                Ok(())
            })?;
        }
        Ok(Self {
            nursery,
            reports,
            cancellers,
            count,
        })
    }

    fn next(&self) -> Result<Report<T>> {
        self.reports.recv()
    }

    /// Cancel whatever is still running and join the children.
    fn finish(self) {
        for c in &self.cancellers {
            c.cancel();
        }
        let _ = self.nursery.wait();
    }
}

/// Block until every task completes. Returns the outputs in task order, or
/// the first error reported (cancelling the others).
pub fn block_all<T: Send + 'static>(tasks: Vec<Task<T>>) -> Result<Vec<T>> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let running = Running::start(tasks)?;
    let mut outputs: Vec<Option<T>> = (0..running.count).map(|_| None).collect();
    for _ in 0..running.count {
        match running.next() {
            Ok((idx, Ok(v))) => outputs[idx] = Some(v),
            Ok((_, Err(e))) | Err(e) => {
                running.finish();
                return Err(e);
            }
        }
    }
    running.finish();
    outputs
        .into_iter()
        .map(|o| o.ok_or(Error::InvalidArgument("task reported twice")))
        .collect()
}

/// Block until the first task completes, successfully or not. Returns its
/// index and result; the rest are cancelled.
pub fn block_race<T: Send + 'static>(tasks: Vec<Task<T>>) -> Result<(usize, T)> {
    if tasks.is_empty() {
        return Err(Error::InvalidArgument("race over no tasks"));
    }
    let running = Running::start(tasks)?;
    let first = running.next();
    running.finish();
    let (idx, r) = first?;
    r.map(|v| (idx, v))
}

/// Block until the first task that succeeds. Fails with the first reported
/// error only when every task failed.
pub fn block_any<T: Send + 'static>(tasks: Vec<Task<T>>) -> Result<(usize, T)> {
    if tasks.is_empty() {
        return Err(Error::InvalidArgument("any over no tasks"));
    }
    let running = Running::start(tasks)?;
    let mut first_error = None;
    for _ in 0..running.count {
        match running.next() {
            Ok((idx, Ok(v))) => {
                running.finish();
                return Ok((idx, v));
            }
            Ok((_, Err(e))) | Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    running.finish();
    Err(first_error.unwrap_or(Error::Closed))
}
