// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadlines and cancellable sleep.

use std::time::{Duration, Instant};

use crate::cancel;
use crate::deadlock::{self, BlockReason};
use crate::error::{Error, Result};
use crate::sched;
use crate::wake::Waiter;

/// An absolute point on the monotonic clock, or "no deadline".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Never expires.
    pub const fn none() -> Self {
        Self { at: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// `timeout` from now. A timeout too large for the clock to represent
    /// never expires, so it becomes [`Deadline::none`].
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    pub fn after_ms(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    pub fn is_none(&self) -> bool {
        self.at.is_none()
    }

    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, `None` for no deadline, zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(_), None) => self,
            _ => other,
        }
    }

    /// Absolute `CLOCK_MONOTONIC` time for APIs that take one.
    pub fn as_timespec(&self) -> Option<libc::timespec> {
        let left = self.remaining()?;
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
        }
        let mut sec = now.tv_sec.saturating_add(left.as_secs().min(i64::MAX as u64) as libc::time_t);
        let mut nsec = now.tv_nsec as i64 + left.subsec_nanos() as i64;
        if nsec >= 1_000_000_000 {
            sec = sec.saturating_add(1);
            nsec -= 1_000_000_000;
        }
        Some(libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec as libc::c_long,
        })
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Deadline::after(timeout)
    }
}

/// Sleep for `duration` at a suspension point.
///
/// Returns `Err(Cancelled)` early if the current task's cancellation token
/// fires while sleeping.
pub fn sleep(duration: Duration) -> Result<()> {
    sleep_until(Deadline::after(duration))
}

pub fn sleep_until(deadline: Deadline) -> Result<()> {
    let token = cancel::current();
    if token.as_ref().is_some_and(|t| t.is_cancelled()) {
        return Err(Error::Cancelled);
    }
    if deadline.expired() {
        return Ok(());
    }

    let waiter = Waiter::new();
    let _registration = token.as_ref().map(|t| t.register(&waiter));
    let _blocked = deadlock::enter(BlockReason::Sleep);
    let _parked = sched::park_current(!deadline.is_none());
    let wake_by = token
        .as_ref()
        .map_or(deadline, |t| deadline.min(t.deadline()));

    loop {
        let seq = waiter.seq();
        if token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        if deadline.expired() {
            return Ok(());
        }
        waiter.park(seq, wake_by);
    }
}
