// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks backed by a dedicated OS thread.
//!
//! The body runs with its own cancellation token installed as the current
//! token, so cancellable runtime waits inside it observe `cancel()`. A body
//! that never reaches such a wait runs to completion.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::cancel::{self, CancelToken};
use crate::deadlock::{self, BlockReason};
use crate::error::{Error, Result};
use crate::sched;

/// Handle to a body running on its own thread.
#[derive(Debug)]
pub struct ThreadTask<T> {
    handle: JoinHandle<Result<T>>,
    token: Arc<CancelToken>,
}

/// Start `f` on a new thread. Its token is a child of the caller's.
pub fn spawn<T, F>(f: F) -> Result<ThreadTask<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let token = match cancel::current() {
        Some(parent) => parent.child(),
        None => Arc::new(CancelToken::new()),
    };
    let body_token = token.clone();
    let handle = thread::Builder::new()
        .name("cc-task".into())
        .spawn(move || {
            if body_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            cancel::scope(Some(body_token), || {
                panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|p| Err(Error::from_panic(p)))
            })
        })
        .map_err(|e| Error::failed(format!("cannot start task thread: {}", e)))?;
    Ok(ThreadTask { handle, token })
}

impl<T> ThreadTask<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Best-effort: the body notices at its next cancellable wait.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_token(&self) -> &Arc<CancelToken> {
        &self.token
    }

    /// Wait for the thread and return the body's result.
    pub fn join(self) -> Result<T> {
        let _blocked = (!self.is_finished()).then(|| deadlock::enter(BlockReason::TaskWait));
        let _park = sched::park_current(false);
        self.handle
            .join()
            .unwrap_or_else(|p| Err(Error::from_panic(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time;
    use std::time::{Duration, Instant};

    #[test]
    fn join_returns_value() {
        let t = spawn(|| Ok(6 * 7)).unwrap();
        assert_eq!(t.join(), Ok(42));
    }

    #[test]
    fn body_error_is_returned() {
        let t = spawn(|| -> Result<u8> { Err(Error::failed("nope")) }).unwrap();
        assert_eq!(t.join(), Err(Error::failed("nope")));
    }

    #[test]
    fn panic_becomes_error() {
        let t = spawn(|| -> Result<u8> { panic!("boom") }).unwrap();
        assert!(matches!(t.join(), Err(Error::Panicked(msg)) if msg.contains("boom")));
    }

    #[test]
    fn cancel_interrupts_cancellable_sleep() {
        let t = spawn(|| {
            time::sleep(Duration::from_secs(5))?;
            Ok("slept")
        })
        .unwrap();
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(20));
        t.cancel();
        assert_eq!(t.join(), Err(Error::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn cancelled_flag_visible_in_body() {
        let t = spawn(|| {
            while !cancel::cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        })
        .unwrap();
        t.cancel();
        assert_eq!(t.join(), Ok(()));
    }
}
