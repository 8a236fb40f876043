// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error kinds.
//!
//! Every fallible runtime operation reports one of these. Success is the
//! `Ok` side of [`Result`].

use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Non-blocking operation could not proceed.
    #[error("operation would block")]
    WouldBlock,
    #[error("deadline expired")]
    Timeout,
    #[error("channel closed")]
    Closed,
    /// Cancelled by the owning nursery or task, or interrupted while blocked.
    #[error("operation cancelled")]
    Cancelled,
    #[error("out of memory")]
    OutOfMemory,
    #[error("scheduler queue full")]
    QueueFull,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Advisory only; the runtime never aborts on it.
    #[error("deadlock detected")]
    DeadlockDetected,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task failed: {0}")]
    Failed(String),
}

impl Error {
    /// User-level task failure with a message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }

    /// True for the two outcomes a timed or cancellable wait can end with
    /// without the channel or task itself having failed.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Timeout | Error::Cancelled)
    }

    /// Convert a caught panic payload into [`Error::Panicked`].
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Error::Panicked(msg)
    }
}

/// A send that did not happen. The value is handed back to the caller.
pub struct SendError<T> {
    pub error: Error,
    pub value: T,
}

impl<T> SendError<T> {
    pub(crate) fn new(error: Error, value: T) -> Self {
        Self { error, value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn error(&self) -> &Error {
        &self.error
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").field("error", &self.error).finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send failed: {}", self.error)
    }
}

impl<T> std::error::Error for SendError<T> {}

impl<T> From<SendError<T>> for Error {
    fn from(e: SendError<T>) -> Self {
        e.error
    }
}

/// Lock a mutex, recovering the guard if a task body panicked while holding it.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
