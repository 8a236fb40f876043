// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded MPMC channels.
//!
//! A [`Channel`] is a cloneable handle; every clone can send and receive.
//! Capacity 0 makes a rendezvous channel where each send pairs with exactly
//! one receive. [`buffered`] / [`unbuffered`] hand out split
//! [`Sender`]/[`Receiver`] halves whose drops close the channel.
//! [`Channel::owned`] builds a [`PoolChannel`] that creates its items on
//! demand.
//!
//! Blocking operations are suspension points: they honour the current
//! cancellation token (returning [`Error::Cancelled`]) and, on a scheduler
//! worker, hand the worker off while parked.

mod buffer;
pub(crate) mod inner;
mod owned;

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;

pub use buffer::ChannelMode;
pub use owned::{PoolChannel, PoolHooks};
use inner::Inner;

use crate::deadlock::BlockReason;
use crate::error::{Error, Result, SendError};
use crate::select::Select;
use crate::task::{PollCx, Task};
use crate::time::Deadline;

/// Which half of a channel [`Channel::shutdown`] closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Receivers fail immediately, buffered values are dropped with the channel.
    Read,
    /// Same as [`Channel::close`].
    Write,
    Both,
}

/// Counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    /// Values sent but not yet received.
    pub buffered: usize,
}

pub struct Channel<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Channel<T> {
    /// FIFO channel holding up to `cap` values.
    pub fn new(cap: usize) -> Self {
        Self::with_mode(cap, ChannelMode::Fifo)
    }

    pub fn with_mode(cap: usize, mode: ChannelMode) -> Self {
        Self {
            inner: Arc::new(Inner::new(cap, mode)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn mode(&self) -> ChannelMode {
        self.inner.mode()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once sending is no longer possible.
    pub fn is_closed(&self) -> bool {
        self.inner.is_send_closed()
    }

    /// Send without blocking. `WouldBlock` when full, or on a rendezvous
    /// channel with no receiver waiting.
    pub fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        self.inner.try_send(value)
    }

    /// Receive without blocking.
    pub fn try_recv(&self) -> Result<T> {
        self.inner.try_recv()
    }

    /// Block until the value is accepted or the channel closes.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.timed_send(value, Deadline::none())
    }

    /// Block until a value arrives, or fail once closed and drained.
    pub fn recv(&self) -> Result<T> {
        self.timed_recv(Deadline::none())
    }

    /// [`send`](Self::send) bounded by `deadline`. On `Timeout` the channel
    /// is unchanged and the value comes back in the error.
    pub fn timed_send(&self, value: T, deadline: Deadline) -> Result<(), SendError<T>> {
        let value = match self.inner.try_send(value) {
            Err(e) if e.error == Error::WouldBlock => e.value,
            other => return other,
        };
        let mut slot = Some(value);
        let r = {
            let mut sel = Select::for_reason(BlockReason::ChannelSend);
            sel.send(self, &mut slot);
            sel.wait(deadline)
        };
        match (r, slot) {
            (Err(e), Some(v)) => Err(SendError::new(e, v)),
            _ => Ok(()),
        }
    }

    pub fn timed_recv(&self, deadline: Deadline) -> Result<T> {
        match self.inner.try_recv() {
            Err(Error::WouldBlock) => {}
            other => return other,
        }
        let mut out = None;
        let r = {
            let mut sel = Select::for_reason(BlockReason::ChannelRecv);
            sel.recv(self, &mut out);
            sel.wait(deadline)
        };
        r?;
        out.ok_or(Error::WouldBlock)
    }

    /// Stop accepting sends and wake every waiter. Buffered values remain
    /// receivable. Idempotent.
    pub fn close(&self) {
        self.inner.close_send(None);
    }

    /// Like [`close`](Self::close), but once drained receivers get `error`
    /// instead of `Closed`. Only the first close error is kept.
    pub fn close_with(&self, error: Error) {
        self.inner.close_send(Some(error));
    }

    pub fn shutdown(&self, how: Shutdown) {
        match how {
            Shutdown::Read => self.inner.close_recv(),
            Shutdown::Write => self.inner.close_send(None),
            Shutdown::Both => {
                self.inner.close_send(None);
                self.inner.close_recv();
            }
        }
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.inner.sent(),
            received: self.inner.received(),
            buffered: self.inner.len(),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    /// A poll task that sends `value`. Polling tries once; waiting on it
    /// blocks in [`send`](Self::send).
    pub fn send_task(&self, value: T) -> Task<()> {
        struct Frame<T> {
            ch: Channel<T>,
            value: Option<T>,
            done: Option<Result<()>>,
        }
        let frame = Frame {
            ch: self.clone(),
            value: Some(value),
            done: None,
        };
        Task::from_poll_with_wait(
            frame,
            |f: &mut Frame<T>, cx: &PollCx| {
                if let Some(done) = f.done.take() {
                    return Poll::Ready(done);
                }
                if cx.is_cancelled() {
                    return Poll::Ready(Err(Error::Cancelled));
                }
                let Some(v) = f.value.take() else {
                    return Poll::Ready(Err(Error::InvalidArgument("send task already finished")));
                };
                match f.ch.try_send(v) {
                    Ok(()) => Poll::Ready(Ok(())),
                    Err(e) if e.error == Error::WouldBlock => {
                        f.value = Some(e.value);
                        Poll::Pending
                    }
                    Err(e) => Poll::Ready(Err(e.error)),
                }
            },
            |f: &mut Frame<T>, _cx: &PollCx| {
                if let Some(v) = f.value.take() {
                    f.done = Some(f.ch.send(v).map_err(|e| e.error));
                }
            },
        )
    }

    /// A poll task that receives one value.
    pub fn recv_task(&self) -> Task<T> {
        struct Frame<T> {
            ch: Channel<T>,
            done: Option<Result<T>>,
        }
        let frame = Frame {
            ch: self.clone(),
            done: None,
        };
        Task::from_poll_with_wait(
            frame,
            |f: &mut Frame<T>, cx: &PollCx| {
                if let Some(done) = f.done.take() {
                    return Poll::Ready(done);
                }
                if cx.is_cancelled() {
                    return Poll::Ready(Err(Error::Cancelled));
                }
                match f.ch.try_recv() {
                    Err(Error::WouldBlock) => Poll::Pending,
                    other => Poll::Ready(other),
                }
            },
            |f: &mut Frame<T>, _cx: &PollCx| {
                if f.done.is_none() {
                    f.done = Some(f.ch.recv());
                }
            },
        )
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity())
            .field("mode", &self.mode())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Split halves over one channel of capacity `cap`.
pub fn pair<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    let ch = Channel::new(cap);
    ch.inner.senders.fetch_add(1, Ordering::SeqCst);
    ch.inner.receivers.fetch_add(1, Ordering::SeqCst);
    (Sender { ch: ch.clone() }, Receiver { ch })
}

pub fn buffered<T>(n: usize) -> (Sender<T>, Receiver<T>) {
    pair(n)
}

/// Rendezvous channel.
pub fn unbuffered<T>() -> (Sender<T>, Receiver<T>) {
    pair(0)
}

/// Sending half. The channel closes when the last `Sender` drops.
pub struct Sender<T> {
    ch: Channel<T>,
}

impl<T> Sender<T> {
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.ch.send(value)
    }

    pub fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        self.ch.try_send(value)
    }

    pub fn timed_send(&self, value: T, deadline: Deadline) -> Result<(), SendError<T>> {
        self.ch.timed_send(value, deadline)
    }

    pub fn close(&self) {
        self.ch.close();
    }

    pub fn as_channel(&self) -> &Channel<T> {
        &self.ch
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.ch.inner.senders.fetch_add(1, Ordering::SeqCst);
        Self { ch: self.ch.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.ch.inner.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.ch.close();
        }
    }
}

/// Receiving half. Dropping the last `Receiver` fails further sends.
pub struct Receiver<T> {
    ch: Channel<T>,
}

impl<T> Receiver<T> {
    pub fn recv(&self) -> Result<T> {
        self.ch.recv()
    }

    pub fn try_recv(&self) -> Result<T> {
        self.ch.try_recv()
    }

    pub fn timed_recv(&self, deadline: Deadline) -> Result<T> {
        self.ch.timed_recv(deadline)
    }

    /// Blocking iterator that ends when the channel is closed and drained.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.recv().ok())
    }

    pub fn as_channel(&self) -> &Channel<T> {
        &self.ch
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.ch.inner.receivers.fetch_add(1, Ordering::SeqCst);
        Self { ch: self.ch.clone() }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.ch.inner.receivers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.ch.shutdown(Shutdown::Read);
        }
    }
}
