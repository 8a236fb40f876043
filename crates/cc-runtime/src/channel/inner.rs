// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared channel state and its non-blocking operations.
//!
//! Buffered channels move values through a [`Buffer`]; blocked parties
//! leave *hints* (bare waiters) that the opposite side pops and wakes after
//! each successful operation. A waiter count plus a `SeqCst` fence on both
//! sides keeps the fast path lock-free without losing wakeups.
//!
//! Rendezvous channels (capacity 0) keep queues of *handoff* records:
//! pending senders (offers, value inside) and pending receivers (takers,
//! empty slot). A peer must win the record's waiter claim before moving the
//! value, which is what makes a select commit to at most one case. Records
//! whose claim fails are skipped, not removed; their owner removes them.
//! A failed claim still notifies the owner, which may have been holding
//! its own claim while scanning.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::deadlock;
use crate::error::{lock, Error, Result, SendError};
use crate::wake::Waiter;

use super::buffer::{Buffer, ChannelMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Send,
    Recv,
}

/// A blocked rendezvous party.
pub(crate) struct Handoff<T> {
    pub(crate) waiter: Arc<Waiter>,
    pub(crate) case: usize,
    pub(crate) slot: Mutex<Option<T>>,
}

impl<T> Handoff<T> {
    pub(crate) fn new(waiter: &Arc<Waiter>, case: usize, value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            waiter: waiter.clone(),
            case,
            slot: Mutex::new(value),
        })
    }
}

struct WaitLists<T> {
    recv_hints: VecDeque<Arc<Waiter>>,
    send_hints: VecDeque<Arc<Waiter>>,
    offers: VecDeque<Arc<Handoff<T>>>,
    takers: VecDeque<Arc<Handoff<T>>>,
}

impl<T> WaitLists<T> {
    fn hints(&mut self, side: Side) -> &mut VecDeque<Arc<Waiter>> {
        match side {
            Side::Send => &mut self.send_hints,
            Side::Recv => &mut self.recv_hints,
        }
    }

    fn records(&mut self, side: Side) -> &mut VecDeque<Arc<Handoff<T>>> {
        match side {
            Side::Send => &mut self.offers,
            Side::Recv => &mut self.takers,
        }
    }
}

pub(crate) struct Inner<T> {
    cap: usize,
    mode: ChannelMode,
    buffer: Option<Buffer<T>>,
    /// No more sends; receivers drain what is buffered.
    send_closed: AtomicBool,
    /// Receiving side shut down; everything fails.
    recv_closed: AtomicBool,
    close_error: Mutex<Option<Error>>,
    /// Senders between their closed check and the end of their push.
    pushing: AtomicUsize,
    waiting: AtomicUsize,
    lists: Mutex<WaitLists<T>>,
    sent: AtomicU64,
    received: AtomicU64,
    pub(crate) senders: AtomicUsize,
    pub(crate) receivers: AtomicUsize,
}

impl<T> Inner<T> {
    pub(crate) fn new(cap: usize, mode: ChannelMode) -> Self {
        Self {
            cap,
            mode,
            buffer: (cap > 0).then(|| Buffer::new(cap, mode)),
            send_closed: AtomicBool::new(false),
            recv_closed: AtomicBool::new(false),
            close_error: Mutex::new(None),
            pushing: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            lists: Mutex::new(WaitLists {
                recv_hints: VecDeque::new(),
                send_hints: VecDeque::new(),
                offers: VecDeque::new(),
                takers: VecDeque::new(),
            }),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            senders: AtomicUsize::new(0),
            receivers: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    pub(crate) fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub(crate) fn is_rendezvous(&self) -> bool {
        self.buffer.is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Buffer::len)
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn is_send_closed(&self) -> bool {
        self.send_closed.load(Ordering::SeqCst) || self.recv_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_recv_closed(&self) -> bool {
        self.recv_closed.load(Ordering::SeqCst)
    }

    fn drained_error(&self) -> Error {
        lock(&self.close_error).clone().unwrap_or(Error::Closed)
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    pub(crate) fn close_send(&self, error: Option<Error>) {
        if let Some(e) = error {
            let mut slot = lock(&self.close_error);
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        self.send_closed.store(true, Ordering::SeqCst);
        self.wake_everyone();
    }

    pub(crate) fn close_recv(&self) {
        self.recv_closed.store(true, Ordering::SeqCst);
        self.wake_everyone();
    }

    fn wake_everyone(&self) {
        let mut woken = Vec::new();
        {
            let mut l = lock(&self.lists);
            let hints = l.recv_hints.len() + l.send_hints.len();
            woken.extend(l.recv_hints.drain(..));
            woken.extend(l.send_hints.drain(..));
            self.waiting.fetch_sub(hints, Ordering::SeqCst);
            woken.extend(l.offers.iter().map(|h| h.waiter.clone()));
            woken.extend(l.takers.iter().map(|h| h.waiter.clone()));
        }
        for w in woken {
            w.notify();
        }
    }

    // ------------------------------------------------------------------
    // Buffered
    // ------------------------------------------------------------------

    fn try_push(&self, buffer: &Buffer<T>, value: T) -> Result<(), SendError<T>> {
        if self.is_send_closed() {
            return Err(SendError::new(Error::Closed, value));
        }
        // Announce the push before checking `closed` again, so a receiver
        // that sees the close and no push in flight knows the buffer is final.
        self.pushing.fetch_add(1, Ordering::SeqCst);
        if self.is_send_closed() {
            self.end_push();
            return Err(SendError::new(Error::Closed, value));
        }
        let pushed = buffer.push(value);
        self.end_push();
        match pushed {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.wake_hint(Side::Recv);
                deadlock::progress();
                Ok(())
            }
            Err(value) => {
                let err = if self.is_send_closed() { Error::Closed } else { Error::WouldBlock };
                Err(SendError::new(err, value))
            }
        }
    }

    fn end_push(&self) {
        self.pushing.fetch_sub(1, Ordering::SeqCst);
        // Receivers that found the channel closed while we were in flight
        // parked instead of failing; let them look again.
        if self.send_closed.load(Ordering::SeqCst) {
            self.wake_everyone();
        }
    }

    fn try_pop(&self, buffer: &Buffer<T>) -> Result<T> {
        if self.is_recv_closed() {
            return Err(Error::Closed);
        }
        let value = match buffer.pop() {
            Some(v) => v,
            // Re-check after seeing the close so a value pushed just before
            // it is still drained.
            None if self.send_closed.load(Ordering::SeqCst) => {
                if self.pushing.load(Ordering::SeqCst) > 0 {
                    return Err(Error::WouldBlock);
                }
                match buffer.pop() {
                    Some(v) => v,
                    None => return Err(self.drained_error()),
                }
            }
            None => return Err(Error::WouldBlock),
        };
        self.received.fetch_add(1, Ordering::Relaxed);
        self.wake_hint(Side::Send);
        deadlock::progress();
        Ok(value)
    }

    /// Wake one waiter parked on `side` (if any).
    fn wake_hint(&self, side: Side) {
        fence(Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        let popped = {
            let mut l = lock(&self.lists);
            let w = l.hints(side).pop_front();
            if w.is_some() {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
            }
            w
        };
        if let Some(w) = popped {
            w.notify();
        }
    }

    /// Leave a hint on `side`; a no-op if this waiter already has one.
    pub(crate) fn add_hint(&self, side: Side, waiter: &Arc<Waiter>) {
        {
            let mut l = lock(&self.lists);
            let hints = l.hints(side);
            if !hints.iter().any(|w| Arc::ptr_eq(w, waiter)) {
                hints.push_back(waiter.clone());
                self.waiting.fetch_add(1, Ordering::SeqCst);
            }
        }
        fence(Ordering::SeqCst);
    }

    pub(crate) fn remove_hint(&self, side: Side, waiter: &Arc<Waiter>) {
        let mut l = lock(&self.lists);
        let hints = l.hints(side);
        if let Some(i) = hints.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            hints.remove(i);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Pass on a wakeup that a departing waiter may have swallowed.
    pub(crate) fn repair(&self, side: Side) {
        let Some(buffer) = &self.buffer else {
            return;
        };
        let closed = self.is_send_closed();
        let wake = match side {
            Side::Recv => buffer.len() > 0 || closed,
            Side::Send => !buffer.is_full() || closed,
        };
        if wake {
            self.wake_hint(side);
        }
    }

    // ------------------------------------------------------------------
    // Rendezvous
    // ------------------------------------------------------------------

    /// Hand `value` to a waiting receiver whose claim we win.
    fn try_give(&self, value: T) -> Result<(), SendError<T>> {
        let mut l = lock(&self.lists);
        if self.is_send_closed() {
            return Err(SendError::new(Error::Closed, value));
        }
        let mut value = Some(value);
        let mut i = 0;
        while i < l.takers.len() {
            let taker = l.takers[i].clone();
            {
                // Hold the slot while claiming so the receiver, once it sees
                // the claim, blocks here until the value is in place.
                let mut slot = lock(&taker.slot);
                if taker.waiter.try_claim(taker.case) {
                    *slot = value.take();
                }
            }
            if value.is_some() {
                // Owner may only be holding its own claim mid-scan; make it
                // rescan instead of parking past us.
                taker.waiter.notify();
            }
            if value.is_none() {
                l.takers.remove(i);
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                drop(l);
                taker.waiter.notify();
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.received.fetch_add(1, Ordering::Relaxed);
                deadlock::progress();
                return Ok(());
            }
            i += 1;
        }
        match value {
            Some(v) => Err(SendError::new(Error::WouldBlock, v)),
            None => Ok(()),
        }
    }

    /// Take a value from a waiting sender whose claim we win.
    fn try_take(&self) -> Result<T> {
        if self.is_recv_closed() {
            return Err(Error::Closed);
        }
        let mut l = lock(&self.lists);
        let mut i = 0;
        while i < l.offers.len() {
            let offer = l.offers[i].clone();
            if offer.waiter.try_claim(offer.case) {
                l.offers.remove(i);
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                drop(l);
                let value = lock(&offer.slot).take();
                offer.waiter.notify();
                return match value {
                    Some(v) => {
                        self.sent.fetch_add(1, Ordering::Relaxed);
                        self.received.fetch_add(1, Ordering::Relaxed);
                        deadlock::progress();
                        Ok(v)
                    }
                    None => Err(Error::WouldBlock),
                };
            }
            offer.waiter.notify();
            i += 1;
        }
        if self.send_closed.load(Ordering::SeqCst) {
            return Err(self.drained_error());
        }
        Err(Error::WouldBlock)
    }

    /// Queue a rendezvous record on `side` and nudge the opposite side so
    /// parked selects re-scan.
    pub(crate) fn add_record(&self, side: Side, record: &Arc<Handoff<T>>) {
        let peers: Vec<Arc<Waiter>> = {
            let mut l = lock(&self.lists);
            l.records(side).push_back(record.clone());
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let opposite = match side {
                Side::Send => &l.takers,
                Side::Recv => &l.offers,
            };
            opposite.iter().map(|h| h.waiter.clone()).collect()
        };
        for w in peers {
            w.notify();
        }
    }

    pub(crate) fn remove_record(&self, side: Side, record: &Arc<Handoff<T>>) {
        let mut l = lock(&self.lists);
        let records = l.records(side);
        if let Some(i) = records.iter().position(|r| Arc::ptr_eq(r, record)) {
            records.remove(i);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(crate) fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        match &self.buffer {
            Some(buffer) => self.try_push(buffer, value),
            None => self.try_give(value),
        }
    }

    pub(crate) fn try_recv(&self) -> Result<T> {
        match &self.buffer {
            Some(buffer) => self.try_pop(buffer),
            None => self.try_take(),
        }
    }
}
