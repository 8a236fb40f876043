// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-way select over channel sends and receives.
//!
//! Phase 1 tries every case once in a random permutation and commits the
//! first that succeeds. Phase 2 loops: register one waiter with every
//! channel, attempt each case while holding the waiter's self-claim, then
//! park. A rendezvous peer commits a case by winning the same claim, so at
//! most one case ever completes. Cases that did not commit leave their
//! `Option` untouched.
//!
//! Blocking `Channel` operations are one-case selects. A [`SelectSet`]
//! owns its channel handles and send values, so the same select can run
//! as a [`Task`]: polled in place, or on a blocking pool.

use std::cell::Cell;
use std::sync::Arc;
use std::task::Poll;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::cancel;
use crate::channel::inner::{Handoff, Inner, Side};
use crate::channel::Channel;
use crate::deadlock::{self, BlockReason};
use crate::error::{lock, Error, Result};
use crate::pool::BlockingPool;
use crate::sched;
use crate::task::{PollCx, Task};
use crate::time::Deadline;
use crate::wake::{Waiter, ABANDONED};

thread_local! {
    static NEXT_SEED: Cell<u64> = Cell::new(rand::random());
}

enum Attempt {
    Ready,
    Pending,
    Closed(Error),
}

/// One arm of a select.
trait Case {
    fn attempt(&mut self) -> Attempt;
    /// Arm for wakeups. Called every loop iteration; must be idempotent.
    fn register(&mut self, waiter: &Arc<Waiter>, idx: usize);
    /// `committed` is true when this case is the one that completed.
    fn unregister(&mut self, waiter: &Arc<Waiter>, committed: bool);
    /// A peer committed this case through its handoff record.
    fn complete_fired(&mut self);
    fn repair(&self);
}

struct RecvCase<'a, T> {
    ch: &'a Inner<T>,
    out: &'a mut Option<T>,
    record: Option<Arc<Handoff<T>>>,
}

impl<T> Case for RecvCase<'_, T> {
    fn attempt(&mut self) -> Attempt {
        match self.ch.try_recv() {
            Ok(v) => {
                *self.out = Some(v);
                Attempt::Ready
            }
            Err(Error::WouldBlock) => Attempt::Pending,
            Err(e) => Attempt::Closed(e),
        }
    }

    fn register(&mut self, waiter: &Arc<Waiter>, idx: usize) {
        if !self.ch.is_rendezvous() {
            self.ch.add_hint(Side::Recv, waiter);
        } else if self.record.is_none() {
            let record = Handoff::new(waiter, idx, None);
            self.ch.add_record(Side::Recv, &record);
            self.record = Some(record);
        }
    }

    fn unregister(&mut self, waiter: &Arc<Waiter>, _committed: bool) {
        match &self.record {
            Some(record) => self.ch.remove_record(Side::Recv, record),
            None => self.ch.remove_hint(Side::Recv, waiter),
        }
    }

    fn complete_fired(&mut self) {
        if let Some(record) = &self.record {
            *self.out = lock(&record.slot).take();
        }
    }

    fn repair(&self) {
        self.ch.repair(Side::Recv);
    }
}

struct SendCase<'a, T> {
    ch: &'a Inner<T>,
    value: &'a mut Option<T>,
    record: Option<Arc<Handoff<T>>>,
}

impl<T> SendCase<'_, T> {
    fn put_back(&mut self, v: T) {
        match &self.record {
            Some(record) => *lock(&record.slot) = Some(v),
            None => *self.value = Some(v),
        }
    }
}

impl<T> Case for SendCase<'_, T> {
    fn attempt(&mut self) -> Attempt {
        let v = match &self.record {
            Some(record) => lock(&record.slot).take(),
            None => self.value.take(),
        };
        let Some(v) = v else {
            return Attempt::Closed(Error::InvalidArgument("send case has no value"));
        };
        match self.ch.try_send(v) {
            Ok(()) => Attempt::Ready,
            Err(e) => {
                let err = e.error;
                self.put_back(e.value);
                if err == Error::WouldBlock {
                    Attempt::Pending
                } else {
                    Attempt::Closed(err)
                }
            }
        }
    }

    fn register(&mut self, waiter: &Arc<Waiter>, idx: usize) {
        if !self.ch.is_rendezvous() {
            self.ch.add_hint(Side::Send, waiter);
        } else if self.record.is_none() {
            let record = Handoff::new(waiter, idx, self.value.take());
            self.ch.add_record(Side::Send, &record);
            self.record = Some(record);
        }
    }

    fn unregister(&mut self, waiter: &Arc<Waiter>, committed: bool) {
        match self.record.take() {
            Some(record) => {
                self.ch.remove_record(Side::Send, &record);
                if !committed {
                    *self.value = lock(&record.slot).take();
                }
            }
            None => self.ch.remove_hint(Side::Send, waiter),
        }
    }

    fn complete_fired(&mut self) {}

    fn repair(&self) {
        self.ch.repair(Side::Send);
    }
}

/// Builder for a select over channel operations.
///
/// ```
/// use cc_runtime::{Channel, Deadline, Select};
///
/// let a: Channel<i32> = Channel::new(1);
/// let b: Channel<&str> = Channel::new(1);
/// b.try_send("ready").unwrap();
///
/// let (mut x, mut y) = (None, None);
/// let mut sel = Select::new();
/// sel.recv(&a, &mut x);
/// let idx_b = sel.recv(&b, &mut y);
/// assert_eq!(sel.wait(Deadline::after_ms(100)), Ok(idx_b));
/// drop(sel);
/// assert_eq!((x, y), (None, Some("ready")));
/// ```
pub struct Select<'a> {
    cases: Vec<Box<dyn Case + 'a>>,
    seed: Option<u64>,
    reason: BlockReason,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            seed: None,
            reason: BlockReason::Select,
        }
    }

    /// Select whose case permutation is fixed by `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::new()
        }
    }

    pub(crate) fn for_reason(reason: BlockReason) -> Self {
        Self {
            reason,
            ..Self::new()
        }
    }

    /// Add a receive case; on commit the value lands in `out`.
    /// Returns the case index.
    pub fn recv<T>(&mut self, ch: &'a Channel<T>, out: &'a mut Option<T>) -> usize {
        self.cases.push(Box::new(RecvCase {
            ch: &ch.inner,
            out,
            record: None,
        }));
        self.cases.len() - 1
    }

    /// Add a send case for the value in `value`. The value is taken only if
    /// this case commits.
    pub fn send<T>(&mut self, ch: &'a Channel<T>, value: &'a mut Option<T>) -> usize {
        self.cases.push(Box::new(SendCase {
            ch: &ch.inner,
            value,
            record: None,
        }));
        self.cases.len() - 1
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Commit a case that can complete right now. `WouldBlock` if none can,
    /// `Closed` (or the channel's close error) if every case is closed.
    pub fn try_select(&mut self) -> Result<usize> {
        let order = self.order();
        match self.try_once(&order)? {
            Some(i) => Ok(i),
            None => Err(Error::WouldBlock),
        }
    }

    /// Block until a case commits, the deadline passes (`Timeout`), the
    /// current task is cancelled (`Cancelled`) or every case is closed.
    pub fn wait(&mut self, deadline: Deadline) -> Result<usize> {
        let order = self.order();
        if let Some(i) = self.try_once(&order)? {
            return Ok(i);
        }
        if deadline.expired() {
            return Err(Error::Timeout);
        }
        let token = cancel::current();
        if token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        let waiter = Waiter::new();
        let _registration = token.as_ref().map(|t| t.register(&waiter));
        let _blocked = deadlock::enter(self.reason);
        let _park = sched::park_current(!deadline.is_none());
        let wake_by = token
            .as_ref()
            .map_or(deadline, |t| deadline.min(t.deadline()));

        let result = self.wait_loop(&order, &waiter, deadline, wake_by, token.as_deref());

        let committed = result.as_ref().ok().copied();
        for (i, case) in self.cases.iter_mut().enumerate() {
            case.unregister(&waiter, committed == Some(i));
        }
        for (i, case) in self.cases.iter().enumerate() {
            if committed != Some(i) {
                case.repair();
            }
        }
        result
    }

    /// Phase 1. `Ok(None)` when some case is still pending.
    fn try_once(&mut self, order: &[usize]) -> Result<Option<usize>> {
        if self.cases.is_empty() {
            return Err(Error::InvalidArgument("select without cases"));
        }
        let mut closed = None;
        let mut pending = false;
        for &i in order {
            match self.cases[i].attempt() {
                Attempt::Ready => return Ok(Some(i)),
                Attempt::Pending => pending = true,
                Attempt::Closed(e) => {
                    closed.get_or_insert(e);
                }
            }
        }
        match closed {
            Some(e) if !pending => Err(e),
            _ => Ok(None),
        }
    }

    fn wait_loop(
        &mut self,
        order: &[usize],
        waiter: &Arc<Waiter>,
        deadline: Deadline,
        wake_by: Deadline,
        token: Option<&cancel::CancelToken>,
    ) -> Result<usize> {
        'park: loop {
            // Arm before reading `seq` and scanning: an operation that lands
            // after a failed attempt then finds our hint and moves `seq`.
            for (i, case) in self.cases.iter_mut().enumerate() {
                case.register(waiter, i);
            }
            let seq = waiter.seq();
            if let Some(i) = waiter.fired() {
                if i < self.cases.len() {
                    self.cases[i].complete_fired();
                    return Ok(i);
                }
            }

            let mut closed = None;
            let mut pending = false;
            for &i in order {
                if !waiter.try_claim(i) {
                    // A peer committed one of our cases meanwhile.
                    continue 'park;
                }
                match self.cases[i].attempt() {
                    Attempt::Ready => return Ok(i),
                    Attempt::Pending => pending = true,
                    Attempt::Closed(e) => {
                        closed.get_or_insert(e);
                    }
                }
                waiter.release(i);
            }

            let give_up = if !pending {
                closed
            } else if token.is_some_and(|t| t.is_cancelled()) {
                Some(Error::Cancelled)
            } else if deadline.expired() {
                Some(Error::Timeout)
            } else {
                None
            };
            if let Some(e) = give_up {
                if waiter.try_claim(ABANDONED) {
                    return Err(e);
                }
                continue;
            }
            waiter.park(seq, wake_by);
        }
    }

    fn order(&self) -> Vec<usize> {
        let seed = self.seed.unwrap_or_else(|| {
            NEXT_SEED.with(|s| {
                let v = s.get();
                s.set(v.wrapping_add(0x9E37_79B9_7F4A_7C15));
                v
            })
        });
        let mut order: Vec<usize> = (0..self.cases.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        order
    }
}

impl Default for Select<'_> {
    fn default() -> Self {
        Self::new()
    }
}

enum OwnedCase<T> {
    Recv(Channel<T>),
    Send(Channel<T>, Option<T>),
}

/// The case of a [`SelectSet`] that committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected<T> {
    /// Receive case `.0` got `.1`.
    Received(usize, T),
    /// Send case `.0` handed its value over.
    Sent(usize),
}

impl<T> Selected<T> {
    pub fn index(&self) -> usize {
        match self {
            Selected::Received(i, _) | Selected::Sent(i) => *i,
        }
    }
}

/// A select over channels of one element type that owns its cases.
///
/// ```
/// use cc_runtime::{Channel, Deadline, FutureStatus, SelectSet, Selected};
///
/// let a: Channel<u32> = Channel::new(1);
/// let b: Channel<u32> = Channel::new(1);
/// let mut set = SelectSet::new();
/// set.recv(&a);
/// set.recv(&b);
/// let mut task = set.into_task(Deadline::none());
/// assert_eq!(task.poll(), FutureStatus::Pending);
/// b.try_send(9).unwrap();
/// assert_eq!(task.block_on(), Ok(Selected::Received(1, 9)));
/// ```
pub struct SelectSet<T> {
    cases: Vec<OwnedCase<T>>,
    seed: Option<u64>,
}

impl<T> SelectSet<T> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            seed: None,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            cases: Vec::new(),
            seed: Some(seed),
        }
    }

    /// Add a receive case. Returns the case index.
    pub fn recv(&mut self, ch: &Channel<T>) -> usize {
        self.cases.push(OwnedCase::Recv(ch.clone()));
        self.cases.len() - 1
    }

    /// Add a send case for `value`. Returns the case index.
    pub fn send(&mut self, ch: &Channel<T>, value: T) -> usize {
        self.cases.push(OwnedCase::Send(ch.clone(), Some(value)));
        self.cases.len() - 1
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Value of send case `idx` that has not been handed over.
    pub fn take_unsent(&mut self, idx: usize) -> Option<T> {
        match self.cases.get_mut(idx) {
            Some(OwnedCase::Send(_, value)) => value.take(),
            _ => None,
        }
    }

    pub fn try_select(&mut self) -> Result<Selected<T>> {
        self.run(None)
    }

    pub fn wait(&mut self, deadline: Deadline) -> Result<Selected<T>> {
        self.run(Some(deadline))
    }

    /// `None` tries once without blocking.
    fn run(&mut self, deadline: Option<Deadline>) -> Result<Selected<T>> {
        let mut outs: Vec<Option<T>> = self.cases.iter().map(|_| None).collect();
        let r = {
            let mut sel = match self.seed {
                Some(seed) => Select::seeded(seed),
                None => Select::new(),
            };
            for (case, out) in self.cases.iter_mut().zip(outs.iter_mut()) {
                match case {
                    OwnedCase::Recv(ch) => sel.recv(ch, out),
                    OwnedCase::Send(ch, value) => sel.send(ch, value),
                };
            }
            match deadline {
                Some(deadline) => sel.wait(deadline),
                None => sel.try_select(),
            }
        };
        let i = r?;
        match self.cases[i] {
            OwnedCase::Recv(_) => outs[i]
                .take()
                .map(|v| Selected::Received(i, v))
                .ok_or(Error::WouldBlock),
            OwnedCase::Send(..) => Ok(Selected::Sent(i)),
        }
    }
}

impl<T: Send + 'static> SelectSet<T> {
    /// A poll task over this select. Polling tries every case once;
    /// waiting on the task blocks until a case commits or `deadline`.
    pub fn into_task(self, deadline: Deadline) -> Task<Selected<T>> {
        struct Frame<T> {
            set: SelectSet<T>,
            deadline: Deadline,
            done: Option<Result<Selected<T>>>,
        }
        let frame = Frame {
            set: self,
            deadline,
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
                match f.set.try_select() {
                    Err(Error::WouldBlock) if f.deadline.expired() => Poll::Ready(Err(Error::Timeout)),
                    Err(Error::WouldBlock) => Poll::Pending,
                    other => Poll::Ready(other),
                }
            },
            |f: &mut Frame<T>, _cx: &PollCx| {
                if f.done.is_none() {
                    f.done = Some(f.set.wait(f.deadline));
                }
            },
        )
    }

    /// Run the whole select on `pool`; the task completes with its outcome.
    pub fn spawn_on(self, pool: &BlockingPool, deadline: Deadline) -> Result<Task<Selected<T>>> {
        let mut set = self;
        Task::blocking_on(pool, move || set.wait(deadline))
    }

    /// [`spawn_on`](Self::spawn_on) the global blocking pool.
    pub fn spawn(self, deadline: Deadline) -> Result<Task<Selected<T>>> {
        let mut set = self;
        Task::blocking(move || set.wait(deadline))
    }
}

impl<T> Default for SelectSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn empty_select_is_invalid() {
        assert!(matches!(Select::new().try_select(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn try_select_would_block() {
        let a: Channel<u8> = Channel::new(1);
        let mut out = None;
        let mut sel = Select::new();
        sel.recv(&a, &mut out);
        assert_eq!(sel.try_select(), Err(Error::WouldBlock));
    }

    #[test]
    fn only_committed_case_changes() {
        let a: Channel<u8> = Channel::new(1);
        let b: Channel<u8> = Channel::new(1);
        let full: Channel<u8> = Channel::new(1);
        full.try_send(0).unwrap();
        b.try_send(5).unwrap();

        let (mut ra, mut rb, mut s) = (None, None, Some(9));
        let mut sel = Select::new();
        sel.recv(&a, &mut ra);
        let ib = sel.recv(&b, &mut rb);
        sel.send(&full, &mut s);
        assert_eq!(sel.wait(Deadline::none()), Ok(ib));
        drop(sel);
        assert_eq!((ra, rb, s), (None, Some(5), Some(9)));
        assert_eq!(full.len(), 1);
    }

    #[test]
    fn timeout_with_nothing_ready() {
        let a: Channel<u8> = Channel::new(1);
        let b: Channel<u8> = Channel::new(0);
        let (mut x, mut y) = (None, None);
        let mut sel = Select::new();
        sel.recv(&a, &mut x);
        sel.recv(&b, &mut y);
        let start = Instant::now();
        assert_eq!(sel.wait(Deadline::after_ms(50)), Err(Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(45));
        drop(sel);
        assert_eq!(b.stats().received, 0);
    }

    #[test]
    fn all_closed_reports_closed() {
        let a: Channel<u8> = Channel::new(1);
        let b: Channel<u8> = Channel::new(0);
        a.close();
        b.close();
        let (mut x, mut y) = (None, None);
        let mut sel = Select::new();
        sel.recv(&a, &mut x);
        sel.recv(&b, &mut y);
        assert_eq!(sel.wait(Deadline::none()), Err(Error::Closed));
    }

    #[test]
    fn close_while_parked_wakes_select() {
        let a: Channel<u8> = Channel::new(0);
        let a2 = a.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            a2.close();
        });
        let mut x = None;
        let mut sel = Select::new();
        sel.recv(&a, &mut x);
        assert_eq!(sel.wait(Deadline::after(Duration::from_secs(5))), Err(Error::Closed));
        closer.join().unwrap();
    }

    #[test]
    fn rendezvous_send_case_commits_with_receiver() {
        let ch: Channel<String> = Channel::new(0);
        let rx = ch.clone();
        let receiver = thread::spawn(move || rx.recv());
        let mut v = Some("hello".to_string());
        let mut sel = Select::new();
        sel.send(&ch, &mut v);
        assert_eq!(sel.wait(Deadline::after(Duration::from_secs(5))), Ok(0));
        drop(sel);
        assert_eq!(v, None);
        assert_eq!(receiver.join().unwrap(), Ok("hello".to_string()));
    }

    #[test]
    fn send_value_returned_on_timeout() {
        let ch: Channel<u32> = Channel::new(0);
        let mut v = Some(77);
        let mut sel = Select::new();
        sel.send(&ch, &mut v);
        assert_eq!(sel.wait(Deadline::after_ms(10)), Err(Error::Timeout));
        drop(sel);
        assert_eq!(v, Some(77));
    }

    #[test]
    fn seeded_order_is_reproducible() {
        let chans: Vec<Channel<u8>> = (0..8).map(|_| Channel::new(1)).collect();
        let mut outs: Vec<Option<u8>> = vec![None; 8];
        let mut sel = Select::seeded(42);
        for (ch, out) in chans.iter().zip(outs.iter_mut()) {
            sel.recv(ch, out);
        }
        let first = sel.order();
        assert_eq!(first, sel.order());
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn racing_selects_commit_each_value_once() {
        // Two selects on the same pair of rendezvous channels, two senders:
        // every value is received exactly once.
        let a: Channel<u32> = Channel::new(0);
        let b: Channel<u32> = Channel::new(0);
        let receivers: Vec<_> = (0..2)
            .map(|_| {
                let (a, b) = (a.clone(), b.clone());
                thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..50 {
                        let (mut x, mut y) = (None, None);
                        let mut sel = Select::new();
                        sel.recv(&a, &mut x);
                        sel.recv(&b, &mut y);
                        let r = sel.wait(Deadline::after(Duration::from_secs(10)));
                        drop(sel);
                        match r {
                            Ok(0) => got.push(x.unwrap()),
                            Ok(_) => got.push(y.unwrap()),
                            Err(e) => panic!("select failed: {:?}", e),
                        }
                    }
                    got
                })
            })
            .collect();
        let sa = {
            let a = a.clone();
            thread::spawn(move || (0..50).for_each(|i| a.send(i).unwrap()))
        };
        let sb = {
            let b = b.clone();
            thread::spawn(move || (100..150).for_each(|i| b.send(i).unwrap()))
        };
        sa.join().unwrap();
        sb.join().unwrap();
        let mut all: Vec<u32> = receivers
            .into_iter()
            .flat_map(|r| r.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u32> = (0..50).chain(100..150).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn parked_selects_see_every_buffered_value() {
        // Consumers block untimed on two tiny buffers while producers keep
        // them full; nothing may be left behind in a buffer.
        const PER_PRODUCER: u32 = 2_000;
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let a: Channel<u32> = Channel::new(1);
            let b: Channel<u32> = Channel::new(2);
            let consumers: Vec<_> = (0..3)
                .map(|_| {
                    let (a, b) = (a.clone(), b.clone());
                    thread::spawn(move || {
                        let mut got = 0u32;
                        loop {
                            let (mut x, mut y) = (None, None);
                            let mut sel = Select::new();
                            sel.recv(&a, &mut x);
                            sel.recv(&b, &mut y);
                            let r = sel.wait(Deadline::none());
                            drop(sel);
                            match r {
                                Ok(_) => got += 1,
                                Err(Error::Closed) => return got,
                                Err(e) => panic!("select failed: {:?}", e),
                            }
                        }
                    })
                })
                .collect();
            let producers: Vec<_> = [a.clone(), b.clone(), a.clone(), b.clone()]
                .into_iter()
                .map(|ch| thread::spawn(move || (0..PER_PRODUCER).for_each(|i| ch.send(i).unwrap())))
                .collect();
            for p in producers {
                p.join().unwrap();
            }
            a.close();
            b.close();
            let total: u32 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
            let _ = done_tx.send((total, a.len() + b.len()));
        });
        let (total, left) = done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("selects stayed parked with values buffered");
        assert_eq!(total, 4 * PER_PRODUCER);
        assert_eq!(left, 0);
    }

    #[test]
    fn select_set_polls_then_commits() {
        let a: Channel<u32> = Channel::new(1);
        let b: Channel<u32> = Channel::new(1);
        let mut set = SelectSet::seeded(7);
        set.recv(&a);
        let ib = set.recv(&b);
        assert_eq!(set.try_select(), Err(Error::WouldBlock));

        let mut task = set.into_task(Deadline::none());
        assert_eq!(task.poll(), crate::task::FutureStatus::Pending);
        b.try_send(4).unwrap();
        assert_eq!(task.poll(), crate::task::FutureStatus::Ready);
        assert_eq!(task.output(), Some(&Selected::Received(ib, 4)));
        assert!(a.is_empty() && b.is_empty());
    }

    #[test]
    fn select_set_task_blocks_until_a_case_commits() {
        let ch: Channel<String> = Channel::new(0);
        let tx = ch.clone();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send("late".to_string())
        });
        let mut set = SelectSet::new();
        set.recv(&ch);
        let got = set.into_task(Deadline::after(Duration::from_secs(5))).block_on();
        assert_eq!(got, Ok(Selected::Received(0, "late".to_string())));
        sender.join().unwrap().unwrap();
    }

    #[test]
    fn select_set_task_times_out() {
        let ch: Channel<u8> = Channel::new(1);
        let mut set = SelectSet::new();
        set.recv(&ch);
        let start = Instant::now();
        let r = set.into_task(Deadline::after_ms(30)).block_on();
        assert_eq!(r, Err(Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn select_set_on_pool_sends_when_space_frees() {
        let pool = BlockingPool::new(1, 4).unwrap();
        let full: Channel<u32> = Channel::new(1);
        full.try_send(1).unwrap();
        let mut set = SelectSet::new();
        let is = set.send(&full, 2);
        let task = set.spawn_on(&pool, Deadline::after(Duration::from_secs(5))).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(full.recv(), Ok(1));
        assert_eq!(task.block_on(), Ok(Selected::Sent(is)));
        assert_eq!(full.recv(), Ok(2));
    }

    #[test]
    fn cancelled_select_set_task_keeps_unsent_value() {
        let pool = BlockingPool::new(1, 4).unwrap();
        let ch: Channel<u32> = Channel::new(0);
        let mut set = SelectSet::new();
        set.send(&ch, 5);
        let task = set.spawn_on(&pool, Deadline::none()).unwrap();
        thread::sleep(Duration::from_millis(20));
        task.cancel();
        assert_eq!(task.block_on(), Err(Error::Cancelled));
        assert_eq!(ch.stats().sent, 0);

        let mut set = SelectSet::new();
        let i = set.send(&ch, 6);
        assert_eq!(set.wait(Deadline::after_ms(5)), Err(Error::Timeout));
        assert_eq!(set.take_unsent(i), Some(6));
        assert_eq!(set.take_unsent(i), None);
    }
}
