// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Uniform handle over deferred computations.
//!
//! A [`Task`] is backed by one of four kinds:
//!
//! - **Future**: a closure on the [blocking pool](crate::pool)
//! - **Poll**: a state machine driven by repeated `poll` calls
//! - **Spawn**: a dedicated OS thread
//! - **Fiber**: a fiber on a [`Scheduler`]
//!
//! Every kind answers `poll` without blocking and `block_on` by waiting.
//! Once terminal, the outcome is cached, so further polls repeat it.
//!
//! State machines use [`AwaitSlot`] for their await points: store the
//! sub-task, return `Pending`, and on re-entry poll the slot until it yields
//! the sub-task's result.

mod combinators;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use crate::cancel::{self, CancelToken};
use crate::channel::Channel;
use crate::deadlock::{self, BlockReason};
use crate::error::{lock, Error, Result};
use crate::pool::{self, BlockingPool};
use crate::sched::{self, FiberHandle, Scheduler};
use crate::thread::{self as task_thread, ThreadTask};

pub use combinators::{block_all, block_any, block_race};

/// Conventional terminal state number for generated state machines.
pub const STATE_DONE: u32 = 999;

/// Result of [`Task::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Pending,
    Ready,
    Err,
}

/// Context handed to poll and wait functions.
#[derive(Debug, Clone)]
pub struct PollCx {
    token: Arc<CancelToken>,
}

impl PollCx {
    /// True once the task has been cancelled. State machines should finish
    /// with `Err(Cancelled)` when they see it.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &Arc<CancelToken> {
        &self.token
    }
}

trait Machine<T>: Send {
    fn poll(&mut self, cx: &PollCx) -> Poll<Result<T>>;
    /// Block until progress is likely. False if the machine has no wait hook.
    fn wait(&mut self, cx: &PollCx) -> bool;
}

struct FrameMachine<F, P, W> {
    frame: F,
    poll: P,
    wait: Option<W>,
}

impl<T, F, P, W> Machine<T> for FrameMachine<F, P, W>
where
    F: Send,
    P: FnMut(&mut F, &PollCx) -> Poll<Result<T>> + Send,
    W: FnMut(&mut F, &PollCx) + Send,
{
    fn poll(&mut self, cx: &PollCx) -> Poll<Result<T>> {
        (self.poll)(&mut self.frame, cx)
    }

    fn wait(&mut self, cx: &PollCx) -> bool {
        match &mut self.wait {
            Some(wait) => {
                wait(&mut self.frame, cx);
                true
            }
            None => false,
        }
    }
}

struct FutureTask<T> {
    done: Channel<Result<()>>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> FutureTask<T> {
    fn finish(&self, code: Result<Result<()>>) -> Result<T> {
        // A closed, empty completion channel means the task was cancelled.
        let code = code.unwrap_or(Err(Error::Cancelled));
        code.and_then(|()| {
            lock(&self.slot)
                .take()
                .ok_or(Error::InvalidArgument("task result already taken"))
        })
    }
}

/// The backing of a [`Task`].
enum TaskKind<T> {
    Future(FutureTask<T>),
    Poll(Box<dyn Machine<T>>),
    Spawn(ThreadTask<T>),
    Fiber(FiberHandle<Result<T>>),
    /// Outcome already moved into the task.
    Finished,
}

impl<T: Send + 'static> TaskKind<T> {
    fn poll(&mut self, cx: &PollCx) -> Poll<Result<T>> {
        match self {
            TaskKind::Future(f) => match f.done.try_recv() {
                Err(Error::WouldBlock) => Poll::Pending,
                code => Poll::Ready(f.finish(code)),
            },
            TaskKind::Poll(m) => m.poll(cx),
            TaskKind::Spawn(t) => {
                if !t.is_finished() {
                    return Poll::Pending;
                }
                match std::mem::replace(self, TaskKind::Finished) {
                    TaskKind::Spawn(t) => Poll::Ready(t.join()),
                    _ => Poll::Pending,
                }
            }
            TaskKind::Fiber(h) => match h.try_join() {
                Some(r) => Poll::Ready(r.and_then(|inner| inner)),
                None => Poll::Pending,
            },
            TaskKind::Finished => Poll::Ready(Err(Error::InvalidArgument("task already finished"))),
        }
    }

    fn block(&mut self, cx: &PollCx) -> Result<T> {
        match std::mem::replace(self, TaskKind::Finished) {
            TaskKind::Future(f) => {
                let code = {
                    let _blocked = deadlock::enter(BlockReason::TaskWait);
                    let _park = sched::park_current(false);
                    f.done.recv()
                };
                f.finish(code)
            }
            TaskKind::Poll(mut m) => {
                let r = drive(m.as_mut(), cx);
                *self = TaskKind::Poll(m);
                r
            }
            TaskKind::Spawn(t) => t.join(),
            TaskKind::Fiber(h) => h.join().and_then(|inner| inner),
            TaskKind::Finished => Err(Error::InvalidArgument("task already finished")),
        }
    }
}

fn drive<T>(m: &mut dyn Machine<T>, cx: &PollCx) -> Result<T> {
    loop {
        if let Poll::Ready(r) = m.poll(cx) {
            return r;
        }
        let waited = cancel::scope(Some(cx.token.clone()), || m.wait(cx));
        if !waited {
            // Pure state machines make progress on every poll.
            sched::yield_now();
        } else if cx.is_cancelled() {
            if let Poll::Ready(r) = m.poll(cx) {
                return r;
            }
            return Err(Error::Cancelled);
        }
    }
}

/// A deferred computation producing `T`.
pub struct Task<T> {
    kind: TaskKind<T>,
    cx: PollCx,
    /// Completion channel of a Future task; closing it wakes the joiner.
    done: Option<Channel<Result<()>>>,
    outcome: Option<Result<T>>,
    status: FutureStatus,
}

impl<T: Send + 'static> Task<T> {
    fn new(kind: TaskKind<T>, token: Arc<CancelToken>) -> Self {
        let done = match &kind {
            TaskKind::Future(f) => Some(f.done.clone()),
            _ => None,
        };
        Self {
            kind,
            cx: PollCx { token },
            done,
            outcome: None,
            status: FutureStatus::Pending,
        }
    }

    /// An already-terminal task.
    pub fn ready(result: Result<T>) -> Self {
        let mut task = Self::new(TaskKind::Finished, Arc::new(CancelToken::new()));
        task.settle(result);
        task
    }

    /// Run `f` on the global blocking pool.
    pub fn blocking<F>(f: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self::blocking_on(pool::global()?, f)
    }

    /// Run `f` on `pool`. Fails with `QueueFull` if the pool is saturated.
    pub fn blocking_on<F>(pool: &BlockingPool, f: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let token = child_of_current();
        let done: Channel<Result<()>> = Channel::new(1);
        let slot = Arc::new(Mutex::new(None));
        let job = {
            let (token, done, slot) = (token.clone(), done.clone(), slot.clone());
            move || {
                if token.is_cancelled() {
                    let _ = done.try_send(Err(Error::Cancelled));
                    return;
                }
                let r = cancel::scope(Some(token), || {
                    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|p| Err(Error::from_panic(p)))
                });
                let code = r.map(|v| {
                    *lock(&slot) = Some(v);
                });
                let _ = done.try_send(code);
            }
        };
        pool.submit(job)?;
        Ok(Self::new(TaskKind::Future(FutureTask { done, slot }), token))
    }

    /// A state machine without a wait hook; `block_on` re-polls it.
    pub fn from_poll<F, P>(frame: F, poll: P) -> Self
    where
        F: Send + 'static,
        P: FnMut(&mut F, &PollCx) -> Poll<Result<T>> + Send + 'static,
    {
        let machine = FrameMachine {
            frame,
            poll,
            wait: None::<fn(&mut F, &PollCx)>,
        };
        Self::new(TaskKind::Poll(Box::new(machine)), child_of_current())
    }

    /// A state machine whose `wait` blocks until re-polling is worthwhile.
    /// The wait runs with the task's token as the current token.
    pub fn from_poll_with_wait<F, P, W>(frame: F, poll: P, wait: W) -> Self
    where
        F: Send + 'static,
        P: FnMut(&mut F, &PollCx) -> Poll<Result<T>> + Send + 'static,
        W: FnMut(&mut F, &PollCx) + Send + 'static,
    {
        let machine = FrameMachine {
            frame,
            poll,
            wait: Some(wait),
        };
        Self::new(TaskKind::Poll(Box::new(machine)), child_of_current())
    }

    /// Run `f` on its own OS thread.
    pub fn thread<F>(f: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let t = task_thread::spawn(f)?;
        let token = t.cancel_token().clone();
        Ok(Self::new(TaskKind::Spawn(t), token))
    }

    /// Run `f` as a fiber on the current worker's scheduler, or the global one.
    pub fn fiber<F>(f: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self::fiber_on(&sched::current_or_global()?, f)
    }

    pub fn fiber_on<F>(scheduler: &Arc<Scheduler>, f: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let h = scheduler.spawn(f)?;
        let token = h.cancel_token().clone();
        Ok(Self::new(TaskKind::Fiber(h), token))
    }

    /// Advance without blocking.
    pub fn poll(&mut self) -> FutureStatus {
        if self.status == FutureStatus::Pending {
            if let Poll::Ready(r) = self.kind.poll(&self.cx) {
                self.settle(r);
            }
        }
        self.status
    }

    /// Block until terminal. Returns the final status.
    pub fn wait(&mut self) -> FutureStatus {
        if self.status == FutureStatus::Pending {
            let r = self.kind.block(&self.cx);
            self.settle(r);
        }
        self.status
    }

    /// Wait and take the result.
    pub fn block_on(mut self) -> Result<T> {
        self.wait();
        self.outcome
            .take()
            .unwrap_or(Err(Error::InvalidArgument("task result already taken")))
    }

    /// Output of a task that finished successfully.
    pub fn output(&self) -> Option<&T> {
        self.outcome.as_ref().and_then(|r| r.as_ref().ok())
    }

    /// Error of a task that failed.
    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().and_then(|r| r.as_ref().err())
    }

    pub fn status(&self) -> FutureStatus {
        self.status
    }

    fn settle(&mut self, r: Result<T>) {
        self.status = if r.is_ok() { FutureStatus::Ready } else { FutureStatus::Err };
        self.outcome = Some(r);
        if let TaskKind::Poll(_) = self.kind {
            // Run the frame's drop hook as soon as the machine is done.
            self.kind = TaskKind::Finished;
        }
    }
}

impl<T> Task<T> {
    /// Request cancellation. See [`TaskCanceller::cancel`].
    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cx.is_cancelled()
    }

    /// A handle that can cancel this task from elsewhere.
    pub fn canceller(&self) -> TaskCanceller {
        TaskCanceller {
            token: self.cx.token.clone(),
            done: self.done.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TaskKind::Future(_) => "future",
            TaskKind::Poll(_) => "poll",
            TaskKind::Spawn(_) => "spawn",
            TaskKind::Fiber(_) => "fiber",
            TaskKind::Finished => "finished",
        };
        f.debug_struct("Task")
            .field("kind", &kind)
            .field("status", &self.status)
            .finish()
    }
}

/// Cancels a task it was taken from.
#[derive(Debug, Clone)]
pub struct TaskCanceller {
    token: Arc<CancelToken>,
    done: Option<Channel<Result<()>>>,
}

impl TaskCanceller {
    /// Future tasks that have not started are skipped and a blocked joiner
    /// wakes with `Cancelled`. Poll machines see it through
    /// [`PollCx::is_cancelled`]; threads and fibers see it at their next
    /// cancellable wait.
    pub fn cancel(&self) {
        self.token.cancel();
        if let Some(done) = &self.done {
            done.close();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn child_of_current() -> Arc<CancelToken> {
    match cancel::current() {
        Some(parent) => parent.child(),
        None => Arc::new(CancelToken::new()),
    }
}

/// An await point on a state machine frame.
pub struct AwaitSlot<U> {
    task: Option<Task<U>>,
}

impl<U: Send + 'static> AwaitSlot<U> {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Store the sub-task being awaited.
    pub fn start(&mut self, task: Task<U>) {
        self.task = Some(task);
    }

    pub fn is_empty(&self) -> bool {
        self.task.is_none()
    }

    /// Poll the stored sub-task. On completion the sub-task is released and
    /// its result returned.
    pub fn poll(&mut self) -> Poll<Result<U>> {
        let Some(task) = &mut self.task else {
            return Poll::Ready(Err(Error::InvalidArgument("nothing awaited")));
        };
        if task.poll() == FutureStatus::Pending {
            return Poll::Pending;
        }
        match self.task.take() {
            Some(task) => Poll::Ready(task.block_on()),
            None => Poll::Pending,
        }
    }

    /// Block on the stored sub-task; for use from a wait hook.
    pub fn wait(&mut self) {
        if let Some(task) = &mut self.task {
            task.wait();
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            task.cancel();
        }
    }
}

impl<U: Send + 'static> Default for AwaitSlot<U> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::time;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn ready_task_is_terminal() {
        let mut t = Task::ready(Ok(5));
        assert_eq!(t.poll(), FutureStatus::Ready);
        assert_eq!(t.poll(), FutureStatus::Ready);
        assert_eq!(t.output(), Some(&5));
        assert_eq!(t.block_on(), Ok(5));
    }

    #[test]
    fn blocking_task_on_pool() {
        let pool = BlockingPool::new(2, 8).unwrap();
        let t = Task::blocking_on(&pool, || Ok("from pool")).unwrap();
        assert_eq!(t.block_on(), Ok("from pool"));
    }

    #[test]
    fn blocking_task_error_and_repeat_poll() {
        let pool = BlockingPool::new(1, 8).unwrap();
        let mut t = Task::blocking_on(&pool, || -> Result<u8> { Err(Error::failed("io")) }).unwrap();
        assert_eq!(t.wait(), FutureStatus::Err);
        assert_eq!(t.poll(), FutureStatus::Err);
        assert_eq!(t.error(), Some(&Error::failed("io")));
    }

    #[test]
    fn cancel_wakes_blocked_future_joiner() {
        let pool = BlockingPool::new(1, 8).unwrap();
        let t = Task::blocking_on(&pool, || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(1)
        })
        .unwrap();
        let canceller = t.canceller();
        let start = Instant::now();
        let joiner = std::thread::spawn(move || t.block_on());
        std::thread::sleep(Duration::from_millis(20));
        canceller.cancel();
        assert_eq!(joiner.join().unwrap(), Err(Error::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(250));
        assert!(canceller.is_cancelled());
    }

    #[test]
    fn poll_machine_counts_to_three() {
        let mut t = Task::from_poll(0u32, |n: &mut u32, _cx: &PollCx| {
            *n += 1;
            if *n == 3 {
                Poll::Ready(Ok(*n))
            } else {
                Poll::Pending
            }
        });
        assert_eq!(t.poll(), FutureStatus::Pending);
        assert_eq!(t.poll(), FutureStatus::Pending);
        assert_eq!(t.poll(), FutureStatus::Ready);
        assert_eq!(t.poll(), FutureStatus::Ready);
        assert_eq!(t.output(), Some(&3));
    }

    #[test]
    fn poll_machine_frame_dropped_on_completion() {
        struct Frame(Arc<AtomicUsize>);
        impl Drop for Frame {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let drops = Arc::new(AtomicUsize::new(0));
        let mut t = Task::from_poll(Frame(drops.clone()), |_f: &mut Frame, _cx: &PollCx| {
            Poll::Ready(Ok(()))
        });
        assert_eq!(t.poll(), FutureStatus::Ready);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn poll_machine_sees_cancel() {
        let mut t = Task::from_poll((), |_f: &mut (), cx: &PollCx| -> Poll<Result<()>> {
            if cx.is_cancelled() {
                Poll::Ready(Err(Error::Cancelled))
            } else {
                Poll::Pending
            }
        });
        assert_eq!(t.poll(), FutureStatus::Pending);
        t.cancel();
        assert!(t.is_cancelled());
        assert_eq!(t.poll(), FutureStatus::Err);
        assert_eq!(t.error(), Some(&Error::Cancelled));
    }

    #[test]
    fn wait_hook_runs_under_task_token() {
        let t = Task::from_poll_with_wait(
            false,
            |slept: &mut bool, _cx: &PollCx| {
                if *slept {
                    Poll::Ready(Ok("woke"))
                } else {
                    Poll::Pending
                }
            },
            |slept: &mut bool, _cx: &PollCx| {
                *slept = time::sleep(Duration::from_millis(5)).is_ok();
            },
        );
        assert_eq!(t.block_on(), Ok("woke"));
    }

    #[test]
    fn thread_task() {
        let mut t = Task::thread(|| {
            std::thread::sleep(Duration::from_millis(10));
            Ok(11)
        })
        .unwrap();
        assert_eq!(t.wait(), FutureStatus::Ready);
        assert_eq!(t.output(), Some(&11));
    }

    #[test]
    fn fiber_task_on_private_scheduler() {
        let s = Scheduler::new(RuntimeConfig::new().workers(2)).unwrap();
        let t = Task::fiber_on(&s, || Ok(String::from("fiber"))).unwrap();
        assert_eq!(t.block_on(), Ok("fiber".to_string()));
        let failing = Task::fiber_on(&s, || -> Result<()> { Err(Error::failed("bad")) }).unwrap();
        assert_eq!(failing.block_on(), Err(Error::failed("bad")));
    }

    #[test]
    fn await_slot_drives_sub_task() {
        // state 0: start the sub-task; state 1: await it; STATE_DONE: publish.
        struct Frame {
            state: u32,
            sub: AwaitSlot<u32>,
            acc: u32,
        }
        let frame = Frame {
            state: 0,
            sub: AwaitSlot::new(),
            acc: 0,
        };
        let t = Task::from_poll_with_wait(
            frame,
            |f: &mut Frame, _cx: &PollCx| loop {
                match f.state {
                    0 => {
                        match Task::thread(|| Ok(41)) {
                            Ok(sub) => f.sub.start(sub),
                            Err(e) => return Poll::Ready(Err(e)),
                        }
                        f.state = 1;
                        return Poll::Pending;
                    }
                    1 => match f.sub.poll() {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(r) => {
                            f.acc = match r {
                                Ok(v) => v + 1,
                                Err(e) => return Poll::Ready(Err(e)),
                            };
                            f.state = STATE_DONE;
                        }
                    },
                    _ => return Poll::Ready(Ok(f.acc)),
                }
            },
            |f: &mut Frame, _cx: &PollCx| f.sub.wait(),
        );
        assert_eq!(t.block_on(), Ok(42));
    }
}
