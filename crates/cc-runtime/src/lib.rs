// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Concurrent-C runtime library.
//!
//! Fibers run on a fixed pool of worker threads fed by one bounded MPMC
//! queue. They talk over bounded channels, wait on several at once with
//! select, and group into nurseries that never outlive their scope.
//!
//! Components:
//! - sched: fiber scheduler, handles, stats, idle-deadlock heuristic
//! - channel: buffered, rendezvous and pool channels, close/shutdown, stats
//! - select: n-way select over channel sends and receives, blocking or as a task
//! - task: uniform task handle (future/poll/spawn/fiber) and combinators
//! - nursery: structured concurrency scopes
//! - arena: bump allocator with checkpoints
//! - pool / thread: blocking closures and OS-thread tasks
//! - wake / cancel / time: parking, cancellation, deadlines
//! - deadlock: opt-in watchdog for stalled waits
//!
//! Every blocking operation is a suspension point: it honours the current
//! cancellation token and, on a worker thread, hands the worker off while
//! parked.

pub mod arena;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod nursery;
pub mod pool;
pub mod sched;
pub mod select;
pub mod task;
pub mod thread;
pub mod time;
pub mod wake;

mod ring;

pub use arena::{Arena, Checkpoint};
pub use cancel::CancelToken;
pub use channel::{
    buffered, unbuffered, Channel, ChannelMode, ChannelStats, PoolChannel, PoolHooks, Receiver, Sender, Shutdown,
};
pub use config::RuntimeConfig;
pub use error::{Error, Result, SendError};
pub use nursery::Nursery;
pub use pool::{BlockingPool, PoolStats};
pub use sched::{FiberHandle, Scheduler, SchedulerStats};
pub use select::{Select, SelectSet, Selected};
pub use task::{block_all, block_any, block_race, AwaitSlot, FutureStatus, PollCx, Task, TaskCanceller};
pub use time::Deadline;
pub use wake::{SpinCondvar, WakePrimitive};
