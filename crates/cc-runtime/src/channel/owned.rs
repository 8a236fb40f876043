// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Owned channels: a bounded channel used as a resource pool.
//!
//! Receiving from an empty pool creates a fresh item while fewer than
//! `capacity` items exist; past that, receivers wait for an item to come
//! back. Sending returns an item, passing it through the reset hook first.
//! When the last handle drops, items still pooled go through the destroy
//! hook. Items checked out at that point belong to their holders.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result, SendError};
use crate::time::Deadline;

use super::{Channel, ChannelStats};

type CreateFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;
type DestroyFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// Lifecycle hooks of a [`PoolChannel`].
pub struct PoolHooks<T> {
    create: CreateFn<T>,
    reset: Option<ResetFn<T>>,
    destroy: Option<DestroyFn<T>>,
}

impl<T> PoolHooks<T> {
    /// `create` makes a new item when a receiver finds the pool empty.
    pub fn new(create: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            create: Box::new(create),
            reset: None,
            destroy: None,
        }
    }

    /// Run on every item handed back with `send`.
    pub fn on_reset(mut self, reset: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        self.reset = Some(Box::new(reset));
        self
    }

    /// Run on every item still pooled when the pool goes away. Without it
    /// pooled items are simply dropped.
    pub fn on_destroy(mut self, destroy: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.destroy = Some(Box::new(destroy));
        self
    }
}

struct PoolShared<T> {
    ch: Channel<T>,
    hooks: PoolHooks<T>,
    created: AtomicUsize,
}

impl<T> PoolShared<T> {
    /// Reserve one creation if the pool is below capacity.
    fn claim_creation(&self) -> bool {
        let cap = self.ch.capacity();
        self.created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < cap).then_some(n + 1))
            .is_ok()
    }
}

impl<T> Drop for PoolShared<T> {
    fn drop(&mut self) {
        self.ch.close();
        let mut destroyed = 0usize;
        while let Ok(item) = self.ch.try_recv() {
            match &self.hooks.destroy {
                Some(destroy) => destroy(item),
                None => drop(item),
            }
            destroyed += 1;
        }
        debug!(
            created = self.created.load(Ordering::Relaxed),
            destroyed,
            "pool channel released"
        );
    }
}

/// A bounded channel that creates its items on demand.
///
/// ```
/// use cc_runtime::{Channel, PoolHooks};
///
/// let pool = Channel::owned(2, PoolHooks::new(Vec::<u8>::new).on_reset(|buf| buf.clear())).unwrap();
/// let mut buf = pool.recv().unwrap();
/// buf.extend_from_slice(b"scratch");
/// pool.send(buf).unwrap();
/// assert!(pool.recv().unwrap().is_empty());
/// assert_eq!(pool.created(), 1);
/// ```
pub struct PoolChannel<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Channel<T> {
    /// A pool of at most `capacity` items made by `hooks`.
    /// `InvalidArgument` for capacity 0.
    pub fn owned(capacity: usize, hooks: PoolHooks<T>) -> Result<PoolChannel<T>> {
        PoolChannel::new(capacity, hooks)
    }
}

impl<T> PoolChannel<T> {
    pub fn new(capacity: usize, hooks: PoolHooks<T>) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("pool channel needs a capacity"));
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                ch: Channel::new(capacity),
                hooks,
                created: AtomicUsize::new(0),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.ch.capacity()
    }

    /// Items made so far; never more than the capacity.
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Items sitting in the pool right now.
    pub fn available(&self) -> usize {
        self.shared.ch.len()
    }

    /// Take a pooled item, or create one if the pool is empty and below
    /// capacity. `WouldBlock` when every item is checked out.
    pub fn try_recv(&self) -> Result<T> {
        match self.shared.ch.try_recv() {
            Err(Error::WouldBlock) => {}
            other => return other,
        }
        if self.shared.claim_creation() {
            Ok((self.shared.hooks.create)())
        } else {
            Err(Error::WouldBlock)
        }
    }

    /// Like [`try_recv`](Self::try_recv), but waits for an item to be
    /// returned once the capacity is used up.
    pub fn recv(&self) -> Result<T> {
        self.timed_recv(Deadline::none())
    }

    pub fn timed_recv(&self, deadline: Deadline) -> Result<T> {
        match self.try_recv() {
            Err(Error::WouldBlock) => self.shared.ch.timed_recv(deadline),
            other => other,
        }
    }

    /// Reset `item` and return it to the pool.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        self.timed_send(item, Deadline::none())
    }

    pub fn try_send(&self, item: T) -> Result<(), SendError<T>> {
        self.shared.ch.try_send(self.reset(item))
    }

    pub fn timed_send(&self, item: T, deadline: Deadline) -> Result<(), SendError<T>> {
        self.shared.ch.timed_send(self.reset(item), deadline)
    }

    /// Stop taking items back and creating new ones. Pooled items can
    /// still be received.
    pub fn close(&self) {
        self.shared.ch.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.ch.is_closed()
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.ch.stats()
    }

    fn reset(&self, mut item: T) -> T {
        if let Some(reset) = &self.shared.hooks.reset {
            reset(&mut item);
        }
        item
    }
}

impl<T> Clone for PoolChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for PoolChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolChannel")
            .field("capacity", &self.capacity())
            .field("created", &self.created())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn counted(made: &Arc<AtomicUsize>) -> PoolHooks<usize> {
        let made = made.clone();
        PoolHooks::new(move || made.fetch_add(1, Ordering::SeqCst))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            Channel::owned(0, PoolHooks::new(|| 0u8)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn creates_on_demand_up_to_capacity() {
        let made = Arc::new(AtomicUsize::new(0));
        let pool = Channel::owned(2, counted(&made)).unwrap();
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.recv(), Ok(0));
        assert_eq!(pool.recv(), Ok(1));
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.try_recv(), Err(Error::WouldBlock));
        assert_eq!(
            pool.timed_recv(Deadline::after_ms(10)),
            Err(Error::Timeout)
        );

        pool.send(1).unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.recv(), Ok(1));
        assert_eq!(made.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn returned_items_are_reset() {
        let pool = Channel::owned(
            1,
            PoolHooks::new(String::new).on_reset(|s: &mut String| s.clear()),
        )
        .unwrap();
        let mut s = pool.recv().unwrap();
        s.push_str("dirty");
        pool.send(s).unwrap();
        assert_eq!(pool.recv(), Ok(String::new()));
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn exhausted_pool_waits_for_a_return() {
        let pool = Channel::owned(1, PoolHooks::new(|| 7u32)).unwrap();
        let item = pool.recv().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.recv())
        };
        thread::sleep(Duration::from_millis(20));
        pool.send(item).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(7));
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn pooled_items_destroyed_with_last_handle() {
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let made = Arc::new(AtomicUsize::new(0));
        let outstanding;
        {
            let sink = destroyed.clone();
            let pool = Channel::owned(
                3,
                counted(&made).on_destroy(move |item| sink.lock().unwrap().push(item)),
            )
            .unwrap();
            let other = pool.clone();
            let a = pool.recv().unwrap();
            let b = pool.recv().unwrap();
            outstanding = pool.recv().unwrap();
            pool.send(a).unwrap();
            other.send(b).unwrap();
            drop(pool);
            assert!(destroyed.lock().unwrap().is_empty());
        }
        let mut got = destroyed.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1]);
        assert_eq!(outstanding, 2);
    }

    #[test]
    fn closed_pool_stops_creating() {
        let pool = Channel::owned(2, PoolHooks::new(|| 1u8)).unwrap();
        let item = pool.recv().unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.send(item).unwrap_err().error, Error::Closed);
        assert_eq!(pool.try_recv(), Err(Error::Closed));
        assert_eq!(pool.created(), 1);
    }
}
