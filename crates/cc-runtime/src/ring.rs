// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded lock-free MPMC ring.
//!
//! Each slot carries a sequence number. A producer at position `p` may write
//! the slot once its sequence equals `p`, then publishes `p + 1`. A consumer
//! at `p` may read once the sequence equals `p + 1`, then publishes
//! `p + slots` to hand the slot back to producers of the next lap.
//! Positions are never reused for a different lap, so there is no ABA.
//!
//! The protocol cannot tell a full one-slot ring from an empty one, so at
//! least two slots are allocated and the requested capacity is enforced
//! against `tail - head` before a producer claims a position.
//!
//! Used for the scheduler's runnable queue, the fiber record pool and the
//! buffer of FIFO channels.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Retries a consumer makes when a producer has claimed a slot but not yet
/// published it.
const PUBLISH_SPINS: u32 = 64;

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub(crate) struct Ring<T> {
    slots: Box<[Slot<T>]>,
    cap: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// Values move between threads through the ring; slot access is serialized
// by the sequence protocol.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// A ring holding at most `capacity` values (at least one).
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity.max(2))
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            cap: capacity,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    /// Approximate number of values; exact when no push/pop is in flight.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue, handing the value back when the ring is full.
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        let slots = self.slots.len();
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            let used = pos.wrapping_sub(head) as isize;
            if used < 0 {
                // Stale tail; consumers have already moved past it.
                pos = self.tail.load(Ordering::Relaxed);
                continue;
            }
            if used as usize >= self.cap {
                return Err(value);
            }
            let slot = &self.slots[pos % slots];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue the oldest value, `None` when empty.
    pub(crate) fn pop(&self) -> Option<T> {
        let slots = self.slots.len();
        let mut pos = self.head.load(Ordering::Relaxed);
        let mut spins = 0;
        loop {
            let slot = &self.slots[pos % slots];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos.wrapping_add(1) as isize;
            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq.store(pos.wrapping_add(slots), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                // Either empty, or a producer claimed this slot and has not
                // published yet.
                let claimed = self.tail.load(Ordering::Acquire) != pos;
                if !claimed || spins >= PUBLISH_SPINS {
                    return None;
                }
                spins += 1;
                std::hint::spin_loop();
                pos = self.head.load(Ordering::Relaxed);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_and_capacity() {
        let r = Ring::new(3);
        assert!(r.is_empty());
        r.push(1).unwrap();
        r.push(2).unwrap();
        r.push(3).unwrap();
        assert_eq!(r.push(4), Err(4));
        assert_eq!(r.len(), 3);
        assert_eq!(r.pop(), Some(1));
        r.push(4).unwrap();
        assert_eq!(r.pop(), Some(2));
        assert_eq!(r.pop(), Some(3));
        assert_eq!(r.pop(), Some(4));
        assert_eq!(r.pop(), None);
    }

    #[test]
    fn single_slot_holds_one_value() {
        let r = Ring::new(1);
        assert_eq!(r.capacity(), 1);
        r.push(1).unwrap();
        assert_eq!(r.push(2), Err(2));
        assert_eq!(r.len(), 1);
        assert_eq!(r.pop(), Some(1));
        assert_eq!(r.pop(), None);
        for i in 0..100 {
            r.push(i).unwrap();
            assert_eq!(r.push(i + 1), Err(i + 1));
            assert_eq!(r.pop(), Some(i));
        }
        assert!(r.is_empty());
    }

    #[test]
    fn single_slot_drop_releases_value() {
        let item = Arc::new(());
        {
            let r = Ring::new(1);
            r.push(item.clone()).unwrap();
            assert!(r.push(item.clone()).is_err());
            assert_eq!(Arc::strong_count(&item), 2);
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn odd_capacity_is_exact() {
        let r = Ring::new(3);
        for lap in 0..50 {
            for i in 0..3 {
                r.push(lap * 3 + i).unwrap();
            }
            assert!(r.push(-1).is_err());
            for i in 0..3 {
                assert_eq!(r.pop(), Some(lap * 3 + i));
            }
        }
    }

    #[test]
    fn wraps_many_laps() {
        let r = Ring::new(2);
        for i in 0..1000 {
            r.push(i).unwrap();
            assert_eq!(r.pop(), Some(i));
        }
    }

    #[test]
    fn drop_releases_values() {
        let item = Arc::new(());
        {
            let r = Ring::new(4);
            r.push(item.clone()).unwrap();
            r.push(item.clone()).unwrap();
            assert_eq!(Arc::strong_count(&item), 3);
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        const PER_PRODUCER: u64 = 10_000;
        let r = Arc::new(Ring::new(64));
        let sum = Arc::new(AtomicU64::new(0));
        let taken = Arc::new(AtomicU64::new(0));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let r = r.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut v = p * PER_PRODUCER + i;
                        while let Err(back) = r.push(v) {
                            v = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let (r, sum, taken) = (r.clone(), sum.clone(), taken.clone());
                thread::spawn(move || {
                    while taken.load(Ordering::Relaxed) < 4 * PER_PRODUCER {
                        match r.pop() {
                            Some(v) => {
                                sum.fetch_add(v, Ordering::Relaxed);
                                taken.fetch_add(1, Ordering::Relaxed);
                            }
                            None => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();
        for t in producers.into_iter().chain(consumers) {
            t.join().unwrap();
        }
        let n = 4 * PER_PRODUCER;
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
    }
}
