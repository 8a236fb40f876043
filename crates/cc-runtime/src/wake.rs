// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wake primitive: a 32-bit counter a thread can sleep on until it changes.
//!
//! Linux/Android use `futex`, macOS uses `__ulock_wait`/`__ulock_wake`,
//! everything else falls back to a mutex and condition variable. Wakers skip
//! the syscall entirely while nobody is parked.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::time::Deadline;

/// Spin iterations with a CPU pause hint before yielding.
pub const SPIN_FAST_ITERS: u32 = 32;
/// `sched_yield` iterations before parking.
pub const SPIN_YIELD_ITERS: u32 = 64;

pub struct WakePrimitive {
    value: AtomicU32,
    sleepers: AtomicU32,
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    fallback: (std::sync::Mutex<()>, std::sync::Condvar),
}

impl WakePrimitive {
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
            sleepers: AtomicU32::new(0),
            #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
            fallback: (std::sync::Mutex::new(()), std::sync::Condvar::new()),
        }
    }

    /// Current counter value. Capture it before checking a condition, then
    /// pass it to [`wait`](Self::wait).
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Sleep while the counter still equals `expected`. May return spuriously.
    pub fn wait(&self, expected: u32) {
        self.park(expected, None);
    }

    /// Like [`wait`](Self::wait) with an upper bound. Returns `false` if the
    /// timeout elapsed.
    pub fn wait_timeout(&self, expected: u32, timeout: Duration) -> bool {
        self.park(expected, Some(timeout))
    }

    /// Wait bounded by a deadline. Returns `false` once the deadline has
    /// passed; callers still re-check their condition.
    pub fn wait_until(&self, expected: u32, deadline: Deadline) -> bool {
        match deadline.remaining() {
            None => {
                self.wait(expected);
                true
            }
            Some(left) if left.is_zero() => false,
            Some(left) => self.wait_timeout(expected, left),
        }
    }

    pub fn wake_one(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            os::wake(self, false);
        }
    }

    pub fn wake_all(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            os::wake(self, true);
        }
    }

    fn park(&self, expected: u32, timeout: Option<Duration>) -> bool {
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let woke = if self.value.load(Ordering::SeqCst) != expected {
            true
        } else {
            os::wait(self, expected, timeout)
        };
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        woke
    }
}

impl Default for WakePrimitive {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WakePrimitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakePrimitive")
            .field("value", &self.load())
            .field("sleepers", &self.sleepers.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod os {
    use super::WakePrimitive;
    use std::io;
    use std::time::Duration;

    pub(super) fn wait(wp: &WakePrimitive, expected: u32, timeout: Option<Duration>) -> bool {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        let r = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &wp.value as *const _ as *const u32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        !(r == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ETIMEDOUT))
    }

    pub(super) fn wake(wp: &WakePrimitive, all: bool) {
        let n: libc::c_int = if all { libc::c_int::MAX } else { 1 };
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &wp.value as *const _ as *const u32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
            );
        }
    }
}

#[cfg(target_os = "macos")]
mod os {
    use super::WakePrimitive;
    use std::time::Duration;

    const UL_COMPARE_AND_WAIT: u32 = 1;
    const ULF_WAKE_ALL: u32 = 0x0000_0100;
    const ULF_NO_ERRNO: u32 = 0x0100_0000;

    extern "C" {
        fn __ulock_wait(operation: u32, addr: *mut libc::c_void, value: u64, timeout_us: u32) -> libc::c_int;
        fn __ulock_wake(operation: u32, addr: *mut libc::c_void, wake_value: u64) -> libc::c_int;
    }

    pub(super) fn wait(wp: &WakePrimitive, expected: u32, timeout: Option<Duration>) -> bool {
        // 0 means "no timeout" to the kernel, so a tiny timeout rounds up.
        let us = timeout.map_or(0, |d| d.as_micros().clamp(1, u32::MAX as u128) as u32);
        let r = unsafe {
            __ulock_wait(
                UL_COMPARE_AND_WAIT | ULF_NO_ERRNO,
                &wp.value as *const _ as *mut libc::c_void,
                expected as u64,
                us,
            )
        };
        r != -libc::ETIMEDOUT
    }

    pub(super) fn wake(wp: &WakePrimitive, all: bool) {
        let op = UL_COMPARE_AND_WAIT | ULF_NO_ERRNO | if all { ULF_WAKE_ALL } else { 0 };
        unsafe {
            __ulock_wake(op, &wp.value as *const _ as *mut libc::c_void, 0);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
mod os {
    use super::WakePrimitive;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    pub(super) fn wait(wp: &WakePrimitive, expected: u32, timeout: Option<Duration>) -> bool {
        let (lock, cvar) = &wp.fallback;
        let guard = crate::error::lock(lock);
        if wp.value.load(Ordering::SeqCst) != expected {
            return true;
        }
        match timeout {
            None => {
                let _g = cvar.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner);
                true
            }
            Some(t) => {
                let (_g, res) = cvar
                    .wait_timeout(guard, t)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                !res.timed_out()
            }
        }
    }

    pub(super) fn wake(wp: &WakePrimitive, all: bool) {
        let (lock, cvar) = &wp.fallback;
        drop(crate::error::lock(lock));
        if all {
            cvar.notify_all();
        } else {
            cvar.notify_one();
        }
    }
}

/// Condition variable that spins briefly before parking.
///
/// Waits spin [`SPIN_FAST_ITERS`] times, then yield [`SPIN_YIELD_ITERS`]
/// times, then park on a [`WakePrimitive`].
#[derive(Debug, Default)]
pub struct SpinCondvar {
    wp: WakePrimitive,
}

impl SpinCondvar {
    pub const fn new() -> Self {
        Self { wp: WakePrimitive::new() }
    }

    /// Block until `ready` returns true. The notifier must make `ready`
    /// observable before calling [`notify_all`](Self::notify_all).
    pub fn wait_for(&self, mut ready: impl FnMut() -> bool) {
        for _ in 0..SPIN_FAST_ITERS {
            if ready() {
                return;
            }
            std::hint::spin_loop();
        }
        for _ in 0..SPIN_YIELD_ITERS {
            if ready() {
                return;
            }
            std::thread::yield_now();
        }
        loop {
            let seq = self.wp.load();
            if ready() {
                return;
            }
            self.wp.wait(seq);
        }
    }

    /// Bounded variant of [`wait_for`](Self::wait_for). Returns whether
    /// `ready` became true before the deadline.
    pub fn wait_for_until(&self, deadline: Deadline, mut ready: impl FnMut() -> bool) -> bool {
        for _ in 0..SPIN_FAST_ITERS {
            if ready() {
                return true;
            }
            std::hint::spin_loop();
        }
        loop {
            let seq = self.wp.load();
            if ready() {
                return true;
            }
            if deadline.expired() {
                return false;
            }
            self.wp.wait_until(seq, deadline);
        }
    }

    pub fn notify_one(&self) {
        self.wp.wake_one();
    }

    pub fn notify_all(&self) {
        self.wp.wake_all();
    }
}

/// Not fired yet.
pub(crate) const UNFIRED: usize = usize::MAX;
/// The owner gave up (timeout, cancellation, all cases closed).
pub(crate) const ABANDONED: usize = usize::MAX - 1;

/// One blocked operation: a channel op, a select, or a sleep.
///
/// Peers deliver to a waiter only after winning `try_claim`, so a waiter is
/// committed at most once. The owner claims itself while it attempts cases
/// so that nobody commits it concurrently.
#[derive(Debug)]
pub(crate) struct Waiter {
    wp: WakePrimitive,
    fired: AtomicUsize,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            wp: WakePrimitive::new(),
            fired: AtomicUsize::new(UNFIRED),
        })
    }

    pub(crate) fn seq(&self) -> u32 {
        self.wp.load()
    }

    pub(crate) fn try_claim(&self, case: usize) -> bool {
        self.fired
            .compare_exchange(UNFIRED, case, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a self-claim taken with `try_claim(case)`.
    pub(crate) fn release(&self, case: usize) {
        let _ = self
            .fired
            .compare_exchange(case, UNFIRED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Committed case index, if a claim has been made.
    pub(crate) fn fired(&self) -> Option<usize> {
        match self.fired.load(Ordering::Acquire) {
            UNFIRED => None,
            n => Some(n),
        }
    }

    pub(crate) fn notify(&self) {
        self.wp.wake_all();
    }

    /// Park until notified or the deadline passes. Returns `false` on timeout.
    pub(crate) fn park(&self, seq: u32, deadline: Deadline) -> bool {
        self.wp.wait_until(seq, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_returns_when_value_already_changed() {
        let wp = WakePrimitive::new();
        let seq = wp.load();
        wp.wake_all();
        // Counter moved, so this must not block.
        wp.wait(seq);
        assert_eq!(wp.load(), seq + 1);
    }

    #[test]
    fn wake_releases_parked_thread() {
        let wp = Arc::new(WakePrimitive::new());
        let flag = Arc::new(AtomicBool::new(false));
        let (wp2, flag2) = (wp.clone(), flag.clone());
        let t = thread::spawn(move || loop {
            let seq = wp2.load();
            if flag2.load(Ordering::Acquire) {
                return;
            }
            wp2.wait(seq);
        });
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        wp.wake_one();
        t.join().unwrap();
    }

    #[test]
    fn timed_wait_expires() {
        let wp = WakePrimitive::new();
        let start = Instant::now();
        let woke = wp.wait_timeout(wp.load(), Duration::from_millis(30));
        assert!(!woke || start.elapsed() < Duration::from_millis(30));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn wait_until_expired_deadline_is_immediate() {
        let wp = WakePrimitive::new();
        assert!(!wp.wait_until(wp.load(), Deadline::after(Duration::ZERO)));
    }

    #[test]
    fn spin_condvar_wakes_waiter() {
        let cv = Arc::new(SpinCondvar::new());
        let done = Arc::new(AtomicBool::new(false));
        let (cv2, done2) = (cv.clone(), done.clone());
        let t = thread::spawn(move || cv2.wait_for(|| done2.load(Ordering::Acquire)));
        thread::sleep(Duration::from_millis(10));
        done.store(true, Ordering::Release);
        cv.notify_all();
        t.join().unwrap();
    }

    #[test]
    fn spin_condvar_times_out() {
        let cv = SpinCondvar::new();
        let ok = cv.wait_for_until(Deadline::after(Duration::from_millis(10)), || false);
        assert!(!ok);
    }

    #[test]
    fn waiter_claims_once() {
        let w = Waiter::new();
        assert_eq!(w.fired(), None);
        assert!(w.try_claim(2));
        assert!(!w.try_claim(3));
        assert_eq!(w.fired(), Some(2));
        w.release(3);
        assert_eq!(w.fired(), Some(2));
        w.release(2);
        assert_eq!(w.fired(), None);
        assert!(w.try_claim(ABANDONED));
    }
}
