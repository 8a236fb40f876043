// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! A token is a flag plus an optional deadline. Tokens form a tree: cancelling
//! a parent cancels every child created from it. Blocked runtime operations
//! register their waiter with the current token so `cancel()` wakes them.
//!
//! The token a task body runs under is kept in a thread-local; `cancelled()`
//! reads it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::lock;
use crate::time::Deadline;
use crate::wake::Waiter;

/// Cancellation token shared between a parent and the tasks it started.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
    parent: Option<Arc<CancelToken>>,
    deadline: Mutex<Deadline>,
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct Listeners {
    waiters: Vec<(u64, Arc<Waiter>)>,
    children: Vec<Weak<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled whenever `self` is.
    pub fn child(self: &Arc<Self>) -> Arc<CancelToken> {
        let child = Arc::new(CancelToken {
            parent: Some(self.clone()),
            ..CancelToken::default()
        });
        {
            let mut l = lock(&self.listeners);
            l.children.retain(|w| w.strong_count() > 0);
            l.children.push(Arc::downgrade(&child));
        }
        // A parent cancelled before the push never saw this child.
        if self.flag.load(Ordering::SeqCst) {
            child.cancel();
        }
        child
    }

    /// Set the cancellation flag and wake every registered waiter.
    pub fn cancel(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let Listeners { waiters, children } = std::mem::take(&mut *lock(&self.listeners));
        for (_, w) in waiters {
            w.notify();
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    /// True once cancelled, once the deadline has passed, or once any
    /// ancestor is cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) || lock(&self.deadline).expired() {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    pub fn set_deadline(&self, deadline: Deadline) {
        *lock(&self.deadline) = deadline;
    }

    /// The earliest deadline on this token and its ancestors.
    pub fn deadline(&self) -> Deadline {
        let own = *lock(&self.deadline);
        match &self.parent {
            Some(p) => own.min(p.deadline()),
            None => own,
        }
    }

    /// Wake `waiter` on cancellation until the returned guard is dropped.
    pub(crate) fn register(&self, waiter: &Arc<Waiter>) -> Registration<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).waiters.push((id, waiter.clone()));
        // Registration raced with cancel(): make sure the waiter sees it.
        if self.flag.load(Ordering::SeqCst) {
            waiter.notify();
        }
        Registration { token: self, id }
    }
}

pub(crate) struct Registration<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock(&self.token.listeners)
            .waiters
            .retain(|(id, _)| *id != self.id);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<CancelToken>>> = const { RefCell::new(None) };
}

/// The token the calling task runs under, if any.
pub fn current() -> Option<Arc<CancelToken>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Check if the current task has been cancelled.
pub fn cancelled() -> bool {
    CURRENT.with(|c| c.borrow().as_ref().is_some_and(|t| t.is_cancelled()))
}

/// Run `f` with `token` installed as the current token. The previous token
/// is restored afterwards, also when `f` panics.
pub fn scope<R>(token: Option<Arc<CancelToken>>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Arc<CancelToken>>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            CURRENT.with(|c| *c.borrow_mut() = prev);
        }
    }
    let prev = CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), token));
    let _restore = Restore(prev);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_sets_flag() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        t.cancel();
        assert!(t.is_cancelled());
        // Idempotent.
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn parent_cancels_children() {
        let parent = Arc::new(CancelToken::new());
        let child = parent.child();
        let grandchild = child.child();
        assert!(!grandchild.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = Arc::new(CancelToken::new());
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn child_cancel_leaves_parent_alone() {
        let parent = Arc::new(CancelToken::new());
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn deadline_counts_as_cancellation() {
        let parent = Arc::new(CancelToken::new());
        let child = parent.child();
        parent.set_deadline(Deadline::after_ms(5));
        assert_eq!(child.deadline(), parent.deadline());
        std::thread::sleep(Duration::from_millis(10));
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancel_notifies_registered_waiter() {
        let t = CancelToken::new();
        let w = Waiter::new();
        let reg = t.register(&w);
        let seq = w.seq();
        t.cancel();
        assert_ne!(w.seq(), seq);
        drop(reg);
        assert!(lock(&t.listeners).waiters.is_empty());
    }

    #[test]
    fn scope_installs_and_restores() {
        assert!(current().is_none());
        let t = Arc::new(CancelToken::new());
        t.cancel();
        let seen = scope(Some(t.clone()), cancelled);
        assert!(seen);
        assert!(current().is_none());
        assert!(!cancelled());
    }
}
