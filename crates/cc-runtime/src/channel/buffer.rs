// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Value storage for buffered channels.

use std::sync::Mutex;

use crate::error::lock;
use crate::ring::Ring;

/// Delivery order of a buffered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    /// Oldest value first, lock-free.
    #[default]
    Fifo,
    /// Newest value first.
    Lifo,
}

pub(crate) enum Buffer<T> {
    Fifo(Ring<T>),
    Lifo { stack: Mutex<Vec<T>>, cap: usize },
}

impl<T> Buffer<T> {
    pub(crate) fn new(cap: usize, mode: ChannelMode) -> Self {
        match mode {
            ChannelMode::Fifo => Buffer::Fifo(Ring::new(cap)),
            ChannelMode::Lifo => Buffer::Lifo {
                stack: Mutex::new(Vec::with_capacity(cap)),
                cap,
            },
        }
    }

    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        match self {
            Buffer::Fifo(ring) => ring.push(value),
            Buffer::Lifo { stack, cap } => {
                let mut stack = lock(stack);
                if stack.len() >= *cap {
                    return Err(value);
                }
                stack.push(value);
                Ok(())
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<T> {
        match self {
            Buffer::Fifo(ring) => ring.pop(),
            Buffer::Lifo { stack, .. } => lock(stack).pop(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Buffer::Fifo(ring) => ring.len(),
            Buffer::Lifo { stack, .. } => lock(stack).len(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match self {
            Buffer::Fifo(ring) => ring.capacity(),
            Buffer::Lifo { cap, .. } => *cap,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}
