// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bump arena with optional growth and checkpoints.
//!
//! Allocation bumps an offset inside the current block. When the block is
//! full and the block budget allows, a new block of at least twice the
//! current capacity is chained on. `reset` unwinds to the first block;
//! `checkpoint`/`restore` unwind to a saved position, freeing blocks grown
//! after it.
//!
//! Allocation takes `&self` and hands out references tied to that borrow;
//! `reset` and `restore` take `&mut self`, so nothing allocated can outlive
//! an unwind. Destructors of arena values are never run. An arena is
//! single-threaded.
//!
//! Heap blocks start on a [`BLOCK_ALIGN`] boundary and alignment is always
//! computed from the real address, so the first allocation in a fresh block
//! sits at offset 0 for any alignment up to [`BLOCK_ALIGN`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Alignment used when a caller passes 0.
pub const DEFAULT_ALIGN: usize = mem::align_of::<usize>();

/// Alignment of every heap block's base address.
pub const BLOCK_ALIGN: usize = 16;

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Chunk {
    _bytes: [u8; BLOCK_ALIGN],
}

/// Owned heap block, sized in whole chunks.
struct HeapBlock {
    chunks: Vec<MaybeUninit<Chunk>>,
}

impl HeapBlock {
    /// At least `cap` bytes, rounded up to a multiple of [`BLOCK_ALIGN`].
    fn new(cap: usize) -> Result<Self> {
        let n = cap.div_ceil(BLOCK_ALIGN);
        let mut chunks = Vec::new();
        chunks.try_reserve_exact(n).map_err(|_| Error::OutOfMemory)?;
        chunks.resize(n, MaybeUninit::uninit());
        Ok(Self { chunks })
    }

    fn base(&mut self) -> NonNull<u8> {
        NonNull::new(self.chunks.as_mut_ptr().cast::<u8>()).unwrap_or(NonNull::dangling())
    }

    fn len(&self) -> usize {
        self.chunks.len() * BLOCK_ALIGN
    }
}

/// Saved allocation position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub block_idx: usize,
    pub offset: usize,
}

pub struct Arena<'buf> {
    /// First block: borrowed from the caller or owned.
    first_base: NonNull<u8>,
    first_cap: usize,
    _first_owned: Option<HeapBlock>,
    /// Blocks chained on after the first; block index `i` is `grown[i - 1]`.
    grown: RefCell<Vec<HeapBlock>>,
    base: Cell<NonNull<u8>>,
    cap: Cell<usize>,
    offset: Cell<usize>,
    /// 0 = unlimited, 1 = fixed.
    block_max: usize,
    _buf: PhantomData<&'buf mut [u8]>,
}

// The arena exclusively owns or exclusively borrows every block.
unsafe impl Send for Arena<'_> {}

impl<'buf> Arena<'buf> {
    /// Fixed arena over caller memory. Never grows.
    pub fn from_buffer(buf: &'buf mut [u8]) -> Self {
        let cap = buf.len();
        let base = NonNull::new(buf.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self::with_first(base, cap, None, 1)
    }
}

impl Arena<'static> {
    /// Heap-backed arena that grows without limit.
    pub fn heap(capacity: usize) -> Result<Self> {
        Self::heap_budget(capacity, 0)
    }

    /// Heap-backed arena limited to `max_blocks` blocks (0 = unlimited).
    /// `OutOfMemory` when the first block cannot be allocated.
    pub fn heap_budget(capacity: usize, max_blocks: usize) -> Result<Self> {
        let mut block = HeapBlock::new(capacity)?;
        let cap = block.len();
        let base = block.base();
        Ok(Self::with_first(base, cap, Some(block), max_blocks))
    }
}

impl<'buf> Arena<'buf> {
    fn with_first(base: NonNull<u8>, cap: usize, owned: Option<HeapBlock>, block_max: usize) -> Self {
        Self {
            first_base: base,
            first_cap: cap,
            _first_owned: owned,
            grown: RefCell::new(Vec::new()),
            base: Cell::new(base),
            cap: Cell::new(cap),
            offset: Cell::new(0),
            block_max,
            _buf: PhantomData,
        }
    }

    /// Reserve `size` bytes aligned to `align` (0 picks [`DEFAULT_ALIGN`]).
    /// Returns `None` for zero-size requests and when the arena is exhausted.
    pub fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.try_alloc(size, align).ok()
    }

    /// Like [`alloc`](Self::alloc), reporting why nothing was reserved.
    pub fn try_alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-size allocation"));
        }
        let align = if align == 0 { DEFAULT_ALIGN } else { align };
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment must be a power of two"));
        }
        if let Some(p) = self.bump(size, align) {
            return Ok(p);
        }
        self.grow(size, align)?;
        self.bump(size, align).ok_or(Error::OutOfMemory)
    }

    pub fn alloc_value<T>(&self, value: T) -> Result<&mut T> {
        let ptr = if mem::size_of::<T>() == 0 {
            NonNull::<T>::dangling()
        } else {
            self.try_alloc(mem::size_of::<T>(), mem::align_of::<T>())?.cast::<T>()
        };
        unsafe {
            ptr.as_ptr().write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<&mut [T]> {
        let bytes = mem::size_of_val(src);
        if bytes == 0 {
            return Ok(&mut []);
        }
        let ptr = self.try_alloc(bytes, mem::align_of::<T>())?.cast::<T>();
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), src.len()))
        }
    }

    pub fn alloc_str(&self, s: &str) -> Result<&mut str> {
        let bytes = self.alloc_slice_copy(s.as_bytes())?;
        // Copied from a valid str.
        Ok(unsafe { std::str::from_utf8_unchecked_mut(bytes) })
    }

    /// Drop every block after the first and rewind to offset 0.
    pub fn reset(&mut self) {
        self.grown.get_mut().clear();
        self.base.set(self.first_base);
        self.cap.set(self.first_cap);
        self.offset.set(0);
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            block_idx: self.block_idx(),
            offset: self.offset.get(),
        }
    }

    /// Rewind to `cp`. Blocks grown after the checkpoint are freed. A
    /// checkpoint ahead of the current position is rejected.
    pub fn restore(&mut self, cp: Checkpoint) -> Result<()> {
        let here = self.checkpoint();
        if cp.block_idx > here.block_idx || (cp.block_idx == here.block_idx && cp.offset > here.offset) {
            return Err(Error::InvalidArgument("checkpoint is ahead of the arena"));
        }
        let grown = self.grown.get_mut();
        grown.truncate(cp.block_idx);
        let (base, cap) = match grown.last_mut() {
            Some(b) => (b.base(), b.len()),
            None => (self.first_base, self.first_cap),
        };
        self.base.set(base);
        self.cap.set(cap);
        self.offset.set(cp.offset);
        Ok(())
    }

    /// Index of the block allocations currently come from.
    pub fn block_idx(&self) -> usize {
        self.grown.borrow().len()
    }

    pub fn offset(&self) -> usize {
        self.offset.get()
    }

    /// Capacity of the current block.
    pub fn capacity(&self) -> usize {
        self.cap.get()
    }

    pub fn remaining(&self) -> usize {
        self.cap.get() - self.offset.get()
    }

    pub fn block_max(&self) -> usize {
        self.block_max
    }

    fn bump(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.base.get().as_ptr() as usize;
        let addr = base.checked_add(self.offset.get())?;
        let aligned = addr.checked_add(align - 1)? & !(align - 1);
        let start = aligned - base;
        let end = start.checked_add(size)?;
        if end > self.cap.get() {
            return None;
        }
        self.offset.set(end);
        NonNull::new(unsafe { self.base.get().as_ptr().add(start) })
    }

    fn grow(&self, size: usize, align: usize) -> Result<()> {
        let blocks = self.block_idx() + 1;
        if self.block_max != 0 && blocks >= self.block_max {
            return Err(Error::OutOfMemory);
        }
        let need = size.checked_add(align).ok_or(Error::OutOfMemory)?;
        let doubled = self.cap.get().saturating_mul(2);
        let cap = need
            .max(doubled)
            .checked_next_power_of_two()
            .ok_or(Error::OutOfMemory)?;
        let mut block = HeapBlock::new(cap)?;
        let base = block.base();
        let cap = block.len();
        self.grown.borrow_mut().push(block);
        self.base.set(base);
        self.cap.set(cap);
        self.offset.set(0);
        Ok(())
    }
}

impl fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("block_idx", &self.block_idx())
            .field("offset", &self.offset())
            .field("capacity", &self.capacity())
            .field("block_max", &self.block_max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_buffer_exhausts() {
        let mut buf = [0u8; 64];
        let arena = Arena::from_buffer(&mut buf);
        assert_eq!(arena.block_max(), 1);
        assert!(arena.alloc(40, 8).is_some());
        assert!(arena.alloc(40, 8).is_none());
        assert_eq!(arena.try_alloc(40, 8), Err(Error::OutOfMemory));
        assert_eq!(arena.block_idx(), 0);
    }

    #[test]
    fn zero_size_reserves_nothing() {
        let arena = Arena::heap(64).unwrap();
        assert!(arena.alloc(0, 8).is_none());
        assert_eq!(arena.offset(), 0);
        assert!(matches!(arena.try_alloc(0, 8), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn bad_alignment_rejected() {
        let arena = Arena::heap(64).unwrap();
        assert!(matches!(arena.try_alloc(8, 3), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn respects_alignment() {
        let arena = Arena::heap(256).unwrap();
        arena.alloc(1, 1).unwrap();
        for align in [2usize, 4, 8, 16, 32, 64] {
            let p = arena.alloc(3, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0);
        }
        let p = arena.alloc(5, 0).unwrap();
        assert_eq!(p.as_ptr() as usize % DEFAULT_ALIGN, 0);
    }

    #[test]
    fn fresh_blocks_start_at_offset_zero() {
        let mut arena = Arena::heap(64).unwrap();
        for _ in 0..3 {
            let p = arena.alloc(40, 8).unwrap();
            assert_eq!(p.as_ptr() as usize % BLOCK_ALIGN, 0);
            assert_eq!(arena.offset(), 40);
            // Does not fit in what is left, so a new block starts.
            let q = arena.alloc(40, 16).unwrap();
            assert_eq!(q.as_ptr() as usize % BLOCK_ALIGN, 0);
            assert_eq!(arena.offset(), 40);
            arena.reset();
        }
    }

    #[test]
    fn capacity_rounds_up_to_whole_chunks() {
        let arena = Arena::heap(10).unwrap();
        assert_eq!(arena.capacity(), BLOCK_ALIGN);
        let empty = Arena::heap(0).unwrap();
        assert_eq!(empty.capacity(), 0);
        assert!(empty.alloc(8, 8).is_some());
        assert_eq!(empty.block_idx(), 1);
    }

    #[test]
    fn unallocatable_first_block_is_an_error() {
        assert_eq!(Arena::heap(usize::MAX).err(), Some(Error::OutOfMemory));
        assert_eq!(Arena::heap_budget(isize::MAX as usize, 2).err(), Some(Error::OutOfMemory));
    }

    #[test]
    fn offsets_increase_monotonically() {
        let arena = Arena::heap(1024).unwrap();
        let mut last = 0;
        for _ in 0..10 {
            arena.alloc(16, 8).unwrap();
            assert!(arena.offset() > last);
            last = arena.offset();
        }
    }

    #[test]
    fn grows_then_resets() {
        let mut arena = Arena::heap(64).unwrap();
        let before = arena.checkpoint();
        for _ in 0..100 {
            assert!(arena.alloc(40, 8).is_some());
        }
        assert!(arena.block_idx() > 0);
        assert!(arena.capacity() >= 128);
        arena.reset();
        assert_eq!(arena.checkpoint(), before);
        assert_eq!(arena.capacity(), 64);
        assert!(arena.alloc(40, 8).is_some());
    }

    #[test]
    fn restore_across_blocks() {
        let mut arena = Arena::heap(64).unwrap();
        arena.alloc(40, 8).unwrap();
        let cp = arena.checkpoint();
        for _ in 0..10 {
            arena.alloc(40, 8).unwrap();
        }
        assert!(arena.block_idx() > cp.block_idx);
        arena.restore(cp).unwrap();
        assert_eq!(arena.checkpoint(), cp);
        // Restoring forward is refused.
        let ahead = Checkpoint { block_idx: cp.block_idx + 1, offset: 0 };
        assert!(arena.restore(ahead).is_err());
    }

    #[test]
    fn budget_limits_growth() {
        let arena = Arena::heap_budget(64, 2).unwrap();
        let mut n = 0;
        while arena.alloc(40, 8).is_some() {
            n += 1;
            assert!(n < 100, "budget never enforced");
        }
        assert_eq!(arena.block_idx(), 1);
        assert_eq!(arena.try_alloc(40, 8), Err(Error::OutOfMemory));
    }

    #[test]
    fn oversized_request_gets_its_own_block() {
        let arena = Arena::heap(16).unwrap();
        let p = arena.alloc(1000, 8).unwrap();
        assert_eq!(p.as_ptr() as usize % 8, 0);
        assert!(arena.capacity() >= 1000);
    }

    #[test]
    fn typed_helpers() {
        let arena = Arena::heap(32).unwrap();
        let a = arena.alloc_value(7u64).unwrap();
        let b = arena.alloc_slice_copy(&[1u32, 2, 3]).unwrap();
        let s = arena.alloc_str("hello arena").unwrap();
        *a += 1;
        b[0] = 10;
        assert_eq!(*a, 8);
        assert_eq!(b, &[10, 2, 3]);
        assert_eq!(s, "hello arena");
        let unit = arena.alloc_value(()).unwrap();
        assert_eq!(*unit, ());
    }
}
