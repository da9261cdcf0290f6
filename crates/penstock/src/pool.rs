//! Block pooling: a bounded lock-free cache of free blocks layered over the
//! system allocator.
//!
//! The pool keeps up to `S` released blocks ready for reuse so that segment
//! turnover in steady state stays off the system allocator. Head and tail are
//! virtual indices over `[0, 2S)`; the physical slot is `index mod S`. Running
//! the indices over twice the capacity makes empty (`head == tail`) and full
//! (gap of `S`) distinguishable without a separate count.
//!
//! Concurrent `alloc` and `dealloc` are tolerated on both endpoints. The
//! protocol is tuned for one allocating side and one releasing side, which is
//! the traffic the pipe generates.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::alloc::{alloc, dealloc, Layout};
use std::array;
use std::marker::PhantomData;

use crossbeam_utils::CachePadded;

/// Thin wrapper over the system allocator handing out one uninitialized block
/// sized and aligned for `B` per call.
pub(crate) struct RawAlloc<B> {
    _marker: PhantomData<B>,
}

impl<B> RawAlloc<B> {
    const LAYOUT: Layout = Layout::new::<B>();

    pub(crate) const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Requests one uninitialized block. `None` means the system allocator
    /// reported failure.
    pub(crate) fn allocate(&self) -> Option<NonNull<B>> {
        if Self::LAYOUT.size() == 0 {
            return Some(NonNull::dangling());
        }
        // SAFETY: the layout has non-zero size.
        let block = unsafe { alloc(Self::LAYOUT) };
        NonNull::new(block.cast())
    }

    /// Returns a block to the system allocator.
    ///
    /// # Safety
    ///
    /// `block` must have come from [`RawAlloc::allocate`] for the same `B` and
    /// must not be used afterwards.
    pub(crate) unsafe fn release(&self, block: NonNull<B>) {
        if Self::LAYOUT.size() == 0 {
            return;
        }
        unsafe { dealloc(block.as_ptr().cast(), Self::LAYOUT) }
    }
}

/// Bounded lock-free cache of `S` free blocks over [`RawAlloc`].
///
/// `S = 0` passes every call straight through to the system allocator and
/// keeps no shared state. `S = 1` collapses the whole pool into a single
/// atomically exchanged cell. Both fast paths are selected at compile time
/// from the const parameter.
pub(crate) struct BlockPool<B, const S: usize> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    slots: [AtomicPtr<B>; S],
    fresh_allocations: AtomicU64,
    pool_reuses: AtomicU64,
    raw: RawAlloc<B>,
}

// SAFETY: the pool stores only pointers to uninitialized blocks; no value of
// `B` is ever read or written through it. Sending the pool (or sharing it)
// moves block ownership, which is what `B: Send` licenses.
unsafe impl<B: Send, const S: usize> Send for BlockPool<B, S> {}
unsafe impl<B: Send, const S: usize> Sync for BlockPool<B, S> {}

impl<B, const S: usize> BlockPool<B, S> {
    /// Virtual index span. Indices wrap at `2S`, never at the word width.
    const SPAN: u64 = 2 * (S as u64);

    const INDEX_FITS: () = assert!(
        (S as u128) * 2 <= u64::MAX as u128,
        "pool reserve does not fit the index word"
    );

    pub(crate) fn new() -> Self {
        let () = Self::INDEX_FITS;
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            fresh_allocations: AtomicU64::new(0),
            pool_reuses: AtomicU64::new(0),
            raw: RawAlloc::new(),
        }
    }

    /// Takes a cached block when one is available, falling back to the system
    /// allocator otherwise. `None` only when the fallback itself fails.
    pub(crate) fn alloc(&self) -> Option<NonNull<B>> {
        if S == 0 {
            return self.fresh();
        }
        if S == 1 {
            let cached = self.slots[0].swap(ptr::null_mut(), Ordering::AcqRel);
            return match NonNull::new(cached) {
                Some(block) => {
                    self.pool_reuses.fetch_add(1, Ordering::Relaxed);
                    Some(block)
                }
                None => self.fresh(),
            };
        }

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == self.tail.load(Ordering::Acquire) {
                break;
            }

            let next = (head + 1) % Self::SPAN;
            let phys = Self::physical(head);

            // Sample before claiming: once `head` moves, a concurrent
            // `dealloc` may overwrite this entry.
            let cached = self.slots[phys].load(Ordering::Acquire);
            if cached.is_null() {
                // The releasing side has claimed this index but its store has
                // not landed yet. Leave the index alone and take the miss.
                break;
            }

            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.pool_reuses.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: non-null checked above; the claimed slot held a
                    // block released through `dealloc`.
                    return Some(unsafe { NonNull::new_unchecked(cached) });
                }
                Err(current) => head = current,
            }
        }

        self.fresh()
    }

    /// Returns a block to the pool. A full pool forwards the block to the
    /// system allocator.
    ///
    /// # Safety
    ///
    /// `block` must have come from [`BlockPool::alloc`] on a pool of the same
    /// `B`, and the caller must not touch it again.
    pub(crate) unsafe fn dealloc(&self, block: NonNull<B>) {
        if S == 0 {
            unsafe { self.raw.release(block) };
            return;
        }
        if S == 1 {
            let displaced = self.slots[0].swap(block.as_ptr(), Ordering::AcqRel);
            if let Some(old) = NonNull::new(displaced) {
                unsafe { self.raw.release(old) };
            }
            return;
        }

        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let head = self.head.load(Ordering::Acquire);
            // Modular full test: the virtual gap spans the whole reserve.
            if head + (S as u64) == tail || tail + (S as u64) == head {
                break;
            }

            let next = (tail + 1) % Self::SPAN;
            match self
                .tail
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // The index claim fences this slot off from every other
                    // releaser; the store is allowed to trail the claim.
                    self.slots[Self::physical(tail)].store(block.as_ptr(), Ordering::Release);
                    return;
                }
                Err(current) => tail = current,
            }
        }

        unsafe { self.raw.release(block) };
    }

    /// System allocator calls made so far.
    pub(crate) fn fresh_allocations(&self) -> u64 {
        self.fresh_allocations.load(Ordering::Relaxed)
    }

    /// Blocks served from the cache so far.
    pub(crate) fn pool_reuses(&self) -> u64 {
        self.pool_reuses.load(Ordering::Relaxed)
    }

    fn fresh(&self) -> Option<NonNull<B>> {
        self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
        self.raw.allocate()
    }

    fn physical(index: u64) -> usize {
        let index = if index < S as u64 {
            index
        } else {
            index - S as u64
        };
        index as usize
    }
}

impl<B, const S: usize> Drop for BlockPool<B, S> {
    fn drop(&mut self) {
        if S == 0 {
            return;
        }
        if S == 1 {
            if let Some(block) = NonNull::new(*self.slots[0].get_mut()) {
                unsafe { self.raw.release(block) };
            }
            return;
        }

        // Only the occupied region owns blocks; consumed slots keep stale
        // pointers behind `head`.
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            if let Some(block) = NonNull::new(*self.slots[Self::physical(head)].get_mut()) {
                unsafe { self.raw.release(block) };
            }
            head = (head + 1) % Self::SPAN;
        }
    }
}
