//! Segmented storage: a doubly linked list of fixed-capacity segments.
//!
//! The producer owns the tail (`back` and `end` cursors), the consumer owns
//! the head (`begin` cursor). There is no synchronization in here; the pipe
//! layers its publication protocol on top and keeps each side on its own
//! cursors. Segments are acquired from and recycled through a [`BlockPool`],
//! so steady-state traffic reuses warm memory instead of hitting the system
//! allocator.
//!
//! Slots are raw storage. A slot holds a live `T` only between the producer
//! staging a value into it and the consumer (or the producer, on rollback)
//! taking the value back out. Slot addresses are stable for the lifetime of
//! their segment.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use std::alloc::{handle_alloc_error, Layout};

use crossbeam_utils::CachePadded;

use crate::pool::BlockPool;
use crate::AllocError;

/// One fixed run of `N` raw slots plus the list links.
#[repr(C)]
pub(crate) struct Segment<T, const N: usize> {
    slots: [MaybeUninit<T>; N],
    prev: *mut Segment<T, N>,
    next: *mut Segment<T, N>,
}

// SAFETY: a segment is plain storage; ownership of the values inside is
// tracked by the cursors above it.
unsafe impl<T: Send, const N: usize> Send for Segment<T, N> {}

impl<T, const N: usize> Segment<T, N> {
    /// Writes fresh link fields into an uninitialized block.
    ///
    /// # Safety
    ///
    /// `seg` must point to an allocated, possibly uninitialized segment.
    unsafe fn init_links(seg: NonNull<Self>, prev: *mut Self) {
        unsafe {
            ptr::addr_of_mut!((*seg.as_ptr()).prev).write(prev);
            ptr::addr_of_mut!((*seg.as_ptr()).next).write(ptr::null_mut());
        }
    }

    /// # Safety
    ///
    /// `seg` must be live and its links initialized.
    unsafe fn next(seg: NonNull<Self>) -> *mut Self {
        unsafe { ptr::addr_of!((*seg.as_ptr()).next).read() }
    }

    /// # Safety
    ///
    /// `seg` must be live and its links initialized.
    unsafe fn prev(seg: NonNull<Self>) -> *mut Self {
        unsafe { ptr::addr_of!((*seg.as_ptr()).prev).read() }
    }

    /// # Safety
    ///
    /// `seg` must be live.
    unsafe fn set_next(seg: NonNull<Self>, next: *mut Self) {
        unsafe { ptr::addr_of_mut!((*seg.as_ptr()).next).write(next) }
    }

    /// # Safety
    ///
    /// `seg` must be live.
    unsafe fn set_prev(seg: NonNull<Self>, prev: *mut Self) {
        unsafe { ptr::addr_of_mut!((*seg.as_ptr()).prev).write(prev) }
    }

    /// Address of slot `pos`. The slot is not read.
    ///
    /// # Safety
    ///
    /// `seg` must be live and `pos < N`.
    unsafe fn slot(seg: NonNull<Self>, pos: usize) -> *mut T {
        debug_assert!(pos < N);
        unsafe { ptr::addr_of_mut!((*seg.as_ptr()).slots).cast::<T>().add(pos) }
    }
}

/// Producer-side cursors. `back` addresses the slot of the most recently
/// committed element; `end` addresses one past it, the staging slot.
struct ProducerPos<T, const N: usize> {
    back_seg: UnsafeCell<*mut Segment<T, N>>,
    back_pos: UnsafeCell<usize>,
    end_seg: UnsafeCell<NonNull<Segment<T, N>>>,
    end_pos: UnsafeCell<usize>,
}

/// Consumer-side cursor. `begin` addresses the oldest live slot.
struct ConsumerPos<T, const N: usize> {
    begin_seg: UnsafeCell<NonNull<Segment<T, N>>>,
    begin_pos: UnsafeCell<usize>,
}

/// Doubly linked list of segments with pooled recycling.
///
/// All operations are restricted to one side. The pipe guarantees the
/// restriction through its handle split; direct users must uphold it.
pub(crate) struct SegmentList<T, const N: usize, const S: usize> {
    pool: BlockPool<Segment<T, N>, S>,
    producer: CachePadded<ProducerPos<T, N>>,
    consumer: CachePadded<ConsumerPos<T, N>>,
}

// SAFETY: the producer and consumer cursor groups are each owned by exactly
// one thread; the pipe enforces the split. The pool is safe for the
// cross-thread traffic the two sides generate.
unsafe impl<T: Send, const N: usize, const S: usize> Send for SegmentList<T, N, S> {}
unsafe impl<T: Send, const N: usize, const S: usize> Sync for SegmentList<T, N, S> {}

impl<T, const N: usize, const S: usize> SegmentList<T, N, S> {
    const CAPACITY_NONZERO: () = assert!(N >= 1, "segment capacity must be at least 1");
    const ELEMENT_SIZED: () = assert!(
        core::mem::size_of::<T>() > 0,
        "zero-sized elements are not supported: slot identity is by address"
    );

    /// Creates a list holding one empty segment.
    ///
    /// Aborts through `handle_alloc_error` if that first segment cannot be
    /// allocated.
    pub(crate) fn new() -> Self {
        let () = Self::CAPACITY_NONZERO;
        let () = Self::ELEMENT_SIZED;

        let pool = BlockPool::new();
        let first = match pool.alloc() {
            Some(seg) => seg,
            None => handle_alloc_error(Layout::new::<Segment<T, N>>()),
        };
        unsafe { Segment::init_links(first, ptr::null_mut()) };

        Self {
            pool,
            producer: CachePadded::new(ProducerPos {
                back_seg: UnsafeCell::new(ptr::null_mut()),
                back_pos: UnsafeCell::new(0),
                end_seg: UnsafeCell::new(first),
                end_pos: UnsafeCell::new(0),
            }),
            consumer: CachePadded::new(ConsumerPos {
                begin_seg: UnsafeCell::new(first),
                begin_pos: UnsafeCell::new(0),
            }),
        }
    }

    /// Address of the oldest live slot. Valid to compare even when the list
    /// is empty; only valid to read while a value is live in it.
    ///
    /// # Safety
    ///
    /// Consumer side only.
    pub(crate) unsafe fn front(&self) -> *mut T {
        unsafe {
            let seg = *self.consumer.begin_seg.get();
            let pos = *self.consumer.begin_pos.get();
            Segment::slot(seg, pos)
        }
    }

    /// Address of the staging slot committed by the latest `push`.
    ///
    /// # Safety
    ///
    /// Producer side only; at least one `push` must have happened.
    pub(crate) unsafe fn back(&self) -> *mut T {
        unsafe {
            let seg = *self.producer.back_seg.get();
            debug_assert!(!seg.is_null());
            let pos = *self.producer.back_pos.get();
            Segment::slot(NonNull::new_unchecked(seg), pos)
        }
    }

    /// Commits the current end slot as the new back and advances the tail.
    ///
    /// A boundary crossing acquires and links the next segment before any
    /// cursor moves, so a failed allocation leaves the list untouched.
    ///
    /// # Safety
    ///
    /// Producer side only.
    pub(crate) unsafe fn push(&self) -> Result<(), AllocError> {
        let p = &self.producer;
        unsafe {
            let end_seg = *p.end_seg.get();
            let end_pos = *p.end_pos.get();

            if end_pos + 1 == N {
                let fresh = self.pool.alloc().ok_or(AllocError)?;
                Segment::init_links(fresh, end_seg.as_ptr());
                Segment::set_next(end_seg, fresh.as_ptr());

                *p.back_seg.get() = end_seg.as_ptr();
                *p.back_pos.get() = end_pos;
                *p.end_seg.get() = fresh;
                *p.end_pos.get() = 0;
            } else {
                *p.back_seg.get() = end_seg.as_ptr();
                *p.back_pos.get() = end_pos;
                *p.end_pos.get() = end_pos + 1;
            }
        }
        Ok(())
    }

    /// Rolls back the most recent `push`. Crossing a boundary hands the
    /// emptied tail segment back to the pool.
    ///
    /// # Safety
    ///
    /// Producer side only; there must be a push to roll back.
    pub(crate) unsafe fn unpush(&self) {
        let p = &self.producer;
        unsafe {
            let back_pos = *p.back_pos.get();
            if back_pos > 0 {
                *p.back_pos.get() = back_pos - 1;
            } else {
                *p.back_pos.get() = N - 1;
                let back_seg = *p.back_seg.get();
                debug_assert!(!back_seg.is_null());
                *p.back_seg.get() = Segment::prev(NonNull::new_unchecked(back_seg));
            }

            let end_pos = *p.end_pos.get();
            if end_pos > 0 {
                *p.end_pos.get() = end_pos - 1;
            } else {
                *p.end_pos.get() = N - 1;
                let end_seg = *p.end_seg.get();
                let prev = Segment::prev(end_seg);
                debug_assert!(!prev.is_null());
                let prev = NonNull::new_unchecked(prev);
                *p.end_seg.get() = prev;

                debug_assert_eq!(Segment::next(prev), end_seg.as_ptr());
                self.pool.dealloc(end_seg);
                Segment::set_next(prev, ptr::null_mut());
            }
        }
    }

    /// Releases the oldest slot. A fully drained head segment is unlinked
    /// and recycled through the pool.
    ///
    /// # Safety
    ///
    /// Consumer side only; the front slot must already be vacated and a
    /// successor element must exist past it.
    pub(crate) unsafe fn pop(&self) {
        let c = &self.consumer;
        unsafe {
            let pos = *c.begin_pos.get() + 1;
            if pos == N {
                let head = *c.begin_seg.get();
                let next = Segment::next(head);
                debug_assert!(!next.is_null());
                let next = NonNull::new_unchecked(next);
                Segment::set_prev(next, ptr::null_mut());
                *c.begin_seg.get() = next;
                *c.begin_pos.get() = 0;
                self.pool.dealloc(head);
            } else {
                *c.begin_pos.get() = pos;
            }
        }
    }

    pub(crate) fn fresh_allocations(&self) -> u64 {
        self.pool.fresh_allocations()
    }

    pub(crate) fn pool_reuses(&self) -> u64 {
        self.pool.pool_reuses()
    }
}

impl<T, const N: usize, const S: usize> Drop for SegmentList<T, N, S> {
    fn drop(&mut self) {
        // Free the remaining chain head to tail. Live elements, if any, were
        // already drained by the owner; only storage is reclaimed here.
        unsafe {
            let mut seg = *self.consumer.begin_seg.get();
            let last = *self.producer.end_seg.get();
            loop {
                let next = Segment::next(seg);
                let done = seg == last;
                self.pool.dealloc(seg);
                if done {
                    break;
                }
                debug_assert!(!next.is_null());
                seg = NonNull::new_unchecked(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stages `value` into the producer's end slot and commits it, the way
    /// the pipe does.
    unsafe fn stage<T, const N: usize, const S: usize>(list: &SegmentList<T, N, S>, value: T) {
        unsafe {
            // First commit makes `back` the staging slot; afterwards `back`
            // always addresses it.
            if (*list.producer.back_seg.get()).is_null() {
                list.push().unwrap();
            }
            list.back().write(value);
            list.push().unwrap();
        }
    }

    unsafe fn take_front<T, const N: usize, const S: usize>(list: &SegmentList<T, N, S>) -> T {
        unsafe {
            let value = list.front().read();
            list.pop();
            value
        }
    }

    #[test]
    fn fifo_across_segment_boundaries() {
        let list: SegmentList<u32, 4, 1> = SegmentList::new();

        unsafe {
            for i in 0..10 {
                stage(&list, i);
            }
            for i in 0..10 {
                assert_eq!(take_front(&list), i);
            }
        }
    }

    #[test]
    fn slot_addresses_are_stable_and_distinct() {
        let list: SegmentList<u64, 4, 0> = SegmentList::new();

        unsafe {
            list.push().unwrap();
            let first = list.back();
            list.back().write(1);
            list.push().unwrap();
            let second = list.back();

            assert_ne!(first, second);
            assert_eq!(list.front(), first);
        }
    }

    #[test]
    fn unpush_across_boundary_recycles_segment() {
        let list: SegmentList<u32, 2, 2> = SegmentList::new();

        unsafe {
            for i in 0..3 {
                stage(&list, i);
            }
            let grown = list.fresh_allocations();

            // Roll all three back; the tail segment the third element forced
            // into existence goes back to the pool.
            for expected in (0..3).rev() {
                list.unpush();
                assert_eq!(list.back().read(), expected);
            }

            // Refilling draws from the pool, not the system.
            for i in 0..3 {
                stage(&list, i);
            }
            assert_eq!(list.fresh_allocations(), grown);
            assert!(list.pool_reuses() > 0);

            for i in 0..3 {
                assert_eq!(take_front(&list), i);
            }
        }
    }

    #[test]
    fn single_slot_segments_advance_every_element() {
        let list: SegmentList<u32, 1, 1> = SegmentList::new();

        unsafe {
            for i in 0..5 {
                stage(&list, i);
            }
            for i in 0..5 {
                assert_eq!(take_front(&list), i);
            }
        }
    }
}
