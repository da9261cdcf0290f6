//! The SPSC pipe protocol.
//!
//! Four cursors drive the pipe, all of them slot addresses inside the
//! segment list:
//!
//! ```text
//!   read_end        reader-private   end of the prefetched readable range
//!   last_flush_end  writer-private   previous published position
//!   flush_end       writer-private   one past the last complete write
//!   commit_end      shared atomic    published position, or null = parked
//! ```
//!
//! `commit_end` is the only word both threads touch. The writer publishes by
//! compare-exchanging `last_flush_end` to `flush_end`; a failure means the
//! reader installed the null sentinel (it drained everything and is about to
//! block externally), so the writer stores the new position and reports
//! `false` to tell its caller to wake the reader. The reader prefetches by
//! compare-exchanging `front` to null; a failure delivers the published
//! position to prefetch up to.
//!
//! Cursors are compared for identity and rewritten, never read through,
//! except for the slot transfer inside `write`, `unwrite` and `read`.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::alloc::{handle_alloc_error, Layout};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::segment::{Segment, SegmentList};
use crate::WriteError;

/// Writer-private cursors.
struct WriterCursors<T> {
    flush_end: UnsafeCell<*mut T>,
    last_flush_end: UnsafeCell<*mut T>,
}

/// Reader-private cursor.
struct ReaderCursor<T> {
    read_end: UnsafeCell<*mut T>,
}

/// Non-blocking unbounded SPSC pipe.
///
/// `N` is the slot count per segment, `S` the number of spare segments kept
/// for reuse. Construction hands out exactly one [`PipeWriter`] and one
/// [`PipeReader`]; the pipe itself stays pinned behind them for its whole
/// lifetime.
pub struct Pipe<T, const N: usize = 128, const S: usize = 1> {
    list: SegmentList<T, N, S>,
    writer: CachePadded<WriterCursors<T>>,
    reader: CachePadded<ReaderCursor<T>>,
    commit_end: AtomicPtr<T>,
}

// SAFETY: the writer cursors are only touched through the unique PipeWriter,
// the reader cursor only through the unique PipeReader, and the segment list
// enforces the same split. `commit_end` is the synchronized rendezvous.
unsafe impl<T: Send, const N: usize, const S: usize> Send for Pipe<T, N, S> {}
unsafe impl<T: Send, const N: usize, const S: usize> Sync for Pipe<T, N, S> {}

impl<T, const N: usize, const S: usize> Pipe<T, N, S> {
    /// Creates a pipe and splits it into its two endpoints.
    pub fn new() -> (PipeWriter<T, N, S>, PipeReader<T, N, S>) {
        let list = SegmentList::new();

        // Stage the first slot so `back` addresses the next write target.
        // From here on the staging slot is never a live element.
        if unsafe { list.push() }.is_err() {
            handle_alloc_error(Layout::new::<Segment<T, N>>());
        }
        let back = unsafe { list.back() };

        let pipe = Arc::new(Pipe {
            list,
            writer: CachePadded::new(WriterCursors {
                flush_end: UnsafeCell::new(back),
                last_flush_end: UnsafeCell::new(back),
            }),
            reader: CachePadded::new(ReaderCursor {
                read_end: UnsafeCell::new(back),
            }),
            commit_end: AtomicPtr::new(back),
        });

        (
            PipeWriter {
                pipe: Arc::clone(&pipe),
            },
            PipeReader { pipe },
        )
    }

    /// # Safety
    ///
    /// Writer side only.
    unsafe fn write(&self, value: T, incomplete: bool) -> Result<(), WriteError<T>> {
        unsafe {
            let slot = self.list.back();
            slot.write(value);
            if self.list.push().is_err() {
                // No cursor moved; take the staged value back out.
                return Err(WriteError::AllocFailed(slot.read()));
            }
            if !incomplete {
                *self.writer.flush_end.get() = self.list.back();
            }
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Writer side only.
    unsafe fn unwrite(&self) -> Option<T> {
        unsafe {
            // Everything up to `flush_end` is spoken for; only writes staged
            // past it can be taken back.
            if *self.writer.flush_end.get() == self.list.back() {
                return None;
            }
            self.list.unpush();
            Some(self.list.back().read())
        }
    }

    /// # Safety
    ///
    /// Writer side only.
    unsafe fn flush(&self) -> bool {
        unsafe {
            let flush_end = *self.writer.flush_end.get();
            let last = *self.writer.last_flush_end.get();
            if last == flush_end {
                return true;
            }

            match self
                .commit_end
                .compare_exchange(last, flush_end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    *self.writer.last_flush_end.get() = flush_end;
                    true
                }
                Err(observed) => {
                    // Only the reader writes this word, and only to park.
                    debug_assert!(observed.is_null());
                    self.commit_end.store(flush_end, Ordering::Release);
                    *self.writer.last_flush_end.get() = flush_end;
                    false
                }
            }
        }
    }

    /// # Safety
    ///
    /// Reader side only.
    unsafe fn check_read(&self) -> bool {
        unsafe {
            let front = self.list.front();
            if front != *self.reader.read_end.get() {
                // Prefetched data not yet drained.
                return true;
            }

            match self.commit_end.compare_exchange(
                front,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // Nothing published past `front`; the pipe is now parked and
                // the next flush will report it.
                Ok(_) => false,
                Err(observed) => {
                    if observed.is_null() {
                        // Still parked from an earlier call.
                        false
                    } else {
                        *self.reader.read_end.get() = observed;
                        true
                    }
                }
            }
        }
    }

    /// # Safety
    ///
    /// Reader side only.
    unsafe fn read(&self) -> Option<T> {
        unsafe {
            if !self.check_read() {
                return None;
            }
            let value = self.list.front().read();
            self.list.pop();
            Some(value)
        }
    }
}

impl<T, const N: usize, const S: usize> Drop for Pipe<T, N, S> {
    fn drop(&mut self) {
        if !mem::needs_drop::<T>() {
            return;
        }
        // Everything in [front, back) is live: published, prefetched or
        // staged alike. The staging slot at `back` is always vacant.
        unsafe {
            while self.list.front() != self.list.back() {
                ptr::drop_in_place(self.list.front());
                self.list.pop();
            }
        }
    }
}

/// Writing endpoint of a [`Pipe`]. Exactly one exists per pipe.
pub struct PipeWriter<T, const N: usize = 128, const S: usize = 1> {
    pipe: Arc<Pipe<T, N, S>>,
}

// SAFETY: the handle is the sole entry to the writer side and all operations
// take `&mut self`.
unsafe impl<T: Send, const N: usize, const S: usize> Send for PipeWriter<T, N, S> {}

impl<T, const N: usize, const S: usize> PipeWriter<T, N, S> {
    /// Stages `value` at the tail.
    ///
    /// With `incomplete = true` the element stays invisible to the reader
    /// until a later complete write; any run of incomplete writes ending in a
    /// complete one is published as a single batch by the next [`flush`].
    ///
    /// On allocation failure the value is handed back and the pipe is
    /// unchanged.
    ///
    /// [`flush`]: Self::flush
    pub fn write(&mut self, value: T, incomplete: bool) -> Result<(), WriteError<T>> {
        unsafe { self.pipe.write(value, incomplete) }
    }

    /// Takes back the most recently staged element that has not been marked
    /// for publication. `None` when every staged element is already spoken
    /// for.
    pub fn unwrite(&mut self) -> Option<T> {
        unsafe { self.pipe.unwrite() }
    }

    /// Publishes every complete write staged so far.
    ///
    /// Returns `false` when the reader had parked itself in the meantime; the
    /// caller must then wake it through its external signal. The data is
    /// published either way.
    pub fn flush(&mut self) -> bool {
        unsafe { self.pipe.flush() }
    }

    /// System allocator calls made by the pipe so far.
    pub fn fresh_allocations(&self) -> u64 {
        self.pipe.list.fresh_allocations()
    }

    /// Segments served from the spare pool so far.
    pub fn pool_reuses(&self) -> u64 {
        self.pipe.list.pool_reuses()
    }
}

/// Reading endpoint of a [`Pipe`]. Exactly one exists per pipe.
pub struct PipeReader<T, const N: usize = 128, const S: usize = 1> {
    pipe: Arc<Pipe<T, N, S>>,
}

// SAFETY: the handle is the sole entry to the reader side and all operations
// take `&mut self`.
unsafe impl<T: Send, const N: usize, const S: usize> Send for PipeReader<T, N, S> {}

impl<T, const N: usize, const S: usize> PipeReader<T, N, S> {
    /// Reports whether data is available, prefetching the published range.
    ///
    /// A `false` return means the reader has advertised itself as parked; the
    /// writer's next flush will observe that and report it to the writing
    /// side.
    pub fn check_read(&mut self) -> bool {
        unsafe { self.pipe.check_read() }
    }

    /// Takes the oldest published element, or `None` when the pipe is empty
    /// (which also parks the pipe, as [`check_read`] does).
    ///
    /// [`check_read`]: Self::check_read
    pub fn read(&mut self) -> Option<T> {
        unsafe { self.pipe.read() }
    }

    /// System allocator calls made by the pipe so far.
    pub fn fresh_allocations(&self) -> u64 {
        self.pipe.list.fresh_allocations()
    }

    /// Segments served from the spare pool so far.
    pub fn pool_reuses(&self) -> u64 {
        self.pipe.list.pool_reuses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn flush_per_element_preserves_order() {
        let (mut tx, mut rx) = Pipe::<i32, 4, 1>::new();

        for i in 0..10 {
            tx.write(i, false).unwrap();
            assert!(tx.flush());
        }

        let drained: Vec<i32> = std::iter::from_fn(|| rx.read()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn incomplete_writes_publish_as_one_batch() {
        let (mut tx, mut rx) = Pipe::<i32, 128, 1>::new();

        for i in 0..10 {
            tx.write(i, true).unwrap();
        }

        // Nothing is marked complete yet, so nothing publishes.
        assert!(tx.flush());
        assert!(rx.read().is_none());

        tx.write(99, false).unwrap();
        assert!(!tx.flush(), "reader parked above; flush must report it");

        let drained: Vec<i32> = std::iter::from_fn(|| rx.read()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 99]);
    }

    #[test]
    fn unwrite_retracts_staged_elements_in_reverse() {
        let (mut tx, mut rx) = Pipe::<i32, 128, 1>::new();

        for i in 0..5 {
            tx.write(i, true).unwrap();
        }
        for expected in (0..5).rev() {
            assert_eq!(tx.unwrite(), Some(expected));
        }
        assert_eq!(tx.unwrite(), None);
        assert!(rx.read().is_none());
    }

    #[test]
    fn unwrite_stops_at_published_elements() {
        let (mut tx, mut rx) = Pipe::<i32, 128, 1>::new();

        tx.write(1, false).unwrap();
        tx.write(2, true).unwrap();

        assert_eq!(tx.unwrite(), Some(2));
        // The complete write is spoken for even before the flush.
        assert_eq!(tx.unwrite(), None);

        assert!(tx.flush());
        assert_eq!(rx.read(), Some(1));
        assert!(rx.read().is_none());
    }

    #[test]
    fn driver_sequence_matches() {
        // Stage 1024, retract 512, close the batch, drain.
        let (mut tx, mut rx) = Pipe::<i32>::new();

        for i in 0..1024 {
            tx.write(i, true).unwrap();
        }
        for expected in (512..1024).rev() {
            assert_eq!(tx.unwrite(), Some(expected));
        }
        tx.write(-1, false).unwrap();
        tx.flush();

        let drained: Vec<i32> = std::iter::from_fn(|| rx.read()).collect();
        let mut expected: Vec<i32> = (0..512).collect();
        expected.push(-1);
        assert_eq!(drained, expected);
    }

    #[test]
    fn park_and_wake_handshake() {
        let (mut tx, mut rx) = Pipe::<i32, 4, 1>::new();

        // Empty read parks the pipe.
        assert!(rx.read().is_none());
        assert!(!rx.check_read(), "re-entry while parked stays empty");
        assert!(rx.read().is_none());

        // The flush after parking reports the need for a wakeup.
        tx.write(7, false).unwrap();
        assert!(!tx.flush());

        // The woken reader sees the data without further handshaking.
        assert!(rx.check_read());
        assert_eq!(rx.read(), Some(7));
        assert!(rx.read().is_none());

        // Once the reader is known awake again, flush reports true.
        tx.write(8, false).unwrap();
        assert!(!tx.flush(), "reader parked again on the empty read above");
        assert_eq!(rx.read(), Some(8));
        tx.write(9, false).unwrap();
        assert!(tx.flush(), "reader is awake; no wakeup needed");
        assert_eq!(rx.read(), Some(9));
    }

    #[test]
    fn flush_with_nothing_staged_is_a_no_op() {
        let (mut tx, mut rx) = Pipe::<i32, 4, 1>::new();
        assert!(tx.flush());
        assert!(rx.read().is_none());
        // Parked reader is invisible to an empty flush.
        assert!(tx.flush());
    }

    #[test]
    fn single_slot_segments() {
        let (mut tx, mut rx) = Pipe::<u32, 1, 1>::new();

        for i in 0..16 {
            tx.write(i, false).unwrap();
            tx.flush();
        }
        for i in 0..16 {
            assert_eq!(rx.read(), Some(i));
        }
        assert!(rx.read().is_none());
    }

    #[test]
    fn no_spare_pool_still_grows() {
        let (mut tx, mut rx) = Pipe::<u32, 2, 0>::new();

        for i in 0..100 {
            tx.write(i, false).unwrap();
        }
        tx.flush();
        for i in 0..100 {
            assert_eq!(rx.read(), Some(i));
        }
        assert_eq!(rx.pool_reuses(), 0);
    }

    #[test]
    fn writes_beyond_pooled_capacity_keep_growing() {
        const N: usize = 8;
        const S: usize = 2;
        let (mut tx, mut rx) = Pipe::<usize, N, S>::new();

        // Far more than N * (S + 1) elements without a single read.
        let total = N * (S + 1) * 10;
        for i in 0..total {
            tx.write(i, false).unwrap();
        }
        tx.flush();

        for i in 0..total {
            assert_eq!(rx.read(), Some(i));
        }
        assert!(rx.read().is_none());
    }

    #[test]
    fn steady_state_reuses_segments() {
        const N: usize = 4;
        let (mut tx, mut rx) = Pipe::<usize, N, 1>::new();

        // Lockstep traffic turns segments over constantly; after warmup the
        // pool supplies them.
        for i in 0..1000 {
            tx.write(i, false).unwrap();
            tx.flush();
            assert_eq!(rx.read(), Some(i));
        }

        let fresh = tx.fresh_allocations();
        let reused = tx.pool_reuses();
        assert!(
            fresh <= 3,
            "lockstep traffic should stay in pooled segments, got {fresh} fresh"
        );
        assert!(reused + fresh >= (1000 / N) as u64);
    }

    static LIVE: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct Tracked(#[allow(dead_code)] u32);

    impl Tracked {
        fn new(v: u32) -> Self {
            LIVE.fetch_add(1, Ordering::Relaxed);
            Tracked(v)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            LIVE.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dropping_the_pipe_drops_live_elements_once() {
        LIVE.store(0, Ordering::Relaxed);
        {
            let (mut tx, mut rx) = Pipe::<Tracked, 4, 1>::new();

            for i in 0..6 {
                tx.write(Tracked::new(i), false).unwrap();
            }
            tx.flush();
            // Consume two, retract nothing; four stay live in the pipe.
            drop(rx.read());
            drop(rx.read());
            assert_eq!(LIVE.load(Ordering::Relaxed), 4);

            // Stage two more that never publish.
            tx.write(Tracked::new(10), true).unwrap();
            tx.write(Tracked::new(11), true).unwrap();
            assert_eq!(LIVE.load(Ordering::Relaxed), 6);

            drop(tx);
            drop(rx);
        }
        assert_eq!(LIVE.load(Ordering::Relaxed), 0, "every element drops exactly once");
    }

    #[test]
    fn moved_values_survive_the_trip() {
        let (mut tx, mut rx) = Pipe::<String, 2, 1>::new();

        for word in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            tx.write(word.to_owned(), false).unwrap();
        }
        tx.flush();

        let words: Vec<String> = std::iter::from_fn(|| rx.read()).collect();
        assert_eq!(words, vec!["alpha", "beta", "gamma", "delta", "epsilon"]);
    }
}
