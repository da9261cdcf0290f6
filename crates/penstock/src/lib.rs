//! Non-blocking unbounded SPSC pipe over pooled segmented storage.
//!
//! One writer, one reader, no locks and no waiting on either side. Elements
//! live in fixed-capacity segments linked into a list; drained segments are
//! recycled through a small lock-free pool so steady-state traffic stays off
//! the system allocator. A single atomic word carries both "how far has the
//! writer published" and "the reader has parked itself", which is all the
//! coordination the two sides need.
//!
//! ```text
//!  begin ──────────▶ read_end ─────▶ commit_end ─────▶ flush_end ──▶ back
//!  (consumed)        (prefetched)    (published)       (complete)    (staging)
//! ```
//!
//! The writer stages elements with [`PipeWriter::write`], optionally marking
//! them incomplete to batch several into one atomic publication, and makes
//! them visible with [`PipeWriter::flush`]. A `false` return from `flush`
//! means the reader parked itself and needs an external wakeup; the
//! [`blocking`] module packages that handshake into a conventional channel.
//!
//! ```
//! use penstock::Pipe;
//!
//! let (mut tx, mut rx) = Pipe::<u32>::new();
//!
//! tx.write(1, false).unwrap();
//! tx.write(2, false).unwrap();
//! tx.flush();
//!
//! assert_eq!(rx.read(), Some(1));
//! assert_eq!(rx.read(), Some(2));
//! assert_eq!(rx.read(), None);
//! ```

pub mod blocking;
mod object;
mod pipe;
mod pool;
mod segment;

pub use object::ObjectAllocator;
pub use pipe::{Pipe, PipeReader, PipeWriter};

/// A block could not be obtained from the system allocator.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AllocError;

/// Error occurring when a write cannot stage its element.
#[derive(Debug, Eq, PartialEq)]
pub enum WriteError<T> {
    /// A fresh segment could not be allocated; the rejected value is handed
    /// back untouched.
    AllocFailed(T),
}
