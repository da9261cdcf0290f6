//! Blocking channel adapter over the non-blocking pipe.
//!
//! The pipe itself never blocks; what it offers instead is the park/wake
//! handshake: an empty read parks the pipe, and the first flush afterwards
//! returns `false` exactly once. This module turns that contract into a
//! conventional blocking channel with a mutex, a condvar and a notified flag.
//! The sending side stays wait-free except for the (rare) wakeup signal.
//!
//! ```
//! use penstock::blocking;
//!
//! let (mut tx, mut rx) = blocking::channel::<u32, 128, 1>();
//! std::thread::spawn(move || {
//!     for i in 0..3 {
//!         tx.send(i).unwrap();
//!     }
//! });
//! assert_eq!(rx.recv(), Some(0));
//! assert_eq!(rx.recv(), Some(1));
//! assert_eq!(rx.recv(), Some(2));
//! assert_eq!(rx.recv(), None); // sender dropped, channel drained
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::pipe::{Pipe, PipeReader, PipeWriter};
use crate::WriteError;

/// Error returned by [`Sender::send`].
#[derive(Debug, Eq, PartialEq)]
pub enum SendError<T> {
    /// The receiving half is gone; the value is handed back.
    Closed(T),
    /// A fresh segment could not be allocated; the value is handed back.
    AllocFailed(T),
}

struct Shared {
    closed: AtomicBool,
    notified: Mutex<bool>,
    readable: Condvar,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Taking the lock orders the close against a receiver that is
        // between its notified check and its wait.
        drop(self.notified.lock());
        self.readable.notify_one();
    }
}

/// Creates a connected blocking channel pair.
pub fn channel<T, const N: usize, const S: usize>() -> (Sender<T, N, S>, Receiver<T, N, S>) {
    let (writer, reader) = Pipe::new();
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        notified: Mutex::new(false),
        readable: Condvar::new(),
    });
    (
        Sender {
            writer,
            shared: Arc::clone(&shared),
        },
        Receiver { reader, shared },
    )
}

/// Sending half. Publishes each element immediately and only touches the
/// mutex when the receiver actually parked.
pub struct Sender<T, const N: usize = 128, const S: usize = 1> {
    writer: PipeWriter<T, N, S>,
    shared: Arc<Shared>,
}

impl<T, const N: usize, const S: usize> Sender<T, N, S> {
    /// Sends `value`. Never blocks on the receiver; wakes it when it had
    /// parked itself.
    pub fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed(value));
        }

        match self.writer.write(value, false) {
            Ok(()) => {}
            Err(WriteError::AllocFailed(value)) => return Err(SendError::AllocFailed(value)),
        }

        if !self.writer.flush() {
            // The receiver parked before this publish; hand it the wakeup.
            *self.shared.notified.lock() = true;
            self.shared.readable.notify_one();
        }
        Ok(())
    }

    /// Closes the channel. The receiver drains what was already published,
    /// then observes the end.
    pub fn close(&mut self) {
        self.shared.close();
    }
}

impl<T, const N: usize, const S: usize> Drop for Sender<T, N, S> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Receiving half. Blocks in [`recv`](Receiver::recv) while the channel is
/// empty and open.
pub struct Receiver<T, const N: usize = 128, const S: usize = 1> {
    reader: PipeReader<T, N, S>,
    shared: Arc<Shared>,
}

impl<T, const N: usize, const S: usize> Receiver<T, N, S> {
    /// Takes the next element, parking the thread while the channel is
    /// empty. Returns `None` once the channel is closed and drained.
    pub fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.reader.read() {
                return Some(value);
            }

            // The failed read parked the pipe, so the next publish flushes
            // false and the sender raises `notified` under this lock: no
            // wakeup can slip through the gap.
            let mut notified = self.shared.notified.lock();
            loop {
                if *notified {
                    *notified = false;
                    break;
                }
                if self.shared.closed.load(Ordering::Acquire) {
                    drop(notified);
                    return self.reader.read();
                }
                self.shared.readable.wait(&mut notified);
            }
        }
    }

    /// Takes the next element if one is published. Never blocks.
    pub fn try_recv(&mut self) -> Option<T> {
        self.reader.read()
    }

    /// Closes the channel; subsequent sends fail with
    /// [`SendError::Closed`].
    pub fn close(&mut self) {
        self.shared.close();
    }
}

impl<T, const N: usize, const S: usize> Drop for Receiver<T, N, S> {
    fn drop(&mut self) {
        self.shared.close();
    }
}
