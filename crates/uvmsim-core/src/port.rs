//! Bounded message ports
//!
//! Components exchange messages through bounded FIFO ports. A port handle
//! is cheaply cloneable; the receiving component keeps one handle and hands
//! clones to whoever needs to send to it. Delivery on a single port is
//! FIFO; nothing is guaranteed across ports.
//!
//! `send` hands the message back when the buffer is full. The sender must
//! treat that as "no progress this tick" and retry later without having
//! mutated any other state.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

struct Buffer<T> {
    queue: VecDeque<T>,
    capacity: usize,
}

/// A bounded FIFO port shared between one receiver and any number of senders
pub struct Port<T> {
    inner: Arc<Mutex<Buffer<T>>>,
}

impl<T> Clone for Port<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Port<T> {
    /// Create a port buffering at most `capacity` messages
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "port capacity must be non-zero");
        Self {
            inner: Arc::new(Mutex::new(Buffer {
                queue: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Enqueue a message, or give it back if the buffer is full
    pub fn send(&self, msg: T) -> std::result::Result<(), T> {
        let mut buf = self.inner.lock();
        if buf.queue.len() >= buf.capacity {
            return Err(msg);
        }
        buf.queue.push_back(msg);
        Ok(())
    }

    /// Dequeue the oldest message
    pub fn retrieve(&self) -> Option<T> {
        self.inner.lock().queue.pop_front()
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the buffer holds no messages
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Drop every buffered message
    pub fn drain(&self) {
        self.inner.lock().queue.clear();
    }
}

impl<T: Clone> Port<T> {
    /// Copy of the oldest message without dequeuing it
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().queue.front().cloned()
    }
}

impl<T> std::fmt::Debug for Port<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// A component driven once per simulated cycle by the external stepping
/// engine. Returns whether any state changed; an engine may idle a
/// component that reports no progress.
pub trait Tick {
    /// Advance one cycle
    fn tick(&mut self) -> crate::error::Result<bool>;
}
