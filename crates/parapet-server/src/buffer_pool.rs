//! Recycling of per-connection plaintext buffers.
//!
//! Every connection holds an inbound buffer (decrypted bytes awaiting the
//! framing stage) and an outbound buffer (encoded responses awaiting
//! encryption). Both are checked out when the connection is registered and
//! checked back in when it closes.
//!
//! Backed by a lock-free `ArrayQueue` shared by all I/O workers. Buffers that
//! grew past `max_retained_capacity` while serving a large request are
//! released instead of pinning that memory in the pool.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Bounded pool of `BytesMut` buffers shared across workers.
#[derive(Debug)]
pub struct BufferPool {
    slots: ArrayQueue<BytesMut>,
    buffer_capacity: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    /// Creates a pool holding at most `slots` idle buffers.
    ///
    /// # Panics
    ///
    /// Panics if `slots` or `buffer_capacity` is 0, or if
    /// `max_retained_capacity` is smaller than `buffer_capacity`.
    pub fn new(slots: usize, buffer_capacity: usize, max_retained_capacity: usize) -> Self {
        assert!(slots > 0, "slots must be positive");
        assert!(buffer_capacity > 0, "buffer_capacity must be positive");
        assert!(
            max_retained_capacity >= buffer_capacity,
            "max_retained_capacity must be at least buffer_capacity"
        );
        Self {
            slots: ArrayQueue::new(slots),
            buffer_capacity,
            max_retained_capacity,
        }
    }

    /// Takes an empty buffer, allocating when the pool is dry.
    pub fn checkout(&self) -> BytesMut {
        self.slots
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    /// Returns a buffer. Its contents are discarded.
    ///
    /// Returns `false` if the buffer was released instead of retained, either
    /// because it outgrew `max_retained_capacity` or the pool is full.
    pub fn checkin(&self, mut buf: BytesMut) -> bool {
        if buf.capacity() > self.max_retained_capacity {
            return false;
        }
        buf.clear();
        self.slots.push(buf).is_ok()
    }

    /// Idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.slots.len()
    }
}
