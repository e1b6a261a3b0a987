//! Reusable byte buffers for log framing and checkpoint encoding.

use crossbeam::queue::ArrayQueue;
use tracing::trace;

/// Buffers larger than this are dropped instead of returned to the pool.
const MAX_RETAINED_CAPACITY: usize = 8 * 1024 * 1024;

/// Bounded lock-free pool of `Vec<u8>` buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    initial_capacity: usize,
}

impl BufferPool {
    pub fn new(slots: usize, initial_capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(slots.max(1)),
            initial_capacity,
        }
    }

    /// Takes an empty buffer, allocating one if the pool is drained.
    pub fn take(&self) -> Vec<u8> {
        self.buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity))
    }

    /// Returns a buffer to the pool.
    pub fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            trace!(capacity = buf.capacity(), "oversized buffer dropped");
            return;
        }
        buf.clear();
        // A full pool simply drops the buffer.
        let _ = self.buffers.push(buf);
    }
}
