//! Pooled scratch buffers for encoders and decoders (spec §4.1, §9).
//!
//! Grounded on the *policy* of the teacher's `allocator/buffer.rs`
//! (checkout from a free list, return exactly once), reimplemented over a
//! safe `crossbeam_queue::ArrayQueue` since this protocol only needs
//! fixed-size scratch regions, not the teacher's variable-length
//! intrusive buffer chains.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Scratch buffers below this size are drawn from the pool; anything
/// larger bypasses it so one oversized message doesn't pin a pool slot
/// (spec §9, "Pooled reads beyond a small threshold bypass the pool").
pub const POOLED_THRESHOLD: usize = 4096;

/// Shared free list of reusable scratch buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<ArrayQueue<Vec<u8>>>,
    buf_size: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize, capacity: usize) -> Self {
        let inner = Arc::new(ArrayQueue::new(capacity));
        for _ in 0..capacity {
            let _ = inner.push(Vec::with_capacity(buf_size));
        }
        Self { inner, buf_size: buf_size.max(POOLED_THRESHOLD) }
    }

    /// Checks out a buffer of at least `size` bytes of capacity. Buffers
    /// larger than [`POOLED_THRESHOLD`] are allocated fresh and never
    /// returned to the pool.
    pub fn checkout(&self, size: usize) -> PooledBuffer {
        if size > POOLED_THRESHOLD {
            return PooledBuffer { buf: Some(Vec::with_capacity(size)), pool: None };
        }
        let mut buf = self.inner.pop().unwrap_or_else(|| Vec::with_capacity(self.buf_size));
        buf.clear();
        if buf.capacity() < size {
            buf.reserve(size - buf.capacity());
        }
        PooledBuffer { buf: Some(buf), pool: Some(self.inner.clone()) }
    }
}

/// An owned scratch buffer checked out of a [`BufferPool`]. Returns itself
/// to the pool on drop; release is therefore idempotent by construction —
/// there is exactly one drop, and a buffer dropped twice is a compile
/// error, not a runtime one.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Option<Arc<ArrayQueue<Vec<u8>>>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.pool.take()) {
            // A full pool just drops the buffer; that's fine, it was
            // never guaranteed to be returned, only safe to return.
            let _ = pool.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_reuses_returned_buffers() {
        let pool = BufferPool::new(4096, 2);
        {
            let mut buf = pool.checkout(100);
            buf.extend_from_slice(b"hello");
        }
        let buf = pool.checkout(100);
        assert!(buf.is_empty(), "checked-out buffer must be cleared");
    }

    #[test]
    fn oversized_checkout_bypasses_pool() {
        let pool = BufferPool::new(4096, 1);
        let big = pool.checkout(POOLED_THRESHOLD + 1);
        assert!(big.pool.is_none());
    }
}
