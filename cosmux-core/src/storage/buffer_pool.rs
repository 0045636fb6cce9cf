//! Reusable part buffer pool
//!
//! Upload parts are read into fixed-size buffers; recycling them avoids one
//! large allocation per part.

use parking_lot::Mutex;
use std::sync::Arc;

/// Thread-safe pool of part-sized byte buffers
///
/// Every buffer handed out by [`acquire`](Self::acquire) is exactly
/// `part_size` bytes long. Only buffers whose capacity still equals
/// `part_size` are taken back; anything else is dropped.
pub struct ByteBufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    part_size: usize,
}

impl ByteBufferPool {
    /// Create an empty pool for buffers of `part_size` bytes
    pub fn new(part_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::new()),
            part_size,
        })
    }

    /// Acquire a zero-filled or recycled buffer of `part_size` bytes
    pub fn acquire(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.part_size])
    }

    /// Return a buffer to the pool
    pub fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() != self.part_size {
            // Short final parts and buffers from another configuration
            return;
        }
        // Restores len without touching bytes we did not write
        buffer.resize(self.part_size, 0);
        self.buffers.lock().push(buffer);
    }

    /// Size of buffers managed by this pool
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Get current pool size
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool() {
        let pool = ByteBufferPool::new(1024);

        let b1 = pool.acquire();
        let b2 = pool.acquire();
        assert_eq!(b1.len(), 1024);
        assert_eq!(pool.available(), 0);

        pool.release(b1);
        pool.release(b2);
        assert_eq!(pool.available(), 2);

        let b3 = pool.acquire();
        assert_eq!(b3.len(), 1024);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_stale_sized_buffers_dropped() {
        let pool = ByteBufferPool::new(1024);

        // Left over from a pool with a smaller part size
        pool.release(vec![0u8; 512]);
        // Left over from a pool with a larger part size
        pool.release(vec![0u8; 4096]);
        assert_eq!(pool.available(), 0);

        for _ in 0..4 {
            assert!(pool.acquire().len() >= pool.part_size());
        }
    }

    #[test]
    fn test_truncated_buffer_restored() {
        let pool = ByteBufferPool::new(64);
        let mut buf = pool.acquire();
        buf.truncate(10);
        pool.release(buf);
        assert_eq!(pool.acquire().len(), 64);
    }
}
