//! Fixed-size copy buffers shared by proxy connections.
//!
//! Borrowed buffers return to the pool when dropped; when the pool is
//! empty a fresh buffer is allocated, and a full pool simply frees the
//! returned one.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

#[derive(Clone)]
pub struct BufferPool {
    queue: Arc<ArrayQueue<Vec<u8>>>,
    buf_size: usize,
}

impl BufferPool {
    /// Pool keeping at most `capacity` idle buffers of `buf_size` bytes
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            buf_size,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Idle buffers currently held
    pub fn idle(&self) -> usize {
        self.queue.len()
    }

    pub fn get(&self) -> PooledBuf {
        let data = self
            .queue
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size]);

        PooledBuf {
            queue: self.queue.clone(),
            data: Some(data),
        }
    }
}

pub struct PooledBuf {
    queue: Arc<ArrayQueue<Vec<u8>>>,
    data: Option<Vec<u8>>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let _ = self.queue.push(data);
        }
    }
}
