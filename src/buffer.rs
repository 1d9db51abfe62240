//! Reusable frame buffers.
//!
//! Outgoing frames are built in a [`PooledBuffer`] and go back to the pool as
//! soon as the transport has taken the bytes. Incoming frames are read into
//! one too; that buffer is attached to the resulting notification and is only
//! returned after the last handler has seen the payload.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::dispatch::ReleaseAction;

/// Default capacity of a freshly allocated buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default number of idle buffers the pool keeps.
pub const DEFAULT_MAX_POOLED: usize = 32;

/// A bounded free-list of [`BytesMut`] buffers.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes and keeping at
    /// most `max_pooled` idle ones.
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
            max_pooled,
        })
    }

    /// Take an empty buffer, allocating if none is idle.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf,
            pool: Some(Arc::downgrade(self)),
        }
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn reclaim(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pooled: DEFAULT_MAX_POOLED,
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("buffer_size", &self.buffer_size)
            .field("max_pooled", &self.max_pooled)
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned on drop.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Option<Weak<BufferPool>>,
}

impl PooledBuffer {
    /// A buffer that belongs to no pool.
    pub fn detached(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pool: None,
        }
    }

    /// A release action that returns this buffer to its pool when run.
    pub fn into_release(self) -> ReleaseAction {
        Box::new(move || drop(self))
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            pool.reclaim(mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn dropped_buffers_return_empty() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.acquire();
        buf.put_slice(b"hello");
        assert_eq!(pool.available(), 0);
        drop(buf);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_empty());
    }

    #[test]
    fn pool_keeps_at_most_max_pooled() {
        let pool = BufferPool::new(16, 2);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn release_action_returns_buffer() {
        let pool = BufferPool::new(16, 2);
        let release = pool.acquire().into_release();
        assert_eq!(pool.available(), 0);
        release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn buffer_outliving_pool_is_simply_freed() {
        let pool = BufferPool::new(16, 2);
        let buf = pool.acquire();
        drop(pool);
        drop(buf);
    }
}
