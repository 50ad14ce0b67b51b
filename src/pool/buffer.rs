//! Byte Buffer Pool
//!
//! Fixed-capacity `BytesMut` buffers lent out as RAII [`PooledBuffer`]s.
//! Buffers are allocated lazily up to `max_buffers`; once that many are out,
//! [`BufferPool::borrow`] parks the caller until one comes back.

use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug)]
struct Slab {
    idle: Vec<bytes::BytesMut>,
    outstanding: usize,
}

#[derive(Debug)]
struct Inner {
    slab: Mutex<Slab>,
    returned: Condvar,
    buffer_size: usize,
    max_buffers: usize,
    closed: AtomicBool,
}

/// Pool of reusable byte buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Creates a pool of buffers of `buffer_size` bytes, at most
    /// `max_buffers` of them lent out at once.
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                slab: Mutex::new(Slab {
                    idle: Vec::new(),
                    outstanding: 0,
                }),
                returned: Condvar::new(),
                buffer_size,
                max_buffers,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Capacity of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Borrows a buffer, waiting for one to be returned if the pool is dry.
    pub fn borrow(&self) -> PooledBuffer {
        let mut slab = self.inner.slab.lock();
        loop {
            if let Some(buf) = self.take(&mut slab) {
                return buf;
            }
            trace!(outstanding = slab.outstanding, "Buffer pool exhausted, waiting");
            self.inner.returned.wait(&mut slab);
        }
    }

    /// Borrows a buffer, giving up after `timeout`.
    pub fn try_borrow_for(&self, timeout: Duration) -> Option<PooledBuffer> {
        let mut slab = self.inner.slab.lock();
        if let Some(buf) = self.take(&mut slab) {
            return Some(buf);
        }
        let result = self.inner.returned.wait_for(&mut slab, timeout);
        if result.timed_out() {
            return None;
        }
        self.take(&mut slab)
    }

    fn take(&self, slab: &mut Slab) -> Option<PooledBuffer> {
        // After release, buffers are plain allocations that are dropped on return.
        if self.inner.closed.load(Ordering::Acquire) {
            return Some(PooledBuffer {
                buf: bytes::BytesMut::with_capacity(self.inner.buffer_size),
                pool: None,
            });
        }

        let buf = match slab.idle.pop() {
            Some(buf) => buf,
            None if slab.outstanding < self.inner.max_buffers => {
                bytes::BytesMut::with_capacity(self.inner.buffer_size)
            }
            None => return None,
        };
        slab.outstanding += 1;
        Some(PooledBuffer {
            buf,
            pool: Some(Arc::clone(&self.inner)),
        })
    }

    /// Buffers currently lent out.
    pub fn outstanding(&self) -> usize {
        self.inner.slab.lock().outstanding
    }

    /// Buffers sitting idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.slab.lock().idle.len()
    }

    /// Drops the idle buffers and stops pooling. Waiters are woken and get
    /// unpooled buffers from then on.
    pub fn release(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut slab = self.inner.slab.lock();
        let freed = slab.idle.len();
        slab.idle.clear();
        drop(slab);
        self.inner.returned.notify_all();
        debug!(freed, "Buffer pool released");
    }
}

/// A buffer on loan from a [`BufferPool`]. Goes back to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: bytes::BytesMut,
    pool: Option<Arc<Inner>>,
}

impl PooledBuffer {
    /// Makes `len` initialized bytes available for a read syscall.
    pub fn scratch(&mut self, len: usize) -> &mut [u8] {
        self.buf.clear();
        self.buf.resize(len, 0);
        &mut self.buf[..]
    }
}

impl Deref for PooledBuffer {
    type Target = bytes::BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let mut buf = std::mem::take(&mut self.buf);
        let mut slab = pool.slab.lock();
        slab.outstanding -= 1;
        if !pool.closed.load(Ordering::Acquire) {
            buf.clear();
            // Reclaims the space in place when nothing else shares the allocation.
            buf.reserve(pool.buffer_size);
            slab.idle.push(buf);
        }
        drop(slab);
        pool.returned.notify_one();
    }
}
