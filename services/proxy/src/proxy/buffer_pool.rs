use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Pool of reusable byte buffers whose size adapts to the largest buffer ever
/// returned to it.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

struct Inner {
    size: AtomicUsize,
    free: Mutex<Vec<Vec<u8>>>,
}

const MAX_POOLED: usize = 64;

impl BufferPool {
    /// Returns `None` for size 0, which disables pooling.
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }

        Some(Self {
            inner: Arc::new(Inner {
                size: AtomicUsize::new(size),
                free: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Current target capacity of pooled buffers.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    /// Empty buffer with capacity of at least `size()`.
    pub fn get(&self) -> Vec<u8> {
        let size = self.size();
        let mut buf = self.inner.free.lock().pop().unwrap_or_default();
        if buf.capacity() < size {
            buf.reserve_exact(size - buf.len());
        }
        buf
    }

    /// Return `buf` to the pool, growing the pool size to its length or
    /// capacity if either is larger.
    pub fn put(&self, mut buf: Vec<u8>) {
        let observed = buf.len().max(buf.capacity());
        self.grow_to(observed);

        buf.clear();
        let mut free = self.inner.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    fn grow_to(&self, observed: usize) {
        let mut current = self.inner.size.load(Ordering::Acquire);
        while observed > current {
            match self.inner.size.compare_exchange_weak(
                current,
                observed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}
