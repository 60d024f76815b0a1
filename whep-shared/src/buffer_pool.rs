use std::sync::{Arc, Mutex};

/// Maximum size of a single UDP datagram we will ever receive or construct.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

struct Inner {
    free: Mutex<Vec<Vec<u8>>>,
}

/// A pool of fixed-size byte slabs shared between the ingress receive loop
/// and every peer's send path.
///
/// Rent a buffer with `rent()`, fill it, hand ownership to the next stage,
/// and that stage calls `PooledBuffer::recycle` (or simply drops it, which
/// returns the slab to the pool via `Drop`) when it is done. Ownership
/// handoff is linear: once a buffer is hand off to the multiplexer, the
/// ingress loop must not touch it again.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Rent a zero-filled buffer of `MAX_DATAGRAM_SIZE` bytes, reusing a
    /// previously-returned slab when one is available.
    pub fn rent(&self) -> PooledBuffer {
        let mut buf = {
            let mut free = self.inner.free.lock().unwrap();
            free.pop().unwrap_or_else(|| vec![0u8; MAX_DATAGRAM_SIZE])
        };
        buf.resize(MAX_DATAGRAM_SIZE, 0);
        PooledBuffer {
            pool: self.inner.clone(),
            buf: Some(buf),
            len: 0,
        }
    }
}

/// A rented slab. Explicitly returned to the pool on `Drop`, so a task that
/// forgets to call `recycle` still can't leak the pool unbounded.
pub struct PooledBuffer {
    pool: Arc<Inner>,
    buf: Option<Vec<u8>>,
    len: usize,
}

impl PooledBuffer {
    /// The datagram actually received/written, i.e. `buf[..len]`.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer already recycled")[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer already recycled")
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= MAX_DATAGRAM_SIZE);
        self.len = len.min(MAX_DATAGRAM_SIZE);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Explicitly return the slab. Equivalent to dropping the handle, but
    /// spells out the rent/use/return contract at call sites that care.
    pub fn recycle(mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = self.pool.free.lock().unwrap();
            // Bound the pool so a burst of ingress traffic can't pin
            // unbounded memory once peers stop draining it.
            if free.len() < 4096 {
                free.push(buf);
            }
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Ok(mut free) = self.pool.free.lock() {
                if free.len() < 4096 {
                    free.push(buf);
                }
            }
        }
    }
}

#[cfg(test)]
mod buffer_pool_test {
    use super::*;

    #[test]
    fn rent_use_return_reuses_slabs() {
        let pool = BufferPool::new();
        let mut a = pool.rent();
        a.as_mut_slice()[0] = 42;
        a.set_len(1);
        assert_eq!(a.as_slice(), &[42]);
        a.recycle();

        let b = pool.rent();
        // Same underlying allocation came back (best-effort check: pool
        // holds exactly one freed slab at this point).
        assert_eq!(b.len(), 0);
    }
}
