//! The chunk buffer pool.
//!
//! `ChunkPool` leases writable buffers from a free list and takes them
//! back when the chunk built from a lease drops its last retain. The
//! pool is a cloneable handle over shared state and is injected as a
//! capability into every component that fills buffers, so tests can
//! watch one pool end-to-end and assert zero outstanding leases on
//! shutdown.
//!
//! Lease capacities are clamped to the configured `[min, max]` range;
//! the free list is scanned for the first buffer large enough, in the
//! manner of a slab free list, and is bounded so a burst does not pin
//! memory forever.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::chunk::{Chunk, Recycler};

/// Default lease clamp, overridable per pool.
pub const DEFAULT_MIN_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_CAPACITY: usize = 64 * 1024;

const MAX_FREE_BUFFERS: usize = 64;

/// Cloneable handle to one pool.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    min_capacity: usize,
    max_capacity: usize,
    /// Leases handed out and not yet reclaimed or lost.
    outstanding: AtomicUsize,
    allocated: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    lost: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub outstanding: usize,
    pub allocated: u64,
    pub reused: u64,
    pub recycled: u64,
    pub lost: u64,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MIN_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    /// A pool clamping leases to `[min, max]` bytes.
    pub fn with_capacity(min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                min_capacity: min,
                max_capacity: max,
                outstanding: AtomicUsize::new(0),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
                lost: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a writable buffer with at least `min(max(size, min), max)`
    /// spare capacity.
    pub fn acquire(&self, size: usize) -> Lease {
        let want = size.clamp(self.inner.min_capacity, self.inner.max_capacity);

        let reused = {
            let mut free = self.inner.free.lock().unwrap();
            free.iter()
                .position(|b| b.capacity() >= want)
                .map(|i| free.swap_remove(i))
        };

        let buf = match reused {
            Some(mut buf) => {
                buf.clear();
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(want)
            }
        };

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        Lease {
            buf,
            pool: Some(self.inner.clone()),
        }
    }

    /// Leases not yet returned. The zero-leak oracle for tests.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            recycled: self.inner.recycled.load(Ordering::Relaxed),
            lost: self.inner.lost.load(Ordering::Relaxed),
        }
    }

    /// Drop all retained free buffers.
    pub fn shrink(&self) {
        self.inner.free.lock().unwrap().clear();
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ChunkPool")
            .field("outstanding", &stats.outstanding)
            .field("allocated", &stats.allocated)
            .finish()
    }
}

impl Recycler for PoolInner {
    fn reclaim(&self, mut buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.recycled.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_FREE_BUFFERS {
            free.push(buf);
        }
    }

    fn lost(&self, _capacity: usize) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.lost.fetch_add(1, Ordering::Relaxed);
    }
}

/// A writable buffer on loan from a pool.
///
/// Fill it through `DerefMut` (it is a [`BytesMut`]) and then
/// [`Lease::freeze`] it into a chunk. Dropping an unfrozen lease returns
/// the buffer immediately.
pub struct Lease {
    buf: BytesMut,
    pool: Option<Arc<PoolInner>>,
}

impl Lease {
    /// Turn the filled buffer into a pooled chunk. The chunk's last
    /// release hands the allocation back to the pool.
    pub fn freeze(mut self, last: bool) -> Chunk {
        let buf = std::mem::take(&mut self.buf);
        let recycler: Arc<dyn Recycler> = self.pool.take().expect("lease already frozen");
        let capacity = buf.capacity();
        Chunk::pooled(buf.freeze(), capacity, recycler, last)
    }
}

impl std::ops::Deref for Lease {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl std::ops::DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.reclaim(std::mem::take(&mut self.buf));
        }
    }
}
