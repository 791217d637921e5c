//! Reference-counted byte chunks.
//!
//! A `Chunk` is an immutable view of bytes plus two flags: `last` (the
//! terminal chunk of its source) and an optional failure. Three shapes
//! exist:
//!
//! - *data chunk*: a non-empty view, no failure;
//! - *terminal empty chunk*: empty view, `last`, no failure ([`Chunk::eof`]);
//! - *failure chunk*: empty view with a cause; `last` distinguishes
//!   fatal from transient ([`Chunk::failure`]).
//!
//! Data chunks own one retain on a shared allocation. [`Chunk::retain`]
//! produces another handle (+1) and [`Chunk::release`] consumes one
//! (-1). Release is the explicit spelling of drop, so ownership
//! transfers are moves and the count never needs touching for a simple
//! hand-off. When
//! the count reaches zero the allocation is handed back to the pool it
//! was leased from. Slicing is zero-copy: the slice shares the
//! allocation and the retain count.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::StrandError;

/// Receives allocations whose retain count reached zero.
///
/// Implemented by the buffer pool; `reclaim` gets the recovered buffer
/// back for reuse, `lost` is the accounting path when an aliasing
/// `Bytes` handle kept the allocation alive past the last release.
pub(crate) trait Recycler: Send + Sync {
    fn reclaim(&self, buf: BytesMut);
    fn lost(&self, capacity: usize);
}

pub(crate) struct SharedBuf {
    data: Bytes,
    capacity: usize,
    recycler: Option<Arc<dyn Recycler>>,
}

impl SharedBuf {
    fn recycle(self) {
        if let Some(recycler) = self.recycler {
            match self.data.try_into_mut() {
                Ok(buf) => recycler.reclaim(buf),
                Err(_aliased) => recycler.lost(self.capacity),
            }
        }
    }
}

pub struct Chunk {
    shared: Option<Arc<SharedBuf>>,
    off: usize,
    len: usize,
    last: bool,
    failure: Option<StrandError>,
}

impl Chunk {
    /// A data chunk over caller-supplied bytes (not pool-backed).
    pub fn of(data: Bytes, last: bool) -> Self {
        let len = data.len();
        Self {
            shared: Some(Arc::new(SharedBuf {
                capacity: len,
                data,
                recycler: None,
            })),
            off: 0,
            len,
            last,
            failure: None,
        }
    }

    /// The terminal empty chunk.
    pub fn eof() -> Self {
        Self {
            shared: None,
            off: 0,
            len: 0,
            last: true,
            failure: None,
        }
    }

    /// A failure chunk. `fatal` failures are also `last`; transient ones
    /// are not, and a reader may ignore them and keep reading.
    pub fn failure(cause: StrandError, fatal: bool) -> Self {
        Self {
            shared: None,
            off: 0,
            len: 0,
            last: fatal,
            failure: Some(cause),
        }
    }

    pub(crate) fn pooled(data: Bytes, capacity: usize, recycler: Arc<dyn Recycler>, last: bool) -> Self {
        let len = data.len();
        Self {
            shared: Some(Arc::new(SharedBuf {
                capacity,
                data,
                recycler: Some(recycler),
            })),
            off: 0,
            len,
            last,
            failure: None,
        }
    }

    /// The byte view. Empty for terminal and failure chunks.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match &self.shared {
            Some(shared) => &shared.data[self.off..self.off + self.len],
            None => &[],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        self.len > 0
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.last
    }

    #[inline]
    pub fn failure_cause(&self) -> Option<&StrandError> {
        self.failure.as_ref()
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Terminal empty chunk test: `last`, no data, no failure.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.last && self.len == 0 && self.failure.is_none()
    }

    /// Another handle on the same allocation; retain count +1.
    pub fn retain(&self) -> Chunk {
        Chunk {
            shared: self.shared.clone(),
            off: self.off,
            len: self.len,
            last: self.last,
            failure: self.failure.clone(),
        }
    }

    /// Give up this handle; retain count -1, reclaiming at zero. This is
    /// the explicit spelling of drop; a plain drop has the same effect.
    #[inline]
    pub fn release(self) {}

    /// Zero-copy sub-view sharing the allocation and retain count. The
    /// slice keeps this chunk's flags only if it reaches the end of the
    /// view.
    pub fn slice(&self, range: Range<usize>) -> Chunk {
        assert!(range.end <= self.len, "slice out of bounds");
        let at_end = range.end == self.len;
        Chunk {
            shared: self.shared.clone(),
            off: self.off + range.start,
            len: range.end - range.start,
            last: self.last && at_end,
            failure: self.failure.clone(),
        }
    }

    /// Consume `n` bytes from the front of the view, in place.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance out of bounds");
        self.off += n;
        self.len -= n;
    }

    /// An aliasing `Bytes` handle over the view, for APIs that take
    /// owned bytes. While it lives, the allocation cannot be recycled
    /// (the pool counts it lost instead); it is still freed normally.
    pub fn to_bytes(&self) -> Bytes {
        match &self.shared {
            Some(shared) => shared.data.slice(self.off..self.off + self.len),
            None => Bytes::new(),
        }
    }

    /// Live handles on this chunk's allocation, for leak assertions.
    pub fn retain_count(&self) -> usize {
        self.shared.as_ref().map_or(0, Arc::strong_count)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            if let Some(owned) = Arc::into_inner(shared) {
                owned.recycle();
            }
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len)
            .field("last", &self.last)
            .field("failure", &self.failure)
            .finish()
    }
}
