//! Bounded freelist of small fixed-size device buffers.
//!
//! Reduction scratch and result buffers are drawn from this pool instead
//! of the device allocator, hiding allocator jitter on the hot path. The
//! pool is filled once at construction; afterwards the number of buffers
//! in circulation is constant. [`DustPool::get`] blocks while the pool is
//! empty (the pool is sized so starvation is transient); returning a
//! buffer never blocks and never rejects.
//!
//! A checked-out [`DustBuffer`] rides back into the pool when dropped, so
//! a buffer captured by a completion callback is returned the moment the
//! callback finishes with it, and no failure path can lose one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::api::{BufferKind, DeviceApi, MemId};
use crate::error::Result;

/// How long `get` sleeps between polls of an empty pool.
const STARVATION_POLL: Duration = Duration::from_millis(10);

struct PoolInner {
    api: Arc<dyn DeviceApi>,
    free: Mutex<Vec<MemId>>,
    dust_size: usize,
    capacity: usize,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let mut free = self.free.lock();
        for mem in free.drain(..) {
            if let Err(err) = self.api.release_buffer(mem) {
                tracing::warn!(mem = mem.0, "failed to release dust buffer: {err}");
            }
        }
    }
}

/// A pooled fixed-size device buffer.
///
/// Dropping the checkout returns the buffer to its pool; [`DustPool::put`]
/// is the explicit spelling of the same hand-back. The device buffer
/// itself is only released when the pool winds down.
pub struct DustBuffer {
    mem: MemId,
    pool: Arc<PoolInner>,
}

impl DustBuffer {
    /// The underlying buffer handle.
    #[must_use]
    pub fn mem(&self) -> MemId {
        self.mem
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pool.dust_size
    }
}

impl Drop for DustBuffer {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.mem);
    }
}

impl std::fmt::Debug for DustBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DustBuffer").field("mem", &self.mem.0).finish()
    }
}

/// Fixed-population freelist of small device buffers.
pub struct DustPool {
    inner: Arc<PoolInner>,
}

impl DustPool {
    /// Create the pool and fill it with `capacity` buffers of `dust_size`
    /// bytes each.
    pub fn new(api: Arc<dyn DeviceApi>, dust_size: usize, capacity: usize) -> Result<Self> {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            match api.create_buffer(BufferKind::Device, dust_size) {
                Ok(mem) => free.push(mem),
                Err(err) => {
                    // Unwind the partial fill before surfacing the error.
                    for mem in free.drain(..) {
                        let _ = api.release_buffer(mem);
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(capacity, dust_size, "filled dust pool");
        Ok(Self {
            inner: Arc::new(PoolInner {
                api,
                free: Mutex::new(free),
                dust_size,
                capacity,
            }),
        })
    }

    /// Buffer payload size in bytes.
    #[must_use]
    pub fn dust_size(&self) -> usize {
        self.inner.dust_size
    }

    /// Total buffers in circulation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently checked in.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Whether every buffer is checked out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check out a buffer, waiting while the pool is empty.
    ///
    /// Every outstanding buffer is returned from a completion callback, so
    /// an empty pool is a transient state, not an error.
    #[must_use]
    pub fn get(&self) -> DustBuffer {
        loop {
            if let Some(mem) = self.inner.free.lock().pop() {
                return DustBuffer {
                    mem,
                    pool: Arc::clone(&self.inner),
                };
            }
            std::thread::sleep(STARVATION_POLL);
        }
    }

    /// Check a buffer back in. Never blocks: the pool population equals
    /// the initial fill, so there is always room.
    pub fn put(&self, buffer: DustBuffer) {
        drop(buffer);
    }
}
