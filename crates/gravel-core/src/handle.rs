//! RAII ownership wrappers for device handles.
//!
//! The underlying API is retain/release reference counted. These wrappers
//! encode exclusive ownership as the default: moving transfers ownership,
//! [`Event::try_clone`] and [`DeviceBuffer::try_clone`] retain, and `Drop`
//! releases exactly once. Error paths that fork ownership release
//! explicitly at each join point; the destructor is the backstop, not the
//! contract.

use std::sync::Arc;

use crate::api::{BufferKind, DeviceApi, EventId, MemId};
use crate::error::Result;

/// Release `event` unless it is the null sentinel.
///
/// Callable on every control path that could have produced the event,
/// including paths where it was never populated. Release failures are
/// logged, not surfaced: by the time a release fails there is nothing the
/// caller can do with the handle anyway.
pub fn safe_release_event(api: &dyn DeviceApi, event: EventId) {
    if event.is_null() {
        return;
    }
    if let Err(err) = api.release_event(event) {
        tracing::warn!(event = event.0, "failed to release event: {err}");
    }
}

/// Owned completion event.
///
/// Wraps one reference to a raw event. The null sentinel is representable
/// and releases as a no-op, so an `Event` can stand in for "no event
/// here" on paths that may or may not produce one.
pub struct Event {
    api: Arc<dyn DeviceApi>,
    raw: EventId,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("raw", &self.raw.0).finish()
    }
}

impl Event {
    /// Take over one reference to `raw`.
    #[must_use]
    pub fn from_raw(api: Arc<dyn DeviceApi>, raw: EventId) -> Self {
        Self { api, raw }
    }

    /// A sentinel event that releases as a no-op.
    #[must_use]
    pub fn null(api: Arc<dyn DeviceApi>) -> Self {
        Self {
            api,
            raw: EventId::NULL,
        }
    }

    /// The wrapped id. Ownership is not transferred.
    #[must_use]
    pub fn raw(&self) -> EventId {
        self.raw
    }

    /// Whether this is the sentinel.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    /// Retain the event and return a second owner.
    pub fn try_clone(&self) -> Result<Event> {
        if !self.raw.is_null() {
            self.api.retain_event(self.raw)?;
        }
        Ok(Self {
            api: Arc::clone(&self.api),
            raw: self.raw,
        })
    }

    /// Give up ownership without releasing. The caller becomes
    /// responsible for the reference.
    #[must_use]
    pub fn into_raw(mut self) -> EventId {
        std::mem::replace(&mut self.raw, EventId::NULL)
    }

    /// Block until the event completes. A sentinel completes immediately.
    pub fn wait(&self) -> Result<()> {
        if self.raw.is_null() {
            return Ok(());
        }
        self.api.wait_event(self.raw)
    }

    /// Release now instead of at drop. Idempotent.
    pub fn release(&mut self) {
        let raw = std::mem::replace(&mut self.raw, EventId::NULL);
        safe_release_event(&*self.api, raw);
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        safe_release_event(&*self.api, self.raw);
    }
}

/// Owned device buffer.
pub struct DeviceBuffer {
    api: Arc<dyn DeviceApi>,
    raw: MemId,
    size: usize,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("raw", &self.raw.0)
            .field("size", &self.size)
            .finish()
    }
}

impl DeviceBuffer {
    /// Allocate a new buffer, owning its initial reference.
    pub fn create(api: Arc<dyn DeviceApi>, kind: BufferKind, size: usize) -> Result<Self> {
        let raw = api.create_buffer(kind, size)?;
        Ok(Self { api, raw, size })
    }

    /// Take over one reference to `raw`.
    #[must_use]
    pub fn from_raw(api: Arc<dyn DeviceApi>, raw: MemId, size: usize) -> Self {
        Self { api, raw, size }
    }

    /// The wrapped id. Ownership is not transferred.
    #[must_use]
    pub fn raw(&self) -> MemId {
        self.raw
    }

    /// Allocated size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Retain the buffer and return a second owner.
    pub fn try_clone(&self) -> Result<DeviceBuffer> {
        self.api.retain_buffer(self.raw)?;
        Ok(Self {
            api: Arc::clone(&self.api),
            raw: self.raw,
            size: self.size,
        })
    }

    /// Give up ownership without releasing.
    #[must_use]
    pub fn into_raw(mut self) -> MemId {
        std::mem::replace(&mut self.raw, MemId::NULL)
    }

    /// Release now instead of at drop. Idempotent.
    pub fn release(&mut self) {
        let raw = std::mem::replace(&mut self.raw, MemId::NULL);
        if raw.is_null() {
            return;
        }
        if let Err(err) = self.api.release_buffer(raw) {
            tracing::warn!(mem = raw.0, "failed to release buffer: {err}");
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubDevice;

    #[test]
    fn event_clone_retains_and_drop_releases() {
        let stub = StubDevice::new();
        let api: Arc<dyn DeviceApi> = stub.clone();

        let mem = api.create_buffer(BufferKind::Device, 64).unwrap();
        let raw = api.unmap_buffer(mem, std::ptr::null_mut(), &[]).unwrap();
        let event = Event::from_raw(Arc::clone(&api), raw);
        let clone = event.try_clone().unwrap();
        drop(event);
        drop(clone);
        api.release_buffer(mem).unwrap();

        assert!(stub.handle_counts().is_balanced());
    }

    #[test]
    fn null_event_is_inert() {
        let stub = StubDevice::new();
        let api: Arc<dyn DeviceApi> = stub.clone();

        let mut event = Event::null(Arc::clone(&api));
        assert!(event.is_null());
        event.wait().unwrap();
        event.release();
        event.release();
        drop(event);

        assert!(stub.handle_counts().is_balanced());
    }

    #[test]
    fn into_raw_disarms_the_destructor() {
        let stub = StubDevice::new();
        let api: Arc<dyn DeviceApi> = stub.clone();

        let buffer = DeviceBuffer::create(Arc::clone(&api), BufferKind::Device, 128).unwrap();
        let raw = buffer.into_raw();
        // The reference now belongs to us; return it manually.
        api.release_buffer(raw).unwrap();

        assert!(stub.handle_counts().is_balanced());
    }
}
