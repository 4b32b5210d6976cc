//! Device-resident chunks and windowed host read-back.
//!
//! A [`Chunk`] pairs a device buffer with the event that signals its
//! producer finished writing it. Consumers order themselves after that
//! event; nothing reads the buffer before it fires. Chunks are closed
//! explicitly by their last consumer; the destructor only backstops leaks
//! on pathological paths.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::api::{DeviceApi, MapMode, MemId};
use crate::codec::ElementCodec;
use crate::error::{GravelError, Result};
use crate::handle::{safe_release_event, DeviceBuffer, Event};

/// A device-resident, immutable-length, logically typed array.
pub struct Chunk<T> {
    elems: usize,
    space: usize,
    elem_size: usize,
    buffer: Option<DeviceBuffer>,
    ready: Option<Event>,
    _elem: PhantomData<fn() -> T>,
}

impl<T> Chunk<T> {
    pub(crate) fn new(
        buffer: DeviceBuffer,
        ready: Event,
        elems: usize,
        space: usize,
        elem_size: usize,
    ) -> Self {
        Self {
            elems,
            space,
            elem_size,
            buffer: Some(buffer),
            ready: Some(ready),
            _elem: PhantomData,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn elems(&self) -> usize {
        self.elems
    }

    /// Allocated byte capacity; at least `elems * elem_size`.
    #[must_use]
    pub fn space(&self) -> usize {
        self.space
    }

    /// Encoded element size in bytes.
    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// The chunk's buffer handle, while the chunk still owns one.
    #[must_use]
    pub fn mem(&self) -> Option<MemId> {
        self.buffer.as_ref().map(DeviceBuffer::raw)
    }

    /// Whether the chunk still owns its device buffer.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.buffer.is_some()
    }

    /// Borrow the buffer and readiness event for an enqueue.
    pub(crate) fn parts(&self) -> Result<(&DeviceBuffer, &Event)> {
        match (&self.buffer, &self.ready) {
            (Some(buffer), Some(ready)) => Ok((buffer, ready)),
            _ => Err(GravelError::precondition("chunk is closed")),
        }
    }

    /// Move the buffer and readiness event out, leaving the chunk closed.
    /// Used by in-place transforms, which consume their input.
    pub(crate) fn take_parts(&mut self) -> Option<(DeviceBuffer, Event)> {
        match (self.buffer.take(), self.ready.take()) {
            (Some(buffer), Some(ready)) => Some((buffer, ready)),
            _ => None,
        }
    }

    /// Release the chunk's buffer and readiness event. Idempotent; closing
    /// an already-closed chunk is a no-op.
    pub fn close(&mut self) {
        if let Some(mut ready) = self.ready.take() {
            ready.release();
        }
        if let Some(mut buffer) = self.buffer.take() {
            buffer.release();
        }
    }
}

impl<T> Drop for Chunk<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for Chunk<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("elems", &self.elems)
            .field("space", &self.space)
            .field("elem_size", &self.elem_size)
            .field("open", &self.is_open())
            .finish()
    }
}

struct Window {
    base_elem: usize,
    ptr: *mut u8,
    len: usize,
    /// Map completion; waited on the first touch of the window, passed as
    /// a dependency of the unmap otherwise.
    map_event: Option<Event>,
}

/// Windowed reader over a chunk's contents.
///
/// At most one map window is host-visible at a time. When the next element
/// falls outside the current window, the window is unmapped and the next
/// one is mapped at a window-aligned offset, ordered behind the unmap. The
/// reader retains the chunk's buffer and readiness event for its lifetime
/// and must be closed; dropping closes as a backstop.
pub struct ChunkReader<C: ElementCodec> {
    api: Arc<dyn DeviceApi>,
    codec: C,
    buffer: DeviceBuffer,
    ready: Event,
    window_bytes: usize,
    elems: usize,
    pos: usize,
    window: Option<Window>,
    pending_unmap: Option<Event>,
    closed: bool,
}

impl<C: ElementCodec> std::fmt::Debug for ChunkReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("window_bytes", &self.window_bytes)
            .field("elems", &self.elems)
            .field("pos", &self.pos)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<C: ElementCodec> ChunkReader<C> {
    pub(crate) fn new(
        api: Arc<dyn DeviceApi>,
        chunk: &Chunk<C::Elem>,
        codec: C,
        window_bytes: usize,
    ) -> Result<Self> {
        let size = codec.size_of();
        if size == 0 || window_bytes == 0 || window_bytes % size != 0 {
            return Err(GravelError::precondition(
                "element size must divide the map window",
            ));
        }
        if chunk.elem_size() != size {
            return Err(GravelError::precondition(
                "codec element size does not match the chunk",
            ));
        }
        let (buffer, ready) = chunk.parts()?;
        let buffer = buffer.try_clone()?;
        let ready = match ready.try_clone() {
            Ok(ready) => ready,
            Err(err) => {
                // The buffer retain must not outlive this failure.
                let mut buffer = buffer;
                buffer.release();
                return Err(err);
            }
        };
        Ok(Self {
            api,
            codec,
            buffer,
            ready,
            window_bytes,
            elems: chunk.elems(),
            pos: 0,
            window: None,
            pending_unmap: None,
            closed: false,
        })
    }

    /// Elements remaining to be read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.elems - self.pos
    }

    fn ensure_window(&mut self, elem: usize) -> Result<()> {
        let size = self.codec.size_of();
        let byte = elem * size;
        if let Some(window) = &self.window {
            let base_byte = window.base_elem * size;
            if byte >= base_byte && byte < base_byte + window.len {
                return Ok(());
            }
        }

        if let Some(window) = self.window.take() {
            let mut wait = Vec::new();
            if let Some(event) = &window.map_event {
                wait.push(event.raw());
            }
            let unmap = self.api.unmap_buffer(self.buffer.raw(), window.ptr, &wait)?;
            // window.map_event drops here, releasing its reference.
            self.pending_unmap = Some(Event::from_raw(Arc::clone(&self.api), unmap));
        }

        let total = self.elems * size;
        let base_byte = byte - (byte % self.window_bytes);
        let len = self.window_bytes.min(total - base_byte);

        let mut wait = Vec::new();
        if !self.ready.is_null() {
            wait.push(self.ready.raw());
        }
        if let Some(unmap) = &self.pending_unmap {
            wait.push(unmap.raw());
        }
        let region = self
            .api
            .map_buffer(self.buffer.raw(), MapMode::Read, base_byte, len, false, &wait)?;
        if let Some(mut unmap) = self.pending_unmap.take() {
            unmap.release();
        }
        self.window = Some(Window {
            base_elem: base_byte / size,
            ptr: region.ptr,
            len: region.len,
            map_event: Some(Event::from_raw(Arc::clone(&self.api), region.event)),
        });
        Ok(())
    }

    fn read_at(&mut self, elem: usize) -> Result<C::Elem> {
        self.ensure_window(elem)?;
        let Some(window) = self.window.as_mut() else {
            return Err(GravelError::precondition("no window mapped"));
        };
        if let Some(event) = window.map_event.take() {
            // First touch of this window: block until the mapping landed.
            event.wait()?;
            // The event reference drops here.
        }
        // Safety: the region stays mapped until `ensure_window` or `close`
        // unmaps it, and its map event has completed.
        let bytes = unsafe { std::slice::from_raw_parts(window.ptr, window.len) };
        Ok(self.codec.decode(elem - window.base_elem, bytes))
    }

    /// Unmap the active window and release the reader's retains.
    /// Idempotent; a second close is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(window) = self.window.take() {
            let mut wait = Vec::new();
            if let Some(event) = &window.map_event {
                wait.push(event.raw());
            }
            match self.api.unmap_buffer(self.buffer.raw(), window.ptr, &wait) {
                Ok(unmap) => safe_release_event(&*self.api, unmap),
                Err(err) => tracing::warn!("unmap during reader close failed: {err}"),
            }
            // window.map_event drops here.
        }
        if let Some(mut unmap) = self.pending_unmap.take() {
            unmap.release();
        }
        self.buffer.release();
        self.ready.release();
    }
}

impl<C: ElementCodec> Iterator for ChunkReader<C> {
    type Item = Result<C::Elem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed || self.pos >= self.elems {
            return None;
        }
        let item = self.read_at(self.pos);
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.closed { 0 } else { self.remaining() };
        (remaining, Some(remaining))
    }
}

impl<C: ElementCodec> Drop for ChunkReader<C> {
    fn drop(&mut self) {
        self.close();
    }
}
