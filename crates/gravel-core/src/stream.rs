//! Host-to-device chunk uploader.
//!
//! Stages a lazy host element sequence into device-resident chunks. Each
//! chunk is encoded through a host-visible buffer mapped blocking and
//! write-invalidating. On unified-memory devices (and NVIDIA discrete
//! parts, whose host-visible buffers are transparently pinned) that buffer
//! doubles as the device buffer and the unmap event is the chunk's
//! readiness. Everywhere else the bytes are copied once into a
//! device-only buffer so the consumer keeps full device bandwidth, and
//! the staging buffer is released from the copy's completion callback.

use std::iter::Peekable;
use std::sync::Arc;

use crate::api::{BufferKind, CompletionCallback, MapMode};
use crate::chunk::Chunk;
use crate::codec::ElementCodec;
use crate::error::{GravelError, Result};
use crate::handle::{safe_release_event, DeviceBuffer, Event};
use crate::session::Session;

/// Lazy sequence of device chunks over a host element sequence.
pub struct ChunkStream<'s, C: ElementCodec, I: Iterator<Item = C::Elem>> {
    session: &'s Session,
    codec: C,
    items: Peekable<I>,
    group_size: usize,
}

impl<'s, C: ElementCodec, I: Iterator<Item = C::Elem>> ChunkStream<'s, C, I> {
    pub(crate) fn new(session: &'s Session, codec: C, items: I, group_size: usize) -> Result<Self> {
        let size = codec.size_of();
        if size == 0 || group_size == 0 || group_size % size != 0 {
            return Err(GravelError::precondition(
                "element size must divide the group size",
            ));
        }
        Ok(Self {
            session,
            codec,
            items: items.peekable(),
            group_size,
        })
    }

    /// Whether the underlying host sequence has more elements.
    pub fn has_next(&mut self) -> bool {
        self.items.peek().is_some()
    }

    fn next_chunk(&mut self) -> Result<Chunk<C::Elem>> {
        let api = Arc::clone(self.session.api());
        let size = self.codec.size_of();
        let capacity = self.group_size / size;

        let mut host = DeviceBuffer::create(Arc::clone(&api), BufferKind::HostVisible, self.group_size)?;

        // Blocking write map: the pointer is writable on return, so the
        // map event carries no further ordering.
        let region = match api.map_buffer(
            host.raw(),
            MapMode::WriteInvalidate,
            0,
            self.group_size,
            true,
            &[],
        ) {
            Ok(region) => region,
            Err(err) => {
                host.release();
                return Err(err);
            }
        };
        safe_release_event(&*api, region.event);

        // Safety: the map was blocking and write-invalidating; this thread
        // is the only writer until the unmap below.
        let window = unsafe { std::slice::from_raw_parts_mut(region.ptr, region.len) };
        let mut copied = 0;
        while copied < capacity {
            match self.items.next() {
                Some(value) => {
                    self.codec.encode(copied, window, &value);
                    copied += 1;
                }
                None => break,
            }
        }

        let mut unmap = match api.unmap_buffer(host.raw(), region.ptr, &[]) {
            Ok(event) => Event::from_raw(Arc::clone(&api), event),
            Err(err) => {
                host.release();
                return Err(err);
            }
        };

        if self.session.unified() {
            tracing::trace!(elems = copied, space = self.group_size, "unified upload");
            return Ok(Chunk::new(host, unmap, copied, self.group_size, size));
        }

        // Staged path: one copy into a device-only buffer; the readiness
        // event is the copy's completion.
        let bytes = copied * size;
        let device = match DeviceBuffer::create(Arc::clone(&api), BufferKind::DeviceReadOnly, bytes)
        {
            Ok(buffer) => buffer,
            Err(err) => {
                unmap.release();
                host.release();
                return Err(err);
            }
        };
        let ready = match api.enqueue_copy(host.raw(), device.raw(), 0, 0, bytes, &[unmap.raw()]) {
            Ok(event) => Event::from_raw(Arc::clone(&api), event),
            Err(err) => {
                let mut device = device;
                device.release();
                unmap.release();
                host.release();
                return Err(err);
            }
        };
        unmap.release();

        // The staging buffer rides in the completion callback and is
        // released only once the copy has consumed it.
        let staged = host;
        let callback: CompletionCallback = Box::new(move |_status| {
            drop(staged);
        });
        if let Err(err) = api.on_complete(ready.raw(), callback) {
            // The unregistered callback box was dropped with the staging
            // buffer inside; the copy command keeps its own reference, so
            // the early release is harmless. A failing registration is a
            // device error and the caller gets it.
            let mut device = device;
            device.release();
            let mut ready = ready;
            ready.release();
            return Err(err);
        }

        tracing::trace!(elems = copied, space = bytes, "staged upload");
        Ok(Chunk::new(device, ready, copied, bytes, size))
    }
}

impl<'s, C: ElementCodec, I: Iterator<Item = C::Elem>> Iterator for ChunkStream<'s, C, I> {
    type Item = Result<Chunk<C::Elem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        Some(self.next_chunk())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::U32Codec;
    use crate::session::SessionOptions;
    use crate::stub::StubDevice;

    fn session(group_size: usize) -> (Arc<StubDevice>, Session) {
        let stub = StubDevice::new();
        let options = SessionOptions {
            group_size,
            ..SessionOptions::default()
        };
        let session = Session::new(stub.clone(), options).unwrap();
        (stub, session)
    }

    #[test]
    fn partial_last_chunk() {
        let (_stub, session) = session(64);
        // 16 elements per chunk; 40 inputs => 2 full chunks + 8.
        let chunks: Vec<_> = session
            .stream(U32Codec, 0u32..40)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].elems(), 16);
        assert_eq!(chunks[1].elems(), 16);
        assert_eq!(chunks[2].elems(), 8);
    }

    #[test]
    fn staged_chunks_size_to_contents() {
        let (_stub, session) = session(64);
        assert!(!session.unified());
        let chunk = session
            .stream(U32Codec, 0u32..8)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(chunk.elems(), 8);
        assert_eq!(chunk.space(), 32);
    }

    #[test]
    fn unified_chunks_keep_the_group_allocation() {
        use crate::api::DeviceProbe;

        let stub = StubDevice::with_probe(DeviceProbe {
            name: "igpu".to_string(),
            vendor: "Acme".to_string(),
            unified_memory: true,
            cpu_class: false,
        });
        let options = SessionOptions {
            group_size: 64,
            ..SessionOptions::default()
        };
        let session = Session::new(stub, options).unwrap();
        assert!(session.unified());

        let chunk = session
            .stream(U32Codec, 0u32..8)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(chunk.elems(), 8);
        assert_eq!(chunk.space(), 64);
    }

    #[test]
    fn exhausted_stream_ends() {
        let (_stub, session) = session(64);
        let mut stream = session.stream(U32Codec, std::iter::empty()).unwrap();
        assert!(!stream.has_next());
        assert!(stream.next().is_none());
    }

    #[test]
    fn misaligned_group_size_is_a_precondition() {
        let (_stub, session) = session(64);
        let err = session
            .stream_grouped(U32Codec, 0u32..4, 30)
            .err()
            .expect("misaligned group size must fail");
        assert!(matches!(err, GravelError::Precondition(_)));
    }

    #[test]
    fn upload_handles_stay_balanced() {
        let (stub, session) = session(64);
        {
            let chunks: Vec<_> = session
                .stream(U32Codec, 0u32..40)
                .unwrap()
                .map(|c| c.unwrap())
                .collect();
            for mut chunk in chunks {
                chunk.close();
            }
        }
        drop(session);
        assert!(stub.handle_counts().is_balanced());
    }
}
