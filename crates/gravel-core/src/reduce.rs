//! Two-stage tree reduction producing asynchronous scalars.
//!
//! Stage 1 folds the input into `n_groups` partials in a pooled scratch
//! buffer; stage 2 folds those partials into one value in a second pooled
//! buffer; a non-blocking read lands the encoded result in a pinned host
//! block. The read's completion callback decodes the value, resolves the
//! future, and returns both scratch buffers to the pool. The callback is
//! the sole releaser on the success path, so a dropped future cannot leak
//! them. The kernels own the associative fold; the engine only guarantees
//! the partial counts and the event chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::api::{CompletionCallback, HostBlock, KernelArg, NdRange};
use crate::chunk::Chunk;
use crate::codec::ElementCodec;
use crate::error::{GravelError, Result};
use crate::handle::Event;
use crate::session::{Session, REDUCE_KERNEL};
use crate::source::KernelSource;

/// The pending result of [`Session::reduce_chunk`].
///
/// Resolves exactly once, after the whole event chain completes. Await it,
/// or call [`ReduceFuture::wait`] from synchronous code.
#[derive(Debug)]
pub struct ReduceFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> ReduceFuture<T> {
    /// Block the calling thread until the reduction lands.
    pub fn wait(self) -> Result<T> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(GravelError::ResultDropped),
        }
    }
}

impl<T> Future for ReduceFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(GravelError::ResultDropped),
        })
    }
}

impl Session {
    /// Reduce a chunk to one value with a two-stage tree reduction.
    ///
    /// The input chunk is not consumed. If any enqueue fails, the scratch
    /// buffers go back to the pool immediately and the failure is
    /// surfaced synchronously; a failed completion rejects the future
    /// with the device error and still returns the buffers.
    pub fn reduce_chunk<C>(
        &self,
        chunk: &Chunk<C::Elem>,
        codec: C,
        source: &dyn KernelSource,
    ) -> Result<ReduceFuture<C::Elem>>
    where
        C: ElementCodec + Clone + 'static,
        C::Elem: Send + 'static,
    {
        let size = codec.size_of();
        if size == 0 || self.pool().dust_size() % size != 0 {
            return Err(GravelError::precondition(
                "element size must divide the dust-buffer size",
            ));
        }
        if chunk.elem_size() != size {
            return Err(GravelError::precondition(
                "codec element size does not match the chunk",
            ));
        }
        let stage2 = source
            .stage2()
            .ok_or_else(|| GravelError::precondition("reduction source has no second stage"))?;

        let (n_groups, n_local) = self.reduction_shape(size);
        let local_bytes = n_local * size;
        let (input_mem, input_ready) = {
            let (buffer, ready) = chunk.parts()?;
            (buffer.raw(), ready.raw())
        };

        let reduce_buf = self.pool().get();
        let res_buf = self.pool().get();

        // Stage 1: input -> n_groups partials.
        let stage1_args = [
            KernelArg::Mem(input_mem),
            KernelArg::Mem(reduce_buf.mem()),
            KernelArg::Local(local_bytes),
            KernelArg::uint(chunk.elems() as u32),
        ];
        let dims1 = NdRange::linear_grouped(n_local * n_groups, n_local);
        // Dropping a checked-out dust buffer returns it, so the early
        // error paths below hand both buffers back by construction.
        let mut ready1 =
            self.call_kernel(source, REDUCE_KERNEL, &stage1_args, &[input_ready], &dims1)?;

        // Stage 2: partials -> one value.
        let stage2_args = [
            KernelArg::Mem(reduce_buf.mem()),
            KernelArg::Mem(res_buf.mem()),
            KernelArg::Local(local_bytes),
            KernelArg::uint(n_groups as u32),
        ];
        let dims2 = NdRange::linear_grouped(n_local, n_local);
        let mut ready2 =
            match self.call_kernel(&*stage2, REDUCE_KERNEL, &stage2_args, &[ready1.raw()], &dims2) {
                Ok(event) => event,
                Err(err) => {
                    ready1.release();
                    return Err(err);
                }
            };
        ready1.release();

        // Read the encoded result into pinned host memory.
        let host = HostBlock::zeroed(size);
        let api = Arc::clone(self.api());
        let finished = match api.enqueue_read(res_buf.mem(), 0, Arc::clone(&host), &[ready2.raw()])
        {
            Ok(event) => Event::from_raw(Arc::clone(&api), event),
            Err(err) => {
                ready2.release();
                return Err(err);
            }
        };
        ready2.release();

        let (tx, rx) = oneshot::channel();
        let callback_codec = codec;
        let callback: CompletionCallback = Box::new(move |status| {
            let outcome = if status == 0 {
                // Safety: the read completed; the device writer is ordered
                // before this callback by the finished event.
                let window = unsafe { host.as_slice() };
                Ok(callback_codec.decode(0, window))
            } else {
                Err(GravelError::device(status, "read reduction result"))
            };
            // A dropped future just ignores the send.
            let _ = tx.send(outcome);
            // The scratch buffers go back only now, after the last
            // dependent command has completed.
            drop(reduce_buf);
            drop(res_buf);
        });
        let mut finished = finished;
        if let Err(err) = api.on_complete(finished.raw(), callback) {
            // The unregistered callback dropped with the dust buffers
            // inside, which returned them to the pool.
            finished.release();
            return Err(err);
        }
        finished.release();

        Ok(ReduceFuture { rx })
    }
}
