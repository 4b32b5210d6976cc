//! Compute sessions: policy, kernel dispatch, and the map engine.
//!
//! A session binds one device (through a [`DeviceApi`] implementation) to
//! the engine's shared state: the dust pool, the program cache, the
//! unified-memory upload policy, and the profiling counter. Command
//! submission is single-threaded per session; parallelism comes from the
//! device executing asynchronously and from completion callbacks on
//! API-internal threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::api::{BufferKind, CompletionCallback, DeviceApi, DeviceProbe, EventId, KernelArg, NdRange};
use crate::cache::ProgramCache;
use crate::chunk::{Chunk, ChunkReader};
use crate::codec::ElementCodec;
use crate::error::{GravelError, Result};
use crate::handle::{safe_release_event, DeviceBuffer, Event};
use crate::pool::DustPool;
use crate::source::KernelSource;
use crate::stream::ChunkStream;

/// Entry name of one-to-one map kernels.
pub const MAP_KERNEL: &str = "map";
/// Entry name of both phases of a tree reduction.
pub const REDUCE_KERNEL: &str = "reduce";

/// Session tunables. The defaults are the engine's design constants.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upload chunk size in bytes.
    pub group_size: usize,
    /// Pooled scratch-buffer size in bytes.
    pub dust_size: usize,
    /// Number of pooled scratch buffers. Reductions need two at a time;
    /// shrinking below 2 breaks them.
    pub dust_count: usize,
    /// Read-back map window in bytes.
    pub map_window: usize,
    /// Bound on cached programs.
    pub program_cache_capacity: usize,
    /// Compiler options passed to every program build.
    pub build_options: String,
    /// Override the reduction group count (power of two).
    pub n_groups: Option<usize>,
    /// Override the reduction work-group size (power of two).
    pub n_local: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            group_size: 256 * 1024 * 1024,
            dust_size: 64 * 1024,
            dust_count: 32,
            map_window: 64 * 1024 * 1024,
            program_cache_capacity: 100,
            build_options: "-cl-unsafe-math-optimizations".to_string(),
            n_groups: None,
            n_local: None,
        }
    }
}

/// A host-side compute session over one device.
pub struct Session {
    options: SessionOptions,
    probe: DeviceProbe,
    unified: bool,
    pool: DustPool,
    cache: ProgramCache,
    execution_time_ns: Arc<AtomicU64>,
    // Dropped last: the pool and cache release their device objects while
    // the backend (and with it the queue and context) is still alive.
    api: Arc<dyn DeviceApi>,
}

/// Open a session over an already-bootstrapped device binding.
pub fn new_session(api: Arc<dyn DeviceApi>, options: SessionOptions) -> Result<Session> {
    Session::new(api, options)
}

impl Session {
    /// Open a session over `api`, probing the device once to fix the
    /// upload and reduction policies, and filling the dust pool.
    pub fn new(api: Arc<dyn DeviceApi>, options: SessionOptions) -> Result<Self> {
        let probe = api.probe()?;
        let unified = probe.unified_memory || probe.vendor.to_lowercase().contains("nvidia");
        let pool = DustPool::new(Arc::clone(&api), options.dust_size, options.dust_count)?;
        let cache = ProgramCache::new(
            Arc::clone(&api),
            options.program_cache_capacity,
            options.build_options.clone(),
        );
        tracing::debug!(
            device = %probe.name,
            vendor = %probe.vendor,
            unified,
            cpu_class = probe.cpu_class,
            "opened compute session"
        );
        Ok(Self {
            options,
            probe,
            unified,
            pool,
            cache,
            execution_time_ns: Arc::new(AtomicU64::new(0)),
            api,
        })
    }

    /// The session tunables.
    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The probed device capabilities.
    #[must_use]
    pub fn device(&self) -> &DeviceProbe {
        &self.probe
    }

    /// Whether uploads reuse host-visible buffers as device buffers.
    #[must_use]
    pub fn unified(&self) -> bool {
        self.unified
    }

    /// The scratch-buffer pool.
    #[must_use]
    pub fn pool(&self) -> &DustPool {
        &self.pool
    }

    /// Accumulated kernel execution time in nanoseconds, summed from
    /// completion callbacks across the session.
    #[must_use]
    pub fn execution_time_ns(&self) -> u64 {
        self.execution_time_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn api(&self) -> &Arc<dyn DeviceApi> {
        &self.api
    }

    pub(crate) fn execution_counter(&self) -> &Arc<AtomicU64> {
        &self.execution_time_ns
    }

    /// The `(n_groups, n_local)` shape for a reduction over elements of
    /// `elem_size` bytes. `n_groups` is halved until one dust buffer holds
    /// every group's partial.
    pub(crate) fn reduction_shape(&self, elem_size: usize) -> (usize, usize) {
        let (default_groups, default_local) = if self.probe.cpu_class { (1, 1) } else { (8192, 128) };
        let mut n_groups = self.options.n_groups.unwrap_or(default_groups);
        let n_local = self.options.n_local.unwrap_or(default_local);
        while n_groups > 1 && n_groups * elem_size > self.options.dust_size {
            n_groups /= 2;
        }
        (n_groups, n_local)
    }

    /// Resolve, configure, and launch one kernel.
    ///
    /// The program comes from the cache (compiled on miss), arguments are
    /// bound in order, the launch is ordered after `wait`, and the
    /// returned event carries the completion of the launch. A profiling
    /// callback folds the kernel's `end − queued` span into
    /// [`Session::execution_time_ns`]. Any failing step releases every
    /// locally acquired resource and surfaces the API error unchanged.
    pub fn call_kernel(
        &self,
        source: &dyn KernelSource,
        name: &str,
        args: &[KernelArg],
        wait: &[EventId],
        dims: &NdRange,
    ) -> Result<Event> {
        let program = self.cache.get_or_build(source)?;
        let kernel = self.api.create_kernel(program.raw(), name)?;

        for (index, arg) in args.iter().enumerate() {
            if let Err(err) = self.api.set_kernel_arg(kernel, index as u32, arg) {
                let _ = self.api.release_kernel(kernel);
                return Err(err);
            }
        }

        let raw = match self.api.enqueue_kernel(kernel, dims, wait) {
            Ok(event) => event,
            Err(err) => {
                let _ = self.api.release_kernel(kernel);
                return Err(err);
            }
        };
        let event = Event::from_raw(Arc::clone(&self.api), raw);

        // The profiling callback owns one extra event reference and
        // releases it after reading the span.
        if let Err(err) = self.api.retain_event(raw) {
            let _ = self.api.release_kernel(kernel);
            return Err(err);
        }
        let api = Arc::clone(&self.api);
        let counter = Arc::clone(&self.execution_time_ns);
        let callback: CompletionCallback = Box::new(move |status| {
            if status == 0 {
                match api.profiling_span_ns(raw) {
                    Ok(span) => {
                        counter.fetch_add(span, Ordering::Relaxed);
                    }
                    Err(err) => tracing::trace!("profiling query failed: {err}"),
                }
            }
            safe_release_event(&*api, raw);
        });
        if let Err(err) = self.api.on_complete(raw, callback) {
            // The callback never ran, so its event reference is still ours
            // to give back.
            safe_release_event(&*self.api, raw);
            let _ = self.api.release_kernel(kernel);
            return Err(err);
        }

        // The API keeps the kernel alive while the launch is pending.
        self.api.release_kernel(kernel)?;
        Ok(event)
    }

    /// Stage a host element sequence into device chunks of the default
    /// group size.
    pub fn stream<C, I>(&self, codec: C, items: I) -> Result<ChunkStream<'_, C, I::IntoIter>>
    where
        C: ElementCodec,
        I: IntoIterator<Item = C::Elem>,
    {
        self.stream_grouped(codec, items, self.options.group_size)
    }

    /// Stage a host element sequence into device chunks of an explicit
    /// group size.
    pub fn stream_grouped<C, I>(
        &self,
        codec: C,
        items: I,
        group_size: usize,
    ) -> Result<ChunkStream<'_, C, I::IntoIter>>
    where
        C: ElementCodec,
        I: IntoIterator<Item = C::Elem>,
    {
        ChunkStream::new(self, codec, items.into_iter(), group_size)
    }

    /// Run a one-to-one kernel over `input`, producing a new chunk whose
    /// readiness chains behind the input's.
    ///
    /// With `destructive` set and matching element sizes the kernel runs
    /// in place and the returned chunk takes over the input's buffer; the
    /// input is left closed and closing it again is a no-op. A
    /// destructive map that is not in place closes the input once the
    /// kernel is enqueued, and also on the failure path. A
    /// non-destructive map leaves the input untouched even on failure.
    pub fn map_chunk<A, C>(
        &self,
        input: &mut Chunk<A>,
        out_codec: &C,
        source: &dyn KernelSource,
        destructive: bool,
    ) -> Result<Chunk<C::Elem>>
    where
        C: ElementCodec,
    {
        let out_size = out_codec.size_of();
        if out_size == 0 {
            return Err(GravelError::precondition("output element size is zero"));
        }
        let elems = input.elems();
        let in_space = input.space();
        let in_size = input.elem_size();
        let (mem, ready_id) = {
            let (buffer, ready) = input.parts()?;
            (buffer.raw(), ready.raw())
        };
        let dims = NdRange::linear(elems);
        let in_place = destructive && in_size == out_size;

        if in_place {
            let args = [KernelArg::Mem(mem)];
            let ready = self.call_kernel(source, MAP_KERNEL, &args, &[ready_id], &dims)?;
            let Some((buffer, mut old_ready)) = input.take_parts() else {
                return Err(GravelError::precondition("chunk closed mid-transform"));
            };
            // The producer event made it into the launch's wait list; its
            // reference is no longer needed.
            old_ready.release();
            return Ok(Chunk::new(buffer, ready, elems, in_space, out_size));
        }

        let out = match DeviceBuffer::create(
            Arc::clone(&self.api),
            BufferKind::Device,
            elems * out_size,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                if destructive {
                    input.close();
                }
                return Err(err);
            }
        };

        let args = [KernelArg::Mem(mem), KernelArg::Mem(out.raw())];
        let ready = match self.call_kernel(source, MAP_KERNEL, &args, &[ready_id], &dims) {
            Ok(event) => event,
            Err(err) => {
                // The fresh output buffer must not leak.
                let mut out = out;
                out.release();
                if destructive {
                    input.close();
                }
                return Err(err);
            }
        };

        if destructive {
            // The device holds its own references while the launch is
            // pending; the host side is done with the input.
            input.close();
        }
        Ok(Chunk::new(out, ready, elems, elems * out_size, out_size))
    }

    /// Read a chunk back element by element through mapped windows.
    pub fn iterate<C>(&self, chunk: &Chunk<C::Elem>, codec: C) -> Result<ChunkReader<C>>
    where
        C: ElementCodec,
    {
        ChunkReader::new(Arc::clone(&self.api), chunk, codec, self.options.map_window)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.probe.name)
            .field("unified", &self.unified)
            .field("pool", &self.pool.len())
            .field("cached_programs", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_the_design_constants() {
        let options = SessionOptions::default();
        assert_eq!(options.group_size, 256 * 1024 * 1024);
        assert_eq!(options.dust_size, 65536);
        assert_eq!(options.dust_count, 32);
        assert_eq!(options.map_window, 64 * 1024 * 1024);
        assert_eq!(options.program_cache_capacity, 100);
        assert_eq!(options.build_options, "-cl-unsafe-math-optimizations");
    }

    #[test]
    fn reduction_shape_fits_one_dust_buffer() {
        use crate::stub::StubDevice;

        let stub = StubDevice::new();
        let session = Session::new(stub, SessionOptions::default()).unwrap();

        // 8192 groups * 8 bytes == 65536, exactly one dust buffer.
        assert_eq!(session.reduction_shape(8), (8192, 128));
        // 16-byte partials must halve the group count once.
        assert_eq!(session.reduction_shape(16), (4096, 128));
    }

    #[test]
    fn cpu_class_devices_reduce_flat() {
        use crate::api::DeviceProbe;
        use crate::stub::StubDevice;

        let stub = StubDevice::with_probe(DeviceProbe {
            name: "host simulator".to_string(),
            vendor: "Acme".to_string(),
            unified_memory: true,
            cpu_class: true,
        });
        let session = Session::new(stub, SessionOptions::default()).unwrap();
        assert_eq!(session.reduction_shape(4), (1, 1));
        assert!(session.unified());
    }

    #[test]
    fn nvidia_vendor_string_forces_unified() {
        use crate::api::DeviceProbe;
        use crate::stub::StubDevice;

        let stub = StubDevice::with_probe(DeviceProbe {
            name: "GeForce".to_string(),
            vendor: "NVIDIA Corporation".to_string(),
            unified_memory: false,
            cpu_class: false,
        });
        let session = Session::new(stub, SessionOptions::default()).unwrap();
        assert!(session.unified());
    }
}
