//! Compute-API abstraction consumed by the engine.
//!
//! The engine drives a command-queue device API (the OpenCL family)
//! through the object-safe [`DeviceApi`] trait, so the same code paths run
//! against the real backend in `gravel-cl` and against the instrumented
//! in-process device in [`crate::stub`]. Handles are opaque ids owned by
//! the backend; reference counts are manipulated only through the retain
//! and release methods here, and every enqueue expresses its ordering
//! through an explicit list of predecessor events.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::error::Result;

/// Opaque device buffer handle (`cl_mem` in the OpenCL backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemId(pub u64);

impl MemId {
    /// The "no buffer" sentinel.
    pub const NULL: MemId = MemId(0);

    /// Whether this is the sentinel value.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque completion-event handle.
///
/// [`EventId::NULL`] is the "no event here" sentinel; releasing it is a
/// no-op on every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u64);

impl EventId {
    /// The "no event" sentinel.
    pub const NULL: EventId = EventId(0);

    /// Whether this is the sentinel value.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque compiled-program handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

/// Opaque kernel-object handle. Kernels are scoped to a single dispatch
/// and never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

/// What kind of memory object to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Plain device-resident buffer.
    Device,
    /// Device-resident buffer the kernels only read.
    DeviceReadOnly,
    /// Buffer backed by host-allocated memory (`ALLOC_HOST_PTR`), usable
    /// directly as a device buffer on unified-memory devices.
    HostVisible,
}

/// How a mapped region will be accessed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Host reads device contents.
    Read,
    /// Host overwrites the region; prior device contents are discarded.
    WriteInvalidate,
}

/// Device capabilities the session derives its policies from.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    /// Human-readable device name.
    pub name: String,
    /// Device vendor string, as reported by the API.
    pub vendor: String,
    /// Whether the device reports host-unified memory.
    pub unified_memory: bool,
    /// Whether this is a CPU-class device (reductions use a flat shape).
    pub cpu_class: bool,
}

/// One kernel argument.
///
/// `Local` is the null-pointer-with-size form of the underlying API: it
/// reserves that many bytes of work-group local memory instead of passing
/// a value.
#[derive(Debug, Clone)]
pub enum KernelArg {
    /// A device buffer bound by handle.
    Mem(MemId),
    /// A work-group local allocation of the given byte size.
    Local(usize),
    /// An immediate value passed by bytes.
    Scalar(Vec<u8>),
}

impl KernelArg {
    /// A 32-bit unsigned immediate.
    #[must_use]
    pub fn uint(value: u32) -> Self {
        Self::Scalar(value.to_le_bytes().to_vec())
    }

    /// A 64-bit unsigned immediate.
    #[must_use]
    pub fn ulong(value: u64) -> Self {
        Self::Scalar(value.to_le_bytes().to_vec())
    }
}

/// Launch geometry for an N-D-range enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdRange {
    /// Number of significant dimensions (1..=3).
    pub work_dim: u32,
    /// Global offset per dimension.
    pub global_offset: [usize; 3],
    /// Global work size per dimension.
    pub global: [usize; 3],
    /// Work-group size per dimension; `None` lets the runtime choose.
    pub local: Option<[usize; 3]>,
}

impl NdRange {
    /// One-dimensional launch with a runtime-chosen work-group size.
    #[must_use]
    pub fn linear(global: usize) -> Self {
        Self {
            work_dim: 1,
            global_offset: [0; 3],
            global: [global, 1, 1],
            local: None,
        }
    }

    /// One-dimensional launch with an explicit work-group size.
    #[must_use]
    pub fn linear_grouped(global: usize, local: usize) -> Self {
        Self {
            work_dim: 1,
            global_offset: [0; 3],
            global: [global, 1, 1],
            local: Some([local, 1, 1]),
        }
    }
}

/// A host window obtained from a buffer mapping.
///
/// The pointer stays valid until the region is unmapped; pairing each map
/// with exactly one unmap is the engine's responsibility.
#[derive(Debug)]
pub struct MappedRegion {
    /// Host pointer to the mapped bytes.
    pub ptr: *mut u8,
    /// Length of the mapped window in bytes.
    pub len: usize,
    /// Completion event of the map command (already signalled for a
    /// blocking map).
    pub event: EventId,
}

// Safety: the pointer refers to pinned memory owned by the device runtime,
// and the engine never touches a mapped window from two threads at once.
unsafe impl Send for MappedRegion {}

/// Pinned destination block for a device-to-host read.
///
/// The device writes the block from its own thread; the read's completion
/// event orders that writer before any reader.
pub struct HostBlock {
    bytes: UnsafeCell<Box<[u8]>>,
}

// Safety: a HostBlock has exactly one writer (the device runtime, before
// the read's completion event fires) and one reader (the completion
// callback, after it fires); the event provides the ordering.
unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    /// Allocate a zero-filled block of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    /// Block length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        // Safety: reading the length does not touch the byte contents.
        unsafe { (&*self.bytes.get()).len() }
    }

    /// Whether the block is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw pointer for the device-side writer.
    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        // Safety: handing out the pointer is safe; writing through it is
        // the backend's responsibility and is ordered by the read event.
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    /// View the block contents.
    ///
    /// # Safety
    ///
    /// Only call after the read's completion event has fired; until then
    /// the device may still be writing.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // Safety: deferred to the caller per the method contract.
        unsafe { &*self.bytes.get() }
    }
}

impl std::fmt::Debug for HostBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBlock").field("len", &self.len()).finish()
    }
}

/// Callback invoked when an event reaches a terminal status. Status `0`
/// is successful completion; a negative value carries the API error code.
pub type CompletionCallback = Box<dyn FnOnce(i32) + Send + 'static>;

/// Object-safe surface of the underlying compute API.
///
/// One implementation binds a live `(context, queue, device)` triple;
/// dropping the implementation tears those down, queue before context.
/// Methods that enqueue work return the command's completion event with
/// one reference owned by the caller.
pub trait DeviceApi: Send + Sync {
    /// Report the capabilities the session policies depend on.
    fn probe(&self) -> Result<DeviceProbe>;

    /// Allocate a buffer of `size` bytes.
    fn create_buffer(&self, kind: BufferKind, size: usize) -> Result<MemId>;
    /// Add a reference to a buffer.
    fn retain_buffer(&self, mem: MemId) -> Result<()>;
    /// Drop a reference to a buffer.
    fn release_buffer(&self, mem: MemId) -> Result<()>;

    /// Add a reference to an event.
    fn retain_event(&self, event: EventId) -> Result<()>;
    /// Drop a reference to an event.
    fn release_event(&self, event: EventId) -> Result<()>;
    /// Block until the event reaches a terminal status.
    fn wait_event(&self, event: EventId) -> Result<()>;
    /// Register a callback fired when the event completes. Callbacks run
    /// on API-internal threads and must not be waited on from this thread.
    fn on_complete(&self, event: EventId, callback: CompletionCallback) -> Result<()>;
    /// Nanoseconds between the command being queued and finishing
    /// execution, for a completed event on a profiling queue.
    fn profiling_span_ns(&self, event: EventId) -> Result<u64>;

    /// Create a program object from source text.
    fn create_program(&self, source: &str) -> Result<ProgramId>;
    /// Build a program for the bound device.
    fn build_program(&self, program: ProgramId, options: &str) -> Result<()>;
    /// The build log of the most recent build attempt.
    fn build_log(&self, program: ProgramId) -> String;
    /// Drop a reference to a program.
    fn release_program(&self, program: ProgramId) -> Result<()>;

    /// Create a kernel object from a built program and an entry name.
    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId>;
    /// Bind one argument by index.
    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> Result<()>;
    /// Drop a reference to a kernel. The API keeps the kernel alive
    /// internally while launches referencing it are pending.
    fn release_kernel(&self, kernel: KernelId) -> Result<()>;

    /// Enqueue an N-D-range launch after `wait`.
    fn enqueue_kernel(&self, kernel: KernelId, dims: &NdRange, wait: &[EventId]) -> Result<EventId>;
    /// Map `len` bytes of a buffer at `offset` into host memory after
    /// `wait`. A blocking map returns only once the pointer is usable.
    fn map_buffer(
        &self,
        mem: MemId,
        mode: MapMode,
        offset: usize,
        len: usize,
        blocking: bool,
        wait: &[EventId],
    ) -> Result<MappedRegion>;
    /// Unmap a previously mapped pointer after `wait`.
    fn unmap_buffer(&self, mem: MemId, ptr: *mut u8, wait: &[EventId]) -> Result<EventId>;
    /// Enqueue a device-to-device copy after `wait`.
    fn enqueue_copy(
        &self,
        src: MemId,
        dst: MemId,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        wait: &[EventId],
    ) -> Result<EventId>;
    /// Enqueue a non-blocking read of `dst.len()` bytes from `src` at
    /// `offset` into a pinned host block, after `wait`.
    fn enqueue_read(
        &self,
        src: MemId,
        offset: usize,
        dst: Arc<HostBlock>,
        wait: &[EventId],
    ) -> Result<EventId>;
}
