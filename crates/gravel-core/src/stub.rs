//! In-process reference device for tests and development.
//!
//! Executes the full command surface eagerly against host memory: every
//! enqueue runs to completion before returning, and its event is born
//! complete, so completion callbacks fire inline at registration, the
//! same "already finished" path a real runtime takes for settled events.
//! Tests register host implementations of named kernels, inject failures
//! at any call site, force completion statuses, and audit retain/release
//! balance per handle class. The engine's ownership discipline can be
//! verified this way without a device.
//!
//! This backend is deliberately public: downstream crates test against it
//! the same way the engine's own suite does.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::{
    BufferKind, CompletionCallback, DeviceApi, DeviceProbe, EventId, HostBlock, KernelArg,
    KernelId, MapMode, MappedRegion, MemId, NdRange, ProgramId,
};
use crate::error::{GravelError, Result};

const CL_BUILD_PROGRAM_FAILURE: i32 = -11;
const CL_INVALID_VALUE: i32 = -30;
const CL_INVALID_MEM_OBJECT: i32 = -38;
const CL_INVALID_PROGRAM: i32 = -44;
const CL_INVALID_PROGRAM_EXECUTABLE: i32 = -45;
const CL_INVALID_KERNEL_NAME: i32 = -46;
const CL_INVALID_KERNEL: i32 = -48;
const CL_INVALID_KERNEL_ARGS: i32 = -52;
const CL_INVALID_EVENT: i32 = -58;

/// Host implementation of a named kernel.
pub type HostKernelFn = Arc<dyn Fn(&LaunchContext) + Send + Sync>;

/// Retain/release accounting for one handle class.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassCounts {
    /// Handles created with an initial reference.
    pub created: u64,
    /// Explicit retains.
    pub retained: u64,
    /// Releases, from any owner.
    pub released: u64,
}

impl ClassCounts {
    /// Outstanding references: `created + retained - released`.
    #[must_use]
    pub fn live(&self) -> i64 {
        (self.created + self.retained) as i64 - self.released as i64
    }
}

/// Accounting across all handle classes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandleCounts {
    /// Memory objects.
    pub buffers: ClassCounts,
    /// Events.
    pub events: ClassCounts,
    /// Programs.
    pub programs: ClassCounts,
    /// Kernels.
    pub kernels: ClassCounts,
}

impl HandleCounts {
    /// Whether every class has zero outstanding references.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.buffers.live() == 0
            && self.events.live() == 0
            && self.programs.live() == 0
            && self.kernels.live() == 0
    }
}

enum StoredArg {
    Mem(u64),
    Local(usize),
    Scalar(Vec<u8>),
}

enum ResolvedArg {
    Buffer(*mut u8, usize),
    Local(usize),
    Scalar(Vec<u8>),
}

/// Snapshot of one launch, handed to a registered host kernel.
pub struct LaunchContext {
    dims: NdRange,
    args: Vec<ResolvedArg>,
}

impl LaunchContext {
    /// The launch geometry.
    #[must_use]
    pub fn dims(&self) -> &NdRange {
        &self.dims
    }

    /// Number of bound arguments.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// First-dimension global size.
    #[must_use]
    pub fn global(&self) -> usize {
        self.dims.global[0]
    }

    /// Number of work-groups in the first dimension.
    #[must_use]
    pub fn num_groups(&self) -> usize {
        let local = self.dims.local.map_or(1, |l| l[0]).max(1);
        (self.dims.global[0] / local).max(1)
    }

    /// The buffer bound at `index`, read-only.
    ///
    /// Panics if the argument is not a buffer; host kernels are test
    /// fixtures and misbinding is a bug in the fixture.
    #[must_use]
    pub fn bytes(&self, index: usize) -> &[u8] {
        match &self.args[index] {
            // Safety: the pointer targets a live stub allocation; launches
            // are serialized, so no other writer is active.
            ResolvedArg::Buffer(ptr, len) => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            _ => panic!("kernel argument {index} is not a buffer"),
        }
    }

    /// The buffer bound at `index`, writable.
    ///
    /// Panics if the argument is not a buffer. Binding the same buffer at
    /// two indexes and writing through both is the fixture's bug.
    #[must_use]
    pub fn bytes_mut(&self, index: usize) -> &mut [u8] {
        match &self.args[index] {
            // Safety: same as `bytes`; exclusivity across indexes is the
            // fixture's contract.
            ResolvedArg::Buffer(ptr, len) => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
            _ => panic!("kernel argument {index} is not a buffer"),
        }
    }

    /// A `uint` immediate bound at `index`.
    #[must_use]
    pub fn scalar_u32(&self, index: usize) -> u32 {
        match &self.args[index] {
            ResolvedArg::Scalar(bytes) if bytes.len() == 4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                u32::from_le_bytes(raw)
            }
            _ => panic!("kernel argument {index} is not a uint"),
        }
    }

    /// The byte size of a local-memory slot bound at `index`.
    #[must_use]
    pub fn local_bytes(&self, index: usize) -> usize {
        match &self.args[index] {
            ResolvedArg::Local(size) => *size,
            _ => panic!("kernel argument {index} is not a local slot"),
        }
    }
}

struct BufferSlot {
    refs: u32,
    ptr: *mut u8,
    len: usize,
}

struct EventSlot {
    refs: u32,
    status: i32,
    span_ns: u64,
}

struct ProgramSlot {
    refs: u32,
    source: String,
    log: String,
    built: bool,
}

struct KernelSlot {
    refs: u32,
    /// Program source, snapshotted at kernel creation so marker-based
    /// handler dispatch works even after the program is released.
    source: String,
    name: String,
    args: Vec<Option<StoredArg>>,
}

struct HandlerEntry {
    /// Substring of the program source this handler is registered for;
    /// empty matches any source.
    marker: String,
    name: String,
    handler: HostKernelFn,
}

struct FailurePlan {
    operation: String,
    countdown: usize,
    code: i32,
}

struct StubState {
    next_id: u64,
    buffers: HashMap<u64, BufferSlot>,
    events: HashMap<u64, EventSlot>,
    programs: HashMap<u64, ProgramSlot>,
    kernels: HashMap<u64, KernelSlot>,
    counts: HandleCounts,
    builds: u64,
    failures: Vec<FailurePlan>,
    status_overrides: Vec<(String, i32)>,
}

impl StubState {
    fn injected(&mut self, operation: &str) -> Option<i32> {
        let idx = self
            .failures
            .iter()
            .position(|plan| plan.operation == operation)?;
        if self.failures[idx].countdown == 0 {
            let plan = self.failures.remove(idx);
            Some(plan.code)
        } else {
            self.failures[idx].countdown -= 1;
            None
        }
    }

    fn status_override(&mut self, operation: &str) -> Option<i32> {
        let idx = self
            .status_overrides
            .iter()
            .position(|(op, _)| op == operation)?;
        Some(self.status_overrides.remove(idx).1)
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn new_event(&mut self, status: i32, span_ns: u64) -> EventId {
        let id = self.fresh_id();
        self.events.insert(
            id,
            EventSlot {
                refs: 1,
                status,
                span_ns,
            },
        );
        self.counts.events.created += 1;
        EventId(id)
    }

    fn check_wait(&self, wait: &[EventId], operation: &'static str) -> Result<()> {
        for event in wait {
            if !event.is_null() && !self.events.contains_key(&event.0) {
                return Err(GravelError::device(CL_INVALID_EVENT, operation));
            }
        }
        Ok(())
    }
}

/// The instrumented in-process device.
pub struct StubDevice {
    probe: DeviceProbe,
    state: Mutex<StubState>,
    impls: Mutex<Vec<HandlerEntry>>,
}

// Safety: the raw buffer pointers inside the state table point at heap
// allocations owned by that table; access to the table is serialized by
// its mutex and launches snapshot pointers before running unlocked, with
// commands executing one at a time.
unsafe impl Send for StubDevice {}
unsafe impl Sync for StubDevice {}

impl StubDevice {
    /// A stub presenting as a discrete non-NVIDIA GPU, which exercises the
    /// staged upload path.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_probe(DeviceProbe {
            name: "stub discrete gpu".to_string(),
            vendor: "Acme Silicon".to_string(),
            unified_memory: false,
            cpu_class: false,
        })
    }

    /// A stub presenting the given capabilities.
    #[must_use]
    pub fn with_probe(probe: DeviceProbe) -> Arc<Self> {
        Arc::new(Self {
            probe,
            state: Mutex::new(StubState {
                next_id: 0,
                buffers: HashMap::new(),
                events: HashMap::new(),
                programs: HashMap::new(),
                kernels: HashMap::new(),
                counts: HandleCounts::default(),
                builds: 0,
                failures: Vec::new(),
                status_overrides: Vec::new(),
            }),
            impls: Mutex::new(Vec::new()),
        })
    }

    /// Register the host implementation launched for kernels named `name`,
    /// regardless of which program they come from.
    pub fn register_kernel(
        &self,
        name: &str,
        handler: impl Fn(&LaunchContext) + Send + Sync + 'static,
    ) {
        self.register_kernel_for("", name, handler);
    }

    /// Register a host implementation for kernels named `name` created
    /// from programs whose source contains `marker`. Marker matches win
    /// over markerless registrations, so several programs can share one
    /// entry name.
    pub fn register_kernel_for(
        &self,
        marker: &str,
        name: &str,
        handler: impl Fn(&LaunchContext) + Send + Sync + 'static,
    ) {
        self.impls.lock().push(HandlerEntry {
            marker: marker.to_string(),
            name: name.to_string(),
            handler: Arc::new(handler),
        });
    }

    fn resolve_handler(&self, name: &str, source: &str) -> Option<HostKernelFn> {
        let impls = self.impls.lock();
        impls
            .iter()
            .find(|entry| {
                entry.name == name && !entry.marker.is_empty() && source.contains(&entry.marker)
            })
            .or_else(|| {
                impls
                    .iter()
                    .find(|entry| entry.name == name && entry.marker.is_empty())
            })
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// Fail the call to `operation` after skipping `countdown` matching
    /// calls, with the given API code. One-shot.
    pub fn inject_failure(&self, operation: &str, countdown: usize, code: i32) {
        self.state.lock().failures.push(FailurePlan {
            operation: operation.to_string(),
            countdown,
            code,
        });
    }

    /// Make the next event produced by `operation` complete with `code`
    /// instead of success. One-shot.
    pub fn complete_with_status(&self, operation: &str, code: i32) {
        self.state
            .lock()
            .status_overrides
            .push((operation.to_string(), code));
    }

    /// Successful program builds so far.
    #[must_use]
    pub fn build_count(&self) -> u64 {
        self.state.lock().builds
    }

    /// Retain/release accounting snapshot.
    #[must_use]
    pub fn handle_counts(&self) -> HandleCounts {
        self.state.lock().counts
    }
}

impl DeviceApi for StubDevice {
    fn probe(&self) -> Result<DeviceProbe> {
        if let Some(code) = self.state.lock().injected("probe") {
            return Err(GravelError::device(code, "probe"));
        }
        Ok(self.probe.clone())
    }

    fn create_buffer(&self, _kind: BufferKind, size: usize) -> Result<MemId> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("create_buffer") {
            return Err(GravelError::device(code, "create_buffer"));
        }
        if size == 0 {
            return Err(GravelError::device(CL_INVALID_VALUE, "create_buffer"));
        }
        let ptr = Box::into_raw(vec![0u8; size].into_boxed_slice()) as *mut u8;
        let id = state.fresh_id();
        state.buffers.insert(id, BufferSlot { refs: 1, ptr, len: size });
        state.counts.buffers.created += 1;
        Ok(MemId(id))
    }

    fn retain_buffer(&self, mem: MemId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("retain_buffer") {
            return Err(GravelError::device(code, "retain_buffer"));
        }
        let slot = state
            .buffers
            .get_mut(&mem.0)
            .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "retain_buffer"))?;
        slot.refs += 1;
        state.counts.buffers.retained += 1;
        Ok(())
    }

    fn release_buffer(&self, mem: MemId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("release_buffer") {
            return Err(GravelError::device(code, "release_buffer"));
        }
        let slot = state
            .buffers
            .get_mut(&mem.0)
            .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "release_buffer"))?;
        slot.refs -= 1;
        if slot.refs == 0 {
            let slot = state
                .buffers
                .remove(&mem.0)
                .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "release_buffer"))?;
            // Safety: the pointer came from Box::into_raw with this length
            // and is dropped exactly once, here.
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    slot.ptr, slot.len,
                )));
            }
        }
        state.counts.buffers.released += 1;
        Ok(())
    }

    fn retain_event(&self, event: EventId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("retain_event") {
            return Err(GravelError::device(code, "retain_event"));
        }
        let slot = state
            .events
            .get_mut(&event.0)
            .ok_or(GravelError::device(CL_INVALID_EVENT, "retain_event"))?;
        slot.refs += 1;
        state.counts.events.retained += 1;
        Ok(())
    }

    fn release_event(&self, event: EventId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("release_event") {
            return Err(GravelError::device(code, "release_event"));
        }
        let slot = state
            .events
            .get_mut(&event.0)
            .ok_or(GravelError::device(CL_INVALID_EVENT, "release_event"))?;
        slot.refs -= 1;
        if slot.refs == 0 {
            state.events.remove(&event.0);
        }
        state.counts.events.released += 1;
        Ok(())
    }

    fn wait_event(&self, event: EventId) -> Result<()> {
        let state = self.state.lock();
        let slot = state
            .events
            .get(&event.0)
            .ok_or(GravelError::device(CL_INVALID_EVENT, "wait_event"))?;
        if slot.status < 0 {
            return Err(GravelError::device(slot.status, "wait_event"));
        }
        Ok(())
    }

    fn on_complete(&self, event: EventId, callback: CompletionCallback) -> Result<()> {
        let status = {
            let mut state = self.state.lock();
            if let Some(code) = state.injected("on_complete") {
                return Err(GravelError::device(code, "on_complete"));
            }
            state
                .events
                .get(&event.0)
                .ok_or(GravelError::device(CL_INVALID_EVENT, "on_complete"))?
                .status
        };
        // Every stub event is already terminal, so the callback fires
        // inline, off the state lock.
        callback(status);
        Ok(())
    }

    fn profiling_span_ns(&self, event: EventId) -> Result<u64> {
        let state = self.state.lock();
        let slot = state
            .events
            .get(&event.0)
            .ok_or(GravelError::device(CL_INVALID_EVENT, "profiling_span_ns"))?;
        Ok(slot.span_ns)
    }

    fn create_program(&self, source: &str) -> Result<ProgramId> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("create_program") {
            return Err(GravelError::device(code, "create_program"));
        }
        let id = state.fresh_id();
        state.programs.insert(
            id,
            ProgramSlot {
                refs: 1,
                source: source.to_string(),
                log: String::new(),
                built: false,
            },
        );
        state.counts.programs.created += 1;
        Ok(ProgramId(id))
    }

    fn build_program(&self, program: ProgramId, _options: &str) -> Result<()> {
        let mut state = self.state.lock();
        let failure = state.injected("build_program");
        let slot = state
            .programs
            .get_mut(&program.0)
            .ok_or(GravelError::device(CL_INVALID_PROGRAM, "build_program"))?;
        if let Some(code) = failure {
            slot.log = "injected build failure".to_string();
            return Err(GravelError::device(code, "build_program"));
        }
        slot.built = true;
        slot.log = String::new();
        state.builds += 1;
        Ok(())
    }

    fn build_log(&self, program: ProgramId) -> String {
        self.state
            .lock()
            .programs
            .get(&program.0)
            .map(|slot| slot.log.clone())
            .unwrap_or_default()
    }

    fn release_program(&self, program: ProgramId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("release_program") {
            return Err(GravelError::device(code, "release_program"));
        }
        let slot = state
            .programs
            .get_mut(&program.0)
            .ok_or(GravelError::device(CL_INVALID_PROGRAM, "release_program"))?;
        slot.refs -= 1;
        if slot.refs == 0 {
            state.programs.remove(&program.0);
        }
        state.counts.programs.released += 1;
        Ok(())
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("create_kernel") {
            return Err(GravelError::device(code, "create_kernel"));
        }
        let (built, source) = {
            let slot = state
                .programs
                .get(&program.0)
                .ok_or(GravelError::device(CL_INVALID_PROGRAM, "create_kernel"))?;
            (slot.built, slot.source.clone())
        };
        if !built {
            return Err(GravelError::device(
                CL_INVALID_PROGRAM_EXECUTABLE,
                "create_kernel",
            ));
        }
        let id = state.fresh_id();
        state.kernels.insert(
            id,
            KernelSlot {
                refs: 1,
                source,
                name: name.to_string(),
                args: Vec::new(),
            },
        );
        state.counts.kernels.created += 1;
        Ok(KernelId(id))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("set_kernel_arg") {
            return Err(GravelError::device(code, "set_kernel_arg"));
        }
        let slot = state
            .kernels
            .get_mut(&kernel.0)
            .ok_or(GravelError::device(CL_INVALID_KERNEL, "set_kernel_arg"))?;
        let index = index as usize;
        if slot.args.len() <= index {
            slot.args.resize_with(index + 1, || None);
        }
        slot.args[index] = Some(match arg {
            KernelArg::Mem(mem) => StoredArg::Mem(mem.0),
            KernelArg::Local(size) => StoredArg::Local(*size),
            KernelArg::Scalar(bytes) => StoredArg::Scalar(bytes.clone()),
        });
        Ok(())
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("release_kernel") {
            return Err(GravelError::device(code, "release_kernel"));
        }
        let slot = state
            .kernels
            .get_mut(&kernel.0)
            .ok_or(GravelError::device(CL_INVALID_KERNEL, "release_kernel"))?;
        slot.refs -= 1;
        if slot.refs == 0 {
            state.kernels.remove(&kernel.0);
        }
        state.counts.kernels.released += 1;
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: KernelId, dims: &NdRange, wait: &[EventId]) -> Result<EventId> {
        let (name, source, resolved, forced_status) = {
            let mut guard = self.state.lock();
            if let Some(code) = guard.injected("enqueue_kernel") {
                return Err(GravelError::device(code, "enqueue_kernel"));
            }
            let forced = guard.status_override("enqueue_kernel");
            let state = &*guard;
            state.check_wait(wait, "enqueue_kernel")?;
            let slot = state
                .kernels
                .get(&kernel.0)
                .ok_or(GravelError::device(CL_INVALID_KERNEL, "enqueue_kernel"))?;
            let mut resolved = Vec::with_capacity(slot.args.len());
            for arg in &slot.args {
                match arg {
                    Some(StoredArg::Mem(id)) => {
                        let buffer = state
                            .buffers
                            .get(id)
                            .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "enqueue_kernel"))?;
                        resolved.push(ResolvedArg::Buffer(buffer.ptr, buffer.len));
                    }
                    Some(StoredArg::Local(size)) => resolved.push(ResolvedArg::Local(*size)),
                    Some(StoredArg::Scalar(bytes)) => {
                        resolved.push(ResolvedArg::Scalar(bytes.clone()));
                    }
                    None => {
                        return Err(GravelError::device(CL_INVALID_KERNEL_ARGS, "enqueue_kernel"))
                    }
                }
            }
            (slot.name.clone(), slot.source.clone(), resolved, forced)
        };

        if forced_status.is_none() {
            let Some(handler) = self.resolve_handler(&name, &source) else {
                return Err(GravelError::device(CL_INVALID_KERNEL_NAME, "enqueue_kernel"));
            };
            let ctx = LaunchContext {
                dims: dims.clone(),
                args: resolved,
            };
            handler(&ctx);
        }

        let span = 1_000 + dims.global[0] as u64;
        let mut state = self.state.lock();
        Ok(state.new_event(forced_status.unwrap_or(0), span))
    }

    fn map_buffer(
        &self,
        mem: MemId,
        _mode: MapMode,
        offset: usize,
        len: usize,
        _blocking: bool,
        wait: &[EventId],
    ) -> Result<MappedRegion> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("map_buffer") {
            return Err(GravelError::device(code, "map_buffer"));
        }
        state.check_wait(wait, "map_buffer")?;
        let (ptr, buf_len) = {
            let slot = state
                .buffers
                .get(&mem.0)
                .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "map_buffer"))?;
            (slot.ptr, slot.len)
        };
        if offset + len > buf_len {
            return Err(GravelError::device(CL_INVALID_VALUE, "map_buffer"));
        }
        let event = state.new_event(0, 0);
        Ok(MappedRegion {
            // Safety: offset is in bounds of the slot allocation.
            ptr: unsafe { ptr.add(offset) },
            len,
            event,
        })
    }

    fn unmap_buffer(&self, mem: MemId, _ptr: *mut u8, wait: &[EventId]) -> Result<EventId> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("unmap_buffer") {
            return Err(GravelError::device(code, "unmap_buffer"));
        }
        state.check_wait(wait, "unmap_buffer")?;
        if !state.buffers.contains_key(&mem.0) {
            return Err(GravelError::device(CL_INVALID_MEM_OBJECT, "unmap_buffer"));
        }
        Ok(state.new_event(0, 0))
    }

    fn enqueue_copy(
        &self,
        src: MemId,
        dst: MemId,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        wait: &[EventId],
    ) -> Result<EventId> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("enqueue_copy") {
            return Err(GravelError::device(code, "enqueue_copy"));
        }
        state.check_wait(wait, "enqueue_copy")?;
        let (src_ptr, src_len) = {
            let slot = state
                .buffers
                .get(&src.0)
                .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "enqueue_copy"))?;
            (slot.ptr, slot.len)
        };
        let (dst_ptr, dst_len) = {
            let slot = state
                .buffers
                .get(&dst.0)
                .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "enqueue_copy"))?;
            (slot.ptr, slot.len)
        };
        if src_offset + len > src_len || dst_offset + len > dst_len {
            return Err(GravelError::device(CL_INVALID_VALUE, "enqueue_copy"));
        }
        // Safety: both ranges are in bounds of live allocations.
        unsafe {
            std::ptr::copy(src_ptr.add(src_offset), dst_ptr.add(dst_offset), len);
        }
        Ok(state.new_event(0, 0))
    }

    fn enqueue_read(
        &self,
        src: MemId,
        offset: usize,
        dst: Arc<HostBlock>,
        wait: &[EventId],
    ) -> Result<EventId> {
        let mut state = self.state.lock();
        if let Some(code) = state.injected("enqueue_read") {
            return Err(GravelError::device(code, "enqueue_read"));
        }
        let forced = state.status_override("enqueue_read");
        state.check_wait(wait, "enqueue_read")?;
        let (src_ptr, src_len) = {
            let slot = state
                .buffers
                .get(&src.0)
                .ok_or(GravelError::device(CL_INVALID_MEM_OBJECT, "enqueue_read"))?;
            (slot.ptr, slot.len)
        };
        let len = dst.len();
        if offset + len > src_len {
            return Err(GravelError::device(CL_INVALID_VALUE, "enqueue_read"));
        }
        if forced.is_none() {
            // Safety: source range is in bounds; the block pointer is the
            // block's own allocation.
            unsafe {
                std::ptr::copy_nonoverlapping(src_ptr.add(offset), dst.as_mut_ptr(), len);
            }
        }
        Ok(state.new_event(forced.unwrap_or(0), 0))
    }
}

impl Drop for StubDevice {
    fn drop(&mut self) {
        // Free whatever buffer storage leaked handles left behind so the
        // process stays clean even when a test asserts imbalance.
        let mut state = self.state.lock();
        for (_, slot) in state.buffers.drain() {
            // Safety: each pointer came from Box::into_raw with its length.
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    slot.ptr, slot.len,
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_lifecycle_is_counted() {
        let stub = StubDevice::new();
        let mem = stub.create_buffer(BufferKind::Device, 128).unwrap();
        stub.retain_buffer(mem).unwrap();
        stub.release_buffer(mem).unwrap();
        stub.release_buffer(mem).unwrap();

        let counts = stub.handle_counts();
        assert_eq!(counts.buffers.created, 1);
        assert_eq!(counts.buffers.retained, 1);
        assert_eq!(counts.buffers.released, 2);
        assert!(counts.is_balanced());
    }

    #[test]
    fn over_release_is_an_error() {
        let stub = StubDevice::new();
        let mem = stub.create_buffer(BufferKind::Device, 16).unwrap();
        stub.release_buffer(mem).unwrap();
        assert!(stub.release_buffer(mem).is_err());
    }

    #[test]
    fn injected_failures_fire_on_the_matching_call() {
        let stub = StubDevice::new();
        stub.inject_failure("create_buffer", 1, -4);

        // First call passes, second fails, third passes again.
        let a = stub.create_buffer(BufferKind::Device, 16).unwrap();
        let err = stub.create_buffer(BufferKind::Device, 16).unwrap_err();
        assert!(matches!(err, GravelError::Device { code: -4, .. }));
        let b = stub.create_buffer(BufferKind::Device, 16).unwrap();

        stub.release_buffer(a).unwrap();
        stub.release_buffer(b).unwrap();
        assert!(stub.handle_counts().is_balanced());
    }

    #[test]
    fn registered_kernels_run_against_bound_buffers() {
        let stub = StubDevice::new();
        stub.register_kernel("double", |ctx: &LaunchContext| {
            let n = ctx.global();
            let data = ctx.bytes_mut(0);
            for i in 0..n {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[i * 4..i * 4 + 4]);
                let doubled = u32::from_le_bytes(raw) * 2;
                data[i * 4..i * 4 + 4].copy_from_slice(&doubled.to_le_bytes());
            }
        });

        let mem = stub.create_buffer(BufferKind::Device, 16).unwrap();
        let region = stub
            .map_buffer(mem, MapMode::WriteInvalidate, 0, 16, true, &[])
            .unwrap();
        // Safety: blocking write map in a single-threaded test.
        let window = unsafe { std::slice::from_raw_parts_mut(region.ptr, region.len) };
        for (i, v) in [1u32, 2, 3, 4].iter().enumerate() {
            window[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        stub.release_event(region.event).unwrap();
        let unmap = stub.unmap_buffer(mem, region.ptr, &[]).unwrap();

        let program = stub.create_program("__kernel void double() {}").unwrap();
        stub.build_program(program, "").unwrap();
        let kernel = stub.create_kernel(program, "double").unwrap();
        stub.set_kernel_arg(kernel, 0, &KernelArg::Mem(mem)).unwrap();
        let done = stub
            .enqueue_kernel(kernel, &NdRange::linear(4), &[unmap])
            .unwrap();

        let read = HostBlock::zeroed(16);
        let finished = stub.enqueue_read(mem, 0, Arc::clone(&read), &[done]).unwrap();
        // Safety: the read has completed (eager execution).
        let out = unsafe { read.as_slice() };
        assert_eq!(&out[0..4], &2u32.to_le_bytes());
        assert_eq!(&out[12..16], &8u32.to_le_bytes());

        for event in [unmap, done, finished] {
            stub.release_event(event).unwrap();
        }
        stub.release_kernel(kernel).unwrap();
        stub.release_program(program).unwrap();
        stub.release_buffer(mem).unwrap();
        assert!(stub.handle_counts().is_balanced());
    }

    #[test]
    fn unregistered_kernel_names_fail_at_enqueue() {
        let stub = StubDevice::new();
        let program = stub.create_program("src").unwrap();
        stub.build_program(program, "").unwrap();
        let kernel = stub.create_kernel(program, "nope").unwrap();
        let err = stub
            .enqueue_kernel(kernel, &NdRange::linear(1), &[])
            .unwrap_err();
        assert!(matches!(err, GravelError::Device { code, .. } if code == CL_INVALID_KERNEL_NAME));
        stub.release_kernel(kernel).unwrap();
        stub.release_program(program).unwrap();
    }

    #[test]
    fn forced_statuses_reach_callbacks() {
        let stub = StubDevice::new();
        let mem = stub.create_buffer(BufferKind::Device, 4).unwrap();
        let block = HostBlock::zeroed(4);
        stub.complete_with_status("enqueue_read", -14);
        let event = stub.enqueue_read(mem, 0, block, &[]).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen_in = Arc::clone(&seen);
        stub.on_complete(event, Box::new(move |status| {
            *seen_in.lock() = Some(status);
        }))
        .unwrap();
        assert_eq!(*seen.lock(), Some(-14));

        stub.release_event(event).unwrap();
        stub.release_buffer(mem).unwrap();
    }
}
