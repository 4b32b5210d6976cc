//! OpenCL realization of the engine's device-API trait.
//!
//! Wraps one `(context, queue, device)` triple and maps every trait
//! method onto the corresponding `cl*` call through the function-level
//! `cl3` bindings, keeping the engine's retain/release discipline exactly
//! one-to-one with the OpenCL reference counts. The queue must be created
//! with profiling enabled; the dispatcher reads `end − queued` spans off
//! kernel events.

use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::Arc;

use cl3::command_queue;
use cl3::context;
use cl3::device::{
    get_device_info, CL_DEVICE_HOST_UNIFIED_MEMORY, CL_DEVICE_NAME, CL_DEVICE_TYPE,
    CL_DEVICE_TYPE_CPU, CL_DEVICE_VENDOR,
};
use cl3::event::{
    self, CL_COMPLETE, CL_PROFILING_COMMAND_END, CL_PROFILING_COMMAND_QUEUED,
};
use cl3::kernel;
use cl3::memory::{
    self, CL_MAP_READ, CL_MAP_WRITE_INVALIDATE_REGION, CL_MEM_ALLOC_HOST_PTR, CL_MEM_READ_ONLY,
    CL_MEM_READ_WRITE,
};
use cl3::program::{self, CL_PROGRAM_BUILD_LOG};
use cl3::types::{
    cl_command_queue, cl_context, cl_device_id, cl_event, cl_int, cl_kernel, cl_mem, cl_program,
    cl_uint, CL_BLOCKING, CL_NON_BLOCKING,
};

use gravel_core::api::{
    BufferKind, CompletionCallback, DeviceApi, DeviceProbe, EventId, HostBlock, KernelArg,
    KernelId, MapMode, MappedRegion, MemId, NdRange, ProgramId,
};
use gravel_core::error::{GravelError, Result};

fn mem_of(id: MemId) -> cl_mem {
    id.0 as usize as cl_mem
}

fn event_of(id: EventId) -> cl_event {
    id.0 as usize as cl_event
}

fn program_of(id: ProgramId) -> cl_program {
    id.0 as usize as cl_program
}

fn kernel_of(id: KernelId) -> cl_kernel {
    id.0 as usize as cl_kernel
}

fn wait_list(wait: &[EventId]) -> Vec<cl_event> {
    wait.iter()
        .filter(|event| !event.is_null())
        .map(|event| event_of(*event))
        .collect()
}

fn wait_ptr(list: &[cl_event]) -> (cl_uint, *const cl_event) {
    if list.is_empty() {
        (0, ptr::null())
    } else {
        (list.len() as cl_uint, list.as_ptr())
    }
}

/// Trampoline bridging `clSetEventCallback` to a boxed Rust closure.
extern "C" fn event_callback_trampoline(_event: cl_event, status: cl_int, user_data: *mut c_void) {
    // Safety: user_data came from Box::into_raw in `on_complete` and is
    // consumed exactly once, here.
    let callback = unsafe { Box::from_raw(user_data as *mut CompletionCallback) };
    let code = if status == CL_COMPLETE { 0 } else { status };
    callback(code);
}

/// Live OpenCL binding: one context, one in-order profiling queue, one
/// device.
pub struct OpenClApi {
    context: cl_context,
    queue: cl_command_queue,
    device: cl_device_id,
}

// Safety: OpenCL 1.2+ guarantees thread safety for context, queue, and
// object APIs; the raw handles are opaque pointers into the runtime,
// which serializes access internally.
unsafe impl Send for OpenClApi {}
unsafe impl Sync for OpenClApi {}

impl OpenClApi {
    /// Wrap existing API objects, taking over one reference to the
    /// context and one to the queue; both are released on drop, queue
    /// first.
    ///
    /// # Safety
    ///
    /// The handles must be valid, `queue` must live on `device` inside
    /// `context`, and the queue must have been created with profiling
    /// enabled.
    #[must_use]
    pub unsafe fn from_raw(
        context: cl_context,
        queue: cl_command_queue,
        device: cl_device_id,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            queue,
            device,
        })
    }

    /// The bound device id.
    #[must_use]
    pub fn device_id(&self) -> cl_device_id {
        self.device
    }
}

impl Drop for OpenClApi {
    fn drop(&mut self) {
        // Queue before context: outstanding commands drain with the queue
        // release; the context goes last.
        unsafe {
            if let Err(code) = command_queue::release_command_queue(self.queue) {
                tracing::warn!(code, "failed to release command queue");
            }
            if let Err(code) = context::release_context(self.context) {
                tracing::warn!(code, "failed to release context");
            }
        }
    }
}

impl DeviceApi for OpenClApi {
    fn probe(&self) -> Result<DeviceProbe> {
        // Safety: the device id is valid for the lifetime of this binding.
        let (name, vendor, unified_memory, cpu_class) = unsafe {
            let name = get_device_info(self.device, CL_DEVICE_NAME)
                .map_err(|code| GravelError::device(code, "probe"))?
                .to_string();
            let vendor = get_device_info(self.device, CL_DEVICE_VENDOR)
                .map_err(|code| GravelError::device(code, "probe"))?
                .to_string();
            let unified_memory = get_device_info(self.device, CL_DEVICE_HOST_UNIFIED_MEMORY)
                .map(|info| info.to_uint() != 0)
                .unwrap_or(false);
            let cpu_class = get_device_info(self.device, CL_DEVICE_TYPE)
                .map(|info| info.to_ulong() & CL_DEVICE_TYPE_CPU != 0)
                .unwrap_or(false);
            (name, vendor, unified_memory, cpu_class)
        };
        Ok(DeviceProbe {
            name: name.trim().to_string(),
            vendor: vendor.trim().to_string(),
            unified_memory,
            cpu_class,
        })
    }

    fn create_buffer(&self, kind: BufferKind, size: usize) -> Result<MemId> {
        let flags = match kind {
            BufferKind::Device => CL_MEM_READ_WRITE,
            BufferKind::DeviceReadOnly => CL_MEM_READ_ONLY,
            BufferKind::HostVisible => CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR,
        };
        // Safety: null host pointer with ALLOC flags is the API's own
        // allocation path.
        let raw = unsafe {
            memory::create_buffer(self.context, flags, size, ptr::null_mut())
                .map_err(|code| GravelError::device(code, "create_buffer"))?
        };
        Ok(MemId(raw as usize as u64))
    }

    fn retain_buffer(&self, mem: MemId) -> Result<()> {
        unsafe {
            memory::retain_mem_object(mem_of(mem))
                .map_err(|code| GravelError::device(code, "retain_buffer"))
        }
    }

    fn release_buffer(&self, mem: MemId) -> Result<()> {
        unsafe {
            memory::release_mem_object(mem_of(mem))
                .map_err(|code| GravelError::device(code, "release_buffer"))
        }
    }

    fn retain_event(&self, event: EventId) -> Result<()> {
        unsafe {
            event::retain_event(event_of(event))
                .map_err(|code| GravelError::device(code, "retain_event"))
        }
    }

    fn release_event(&self, event: EventId) -> Result<()> {
        unsafe {
            event::release_event(event_of(event))
                .map_err(|code| GravelError::device(code, "release_event"))
        }
    }

    fn wait_event(&self, event: EventId) -> Result<()> {
        let events = [event_of(event)];
        // Safety: the caller owns a reference to the event.
        unsafe {
            event::wait_for_events(&events).map_err(|code| GravelError::device(code, "wait_event"))
        }
    }

    fn on_complete(&self, event: EventId, callback: CompletionCallback) -> Result<()> {
        let boxed = Box::new(callback);
        let user_data = Box::into_raw(boxed) as *mut c_void;
        // Safety: the trampoline reboxes user_data exactly once when the
        // runtime invokes it.
        let result = unsafe {
            event::set_event_callback(
                event_of(event),
                CL_COMPLETE,
                event_callback_trampoline,
                user_data,
            )
        };
        if let Err(code) = result {
            // Registration failed; reclaim the closure so it is dropped
            // rather than leaked.
            // Safety: the runtime never saw user_data.
            drop(unsafe { Box::from_raw(user_data as *mut CompletionCallback) });
            return Err(GravelError::device(code, "on_complete"));
        }
        Ok(())
    }

    fn profiling_span_ns(&self, event: EventId) -> Result<u64> {
        // Safety: only queried from completion callbacks, after the event
        // reached a terminal status.
        unsafe {
            let queued =
                event::get_event_profiling_info(event_of(event), CL_PROFILING_COMMAND_QUEUED)
                    .map_err(|code| GravelError::device(code, "profiling_span_ns"))?
                    .to_ulong();
            let end = event::get_event_profiling_info(event_of(event), CL_PROFILING_COMMAND_END)
                .map_err(|code| GravelError::device(code, "profiling_span_ns"))?
                .to_ulong();
            Ok(end.saturating_sub(queued))
        }
    }

    fn create_program(&self, source: &str) -> Result<ProgramId> {
        // Safety: the context is live for the lifetime of this binding.
        let raw = unsafe {
            program::create_program_with_source(self.context, &[source])
                .map_err(|code| GravelError::device(code, "create_program"))?
        };
        Ok(ProgramId(raw as usize as u64))
    }

    fn build_program(&self, program_id: ProgramId, options: &str) -> Result<()> {
        let options = CString::new(options)
            .map_err(|_| GravelError::precondition("build options contain a NUL byte"))?;
        let devices = [self.device];
        // Safety: program and device handles are live; no notify callback.
        unsafe {
            program::build_program(
                program_of(program_id),
                &devices,
                &options,
                None,
                ptr::null_mut(),
            )
            .map_err(|code| GravelError::device(code, "build_program"))
        }
    }

    fn build_log(&self, program_id: ProgramId) -> String {
        // Safety: the program handle is live (the cache holds it).
        unsafe {
            program::get_program_build_info(
                program_of(program_id),
                self.device,
                CL_PROGRAM_BUILD_LOG,
            )
            .map(|info| info.to_string())
            .unwrap_or_default()
        }
    }

    fn release_program(&self, program_id: ProgramId) -> Result<()> {
        unsafe {
            program::release_program(program_of(program_id))
                .map_err(|code| GravelError::device(code, "release_program"))
        }
    }

    fn create_kernel(&self, program_id: ProgramId, name: &str) -> Result<KernelId> {
        let name = CString::new(name)
            .map_err(|_| GravelError::precondition("kernel name contains a NUL byte"))?;
        // Safety: the program handle is live and built.
        let raw = unsafe {
            kernel::create_kernel(program_of(program_id), &name)
                .map_err(|code| GravelError::device(code, "create_kernel"))?
        };
        Ok(KernelId(raw as usize as u64))
    }

    fn set_kernel_arg(&self, kernel_id: KernelId, index: u32, arg: &KernelArg) -> Result<()> {
        // A null value pointer with a nonzero size is the local-memory
        // form; a buffer passes the handle by pointer-to-handle.
        let result = match arg {
            KernelArg::Mem(mem) => {
                let handle = mem_of(*mem);
                // Safety: the handle outlives the call; OpenCL copies it.
                unsafe {
                    kernel::set_kernel_arg(
                        kernel_of(kernel_id),
                        index,
                        std::mem::size_of::<cl_mem>(),
                        &handle as *const cl_mem as *const c_void,
                    )
                }
            }
            KernelArg::Local(size) => unsafe {
                kernel::set_kernel_arg(kernel_of(kernel_id), index, *size, ptr::null())
            },
            KernelArg::Scalar(bytes) => unsafe {
                kernel::set_kernel_arg(
                    kernel_of(kernel_id),
                    index,
                    bytes.len(),
                    bytes.as_ptr() as *const c_void,
                )
            },
        };
        result.map_err(|code| GravelError::device(code, "set_kernel_arg"))
    }

    fn release_kernel(&self, kernel_id: KernelId) -> Result<()> {
        unsafe {
            kernel::release_kernel(kernel_of(kernel_id))
                .map_err(|code| GravelError::device(code, "release_kernel"))
        }
    }

    fn enqueue_kernel(&self, kernel_id: KernelId, dims: &NdRange, wait: &[EventId]) -> Result<EventId> {
        let list = wait_list(wait);
        let (num_wait, wait_ptr) = wait_ptr(&list);
        let local_ptr = dims
            .local
            .as_ref()
            .map_or(ptr::null(), |local| local.as_ptr());
        // Safety: the size arrays outlive the call and wait handles are
        // live (the engine still owns references to them).
        let raw = unsafe {
            command_queue::enqueue_nd_range_kernel(
                self.queue,
                kernel_of(kernel_id),
                dims.work_dim,
                dims.global_offset.as_ptr(),
                dims.global.as_ptr(),
                local_ptr,
                num_wait,
                wait_ptr,
            )
            .map_err(|code| GravelError::device(code, "enqueue_kernel"))?
        };
        Ok(EventId(raw as usize as u64))
    }

    fn map_buffer(
        &self,
        mem: MemId,
        mode: MapMode,
        offset: usize,
        len: usize,
        blocking: bool,
        wait: &[EventId],
    ) -> Result<MappedRegion> {
        let flags = match mode {
            MapMode::Read => CL_MAP_READ,
            MapMode::WriteInvalidate => CL_MAP_WRITE_INVALIDATE_REGION,
        };
        let list = wait_list(wait);
        let (num_wait, wait_ptr) = wait_ptr(&list);
        let blocking = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        let mut ptr: cl_mem = ptr::null_mut();
        // Safety: the out-pointer is local; wait handles are live.
        let event = unsafe {
            command_queue::enqueue_map_buffer(
                self.queue,
                mem_of(mem),
                blocking,
                flags,
                offset,
                len,
                &mut ptr,
                num_wait,
                wait_ptr,
            )
            .map_err(|code| GravelError::device(code, "map_buffer"))?
        };
        Ok(MappedRegion {
            ptr: ptr as *mut u8,
            len,
            event: EventId(event as usize as u64),
        })
    }

    fn unmap_buffer(&self, mem: MemId, ptr_arg: *mut u8, wait: &[EventId]) -> Result<EventId> {
        let list = wait_list(wait);
        let (num_wait, wait_ptr) = wait_ptr(&list);
        // Safety: the pointer came from a map on this buffer.
        let raw = unsafe {
            command_queue::enqueue_unmap_mem_object(
                self.queue,
                mem_of(mem),
                ptr_arg as *mut c_void,
                num_wait,
                wait_ptr,
            )
            .map_err(|code| GravelError::device(code, "unmap_buffer"))?
        };
        Ok(EventId(raw as usize as u64))
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
        let list = wait_list(wait);
        let (num_wait, wait_ptr) = wait_ptr(&list);
        // Safety: both handles are live; offsets were bounds-checked by
        // the allocating side.
        let raw = unsafe {
            command_queue::enqueue_copy_buffer(
                self.queue,
                mem_of(src),
                mem_of(dst),
                src_offset,
                dst_offset,
                len,
                num_wait,
                wait_ptr,
            )
            .map_err(|code| GravelError::device(code, "enqueue_copy"))?
        };
        Ok(EventId(raw as usize as u64))
    }

    fn enqueue_read(
        &self,
        src: MemId,
        offset: usize,
        dst: Arc<HostBlock>,
        wait: &[EventId],
    ) -> Result<EventId> {
        let list = wait_list(wait);
        let (num_wait, wait_ptr) = wait_ptr(&list);
        let len = dst.len();
        // Safety: the engine keeps the block alive in the completion
        // callback it registers on the returned event, so the destination
        // outlives the transfer.
        let raw = unsafe {
            command_queue::enqueue_read_buffer(
                self.queue,
                mem_of(src),
                CL_NON_BLOCKING,
                offset,
                len,
                dst.as_mut_ptr() as *mut c_void,
                num_wait,
                wait_ptr,
            )
            .map_err(|code| GravelError::device(code, "enqueue_read"))?
        };
        Ok(EventId(raw as usize as u64))
    }
}
