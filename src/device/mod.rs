//! Device abstraction: one physical compute device, its command queue pair,
//! its compiled program, and the live buffers/kernels it tracks.

pub mod buffer;
pub mod event;
pub mod program;
pub mod queue;

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use opencl3::context::Context;
use opencl3::device::Device as ClDevice;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::types::cl_event;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::field::FieldType;
use crate::platform::{DeviceDescriptor, Vendor};

use buffer::{BufferKind, FieldBuffer};
use event::{CompletionEvent, EventWaitStrategy};
use program::ProgramCache;
use queue::CommandQueuePair;

// ============================================================================
// Arena
// ============================================================================

/// Growable slot collection with free-marking, used for the device's live
/// buffer/kernel registries. Releasing marks the slot vacant; reuse fills
/// vacant slots first.
pub(crate) struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(value);
                i
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Vacate a slot. Panics if the slot is already vacant: that indicates
    /// a double release, a bug in the engine rather than a runtime
    /// condition.
    pub fn remove(&mut self, id: usize) -> T {
        let value = self
            .slots
            .get_mut(id)
            .and_then(|s| s.take())
            .unwrap_or_else(|| panic!("engine invariant violated: arena slot {} is vacant", id));
        self.free.push(id);
        value
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

// ============================================================================
// Device
// ============================================================================

/// Context-scoped OpenCL state shared between the device and its buffers.
pub(crate) struct DeviceCore {
    pub(crate) context: Context,
    pub(crate) queues: CommandQueuePair,
}

// Safety: OpenCL 1.2 guarantees thread safety for contexts and queues; the
// handles are opaque and the runtime serializes access internally.
unsafe impl Send for DeviceCore {}
unsafe impl Sync for DeviceCore {}

/// Parameters the (out-of-scope) kernel code generator needs from a device.
#[derive(Debug, Clone, Copy)]
pub struct CodeGenParams {
    pub vendor: Vendor,
    pub warp_size: usize,
    pub local_mem_size: u64,
    pub max_constant_buffer_size: u64,
    pub max_mem_alloc_size: u64,
    pub max_work_group_size: usize,
}

/// Handle to a device kernel registered with [`Device::add_kernel_source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSlot(usize);

impl KernelSlot {
    #[cfg(test)]
    pub(crate) fn from_raw(i: usize) -> Self {
        KernelSlot(i)
    }
}

/// Handle to a CPU kernel registered with [`Device::add_cpu_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuKernelSlot(usize);

struct DeviceKernelEntry {
    canonical: String,
    instance: Option<Kernel>,
}

/// One physical compute device: context, command queue pair, program, and
/// registries of the live buffers and kernels it is responsible for.
pub struct Device {
    core: Arc<DeviceCore>,
    name: String,
    vendor: Vendor,
    vendor_string: String,
    is_gpu: bool,
    params: CodeGenParams,
    wait_strategy: EventWaitStrategy,
    program: ProgramCache,
    default_buffer_kind: BufferKind,
    buffers: Mutex<Arena<Arc<FieldBuffer>>>,
    device_kernels: Mutex<Arena<DeviceKernelEntry>>,
    cpu_kernels: Mutex<Arena<String>>,
}

// Safety: as for DeviceCore; kernel objects are only mutated under the
// arena mutexes and launches are driven by a single controlling thread.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    /// Open a discovered device: create its context and queue pair, probe
    /// its capabilities, and select the per-vendor event-wait strategy.
    pub fn open(descriptor: &DeviceDescriptor, config: &EngineConfig) -> Result<Arc<Self>> {
        let cl = ClDevice::new(descriptor.id);
        let context = Context::from_device(&cl).map_err(|e| EngineError::Device {
            routine: "create_context",
            detail: format!("{:?}", e),
        })?;
        let queues = CommandQueuePair::new(&context, config.profiling)?;

        let params = Self::probe_params(&cl, descriptor.vendor);
        let wait_strategy = EventWaitStrategy::for_vendor(descriptor.vendor);
        info!(
            "opened device '{}' ({}): warp={}, local_mem={}KB, wait={:?}",
            descriptor.name,
            descriptor.vendor_string,
            params.warp_size,
            params.local_mem_size / 1024,
            wait_strategy
        );

        Ok(Arc::new(Device {
            core: Arc::new(DeviceCore { context, queues }),
            name: descriptor.name.clone(),
            vendor: descriptor.vendor,
            vendor_string: descriptor.vendor_string.clone(),
            is_gpu: descriptor.is_gpu,
            params,
            wait_strategy,
            program: ProgramCache::new(),
            default_buffer_kind: config.default_buffer_kind,
            buffers: Mutex::new(Arena::default()),
            device_kernels: Mutex::new(Arena::default()),
            cpu_kernels: Mutex::new(Arena::default()),
        }))
    }

    fn probe_params(cl: &ClDevice, vendor: Vendor) -> CodeGenParams {
        let local_mem_size = cl.local_mem_size().unwrap_or_else(|_| {
            warn!("local_mem_size query failed; assuming 32KB");
            32 * 1024
        });
        let max_constant_buffer_size = cl.max_constant_buffer_size().unwrap_or_else(|_| {
            warn!("max_constant_buffer_size query failed; assuming 64KB");
            64 * 1024
        });
        let max_mem_alloc_size = cl.max_mem_alloc_size().unwrap_or_else(|_| {
            warn!("max_mem_alloc_size query failed; assuming 128MB");
            128 * 1024 * 1024
        });
        let max_work_group_size = cl.max_work_group_size().unwrap_or_else(|_| {
            warn!("max_work_group_size query failed; assuming 1");
            1
        });
        CodeGenParams {
            vendor,
            warp_size: vendor.warp_size(),
            local_mem_size,
            max_constant_buffer_size,
            max_mem_alloc_size,
            max_work_group_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_gpu(&self) -> bool {
        self.is_gpu
    }

    pub fn is_nvidia(&self) -> bool {
        self.vendor == Vendor::Nvidia
    }

    pub fn is_amd(&self) -> bool {
        self.vendor == Vendor::Amd
    }

    pub fn is_intel(&self) -> bool {
        self.vendor == Vendor::Intel
    }

    pub fn vendor_string(&self) -> &str {
        &self.vendor_string
    }

    /// Code-generation parameters probed at open time.
    pub fn codegen_params(&self) -> CodeGenParams {
        self.params
    }

    pub fn wait_strategy(&self) -> EventWaitStrategy {
        self.wait_strategy
    }

    // ------------------------------------------------------------------
    // Field buffers
    // ------------------------------------------------------------------

    /// Construct and register a field buffer sized for `field_type`.
    pub fn create_field_buffer(
        &self,
        field_type: FieldType,
        kind: BufferKind,
    ) -> Arc<FieldBuffer> {
        let buffer = Arc::new(FieldBuffer::new(Arc::clone(&self.core), field_type, kind));
        self.buffers.lock().unwrap().insert(Arc::clone(&buffer));
        buffer
    }

    /// Register a field buffer with the device's default kind.
    pub fn create_default_field_buffer(&self, field_type: FieldType) -> Arc<FieldBuffer> {
        self.create_field_buffer(field_type, self.default_buffer_kind)
    }

    /// Release one tracked buffer. Panics if the buffer is not registered
    /// to this device: that is an engine bug, not a runtime condition.
    pub fn release_field_buffer(&self, buffer: &Arc<FieldBuffer>) {
        let mut buffers = self.buffers.lock().unwrap();
        let id = buffers
            .slots
            .iter()
            .position(|s| matches!(s, Some(b) if Arc::ptr_eq(b, buffer)))
            .unwrap_or_else(|| {
                panic!("engine invariant violated: buffer not registered to this device")
            });
        buffers.remove(id);
    }

    /// Number of live field buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Kernels
    // ------------------------------------------------------------------

    /// Append a device kernel's source to the program (invalidating any
    /// previous build) and track the kernel.
    pub fn add_kernel_source(&self, source: &str) -> Result<KernelSlot> {
        let canonical = self.program.add_kernel_source(source)?;
        let id = self.device_kernels.lock().unwrap().insert(DeviceKernelEntry {
            canonical,
            instance: None,
        });
        Ok(KernelSlot(id))
    }

    /// Track a host-executed kernel that manipulates device buffers.
    pub fn add_cpu_kernel(&self, label: &str) -> CpuKernelSlot {
        CpuKernelSlot(self.cpu_kernels.lock().unwrap().insert(label.to_string()))
    }

    /// Build the program if dirty. Called once after circuit registration;
    /// a build failure is fatal.
    pub fn build_program(&self) -> Result<()> {
        self.program.program(&self.core.context).map(|_| ())
    }

    /// The canonical entry name a kernel slot resolved to.
    pub fn kernel_entry_name(&self, slot: KernelSlot) -> String {
        self.device_kernels
            .lock()
            .unwrap()
            .get(slot.0)
            .map(|e| e.canonical.clone())
            .unwrap_or_else(|| panic!("engine invariant violated: unknown kernel slot"))
    }

    /// Bind the compiled entry point for a registered kernel. Fatal if the
    /// entry point is missing from the built program (source/name
    /// mismatch).
    pub fn instantiate_kernel(&self, slot: KernelSlot) -> Result<()> {
        let canonical = self.kernel_entry_name(slot);
        let kernel = self.program.create_kernel(&self.core.context, &canonical)?;
        debug!("instantiated kernel '{}'", canonical);
        let mut kernels = self.device_kernels.lock().unwrap();
        let entry = kernels
            .get_mut(slot.0)
            .unwrap_or_else(|| panic!("engine invariant violated: unknown kernel slot"));
        entry.instance = Some(kernel);
        Ok(())
    }

    /// Drop a kernel's compiled binding so it can later be re-instantiated
    /// (e.g. after migration to another device).
    pub fn deinstantiate_kernel(&self, slot: KernelSlot) {
        let mut kernels = self.device_kernels.lock().unwrap();
        let entry = kernels
            .get_mut(slot.0)
            .unwrap_or_else(|| panic!("engine invariant violated: unknown kernel slot"));
        entry.instance = None;
    }

    /// Launch an instantiated kernel with positional buffer arguments
    /// (inputs, then outputs), an explicit wait condition, and a flat or
    /// multi-dimensional work shape. Returns the launch's completion event.
    pub fn enqueue_kernel(
        &self,
        slot: KernelSlot,
        args: &[Arc<FieldBuffer>],
        global: &[usize],
        local: Option<&[usize]>,
        wait: &[cl_event],
    ) -> Result<CompletionEvent> {
        // Lock every distinct argument buffer's device allocation once;
        // a kernel may take the same register for several arguments.
        let mut locked: Vec<(usize, buffer::DeviceMemGuard<'_>)> = Vec::with_capacity(args.len());
        for arg in args {
            let key = Arc::as_ptr(arg) as usize;
            if !locked.iter().any(|(k, _)| *k == key) {
                locked.push((key, arg.device_handle()?));
            }
        }
        let arg_buffers: Vec<_> = args
            .iter()
            .map(|arg| {
                let key = Arc::as_ptr(arg) as usize;
                locked.iter().find(|(k, _)| *k == key).unwrap().1.cl_buffer()
            })
            .collect();

        let kernels = self.device_kernels.lock().unwrap();
        let entry = kernels
            .get(slot.0)
            .unwrap_or_else(|| panic!("engine invariant violated: unknown kernel slot"));
        let kernel = entry.instance.as_ref().ok_or_else(|| EngineError::Device {
            routine: "enqueue_kernel",
            detail: format!("kernel '{}' launched before instantiation", entry.canonical),
        })?;

        let event = unsafe {
            let mut exec = ExecuteKernel::new(kernel);
            for buf in &arg_buffers {
                exec.set_arg(*buf);
            }
            exec.set_global_work_sizes(global);
            if let Some(local) = local {
                exec.set_local_work_sizes(local);
            }
            if !wait.is_empty() {
                exec.set_event_wait_list(wait);
            }
            exec.enqueue_nd_range(self.core.queues.kernel_queue())
                .map_err(|e| EngineError::Device {
                    routine: "enqueue_nd_range",
                    detail: format!("kernel '{}': {:?}", entry.canonical, e),
                })?
        };
        Ok(CompletionEvent::new(event))
    }

    /// Number of live device kernels.
    pub fn device_kernel_count(&self) -> usize {
        self.device_kernels.lock().unwrap().len()
    }

    /// Number of live CPU kernels.
    pub fn cpu_kernel_count(&self) -> usize {
        self.cpu_kernels.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Release all circuit-owned resources in deterministic order (field
    /// buffers, device kernels, CPU kernels, the compiled program), leaving
    /// the device able to accept a new circuit.
    pub fn release_for_reuse(&self) {
        let buffers = {
            let mut arena = self.buffers.lock().unwrap();
            let n = arena.len();
            arena.clear();
            n
        };
        let kernels = {
            let mut arena = self.device_kernels.lock().unwrap();
            let n = arena.len();
            arena.clear();
            n
        };
        let cpu = {
            let mut arena = self.cpu_kernels.lock().unwrap();
            let n = arena.len();
            arena.clear();
            n
        };
        self.program.clear();
        debug!(
            "released {} buffer(s), {} device kernel(s), {} cpu kernel(s) for reuse",
            buffers, kernels, cpu
        );
    }

    /// Full teardown: release everything and drain the queues. Dropping
    /// the final handle then releases the queue pair and context, after
    /// which the device cannot be used.
    pub fn release(self: Arc<Self>) {
        self.release_for_reuse();
        if let Err(e) = self.core.queues.finish() {
            warn!("queue drain during release failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_insert_get_remove() {
        let mut arena: Arena<&str> = Arena::default();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), "a");
        assert_eq!(arena.len(), 1);
        assert!(arena.get(a).is_none());
        // Freed slot is reused.
        let c = arena.insert("c");
        assert_eq!(c, a);
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    #[should_panic(expected = "engine invariant violated")]
    fn test_arena_double_release_panics() {
        let mut arena: Arena<u32> = Arena::default();
        let id = arena.insert(7);
        arena.remove(id);
        arena.remove(id);
    }

    #[test]
    fn test_arena_iter_skips_vacant() {
        let mut arena: Arena<u32> = Arena::default();
        let a = arena.insert(1);
        arena.insert(2);
        arena.remove(a);
        let live: Vec<u32> = arena.iter().copied().collect();
        assert_eq!(live, vec![2]);
    }
}
