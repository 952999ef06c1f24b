//! Field buffers: per-field CPU/GPU memory with lazy cache coherence.
//!
//! A `FieldBuffer` pairs an optional CPU-resident block with a device memory
//! allocation, both lazily created, plus a "CPU copy is valid" flag that
//! implements a single-writer coherence protocol between the two copies:
//! kernels writing the device copy invalidate the flag, `read()` refreshes
//! the CPU copy exactly once while the flag is down, and `write()` raises
//! the flag and pushes the CPU copy down to the device.

use std::ffi::c_void;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};
use opencl3::memory::{
    Buffer as ClBuffer, ClMem, CL_MAP_READ, CL_MAP_WRITE, CL_MEM_ALLOC_HOST_PTR,
    CL_MEM_READ_WRITE, CL_MEM_USE_HOST_PTR,
};
use opencl3::types::CL_BLOCKING;

use crate::error::{EngineError, Result};
use crate::field::FieldType;

use super::event::CompletionEvent;
use super::DeviceCore;

/// Requested CPU-side allocation strategy for a field buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Page-locked host memory: fastest transfers. Falls back to `Direct`
    /// if the allocation fails (a warning is logged).
    PinnedDirect,
    /// Pageable native memory; the device allocation is bound over the
    /// block's backing storage for direct transfer.
    Direct,
    /// Ordinary heap memory; transfers go through the runtime's internal
    /// staging path.
    Indirect,
}

/// Page-locked host block: a device-allocated staging object kept
/// persistently mapped into the host address space.
struct PinnedBlock {
    core: Arc<DeviceCore>,
    staging: ClBuffer<u8>,
    ptr: *mut u8,
    len: usize,
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        let result = unsafe {
            self.core.queues.transfer_queue().enqueue_unmap_mem_object(
                self.staging.get(),
                self.ptr as *mut c_void,
                &[],
            )
        };
        match result {
            Ok(event) => {
                let _ = event.wait();
            }
            Err(e) => warn!("unmap of pinned block failed: {:?}", e),
        }
    }
}

/// The CPU-resident block backing a field buffer.
enum HostBlock {
    /// f32-word storage so typed views of the bytes stay aligned.
    Pageable { words: Box<[f32]>, bound: bool },
    Pinned(PinnedBlock),
}

impl HostBlock {
    fn pageable(byte_len: usize) -> Self {
        HostBlock::Pageable {
            words: vec![0f32; byte_len.div_ceil(4)].into_boxed_slice(),
            bound: false,
        }
    }

    fn bytes(&self, byte_len: usize) -> &[u8] {
        match self {
            HostBlock::Pageable { words, .. } => &bytemuck::cast_slice(words.as_ref())[..byte_len],
            // Safety: the mapping is valid for `len` bytes until the block
            // is dropped, and all access is serialized by the host mutex.
            HostBlock::Pinned(p) => unsafe { std::slice::from_raw_parts(p.ptr, p.len) },
        }
    }

    fn bytes_mut(&mut self, byte_len: usize) -> &mut [u8] {
        match self {
            HostBlock::Pageable { words, .. } => {
                &mut bytemuck::cast_slice_mut(words.as_mut())[..byte_len]
            }
            // Safety: as in `bytes`.
            HostBlock::Pinned(p) => unsafe { std::slice::from_raw_parts_mut(p.ptr, p.len) },
        }
    }

    fn is_pinned(&self) -> bool {
        matches!(self, HostBlock::Pinned(_))
    }
}

/// Explicit lazy-allocation states (no nullable double-checked locking).
enum HostMemory {
    Unallocated,
    Allocated(HostBlock),
}

impl HostMemory {
    fn block(&self) -> &HostBlock {
        match self {
            HostMemory::Allocated(b) => b,
            HostMemory::Unallocated => {
                panic!("engine invariant violated: host block accessed before allocation")
            }
        }
    }

    fn block_mut(&mut self) -> &mut HostBlock {
        match self {
            HostMemory::Allocated(b) => b,
            HostMemory::Unallocated => {
                panic!("engine invariant violated: host block accessed before allocation")
            }
        }
    }
}

enum DeviceMemory {
    Unallocated,
    Allocated(ClBuffer<u8>),
}

/// Per-field memory object: optional CPU block, device allocation, validity
/// flag, and transfer accounting.
///
/// The validity flag, the host block, and the device allocation live behind
/// three separate mutexes so unrelated concerns are never serialized
/// together. Lock order is always validity -> host -> device.
pub struct FieldBuffer {
    field_type: FieldType,
    kind: BufferKind,
    byte_len: usize,
    core: Arc<DeviceCore>,
    // Declared before the host block so the device object (which may be
    // bound over the block's storage) is released first.
    device_mem: Mutex<DeviceMemory>,
    host_mem: Mutex<HostMemory>,
    host_valid: Mutex<bool>,
    to_device: AtomicU64,
    from_device: AtomicU64,
}

// Safety: OpenCL 1.2 guarantees thread safety for memory objects and
// queues; the host block and raw mapping pointer are only touched under
// the buffer's mutexes.
unsafe impl Send for FieldBuffer {}
unsafe impl Sync for FieldBuffer {}

impl FieldBuffer {
    pub(crate) fn new(core: Arc<DeviceCore>, field_type: FieldType, kind: BufferKind) -> Self {
        let byte_len = field_type.byte_size();
        FieldBuffer {
            field_type,
            kind,
            byte_len,
            core,
            device_mem: Mutex::new(DeviceMemory::Unallocated),
            host_mem: Mutex::new(HostMemory::Unallocated),
            host_valid: Mutex::new(false),
            to_device: AtomicU64::new(0),
            from_device: AtomicU64::new(0),
        }
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    /// The requested buffer kind (the actual block may have been downgraded
    /// from pinned to pageable).
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Fixed capacity in bytes, set at creation from the field type.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// (host->device, device->host) transfer counts.
    pub fn transfer_counts(&self) -> (u64, u64) {
        (
            self.to_device.load(Ordering::Relaxed),
            self.from_device.load(Ordering::Relaxed),
        )
    }

    /// Whether the CPU copy is currently valid.
    pub fn host_is_valid(&self) -> bool {
        *self.host_valid.lock().unwrap()
    }

    /// Whether the device allocation is bound over the CPU block.
    pub fn device_bound(&self) -> bool {
        match &*self.host_mem.lock().unwrap() {
            HostMemory::Allocated(HostBlock::Pageable { bound, .. }) => *bound,
            _ => false,
        }
    }

    /// The CPU-resident block, lazily allocated, for the caller to populate.
    /// Populating it does not raise the validity flag; call [`write`] to
    /// publish the contents to the device.
    pub fn cpu_memory(&self) -> Result<CpuMemoryGuard<'_>> {
        let mut host = self.host_mem.lock().unwrap();
        self.ensure_host(&mut host)?;
        Ok(CpuMemoryGuard {
            host,
            byte_len: self.byte_len,
        })
    }

    /// The CPU copy of the field, refreshed from the device if stale.
    ///
    /// Synchronized on the validity flag: concurrent readers of an invalid
    /// buffer trigger exactly one device->host transfer between them.
    pub fn read(&self) -> Result<CpuReadGuard<'_>> {
        let mut valid = self.host_valid.lock().unwrap();
        let mut host = self.host_mem.lock().unwrap();
        let synced = self.ensure_host(&mut host)?;
        if synced {
            *valid = true;
        }
        if !*valid {
            let dev = self.device_mem.lock().unwrap();
            if let DeviceMemory::Allocated(cl_buf) = &*dev {
                self.transfer_from_device(cl_buf, host.block_mut())?;
                self.from_device.fetch_add(1, Ordering::Relaxed);
            }
            // No device allocation means nothing has ever been computed
            // into this field; the zeroed block is the current value.
            *valid = true;
        }
        drop(valid);
        Ok(CpuReadGuard {
            host,
            byte_len: self.byte_len,
        })
    }

    /// Publish the CPU copy to the device: unconditionally raises the
    /// validity flag (the caller has already populated the block) and
    /// performs the host->device copy. Returns the transfer's completion
    /// event so downstream launches can be gated on it.
    pub fn write(&self) -> Result<CompletionEvent> {
        let mut valid = self.host_valid.lock().unwrap();
        let mut host = self.host_mem.lock().unwrap();
        self.ensure_host(&mut host)?;
        *valid = true;
        let mut dev = self.device_mem.lock().unwrap();
        self.ensure_device(&mut host, &mut dev)?;
        let DeviceMemory::Allocated(cl_buf) = &mut *dev else {
            unreachable!("ensure_device always allocates");
        };
        let event = self.transfer_to_device(host.block(), cl_buf)?;
        self.to_device.fetch_add(1, Ordering::Relaxed);
        Ok(event)
    }

    /// Mark the CPU copy stale. Called after a kernel writes the device
    /// copy without updating the host copy.
    pub fn invalidate(&self) {
        *self.host_valid.lock().unwrap() = false;
    }

    /// The device allocation, lazily created, for launch argument binding.
    pub(crate) fn device_handle(&self) -> Result<DeviceMemGuard<'_>> {
        let mut host = self.host_mem.lock().unwrap();
        let mut dev = self.device_mem.lock().unwrap();
        self.ensure_device(&mut host, &mut dev)?;
        drop(host);
        Ok(DeviceMemGuard { dev })
    }

    /// Lazily allocate the CPU block per the requested kind. Returns true
    /// if the block was freshly synchronized from an existing device
    /// allocation (retroactive binding).
    fn ensure_host(&self, host: &mut HostMemory) -> Result<bool> {
        if matches!(host, HostMemory::Allocated(_)) {
            return Ok(false);
        }
        let block = match self.kind {
            BufferKind::PinnedDirect => match self.alloc_pinned() {
                Ok(block) => HostBlock::Pinned(block),
                Err(e) => {
                    warn!(
                        "pinned allocation failed for {} ({}); downgraded to pageable",
                        self.field_type, e
                    );
                    HostBlock::pageable(self.byte_len)
                }
            },
            BufferKind::Direct | BufferKind::Indirect => HostBlock::pageable(self.byte_len),
        };
        trace!(
            "allocated host block for {} ({} bytes, pinned={})",
            self.field_type,
            self.byte_len,
            block.is_pinned()
        );
        *host = HostMemory::Allocated(block);

        // Retroactive binding: if device memory already exists for a direct
        // buffer, re-bind it over the new block (contents preserved via a
        // read-back first).
        if self.kind == BufferKind::Direct {
            return self.rebind_device(host);
        }
        Ok(false)
    }

    /// Re-create an existing unbound device allocation bound over the CPU
    /// block. Returns true if a device read-back refreshed the block.
    fn rebind_device(&self, host: &mut HostMemory) -> Result<bool> {
        let mut dev = self.device_mem.lock().unwrap();
        let DeviceMemory::Allocated(old) = &*dev else {
            return Ok(false);
        };
        self.transfer_from_device(old, host.block_mut())?;
        self.from_device.fetch_add(1, Ordering::Relaxed);

        let HostBlock::Pageable { words, bound } = host.block_mut() else {
            unreachable!("direct buffers use pageable blocks");
        };
        let bound_buf = unsafe {
            ClBuffer::<u8>::create(
                &self.core.context,
                CL_MEM_READ_WRITE | CL_MEM_USE_HOST_PTR,
                self.byte_len,
                words.as_mut_ptr() as *mut c_void,
            )
            .map_err(|e| EngineError::AllocationFailed(format!("bound device buffer: {:?}", e)))?
        };
        *bound = true;
        debug!("re-bound device memory over new host block for {}", self.field_type);
        *dev = DeviceMemory::Allocated(bound_buf);
        Ok(true)
    }

    /// Lazily allocate device memory. Three cases: pixel fields use linear
    /// byte layout (the code generator addresses pixel data linearly); a
    /// direct buffer whose CPU block exists is bound over that block; any
    /// other field gets a plain device allocation with no host binding
    /// (GPU-only intermediates that are never read back).
    fn ensure_device(&self, host: &mut HostMemory, dev: &mut DeviceMemory) -> Result<()> {
        if matches!(dev, DeviceMemory::Allocated(_)) {
            return Ok(());
        }
        let buffer = match (&mut *host, self.kind) {
            (HostMemory::Allocated(HostBlock::Pageable { words, bound }), BufferKind::Direct) => {
                let buf = unsafe {
                    ClBuffer::<u8>::create(
                        &self.core.context,
                        CL_MEM_READ_WRITE | CL_MEM_USE_HOST_PTR,
                        self.byte_len,
                        words.as_mut_ptr() as *mut c_void,
                    )
                    .map_err(|e| {
                        EngineError::AllocationFailed(format!("bound device buffer: {:?}", e))
                    })?
                };
                *bound = true;
                buf
            }
            _ => unsafe {
                ClBuffer::<u8>::create(
                    &self.core.context,
                    CL_MEM_READ_WRITE,
                    self.byte_len,
                    ptr::null_mut(),
                )
                .map_err(|e| {
                    EngineError::AllocationFailed(format!("device buffer: {:?}", e))
                })?
            },
        };
        trace!(
            "allocated device memory for {} ({} bytes)",
            self.field_type, self.byte_len
        );
        *dev = DeviceMemory::Allocated(buffer);
        Ok(())
    }

    fn alloc_pinned(&self) -> Result<PinnedBlock> {
        let mut staging = unsafe {
            ClBuffer::<u8>::create(
                &self.core.context,
                CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR,
                self.byte_len,
                ptr::null_mut(),
            )
            .map_err(|e| EngineError::AllocationFailed(format!("pinned staging: {:?}", e)))?
        };
        let mut mapped: *mut c_void = ptr::null_mut();
        let event = unsafe {
            self.core
                .queues
                .transfer_queue()
                .enqueue_map_buffer(
                    &mut staging,
                    CL_BLOCKING,
                    CL_MAP_READ | CL_MAP_WRITE,
                    0,
                    self.byte_len,
                    &mut mapped,
                    &[],
                )
                .map_err(|e| EngineError::AllocationFailed(format!("pinned map: {:?}", e)))?
        };
        drop(event); // blocking map: already complete
        if mapped.is_null() {
            return Err(EngineError::AllocationFailed(
                "pinned map returned null".into(),
            ));
        }
        Ok(PinnedBlock {
            core: Arc::clone(&self.core),
            staging,
            ptr: mapped as *mut u8,
            len: self.byte_len,
        })
    }

    fn transfer_to_device(
        &self,
        block: &HostBlock,
        cl_buf: &mut ClBuffer<u8>,
    ) -> Result<CompletionEvent> {
        let event = match block {
            HostBlock::Pinned(p) => {
                // Non-blocking submit, then wait: truly blocking transfer
                // calls combined with pinned memory deadlock some drivers.
                // Safety: the mapping outlives the wait below and access is
                // serialized by the host mutex held by the caller.
                let data = unsafe { std::slice::from_raw_parts(p.ptr, p.len) };
                let event = self.core.queues.write_buffer(cl_buf, false, data, &[])?;
                event.wait()?;
                event
            }
            HostBlock::Pageable { .. } => {
                self.core
                    .queues
                    .write_buffer(cl_buf, true, block.bytes(self.byte_len), &[])?
            }
        };
        check_transfer("write_buffer", &event)?;
        Ok(event)
    }

    fn transfer_from_device(&self, cl_buf: &ClBuffer<u8>, block: &mut HostBlock) -> Result<()> {
        let event = match block {
            HostBlock::Pinned(p) => {
                // Safety: as in transfer_to_device.
                let data = unsafe { std::slice::from_raw_parts_mut(p.ptr, p.len) };
                let event = self.core.queues.read_buffer(cl_buf, false, data, &[])?;
                event.wait()?;
                event
            }
            HostBlock::Pageable { .. } => self.core.queues.read_buffer(
                cl_buf,
                true,
                block.bytes_mut(self.byte_len),
                &[],
            )?,
        };
        check_transfer("read_buffer", &event)
    }
}

/// Validate a transfer's completion event. An error status is fatal and
/// names the routine and status code.
fn check_transfer(routine: &'static str, event: &CompletionEvent) -> Result<()> {
    let status = event.status()?;
    if status < 0 {
        return Err(EngineError::TransferFailed {
            routine,
            detail: format!("completion status {}", status),
        });
    }
    Ok(())
}

/// Shared read view of a field's CPU copy. Holding the guard keeps the
/// block borrowed; release it before reading the field again.
pub struct CpuReadGuard<'a> {
    host: MutexGuard<'a, HostMemory>,
    byte_len: usize,
}

impl Deref for CpuReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.host.block().bytes(self.byte_len)
    }
}

impl CpuReadGuard<'_> {
    /// Typed view for f32-component fields.
    pub fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(&**self)
    }
}

/// Mutable view of a field's CPU copy, for population before [`FieldBuffer::write`].
pub struct CpuMemoryGuard<'a> {
    host: MutexGuard<'a, HostMemory>,
    byte_len: usize,
}

impl Deref for CpuMemoryGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.host.block().bytes(self.byte_len)
    }
}

impl DerefMut for CpuMemoryGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.host.block_mut().bytes_mut(self.byte_len)
    }
}

impl CpuMemoryGuard<'_> {
    pub fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(&**self)
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(&mut **self)
    }
}

/// Locked view of the device allocation, for launch argument binding.
pub(crate) struct DeviceMemGuard<'a> {
    dev: MutexGuard<'a, DeviceMemory>,
}

impl DeviceMemGuard<'_> {
    pub(crate) fn cl_buffer(&self) -> &ClBuffer<u8> {
        match &*self.dev {
            DeviceMemory::Allocated(buf) => buf,
            DeviceMemory::Unallocated => {
                panic!("engine invariant violated: device handle taken before allocation")
            }
        }
    }
}
