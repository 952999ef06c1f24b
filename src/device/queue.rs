//! Command queue pair: one queue for transfers, one for kernel launches.
//!
//! A single out-of-order queue would in principle give the same overlap, but
//! out-of-order execution is poorly supported across vendors. Two in-order
//! queues, host<->device transfers on one and kernel launches on the other,
//! give dependable overlap everywhere, with ordering between them expressed
//! explicitly through event wait lists.

use log::warn;
use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::memory::Buffer;
use opencl3::types::{cl_event, CL_BLOCKING, CL_NON_BLOCKING};

use crate::error::{EngineError, Result};

use super::event::CompletionEvent;

/// The two per-device command queues.
pub struct CommandQueuePair {
    transfer: CommandQueue,
    kernel: CommandQueue,
    profiling: bool,
}

impl CommandQueuePair {
    /// Create both queues on the context's device.
    ///
    /// Queue profiling is a probed capability: if the device rejects a
    /// profiling queue the request is downgraded with a warning rather than
    /// failing; the capability is simply not used.
    pub fn new(context: &Context, want_profiling: bool) -> Result<Self> {
        let (transfer, profiling) = Self::create_queue(context, want_profiling)?;
        let (kernel, _) = Self::create_queue(context, profiling)?;
        Ok(CommandQueuePair {
            transfer,
            kernel,
            profiling,
        })
    }

    fn create_queue(context: &Context, want_profiling: bool) -> Result<(CommandQueue, bool)> {
        // The OpenCL 1.2 entry point: create_default_with_properties is a
        // 2.0 API that several vendors still reject.
        if want_profiling {
            #[allow(deprecated)]
            match CommandQueue::create_default(context, CL_QUEUE_PROFILING_ENABLE) {
                Ok(q) => return Ok((q, true)),
                Err(e) => {
                    warn!("profiling queue unsupported ({:?}); created without profiling", e);
                }
            }
        }
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(context, 0).map_err(|e| EngineError::Device {
            routine: "create_command_queue",
            detail: format!("{:?}", e),
        })?;
        Ok((queue, false))
    }

    /// Whether profiling was actually granted on the queues.
    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Queue dedicated to kernel launches.
    pub fn kernel_queue(&self) -> &CommandQueue {
        &self.kernel
    }

    /// Queue dedicated to host<->device transfers.
    pub fn transfer_queue(&self) -> &CommandQueue {
        &self.transfer
    }

    /// Enqueue a host->device copy of `data` into `buffer`.
    ///
    /// `blocking` selects the blocking transfer call; the non-blocking
    /// variant returns immediately and the caller must wait on the returned
    /// event (the pinned-memory path does exactly that).
    pub fn write_buffer(
        &self,
        buffer: &mut Buffer<u8>,
        blocking: bool,
        data: &[u8],
        wait: &[cl_event],
    ) -> Result<CompletionEvent> {
        let mode = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        let event = unsafe {
            self.transfer
                .enqueue_write_buffer(buffer, mode, 0, data, wait)
                .map_err(|e| EngineError::TransferFailed {
                    routine: "enqueue_write_buffer",
                    detail: format!("{:?}", e),
                })?
        };
        Ok(CompletionEvent::new(event))
    }

    /// Enqueue a device->host copy of `buffer` into `data`.
    pub fn read_buffer(
        &self,
        buffer: &Buffer<u8>,
        blocking: bool,
        data: &mut [u8],
        wait: &[cl_event],
    ) -> Result<CompletionEvent> {
        let mode = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        let event = unsafe {
            self.transfer
                .enqueue_read_buffer(buffer, mode, 0, data, wait)
                .map_err(|e| EngineError::TransferFailed {
                    routine: "enqueue_read_buffer",
                    detail: format!("{:?}", e),
                })?
        };
        Ok(CompletionEvent::new(event))
    }

    /// Drain both queues. Used during teardown.
    pub fn finish(&self) -> Result<()> {
        self.transfer.finish().map_err(|e| EngineError::Device {
            routine: "finish_transfer_queue",
            detail: format!("{:?}", e),
        })?;
        self.kernel.finish().map_err(|e| EngineError::Device {
            routine: "finish_kernel_queue",
            detail: format!("{:?}", e),
        })
    }
}
