//! Runtime kernels: the per-kernel execution state machine and the host
//! interface CPU kernels run against.

use std::sync::Arc;

use crate::device::buffer::{CpuMemoryGuard, CpuReadGuard, FieldBuffer};
use crate::device::event::CompletionEvent;
use crate::device::{CpuKernelSlot, KernelSlot};
use crate::error::Result;
use crate::field::FieldType;

use super::{Input, Opcode, WorkGroupShape};

/// Execution state of a kernel. The executing/output-pending/
/// output-complete loop repeats every simulation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KernelState {
    Constructed,
    AddedToDevice,
    Instantiated,
    Executing,
    OutputPending,
    OutputComplete,
    Released,
}

impl KernelState {
    fn can_advance_to(self, next: KernelState) -> bool {
        use KernelState::*;
        matches!(
            (self, next),
            (Constructed, AddedToDevice)
                | (AddedToDevice, Instantiated)
                | (Instantiated, Executing)
                | (Executing, OutputPending)
                | (OutputPending, OutputComplete)
                | (OutputComplete, Instantiated)
                | (Instantiated, AddedToDevice) // de-instantiation
                | (AddedToDevice, Released)
                | (Instantiated, Released)
                | (OutputComplete, Released)
        )
    }
}

/// Body variant bound to runtime handles.
pub(crate) enum RuntimeKind {
    Device {
        slot: KernelSlot,
        work_group: WorkGroupShape,
    },
    Cpu {
        routine: Box<dyn CpuKernelRoutine>,
        #[allow(dead_code)]
        slot: CpuKernelSlot,
    },
}

/// A kernel bound to a device, cycling through the execution state machine.
pub(crate) struct RuntimeKernel {
    pub label: String,
    pub opcode: Opcode,
    pub inputs: Vec<Input>,
    /// Registers this kernel drives.
    pub outputs: Vec<super::RegisterId>,
    pub kind: RuntimeKind,
    pub state: KernelState,
    /// Completion events of the current cycle; consumed and released in
    /// phase 2 so the next cycle produces fresh ones.
    pub events: Vec<CompletionEvent>,
}

impl RuntimeKernel {
    /// Transition the state machine. An invalid transition is an engine
    /// bug and aborts immediately.
    pub fn advance(&mut self, next: KernelState) {
        if !self.state.can_advance_to(next) {
            panic!(
                "engine invariant violated: kernel '{}' cannot go {:?} -> {:?}",
                self.label, self.state, next
            );
        }
        self.state = next;
    }
}

/// Host view of a kernel invocation: the input and output field buffers, as
/// device-coherent CPU memory.
pub struct CpuKernelContext<'a> {
    inputs: &'a [Arc<FieldBuffer>],
    outputs: &'a [Arc<FieldBuffer>],
}

impl<'a> CpuKernelContext<'a> {
    pub(crate) fn new(inputs: &'a [Arc<FieldBuffer>], outputs: &'a [Arc<FieldBuffer>]) -> Self {
        CpuKernelContext { inputs, outputs }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_field_type(&self, i: usize) -> &FieldType {
        self.input_buffer(i).field_type()
    }

    pub fn output_field_type(&self, i: usize) -> &FieldType {
        self.output_buffer(i).field_type()
    }

    /// Current value of input `i`, refreshed from the device if stale.
    pub fn read_input(&self, i: usize) -> Result<CpuReadGuard<'_>> {
        self.input_buffer(i).read()
    }

    /// CPU block of output `i`, for the routine to populate. The engine
    /// publishes populated outputs to the device after the routine returns.
    pub fn output(&self, i: usize) -> Result<CpuMemoryGuard<'_>> {
        self.output_buffer(i).cpu_memory()
    }

    fn input_buffer(&self, i: usize) -> &FieldBuffer {
        self.inputs
            .get(i)
            .unwrap_or_else(|| panic!("cpu kernel read input {} of {}", i, self.inputs.len()))
    }

    fn output_buffer(&self, i: usize) -> &FieldBuffer {
        self.outputs
            .get(i)
            .unwrap_or_else(|| panic!("cpu kernel wrote output {} of {}", i, self.outputs.len()))
    }
}

/// A kernel executed on the host. Runs synchronously during phase 1 but
/// participates in the completion-event protocol through its output write
/// transfers, so downstream device kernels stay correctly gated.
pub trait CpuKernelRoutine: Send {
    /// Host-side setup, performed when the kernel is instantiated.
    fn instantiate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Compute this cycle's outputs from the inputs.
    fn run(&mut self, ctx: &mut CpuKernelContext<'_>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> RuntimeKernel {
        RuntimeKernel {
            label: "t".into(),
            opcode: Opcode::new("t"),
            inputs: vec![],
            outputs: vec![],
            kind: RuntimeKind::Device {
                slot: KernelSlot::from_raw(0),
                work_group: WorkGroupShape::linear(1),
            },
            state: KernelState::Constructed,
            events: vec![],
        }
    }

    #[test]
    fn test_cyclic_state_machine() {
        let mut k = kernel();
        k.advance(KernelState::AddedToDevice);
        k.advance(KernelState::Instantiated);
        for _ in 0..3 {
            k.advance(KernelState::Executing);
            k.advance(KernelState::OutputPending);
            k.advance(KernelState::OutputComplete);
            k.advance(KernelState::Instantiated);
        }
        k.advance(KernelState::Released);
    }

    #[test]
    fn test_deinstantiation_roundtrip() {
        let mut k = kernel();
        k.advance(KernelState::AddedToDevice);
        k.advance(KernelState::Instantiated);
        k.advance(KernelState::AddedToDevice); // migrate away
        k.advance(KernelState::Instantiated); // rebind elsewhere
    }

    #[test]
    #[should_panic(expected = "engine invariant violated")]
    fn test_invalid_transition_panics() {
        let mut k = kernel();
        k.advance(KernelState::Executing); // never added to a device
    }
}
