//! The two-phase, dependency-ordered circuit execution protocol.
//!
//! A single controlling thread drives every cycle; real parallelism comes
//! from the device's asynchronous execution units. Phase 1 never blocks the
//! host: launches are fire-and-forget, each returning a completion event,
//! and the host blocks exactly once per cycle, on the sink kernels' events.

use std::sync::Arc;

use log::{debug, trace};
use opencl3::types::cl_event;
use rustc_hash::FxHashMap;

use crate::device::buffer::{CpuReadGuard, FieldBuffer};
use crate::device::event::CompletionEvent;
use crate::device::Device;
use crate::error::{EngineError, Result};
use crate::field::FieldType;

use super::kernel::{CpuKernelContext, KernelState, RuntimeKernel, RuntimeKind};
use super::{CircuitSpec, KernelBody, RegisterClass, RegisterId};

/// A virtual field register bound to device memory. Recurrent registers
/// hold a double buffer: consumers read the front half while the driving
/// kernel computes into the back half, and the register clock swaps the
/// halves at the top of every cycle.
pub(crate) struct RuntimeRegister {
    field_type: FieldType,
    buffers: Vec<Arc<FieldBuffer>>,
    front: usize,
    initial: Option<Vec<u8>>,
}

impl RuntimeRegister {
    fn is_recurrent(&self) -> bool {
        self.buffers.len() == 2
    }

    /// Buffer consumers read this cycle.
    fn read_buffer(&self) -> &Arc<FieldBuffer> {
        &self.buffers[self.front]
    }

    /// Buffer the driving kernel writes this cycle.
    fn write_buffer(&self) -> &Arc<FieldBuffer> {
        if self.is_recurrent() {
            &self.buffers[self.front ^ 1]
        } else {
            &self.buffers[0]
        }
    }

    /// Buffer holding the most recently computed value: what probes see.
    fn probe_buffer(&self) -> &Arc<FieldBuffer> {
        self.write_buffer()
    }

    /// Phase 0: advance to the previously computed next-value.
    fn clock(&mut self) {
        if self.is_recurrent() {
            self.front ^= 1;
        }
    }
}

/// A circuit bound to a device: kernels with runtime handles, registers
/// with device memory, and the per-cycle execution state.
pub(crate) struct CircuitRuntime {
    device: Arc<Device>,
    kernels: Vec<RuntimeKernel>,
    registers: FxHashMap<RegisterId, RuntimeRegister>,
    order: Vec<usize>,
    sinks: Vec<usize>,
    cycle: u64,
    /// Kernel indices in submission order for the most recent cycle.
    trace: Vec<usize>,
}

impl CircuitRuntime {
    /// Bind a finished circuit to a device: allocate register buffers,
    /// register and compile kernel sources, instantiate every kernel, and
    /// initialize stateful registers.
    pub fn bind(device: Arc<Device>, spec: CircuitSpec) -> Result<Self> {
        let CircuitSpec {
            kernels: specs,
            order,
            sinks,
        } = spec;

        let mut kernels = Vec::with_capacity(specs.len());
        let mut registers = FxHashMap::default();

        for (i, spec) in specs.into_iter().enumerate() {
            let mut output_ids = Vec::with_capacity(spec.outputs.len());
            for (o, output) in spec.outputs.iter().enumerate() {
                let id = RegisterId {
                    kernel: i,
                    output: o,
                };
                let (halves, initial) = match &output.class {
                    RegisterClass::Wire => (1, None),
                    RegisterClass::Recurrent { initial } => (2, Some(initial.clone())),
                };
                let buffers = (0..halves)
                    .map(|_| device.create_default_field_buffer(output.field_type))
                    .collect();
                registers.insert(
                    id,
                    RuntimeRegister {
                        field_type: output.field_type,
                        buffers,
                        front: 0,
                        initial,
                    },
                );
                output_ids.push(id);
            }

            let kind = match spec.body {
                KernelBody::Device { source, work_group } => RuntimeKind::Device {
                    slot: device.add_kernel_source(&source)?,
                    work_group,
                },
                KernelBody::Cpu(routine) => RuntimeKind::Cpu {
                    slot: device.add_cpu_kernel(&spec.label),
                    routine,
                },
            };

            let mut kernel = RuntimeKernel {
                label: spec.label,
                opcode: spec.opcode,
                inputs: spec.inputs,
                outputs: output_ids,
                kind,
                state: KernelState::Constructed,
                events: Vec::new(),
            };
            kernel.advance(KernelState::AddedToDevice);
            kernels.push(kernel);
        }

        if kernels
            .iter()
            .any(|k| matches!(k.kind, RuntimeKind::Device { .. }))
        {
            device.build_program()?;
        }

        for kernel in &mut kernels {
            match &mut kernel.kind {
                RuntimeKind::Device { slot, .. } => device.instantiate_kernel(*slot)?,
                RuntimeKind::Cpu { routine, .. } => routine.instantiate()?,
            }
            kernel.advance(KernelState::Instantiated);
        }
        debug!(
            "bound circuit: {} kernel(s), {} register(s), {} sink(s)",
            kernels.len(),
            registers.len(),
            sinks.len()
        );

        let mut runtime = CircuitRuntime {
            device,
            kernels,
            registers,
            order,
            sinks,
            cycle: 0,
            trace: Vec::new(),
        };
        runtime.reset()?;
        Ok(runtime)
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Labels of the kernels submitted last cycle, in submission order.
    pub fn submission_trace(&self) -> Vec<String> {
        self.trace
            .iter()
            .map(|&i| self.kernels[i].label.clone())
            .collect()
    }

    /// Reinitialize every stateful register to its declared initial value
    /// and re-zero the cycle counter. Idempotent.
    pub fn reset(&mut self) -> Result<()> {
        self.cycle = 0;
        self.trace.clear();
        for kernel in &mut self.kernels {
            kernel.events.clear();
        }
        for register in self.registers.values_mut() {
            if let Some(initial) = &register.initial {
                // Both halves get the initial value so the first register
                // clock is a no-op in terms of observable state.
                for buffer in &register.buffers {
                    buffer.cpu_memory()?.copy_from_slice(initial);
                    buffer.write()?;
                }
            }
            register.front = 0;
        }
        Ok(())
    }

    /// Execute one simulation cycle. Returns the new cycle count.
    pub fn step(&mut self) -> Result<u64> {
        trace!("cycle {} begin", self.cycle);
        self.clock_registers();
        self.launch_all()?;
        self.wait_for_sinks()?;
        self.validate_and_release()?;
        self.cycle += 1;
        trace!("cycle {} complete", self.cycle);
        Ok(self.cycle)
    }

    /// Phase 0: every recurrent register atomically advances to the value
    /// computed last cycle, decoupling "readable this cycle" from
    /// "computed this cycle".
    fn clock_registers(&mut self) {
        self.trace.clear();
        for register in self.registers.values_mut() {
            register.clock();
        }
    }

    /// Phase 1: launch every kernel in dependency order, gating each on
    /// the completion events of all kernels producing its inputs.
    fn launch_all(&mut self) -> Result<()> {
        for position in 0..self.order.len() {
            let i = self.order[position];

            // Feedback edges read the previous cycle's value, which was
            // validated complete before this cycle began; only feed-forward
            // producers gate the launch.
            let wait: Vec<cl_event> = self.kernels[i]
                .inputs
                .iter()
                .filter(|input| !input.is_feedback())
                .flat_map(|input| {
                    self.kernels[input.register().kernel]
                        .events
                        .iter()
                        .map(|e| e.raw())
                })
                .collect();

            let input_buffers: Vec<Arc<FieldBuffer>> = self.kernels[i]
                .inputs
                .iter()
                .map(|input| Arc::clone(self.registers[&input.register()].read_buffer()))
                .collect();
            let output_buffers: Vec<Arc<FieldBuffer>> = self.kernels[i]
                .outputs
                .iter()
                .map(|id| Arc::clone(self.registers[id].write_buffer()))
                .collect();

            // Decide the path first so no borrow of the kernel list is
            // held across the launch.
            let device_launch = match &self.kernels[i].kind {
                RuntimeKind::Device { slot, work_group } => Some((
                    *slot,
                    work_group.global.clone(),
                    work_group.local.clone(),
                )),
                RuntimeKind::Cpu { .. } => None,
            };

            match device_launch {
                Some((slot, global, local)) => {
                    let args: Vec<Arc<FieldBuffer>> = input_buffers
                        .iter()
                        .chain(output_buffers.iter())
                        .cloned()
                        .collect();
                    let event = self.device.enqueue_kernel(
                        slot,
                        &args,
                        &global,
                        local.as_deref(),
                        &wait,
                    )?;
                    let kernel = &mut self.kernels[i];
                    kernel.advance(KernelState::Executing);
                    kernel.events = vec![event];
                    kernel.advance(KernelState::OutputPending);
                    // The device copy is about to change; the host copies
                    // of the outputs are stale.
                    for buffer in &output_buffers {
                        buffer.invalidate();
                    }
                }
                None => {
                    // Host execution is synchronous: wait for the producers
                    // first, per the device's wait strategy.
                    {
                        let producers: Vec<usize> = self.kernels[i]
                            .inputs
                            .iter()
                            .filter(|input| !input.is_feedback())
                            .map(|input| input.register().kernel)
                            .collect();
                        let pairs: Vec<(&str, &CompletionEvent)> = producers
                            .iter()
                            .flat_map(|&p| {
                                let producer = &self.kernels[p];
                                producer
                                    .events
                                    .iter()
                                    .map(move |e| (producer.label.as_str(), e))
                            })
                            .collect();
                        self.device.wait_strategy().wait_all(pairs)?;
                    }

                    let kernel = &mut self.kernels[i];
                    kernel.advance(KernelState::Executing);
                    let label = kernel.label.clone();
                    let RuntimeKind::Cpu { routine, .. } = &mut kernel.kind else {
                        unreachable!();
                    };
                    let mut ctx = CpuKernelContext::new(&input_buffers, &output_buffers);
                    routine
                        .run(&mut ctx)
                        .map_err(|e| EngineError::CpuKernelFailed {
                            kernel: label,
                            detail: e.to_string(),
                        })?;

                    // Publish the outputs; the write transfers' events are
                    // this kernel's completion events, keeping downstream
                    // device kernels correctly gated.
                    let mut events = Vec::with_capacity(output_buffers.len());
                    for buffer in &output_buffers {
                        events.push(buffer.write()?);
                    }
                    let kernel = &mut self.kernels[i];
                    kernel.events = events;
                    kernel.advance(KernelState::OutputPending);
                }
            }
            self.trace.push(i);
        }
        Ok(())
    }

    /// Block on the sink kernels' completion events only; every ancestor's
    /// completion is implied by the event dependency chain.
    fn wait_for_sinks(&self) -> Result<()> {
        let pairs: Vec<(&str, &CompletionEvent)> = self
            .sinks
            .iter()
            .flat_map(|&s| {
                let kernel = &self.kernels[s];
                kernel
                    .events
                    .iter()
                    .map(move |e| (kernel.label.as_str(), e))
            })
            .collect();
        self.device.wait_strategy().wait_all(pairs)
    }

    /// Phase 2: inspect every kernel's completion status (an error status
    /// aborts the step), then release the consumed events so the next
    /// cycle produces fresh ones.
    fn validate_and_release(&mut self) -> Result<()> {
        for position in 0..self.order.len() {
            let i = self.order[position];
            let kernel = &mut self.kernels[i];
            for event in &kernel.events {
                event.check(&kernel.label)?;
            }
            kernel.events.clear();
            kernel.advance(KernelState::OutputComplete);
            kernel.advance(KernelState::Instantiated);
        }
        Ok(())
    }

    /// Current value of a register, as seen by probes: the most recently
    /// computed buffer, refreshed to the host if stale.
    pub fn read_register(&self, id: RegisterId) -> Result<CpuReadGuard<'_>> {
        let register = self
            .registers
            .get(&id)
            .ok_or_else(|| EngineError::Circuit(format!("unknown register {}", id)))?;
        register.probe_buffer().read()
    }

    pub fn register_field_type(&self, id: RegisterId) -> Result<FieldType> {
        self.registers
            .get(&id)
            .map(|r| r.field_type)
            .ok_or_else(|| EngineError::Circuit(format!("unknown register {}", id)))
    }

    /// Tear down the circuit: release kernels and hand every circuit-owned
    /// resource back to the device in deterministic order.
    pub fn release(&mut self) {
        for kernel in &mut self.kernels {
            if kernel.state != KernelState::Released {
                kernel.events.clear();
                kernel.state = KernelState::Released;
            }
        }
        self.registers.clear();
        self.device.release_for_reuse();
    }
}
