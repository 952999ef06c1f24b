//! Kernel circuit description: the immutable DAG the engine executes.
//!
//! The (out-of-scope) front-end compiler lowers the field/operator algebra
//! into a list of abstract kernels wired through virtual field registers,
//! then hands the finished circuit to the engine through [`CircuitBuilder`].
//! Feed-forward edges carry data within a cycle; feedback edges read the
//! previous cycle's value of a recurrent register.

mod driver;
mod executor;
mod kernel;

use std::fmt;

use crate::error::{EngineError, Result};
use crate::field::FieldType;

pub use driver::{FieldData, Simulator};
pub use kernel::{CpuKernelContext, CpuKernelRoutine};

/// Operation identity of a kernel, assigned by the front-end compiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Opcode(String);

impl Opcode {
    pub fn new(name: impl Into<String>) -> Self {
        Opcode(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a virtual field register: output `output` of kernel `kernel`.
/// Registers are created from a kernel's declared output field types when
/// the kernel is added, so each register has exactly one driving kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterId {
    pub kernel: usize,
    pub output: usize,
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}.{}", self.kernel, self.output)
    }
}

/// One input slot of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Feed-forward edge: reads the value computed this cycle. Must
    /// reference an earlier kernel's register.
    Register(RegisterId),
    /// State edge: reads the previous cycle's value of a recurrent
    /// register. May reference the kernel's own output.
    Feedback(RegisterId),
}

impl Input {
    pub fn register(&self) -> RegisterId {
        match self {
            Input::Register(r) | Input::Feedback(r) => *r,
        }
    }

    pub fn is_feedback(&self) -> bool {
        matches!(self, Input::Feedback(_))
    }
}

/// Register class of a declared kernel output.
pub enum RegisterClass {
    /// Plain feed-forward register.
    Wire,
    /// Stateful register with a declared initial value (exact byte layout
    /// of the field type). Holds a double buffer advanced by the register
    /// clock each cycle.
    Recurrent { initial: Vec<u8> },
}

/// One declared kernel output, from which its register is constructed.
pub struct OutputSpec {
    pub field_type: FieldType,
    pub class: RegisterClass,
}

impl OutputSpec {
    pub fn wire(field_type: FieldType) -> Self {
        OutputSpec {
            field_type,
            class: RegisterClass::Wire,
        }
    }

    pub fn recurrent(field_type: FieldType, initial: Vec<u8>) -> Self {
        OutputSpec {
            field_type,
            class: RegisterClass::Recurrent { initial },
        }
    }

    /// Recurrent register initialized from f32 components.
    pub fn recurrent_f32(field_type: FieldType, initial: &[f32]) -> Self {
        Self::recurrent(field_type, bytemuck::cast_slice(initial).to_vec())
    }

    pub fn is_recurrent(&self) -> bool {
        matches!(self.class, RegisterClass::Recurrent { .. })
    }
}

/// Dispatch shape for a device kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkGroupShape {
    /// Global work size, 1-3 dimensions, innermost first.
    pub global: Vec<usize>,
    /// Optional explicit work-group size with the same dimensionality.
    pub local: Option<Vec<usize>>,
}

impl WorkGroupShape {
    /// Flat 1D dispatch of `n` work items.
    pub fn linear(n: usize) -> Self {
        WorkGroupShape {
            global: vec![n.max(1)],
            local: None,
        }
    }

    /// One work item per field point, shaped by the field dimensions.
    pub fn for_field(field_type: &FieldType) -> Self {
        WorkGroupShape {
            global: field_type.field_shape().work_dims(),
            local: None,
        }
    }

    pub fn with_local(mut self, local: Vec<usize>) -> Self {
        self.local = Some(local);
        self
    }
}

/// Kernel body: where and how the computation runs.
pub enum KernelBody {
    /// Compiled to the device program and launched on the GPU. The source
    /// is an opaque blob from the code generator; the entry name embedded
    /// in it is normalized and content-hashed by the program cache.
    Device {
        source: String,
        work_group: WorkGroupShape,
    },
    /// Runs on the host but reads and writes device buffers, participating
    /// in the completion-event protocol like any other kernel.
    Cpu(Box<dyn CpuKernelRoutine>),
}

/// An abstract kernel as delivered by the front-end compiler: opcode,
/// ordered inputs, declared outputs, and a body.
pub struct KernelSpec {
    pub opcode: Opcode,
    pub label: String,
    pub inputs: Vec<Input>,
    pub outputs: Vec<OutputSpec>,
    pub body: KernelBody,
}

impl KernelSpec {
    pub fn device(
        opcode: Opcode,
        inputs: Vec<Input>,
        outputs: Vec<OutputSpec>,
        source: impl Into<String>,
        work_group: WorkGroupShape,
    ) -> Self {
        let label = opcode.to_string();
        KernelSpec {
            opcode,
            label,
            inputs,
            outputs,
            body: KernelBody::Device {
                source: source.into(),
                work_group,
            },
        }
    }

    pub fn cpu(
        opcode: Opcode,
        inputs: Vec<Input>,
        outputs: Vec<OutputSpec>,
        routine: Box<dyn CpuKernelRoutine>,
    ) -> Self {
        let label = opcode.to_string();
        KernelSpec {
            opcode,
            label,
            inputs,
            outputs,
            body: KernelBody::Cpu(routine),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Incrementally assembles a circuit, validating register wiring as kernels
/// are added.
#[derive(Default)]
pub struct CircuitBuilder {
    kernels: Vec<KernelSpec>,
}

impl CircuitBuilder {
    pub fn new() -> Self {
        CircuitBuilder::default()
    }

    /// Index the next added kernel will receive. Needed to wire a kernel's
    /// feedback input to its own output.
    pub fn next_kernel_index(&self) -> usize {
        self.kernels.len()
    }

    /// Add a kernel, returning the ids of the registers constructed from
    /// its declared outputs.
    pub fn add_kernel(&mut self, spec: KernelSpec) -> Result<Vec<RegisterId>> {
        let index = self.kernels.len();

        for output in &spec.outputs {
            if let RegisterClass::Recurrent { initial } = &output.class {
                if initial.len() != output.field_type.byte_size() {
                    return Err(EngineError::Circuit(format!(
                        "kernel '{}': initial value is {} bytes but field {} needs {}",
                        spec.label,
                        initial.len(),
                        output.field_type,
                        output.field_type.byte_size()
                    )));
                }
            }
        }

        for input in &spec.inputs {
            let r = input.register();
            let (producer_outputs, producer_label): (&[OutputSpec], &str) = if r.kernel == index {
                (&spec.outputs, spec.label.as_str())
            } else if r.kernel < index {
                let k = &self.kernels[r.kernel];
                (&k.outputs, k.label.as_str())
            } else {
                return Err(EngineError::Circuit(format!(
                    "kernel '{}': input {} references a kernel that does not exist yet",
                    spec.label, r
                )));
            };
            let output = producer_outputs.get(r.output).ok_or_else(|| {
                EngineError::Circuit(format!(
                    "kernel '{}': input {} references output {} of '{}' which has {} output(s)",
                    spec.label,
                    r,
                    r.output,
                    producer_label,
                    producer_outputs.len()
                ))
            })?;
            match input {
                Input::Register(_) => {
                    if r.kernel == index {
                        return Err(EngineError::Circuit(format!(
                            "kernel '{}': feed-forward input {} references its own output; \
                             use a feedback edge for state",
                            spec.label, r
                        )));
                    }
                }
                Input::Feedback(_) => {
                    if !output.is_recurrent() {
                        return Err(EngineError::Circuit(format!(
                            "kernel '{}': feedback input {} targets a non-recurrent register",
                            spec.label, r
                        )));
                    }
                }
            }
        }

        let ids = (0..spec.outputs.len())
            .map(|output| RegisterId {
                kernel: index,
                output,
            })
            .collect();
        self.kernels.push(spec);
        Ok(ids)
    }

    /// Finalize: compute the dependency order and the sink set.
    pub fn finish(self) -> Result<CircuitSpec> {
        let order = topological_order(&self.kernels)?;
        let sinks = find_sinks(&self.kernels);
        Ok(CircuitSpec {
            kernels: self.kernels,
            order,
            sinks,
        })
    }
}

/// A finished, immutable circuit: kernels plus their precomputed dependency
/// order and sink set.
pub struct CircuitSpec {
    pub(crate) kernels: Vec<KernelSpec>,
    pub(crate) order: Vec<usize>,
    pub(crate) sinks: Vec<usize>,
}

impl CircuitSpec {
    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    /// Kernel indices in dependency (launch) order, leaves first.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Kernels whose outputs feed no same-cycle consumer. Only their
    /// completion is waited on each cycle; ancestors complete transitively.
    pub fn sinks(&self) -> &[usize] {
        &self.sinks
    }
}

/// Kahn's algorithm over the feed-forward edges. Feedback edges carry no
/// same-cycle dependency and are ignored.
fn topological_order(kernels: &[KernelSpec]) -> Result<Vec<usize>> {
    let n = kernels.len();
    let mut indegree = vec![0usize; n];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, kernel) in kernels.iter().enumerate() {
        for input in &kernel.inputs {
            if let Input::Register(r) = input {
                indegree[i] += 1;
                consumers[r.kernel].push(i);
            }
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop() {
        order.push(i);
        for &c in &consumers[i] {
            indegree[c] -= 1;
            if indegree[c] == 0 {
                ready.push(c);
            }
        }
    }

    if order.len() != n {
        // Unreachable through CircuitBuilder (feed-forward edges always
        // point backwards), kept as a defense for hand-built specs.
        return Err(EngineError::Circuit(
            "feed-forward edges form a cycle".into(),
        ));
    }
    Ok(order)
}

fn find_sinks(kernels: &[KernelSpec]) -> Vec<usize> {
    let n = kernels.len();
    let mut has_consumer = vec![false; n];
    for kernel in kernels {
        for input in &kernel.inputs {
            if let Input::Register(r) = input {
                has_consumer[r.kernel] = true;
            }
        }
    }
    (0..n).filter(|&i| !has_consumer[i]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldShape, FieldType};

    fn ft() -> FieldType {
        FieldType::scalar_f32(FieldShape::d1(4))
    }

    fn source_kernel(name: &str) -> KernelSpec {
        KernelSpec::device(
            Opcode::new(name),
            vec![],
            vec![OutputSpec::wire(ft())],
            format!("__kernel void {}_1(__global float* out) {{}}", name),
            WorkGroupShape::linear(4),
        )
    }

    fn unary_kernel(name: &str, input: RegisterId) -> KernelSpec {
        KernelSpec::device(
            Opcode::new(name),
            vec![Input::Register(input)],
            vec![OutputSpec::wire(ft())],
            format!(
                "__kernel void {}_1(__global const float* a, __global float* out) {{}}",
                name
            ),
            WorkGroupShape::linear(4),
        )
    }

    #[test]
    fn test_register_ids_assigned_in_order() {
        let mut b = CircuitBuilder::new();
        let regs = b.add_kernel(source_kernel("src")).unwrap();
        assert_eq!(regs, vec![RegisterId { kernel: 0, output: 0 }]);
    }

    #[test]
    fn test_diamond_order_and_sinks() {
        // src -> (left, right) -> join
        let mut b = CircuitBuilder::new();
        let src = b.add_kernel(source_kernel("src")).unwrap()[0];
        let left = b.add_kernel(unary_kernel("left", src)).unwrap()[0];
        let right = b.add_kernel(unary_kernel("right", src)).unwrap()[0];
        let join = b
            .add_kernel(KernelSpec::device(
                Opcode::new("join"),
                vec![Input::Register(left), Input::Register(right)],
                vec![OutputSpec::wire(ft())],
                "__kernel void join_1(__global const float* a, __global const float* b, __global float* out) {}",
                WorkGroupShape::linear(4),
            ))
            .unwrap()[0];
        let circuit = b.finish().unwrap();

        let pos = |k: usize| circuit.order().iter().position(|&i| i == k).unwrap();
        assert!(pos(src.kernel) < pos(left.kernel));
        assert!(pos(src.kernel) < pos(right.kernel));
        assert!(pos(left.kernel) < pos(join.kernel));
        assert!(pos(right.kernel) < pos(join.kernel));
        assert_eq!(circuit.sinks(), &[join.kernel]);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let mut b = CircuitBuilder::new();
        let err = b
            .add_kernel(unary_kernel(
                "dangling",
                RegisterId { kernel: 5, output: 0 },
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Circuit(_)));
    }

    #[test]
    fn test_unknown_output_rejected() {
        let mut b = CircuitBuilder::new();
        let src = b.add_kernel(source_kernel("src")).unwrap()[0];
        let err = b
            .add_kernel(unary_kernel(
                "bad",
                RegisterId { kernel: src.kernel, output: 3 },
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Circuit(_)));
    }

    #[test]
    fn test_same_cycle_self_reference_rejected() {
        let mut b = CircuitBuilder::new();
        let idx = b.next_kernel_index();
        let err = b
            .add_kernel(unary_kernel("selfloop", RegisterId { kernel: idx, output: 0 }))
            .unwrap_err();
        assert!(matches!(err, EngineError::Circuit(_)));
    }

    #[test]
    fn test_feedback_requires_recurrent_register() {
        let mut b = CircuitBuilder::new();
        let src = b.add_kernel(source_kernel("src")).unwrap()[0];
        let err = b
            .add_kernel(KernelSpec::device(
                Opcode::new("fb"),
                vec![Input::Feedback(src)],
                vec![OutputSpec::wire(ft())],
                "__kernel void fb_1(__global const float* a, __global float* out) {}",
                WorkGroupShape::linear(4),
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Circuit(_)));
    }

    #[test]
    fn test_own_feedback_accepted() {
        let mut b = CircuitBuilder::new();
        let idx = b.next_kernel_index();
        let regs = b
            .add_kernel(KernelSpec::device(
                Opcode::new("acc"),
                vec![Input::Feedback(RegisterId { kernel: idx, output: 0 })],
                vec![OutputSpec::recurrent_f32(ft(), &[0.0; 4])],
                "__kernel void acc_1(__global const float* prev, __global float* next) {}",
                WorkGroupShape::linear(4),
            ))
            .unwrap();
        let circuit = b.finish().unwrap();
        assert_eq!(regs.len(), 1);
        // A self-recurrent kernel is a leaf (no feed-forward inputs) and a
        // sink (no same-cycle consumers).
        assert_eq!(circuit.order(), &[0]);
        assert_eq!(circuit.sinks(), &[0]);
    }

    #[test]
    fn test_initial_value_size_mismatch_is_hard_error() {
        let mut b = CircuitBuilder::new();
        let err = b
            .add_kernel(KernelSpec::device(
                Opcode::new("acc"),
                vec![],
                vec![OutputSpec::recurrent_f32(ft(), &[0.0; 3])], // needs 4
                "__kernel void acc_1(__global float* next) {}",
                WorkGroupShape::linear(4),
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Circuit(_)));
    }
}
