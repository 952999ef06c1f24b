//! Cog: a synchronous-dataflow kernel-circuit execution engine.
//!
//! Cog executes static dataflow circuits of tensor fields in lock-step
//! simulation cycles on OpenCL devices. The front-end compiler (a separate
//! layer) lowers field/operator algebra into a DAG of abstract kernels
//! wired through virtual field registers; this crate is the engine that
//! binds that DAG to a device and runs it.
//!
//! # Architecture
//!
//! - **field**: immutable field type descriptors (shape, tensor, element)
//! - **platform**: device enumeration and GPU-preferred selection
//! - **device**: one physical device: command queue pair, program cache,
//!   field buffers, live-resource registries
//! - **circuit**: circuit description, the two-phase execution protocol,
//!   and the simulation driver
//!
//! # Execution model
//!
//! A single controlling thread drives every cycle: recurrent registers
//! clock first, then every kernel launches in dependency order with its
//! producers' completion events as the wait condition, then the host
//! blocks once on the sink kernels' events, and finally every completion
//! status is validated. Parallelism comes from the device, not from
//! host-side threads.

// ============================================================================
// Core Modules
// ============================================================================

pub mod circuit;
pub mod config;
pub mod device;
pub mod error;
pub mod field;
pub mod platform;

// ============================================================================
// Re-exports
// ============================================================================

pub use circuit::{
    CircuitBuilder, CircuitSpec, CpuKernelContext, CpuKernelRoutine, FieldData, Input, KernelBody,
    KernelSpec, Opcode, OutputSpec, RegisterClass, RegisterId, Simulator, WorkGroupShape,
};
pub use config::EngineConfig;
pub use device::buffer::{BufferKind, FieldBuffer};
pub use device::{CodeGenParams, Device};
pub use error::{EngineError, Result};
pub use field::{ElementType, FieldShape, FieldType, TensorShape};
pub use platform::{DeviceDescriptor, Platform, Vendor};

// ============================================================================
// Prelude
// ============================================================================

/// Commonly used types and traits.
pub mod prelude {
    pub use crate::circuit::{
        CircuitBuilder, CpuKernelContext, CpuKernelRoutine, Input, KernelSpec, Opcode, OutputSpec,
        RegisterId, Simulator, WorkGroupShape,
    };
    pub use crate::config::EngineConfig;
    pub use crate::device::buffer::BufferKind;
    pub use crate::device::Device;
    pub use crate::error::{EngineError, Result};
    pub use crate::field::{ElementType, FieldShape, FieldType, TensorShape};
    pub use crate::platform::Platform;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #[test]
    fn test_facade_compiles() {
        use super::prelude::*;
        let ft = FieldType::scalar_f32(FieldShape::d1(8));
        assert_eq!(ft.byte_size(), 32);
        let _ = EngineConfig::default();
    }
}
