//! Error types for the execution engine.

use thiserror::Error;

/// Main error type for engine operations.
///
/// Warnings (pinned-memory downgrades, unsupported queue capabilities) are
/// logged and never surface here. Internal consistency violations (bugs in
/// the engine itself, such as releasing a buffer the device does not track)
/// panic immediately instead of returning an error.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// No OpenCL platform or device satisfied the selection criteria.
    #[error("no usable OpenCL device: {0}")]
    NoDevice(String),

    /// A device or memory object could not be allocated.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// A host<->device transfer reported an error completion status.
    #[error("transfer failed in {routine}: {detail}")]
    TransferFailed {
        routine: &'static str,
        detail: String,
    },

    /// Kernel source text could not be parsed for an entry point.
    #[error("invalid kernel source: {0}")]
    InvalidKernelSource(String),

    /// The monolithic device program failed to build. Fatal: a broken
    /// program makes the whole circuit unusable. Carries the full
    /// concatenated source for diagnosis.
    #[error("kernel program build failed: {detail}\n--- program source ---\n{program_source}")]
    BuildFailed {
        detail: String,
        program_source: String,
    },

    /// A compiled entry point was missing from the built program. Indicates
    /// a source/name mismatch between registration and instantiation.
    #[error("kernel entry point '{0}' not found in built program")]
    KernelNotFound(String),

    /// A kernel's completion event reported an error status. Fatal at step
    /// granularity: the step containing the failing kernel did not complete.
    #[error("kernel '{kernel}' failed with execution status {status}")]
    KernelExecutionFailed { kernel: String, status: i32 },

    /// The circuit handed to the engine is malformed (unknown register
    /// reference, feedback into a non-recurrent register, initial value of
    /// the wrong size, ...).
    #[error("invalid circuit: {0}")]
    Circuit(String),

    /// A queue or device operation failed outside the cases above.
    #[error("device error in {routine}: {detail}")]
    Device {
        routine: &'static str,
        detail: String,
    },

    /// A CPU kernel routine reported a failure.
    #[error("cpu kernel '{kernel}' failed: {detail}")]
    CpuKernelFailed { kernel: String, detail: String },

    /// The simulation driver was used inconsistently (e.g. `run()` while
    /// already free-running).
    #[error("driver error: {0}")]
    Driver(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::KernelExecutionFailed {
            kernel: "add_f00d".into(),
            status: -36,
        };
        assert!(err.to_string().contains("add_f00d"));
        assert!(err.to_string().contains("-36"));

        let err = EngineError::TransferFailed {
            routine: "read_buffer",
            detail: "CL_OUT_OF_RESOURCES".into(),
        };
        assert!(err.to_string().contains("read_buffer"));
    }

    #[test]
    fn test_build_failure_carries_source() {
        let err = EngineError::BuildFailed {
            detail: "syntax error".into(),
            program_source: "__kernel void broken(".into(),
        };
        assert!(err.to_string().contains("__kernel void broken("));
    }
}
