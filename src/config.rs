//! Engine configuration.
//!
//! A small typed value object consumed by device selection and buffer
//! allocation. File/CLI loading is the embedding application's concern.

use typed_builder::TypedBuilder;

use crate::device::buffer::BufferKind;

/// Configuration for platform selection and engine behavior.
///
/// ```
/// use cog::config::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .vendor_filter("NVIDIA")
///     .profiling(true)
///     .build();
/// assert!(config.prefer_gpu);
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineConfig {
    /// Prefer GPU devices over CPU devices during selection.
    #[builder(default = true)]
    pub prefer_gpu: bool,

    /// Case-insensitive substring matched against the device vendor and
    /// name; devices that do not match are skipped.
    #[builder(default, setter(into, strip_option))]
    pub vendor_filter: Option<String>,

    /// Explicit index into the filtered device list, overriding the
    /// GPU-first preference order.
    #[builder(default, setter(strip_option))]
    pub device_index: Option<usize>,

    /// Host memory kind used for field buffers created by the engine.
    #[builder(default = BufferKind::Direct)]
    pub default_buffer_kind: BufferKind,

    /// Request queue profiling. If the device rejects the capability it is
    /// simply not used (a warning is logged).
    #[builder(default = false)]
    pub profiling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::builder().build()
    }
}
