//! OpenCL platform and device discovery.
//!
//! Enumerates every device of every installed platform, orders GPU devices
//! ahead of CPU devices, and applies the configured vendor filter. The
//! selected descriptor is then handed to [`crate::device::Device::open`],
//! which owns the context and queues for that device.

use log::{debug, warn};
use opencl3::device::{Device as ClDevice, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU};
use opencl3::platform::get_platforms;
use opencl3::types::cl_device_id;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Device vendor, recognized from the vendor string. Drives the per-vendor
/// event-wait workaround and the warp-size code-generation parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Other,
}

impl Vendor {
    /// Recognize a vendor from an OpenCL vendor string.
    pub fn from_vendor_string(vendor: &str) -> Self {
        let v = vendor.to_ascii_lowercase();
        if v.contains("nvidia") {
            Vendor::Nvidia
        } else if v.contains("advanced micro devices") || v.contains("amd") {
            Vendor::Amd
        } else if v.contains("intel") {
            Vendor::Intel
        } else {
            Vendor::Other
        }
    }

    /// SIMD execution width the vendor's compiler assumes: the NVIDIA warp,
    /// the AMD wavefront, the Intel subgroup. Feeds code generation only.
    pub fn warp_size(&self) -> usize {
        match self {
            Vendor::Nvidia => 32,
            Vendor::Amd => 64,
            Vendor::Intel => 16,
            Vendor::Other => 1,
        }
    }
}

/// One discovered compute device, not yet opened.
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub(crate) id: cl_device_id,
    /// Human-readable device name.
    pub name: String,
    /// Vendor string as reported by the driver.
    pub vendor_string: String,
    /// Recognized vendor.
    pub vendor: Vendor,
    /// Whether this is a GPU (vs a CPU-as-device).
    pub is_gpu: bool,
    /// Name of the platform the device belongs to.
    pub platform_name: String,
}

impl std::fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("is_gpu", &self.is_gpu)
            .field("platform", &self.platform_name)
            .finish()
    }
}

impl DeviceDescriptor {
    fn matches_filter(&self, filter: &str) -> bool {
        let f = filter.to_ascii_lowercase();
        self.vendor_string.to_ascii_lowercase().contains(&f)
            || self.name.to_ascii_lowercase().contains(&f)
            || self.platform_name.to_ascii_lowercase().contains(&f)
    }
}

/// Discovered OpenCL world: every device of every platform, GPUs first.
pub struct Platform {
    devices: Vec<DeviceDescriptor>,
}

impl Platform {
    /// Enumerate all platforms and devices. GPU devices are listed before
    /// CPU devices; relative order within a class follows platform order.
    ///
    /// Returns an error only if no OpenCL runtime is installed at all; an
    /// installed runtime with zero devices yields an empty listing.
    pub fn discover() -> Result<Self> {
        let platforms = get_platforms()
            .map_err(|e| EngineError::NoDevice(format!("platform enumeration failed: {:?}", e)))?;

        let mut gpus = Vec::new();
        let mut cpus = Vec::new();

        for platform in &platforms {
            let platform_name = platform.name().unwrap_or_else(|_| "Unknown".into());

            for (device_type, out) in [
                (CL_DEVICE_TYPE_GPU, &mut gpus),
                (CL_DEVICE_TYPE_CPU, &mut cpus),
            ] {
                let ids = match platform.get_devices(device_type) {
                    Ok(ids) => ids,
                    Err(_) => continue, // platform has no devices of this type
                };
                for id in ids {
                    let cl = ClDevice::new(id);
                    let name = cl.name().unwrap_or_else(|_| "Unknown".into());
                    let vendor_string = cl.vendor().unwrap_or_else(|_| "Unknown".into());
                    let vendor = Vendor::from_vendor_string(&vendor_string);
                    out.push(DeviceDescriptor {
                        id,
                        name: name.trim().to_string(),
                        vendor_string: vendor_string.trim().to_string(),
                        vendor,
                        is_gpu: device_type == CL_DEVICE_TYPE_GPU,
                        platform_name: platform_name.clone(),
                    });
                }
            }
        }

        let mut devices = gpus;
        devices.append(&mut cpus);
        debug!("discovered {} OpenCL device(s)", devices.len());
        Ok(Platform { devices })
    }

    /// All discovered devices, GPUs first.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Select a device per the configuration: apply the vendor filter, then
    /// either the explicit index or the first device in preference order.
    pub fn select(&self, config: &EngineConfig) -> Result<&DeviceDescriptor> {
        let filtered: Vec<&DeviceDescriptor> = self
            .devices
            .iter()
            .filter(|d| match &config.vendor_filter {
                Some(f) => d.matches_filter(f),
                None => true,
            })
            .collect();

        if filtered.is_empty() {
            return Err(EngineError::NoDevice(format!(
                "no device matches filter {:?} among {} discovered",
                config.vendor_filter,
                self.devices.len()
            )));
        }

        let selected = match config.device_index {
            Some(i) => *filtered.get(i).ok_or_else(|| {
                EngineError::NoDevice(format!(
                    "device index {} out of range (available: {})",
                    i,
                    filtered.len()
                ))
            })?,
            None => {
                if config.prefer_gpu {
                    filtered[0] // listing is already GPU-first
                } else {
                    *filtered.iter().find(|d| !d.is_gpu).unwrap_or(&filtered[0])
                }
            }
        };

        if !selected.is_gpu {
            warn!(
                "selected CPU-as-device '{}'; expect reduced throughput",
                selected.name
            );
        }
        debug!(
            "selected device '{}' ({}) on platform '{}'",
            selected.name, selected.vendor_string, selected.platform_name
        );
        Ok(selected)
    }

}
