//! Simulation driver: the user-facing surface over a bound circuit.
//!
//! Owns the single controlling thread model: `step()` drives cycles from
//! the calling thread, `run()`/`stop()` move stepping onto one worker
//! thread, and probes (`read_field`) interleave between cycles under the
//! runtime lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error};

use super::executor::CircuitRuntime;
use super::{CircuitSpec, RegisterId};
use crate::config::EngineConfig;
use crate::device::buffer::CpuReadGuard;
use crate::device::Device;
use crate::error::{EngineError, Result};
use crate::field::FieldType;
use crate::platform::Platform;

/// A populated CPU view of one field, handed to `read_field` callbacks.
/// The underlying buffer stays borrowed for the lifetime of the view, so a
/// field has at most one outstanding read at a time.
pub struct FieldData<'a> {
    bytes: CpuReadGuard<'a>,
    field_type: FieldType,
}

impl FieldData<'_> {
    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Typed view for f32-component fields.
    pub fn as_f32(&self) -> &[f32] {
        self.bytes.as_f32()
    }
}

struct SimulatorShared {
    runtime: Mutex<CircuitRuntime>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Drives a compiled circuit through simulation cycles.
pub struct Simulator {
    shared: Arc<SimulatorShared>,
}

impl Simulator {
    /// Bind `circuit` to an already-opened device.
    pub fn new(device: Arc<Device>, circuit: CircuitSpec) -> Result<Self> {
        let runtime = CircuitRuntime::bind(device, circuit)?;
        Ok(Simulator {
            shared: Arc::new(SimulatorShared {
                runtime: Mutex::new(runtime),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Discover, select, and open a device per `config`, then bind
    /// `circuit` to it.
    pub fn with_selected_device(circuit: CircuitSpec, config: &EngineConfig) -> Result<Self> {
        let platform = Platform::discover()?;
        let descriptor = platform.select(config)?;
        let device = Device::open(descriptor, config)?;
        Self::new(device, circuit)
    }

    /// Advance the circuit by one cycle. Returns total cycles executed.
    pub fn step(&self) -> Result<u64> {
        self.ensure_not_running("step")?;
        self.shared.runtime.lock().unwrap().step()
    }

    /// Advance the circuit by `count` cycles.
    pub fn step_n(&self, count: u64) -> Result<u64> {
        self.ensure_not_running("step")?;
        let mut runtime = self.shared.runtime.lock().unwrap();
        let mut cycle = runtime.cycle();
        for _ in 0..count {
            cycle = runtime.step()?;
        }
        Ok(cycle)
    }

    /// Start free-running execution on a worker thread.
    pub fn run(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Driver("already free-running".into()));
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || -> Result<()> {
            while shared.running.load(Ordering::SeqCst) {
                let mut runtime = shared.runtime.lock().unwrap();
                if let Err(e) = runtime.step() {
                    error!("free-running step failed: {}", e);
                    shared.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
            Ok(())
        });
        *self.shared.worker.lock().unwrap() = Some(handle);
        debug!("free-running started");
        Ok(())
    }

    /// Stop free-running execution, surfacing any error the worker hit.
    /// Returns total cycles executed.
    pub fn stop(&self) -> Result<u64> {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self.shared.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(EngineError::Driver("worker thread panicked".into())),
            }
        }
        debug!("free-running stopped");
        Ok(self.cycle())
    }

    /// Whether the circuit is currently free-running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Reinitialize all stateful fields to their declared initial values
    /// and re-zero the cycle counter.
    pub fn reset(&self) -> Result<()> {
        self.ensure_not_running("reset")?;
        self.shared.runtime.lock().unwrap().reset()
    }

    /// Cycles executed since the last reset.
    pub fn cycle(&self) -> u64 {
        self.shared.runtime.lock().unwrap().cycle()
    }

    /// Read a field's current value, invoking `callback` with the
    /// populated CPU view. The view is released when the callback returns,
    /// honoring the single-outstanding-read-per-field contract.
    pub fn read_field<R>(
        &self,
        id: RegisterId,
        callback: impl FnOnce(&FieldData<'_>) -> R,
    ) -> Result<R> {
        let runtime = self.shared.runtime.lock().unwrap();
        let field_type = runtime.register_field_type(id)?;
        let bytes = runtime.read_register(id)?;
        let data = FieldData { bytes, field_type };
        Ok(callback(&data))
    }

    /// Labels of the kernels submitted last cycle, in submission order.
    pub fn submission_trace(&self) -> Vec<String> {
        self.shared.runtime.lock().unwrap().submission_trace()
    }

    /// Tear down the circuit and hand its resources back to the device.
    pub fn release(&self) -> Result<()> {
        self.ensure_not_running("release")?;
        self.shared.runtime.lock().unwrap().release();
        Ok(())
    }

    fn ensure_not_running(&self, what: &str) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(EngineError::Driver(format!(
                "cannot {} while free-running; call stop() first",
                what
            )));
        }
        Ok(())
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        // Best-effort stop of a forgotten free run.
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.shared.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
