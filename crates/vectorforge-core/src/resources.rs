//! Memory and device accounting with bounded execution.
//!
//! The manager owns the configured ceilings and the selected compute
//! device; callers gate expensive work through
//! [`ResourceManager::execute_with_resources`], which fails fast when
//! the budget would be exceeded.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Compute device the pipeline may target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host CPU
    Cpu,
    /// GPU accelerator
    Gpu,
}

impl Device {
    /// Whether the device participates in GPU memory accounting
    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu)
    }
}

/// Device availability and GPU accounting capability
///
/// Adapter-supplied; the core never talks to an accelerator runtime
/// directly. [`NoGpu`] is the default probe for CPU-only deployments.
pub trait DeviceProbe: Send + Sync {
    /// Whether the device exists at all
    fn is_available(&self, device: Device) -> bool;

    /// Probe the device by attempting a small allocation
    fn probe_allocation(&self, device: Device) -> bool;

    /// Current GPU memory usage, when the runtime exposes it
    fn gpu_memory_used_mb(&self) -> Option<f64>;
}

/// Probe for deployments without an accelerator
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGpu;

impl DeviceProbe for NoGpu {
    fn is_available(&self, device: Device) -> bool {
        device == Device::Cpu
    }

    fn probe_allocation(&self, device: Device) -> bool {
        device == Device::Cpu
    }

    fn gpu_memory_used_mb(&self) -> Option<f64> {
        None
    }
}

/// Resource ceilings and device preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Resident memory ceiling in MB
    pub max_memory_mb: f64,
    /// GPU memory ceiling in MB, when a GPU is in play
    pub max_gpu_memory_mb: Option<f64>,
    /// Preferred compute device
    pub target_device: Device,
    /// Device used when the target is unavailable
    pub fallback_device: Device,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 4096.0,
            max_gpu_memory_mb: None,
            target_device: Device::Cpu,
            fallback_device: Device::Cpu,
        }
    }
}

/// Manages compute resources for pipeline operations
pub struct ResourceManager {
    limits: ResourceLimits,
    device: Device,
    probe: Arc<dyn DeviceProbe>,
    system: Mutex<System>,
    pid: Pid,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("limits", &self.limits)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Create a manager, selecting the compute device up front
    #[must_use]
    pub fn new(limits: ResourceLimits, probe: Arc<dyn DeviceProbe>) -> Self {
        let device = Self::select_device(&limits, probe.as_ref());
        debug!(?device, max_memory_mb = limits.max_memory_mb, "resource manager initialized");
        Self {
            limits,
            device,
            probe,
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Create a CPU-only manager
    #[must_use]
    pub fn cpu_only(limits: ResourceLimits) -> Self {
        Self::new(limits, Arc::new(NoGpu))
    }

    fn select_device(limits: &ResourceLimits, probe: &dyn DeviceProbe) -> Device {
        let target = limits.target_device;
        if target == limits.fallback_device {
            return target;
        }
        if !probe.is_available(target) {
            warn!(?target, "requested device unavailable, falling back");
            return limits.fallback_device;
        }
        if !probe.probe_allocation(target) {
            warn!(?target, "device probe allocation failed, falling back");
            return limits.fallback_device;
        }
        target
    }

    /// The configured ceilings
    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The device selected at construction
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Current resident memory of this process in MB
    #[must_use]
    pub fn current_memory_mb(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_process(self.pid);
        system
            .process(self.pid)
            .map_or(0.0, |p| p.memory() as f64 / 1024.0 / 1024.0)
    }

    /// Whether an operation needing `required_mb` fits under the ceilings
    #[must_use]
    pub fn check_memory(&self, required_mb: f64) -> bool {
        if self.current_memory_mb() + required_mb > self.limits.max_memory_mb {
            return false;
        }
        if self.device.is_gpu() {
            if let Some(gpu_ceiling) = self.limits.max_gpu_memory_mb {
                let gpu_used = self.probe.gpu_memory_used_mb().unwrap_or(0.0);
                if gpu_used + required_mb > gpu_ceiling {
                    return false;
                }
            }
        }
        true
    }

    /// Memory still available under the effective ceiling, in MB
    #[must_use]
    pub fn available_memory_mb(&self) -> f64 {
        let mut ceiling = self.limits.max_memory_mb;
        if self.device.is_gpu() {
            if let Some(gpu_ceiling) = self.limits.max_gpu_memory_mb {
                ceiling = ceiling.min(gpu_ceiling);
            }
        }
        (ceiling - self.current_memory_mb()).max(0.0)
    }

    /// Shrink a requested batch size to what fits in available memory
    #[must_use]
    pub fn optimize_batch_size(&self, requested: usize, item_mb: f64) -> usize {
        if item_mb <= 0.0 {
            return requested;
        }
        let max_items = (self.available_memory_mb() / item_mb).floor() as usize;
        requested.min(max_items)
    }

    /// Run `op` after a fail-fast memory check
    ///
    /// Returns `ResourceExhausted` without running when the budget is
    /// exceeded; failures inside `op` are wrapped as `Resource` with
    /// the cause preserved.
    pub async fn execute_with_resources<T, F>(&self, op: F, required_mb: f64) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.check_memory(required_mb) {
            return Err(Error::ResourceExhausted {
                required_mb,
                available_mb: self.available_memory_mb(),
            });
        }
        op.await.map_err(|e| Error::Resource {
            message: "resource-gated operation failed".into(),
            source: Some(Box::new(e)),
        })
    }
}
