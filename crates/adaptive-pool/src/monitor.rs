//! CPU utilization sources
//!
//! The control loop only ever asks one question, "how busy is the host right
//! now, 0 to 100". Platform sampling lives behind [`CpuMonitor`] so it never
//! leaks into the controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, RefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::metrics::AtomicF64;

/// CPU sampling errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonitorError {
    /// The platform cannot report CPU usage
    #[error("cpu usage is unavailable: {0}")]
    Unavailable(String),

    /// The sampler produced a value that is not a percentage
    #[error("invalid cpu reading: {0}")]
    InvalidReading(f64),
}

/// Capability: report current host CPU utilization
///
/// Implementations must be cheap to call; the control loop samples once per tick.
pub trait CpuMonitor: Send + Sync {
    /// Current utilization in percent, `0.0..=100.0`
    fn current_usage(&self) -> Result<f64, MonitorError>;

    /// A no-op monitor disables CPU-based throttling entirely
    fn is_noop(&self) -> bool {
        false
    }

    /// Human-readable name for logging
    fn name(&self) -> &'static str {
        "CpuMonitor"
    }
}

impl<M: CpuMonitor + ?Sized> CpuMonitor for Arc<M> {
    fn current_usage(&self) -> Result<f64, MonitorError> {
        (**self).current_usage()
    }

    fn is_noop(&self) -> bool {
        (**self).is_noop()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Monitor that always reports 0% and turns CPU throttling off
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCpuMonitor;

impl CpuMonitor for NoopCpuMonitor {
    fn current_usage(&self) -> Result<f64, MonitorError> {
        Ok(0.0)
    }

    fn is_noop(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "NoopCpuMonitor"
    }
}

/// Host-wide CPU monitor backed by `sysinfo`
///
/// sysinfo needs a minimum gap between refreshes to produce a meaningful
/// value. Calls arriving faster than that return the last reading.
pub struct SystemCpuMonitor {
    state: Mutex<SystemState>,
}

struct SystemState {
    system: System,
    last_refresh: Instant,
    last_usage: f64,
}

impl SystemCpuMonitor {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        // First refresh establishes the baseline for the next delta
        system.refresh_cpu_usage();

        Self {
            state: Mutex::new(SystemState {
                system,
                last_refresh: Instant::now(),
                last_usage: 0.0,
            }),
        }
    }
}

impl Default for SystemCpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemCpuMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCpuMonitor")
            .field("last_usage", &self.state.lock().last_usage)
            .finish()
    }
}

impl CpuMonitor for SystemCpuMonitor {
    fn current_usage(&self) -> Result<f64, MonitorError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(MonitorError::Unavailable(
                "platform not supported by sysinfo".to_string(),
            ));
        }

        let mut state = self.state.lock();
        if state.last_refresh.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL {
            state.system.refresh_cpu_usage();
            state.last_refresh = Instant::now();

            let usage = state.system.global_cpu_usage() as f64;
            if !usage.is_finite() {
                return Err(MonitorError::InvalidReading(usage));
            }
            state.last_usage = usage.clamp(0.0, 100.0);
        }

        Ok(state.last_usage)
    }

    fn name(&self) -> &'static str {
        "SystemCpuMonitor"
    }
}

/// Monitor whose reading is set by hand
///
/// Used for tests and simulations. Can also be told to fail, to exercise the
/// controller's "no signal this tick" path.
#[derive(Debug, Default)]
pub struct ManualCpuMonitor {
    usage: AtomicF64,
    failing: AtomicBool,
}

impl ManualCpuMonitor {
    pub fn new(usage: f64) -> Self {
        Self {
            usage: AtomicF64::new(usage),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_usage(&self, usage: f64) {
        self.usage.store(usage);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl CpuMonitor for ManualCpuMonitor {
    fn current_usage(&self) -> Result<f64, MonitorError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(MonitorError::Unavailable("manual monitor set to fail".into()));
        }
        let usage = self.usage.load();
        if !(0.0..=100.0).contains(&usage) {
            return Err(MonitorError::InvalidReading(usage));
        }
        Ok(usage)
    }

    fn name(&self) -> &'static str {
        "ManualCpuMonitor"
    }
}
