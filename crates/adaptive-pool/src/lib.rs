//! # Adaptive Worker Pool
//!
//! A CPU-aware worker pool that decides how many jobs run at once from host
//! load, instead of a fixed thread count.
//!
//! ## Features
//!
//! - **Adaptive concurrency**: target concurrency ramps up while CPU has
//!   headroom and steps down when smoothed CPU crosses the ceiling
//! - **Admission control**: producers wait while CPU is saturated or the
//!   queue is deeper than `target * queue_buffer_multiplier`
//! - **Fault isolation**: failing or panicking jobs are reported to observers
//!   and never reach the control loop
//! - **Pause/resume and graceful shutdown**
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CpuMonitor                            │
//! │  (sysinfo, manual, or no-op: "how busy is the host")        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       AdaptivePool                           │
//! │  (admission, control loop, worker launch and bookkeeping)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               MetricsCollector / PoolObserver                │
//! │  (snapshots, cpu readings, adjustments, faults)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use adaptive_pool::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), PoolError> {
//! let (observer, mut events) = ChannelObserver::new();
//!
//! let pool = AdaptivePool::builder(PoolSettings::new().with_max_cpu_usage(75.0))
//!     .observer(Arc::new(observer))
//!     .build()?;
//!
//! for n in 0..1_000u64 {
//!     pool.submit(n, |n| -> Result<(), String> {
//!         if n % 97 == 0 {
//!             return Err(format!("{n} is unlucky"));
//!         }
//!         Ok(())
//!     })
//!     .await?;
//! }
//!
//! pool.wait_for_idle().await?;
//! while let Ok(event) = events.try_recv() {
//!     if let PoolEvent::Fault(fault) = event {
//!         eprintln!("{fault}");
//!     }
//! }
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod metrics;
pub mod monitor;
pub mod observer;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, PoolSettings};
    pub use crate::metrics::MetricsSnapshot;
    pub use crate::monitor::{CpuMonitor, ManualCpuMonitor, NoopCpuMonitor, SystemCpuMonitor};
    pub use crate::observer::{ChannelObserver, PoolEvent, PoolFault, PoolObserver};
    pub use crate::worker::{AdaptivePool, Job, PoolError, PoolStatus};
}

// Re-export key types at crate root
pub use config::{ConfigError, PoolSettings};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use monitor::{CpuMonitor, ManualCpuMonitor, MonitorError, NoopCpuMonitor, SystemCpuMonitor};
pub use observer::{
    ChannelObserver, ObserverSet, PoolEvent, PoolFault, PoolObserver, TracingObserver,
};
pub use worker::{
    AdaptivePool, Adjustment, Admission, IntoJobResult, Job, PoolBuilder, PoolError, PoolStatus,
    Rejected,
};
