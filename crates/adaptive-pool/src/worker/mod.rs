//! Adaptive worker pool
//!
//! This module provides:
//! - [`AdaptivePool`] - Queue, control loop and worker bookkeeping
//! - [`ConcurrencyController`] - The CPU-driven concurrency algorithm
//! - [`AdmissionState`] - Producer-side gate on CPU and queue depth
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       AdaptivePool                           │
//! │                                                              │
//! │  producers ──► AdmissionState ──► Job Queue (crossbeam)     │
//! │                  (cpu, queue       │                         │
//! │                   vs target)       │                         │
//! │                      ▲             ▼                         │
//! │  ┌───────────────────┴──────────────────────────────────┐   │
//! │  │                 Control Loop (tick)                   │   │
//! │  │  1. sample CpuMonitor, smooth (EMA)                   │   │
//! │  │  2. ConcurrencyController::adjust -> target           │   │
//! │  │  3. prune finished, launch while running < target     │   │
//! │  └───────────────────────┬──────────────────────────────┘   │
//! │                          ▼                                   │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │          Workers (tokio blocking pool)              │    │
//! │  │  [Job 1] [Job 2] ... [Job target]                   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │          │ durations                │ faults                 │
//! │          ▼                          ▼                        │
//! │   MetricsCollector             ObserverSet                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use adaptive_pool::{AdaptivePool, PoolSettings};
//!
//! # async fn run() -> Result<(), adaptive_pool::PoolError> {
//! let settings = PoolSettings::new()
//!     .with_max_cpu_usage(70.0)
//!     .with_max_degree_of_parallelism(8);
//!
//! let pool = AdaptivePool::new(settings)?;
//!
//! pool.submit("report.csv".to_string(), |path| {
//!     println!("processing {path}");
//! })
//! .await?;
//!
//! pool.wait_for_idle().await?;
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod admission;
mod controller;
mod job;
mod pool;

pub use admission::{Admission, AdmissionState};
pub use controller::{
    Adjustment, ConcurrencyController, HEADROOM_BUFFER, SHORT_JOB_THRESHOLD, SMOOTHING_FACTOR,
};
pub use job::{IntoJobResult, Job, JobAction, JobOutcome};
pub use pool::{AdaptivePool, PoolBuilder, PoolError, PoolStatus, Rejected};
