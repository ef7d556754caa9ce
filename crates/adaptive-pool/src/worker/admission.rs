//! Admission control for producers
//!
//! Decides whether a new job may enter the queue, based on smoothed CPU and
//! queue depth relative to target concurrency.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::metrics::AtomicF64;

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    /// The job may be enqueued
    Admit,
    /// Smoothed CPU is above the configured ceiling
    CpuSaturated { smoothed_cpu: f64, ceiling: f64 },
    /// The queue holds more than `limit` jobs
    QueueFull { queue_len: usize, limit: usize },
}

impl Admission {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admit => write!(f, "admit"),
            Self::CpuSaturated {
                smoothed_cpu,
                ceiling,
            } => write!(f, "cpu {smoothed_cpu:.1}% above ceiling {ceiling:.1}%"),
            Self::QueueFull { queue_len, limit } => {
                write!(f, "queue length {queue_len} exceeds limit {limit}")
            }
        }
    }
}

/// Admission state shared between the control loop (writer) and producers (readers)
///
/// Target concurrency and smoothed CPU are plain atomics. A producer may read a
/// value one tick stale; the next check corrects it.
#[derive(Debug)]
pub struct AdmissionState {
    max_cpu_usage: f64,
    throttling: bool,
    buffer_multiplier: usize,
    target: AtomicUsize,
    smoothed_cpu: AtomicF64,
}

impl AdmissionState {
    pub fn new(
        max_cpu_usage: f64,
        throttling: bool,
        buffer_multiplier: usize,
        initial_target: usize,
    ) -> Self {
        Self {
            max_cpu_usage,
            throttling,
            buffer_multiplier: buffer_multiplier.max(1),
            target: AtomicUsize::new(initial_target.max(1)),
            smoothed_cpu: AtomicF64::new(0.0),
        }
    }

    /// Check whether a job may enter a queue currently holding `queue_len` jobs
    pub fn check(&self, queue_len: usize) -> Admission {
        if self.throttling {
            let smoothed_cpu = self.smoothed_cpu.load();
            if smoothed_cpu > self.max_cpu_usage {
                return Admission::CpuSaturated {
                    smoothed_cpu,
                    ceiling: self.max_cpu_usage,
                };
            }
        }

        let limit = self.queue_limit();
        if queue_len > limit {
            return Admission::QueueFull { queue_len, limit };
        }

        Admission::Admit
    }

    /// Queue length above which producers are held back
    pub fn queue_limit(&self) -> usize {
        self.target().saturating_mul(self.buffer_multiplier)
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    pub fn set_target(&self, target: usize) {
        self.target.store(target.max(1), Ordering::Release);
    }

    pub fn smoothed_cpu(&self) -> f64 {
        self.smoothed_cpu.load()
    }

    pub fn set_smoothed_cpu(&self, value: f64) {
        self.smoothed_cpu.store(value);
    }

    pub fn throttling(&self) -> bool {
        self.throttling
    }
}
