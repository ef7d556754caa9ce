//! Jobs and worker execution
//!
//! A [`Job`] pairs a payload with the action that consumes it. Workers run a
//! job exactly once, time it, and contain any failure so it never reaches the
//! control loop.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::metrics::MetricsCollector;
use crate::observer::{ObserverSet, PoolFault};

/// Boxed job action
pub type JobAction<T> = Box<dyn FnOnce(T) -> Result<(), String> + Send>;

/// Return types accepted from job actions
///
/// Implemented for `()` and for `Result<(), E>` with a displayable error, so
/// both infallible closures and `?`-style closures can be submitted.
pub trait IntoJobResult {
    fn into_job_result(self) -> Result<(), String>;
}

impl IntoJobResult for () {
    fn into_job_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> IntoJobResult for Result<(), E> {
    fn into_job_result(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// A unit of work: payload plus the action that consumes it
pub struct Job<T> {
    payload: T,
    action: JobAction<T>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new<F, R>(payload: T, action: F) -> Self
    where
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoJobResult,
    {
        Self {
            payload,
            action: Box::new(move |payload| action(payload).into_job_result()),
        }
    }
}

impl<T> Job<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the job without running it
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Run the action, record its duration and report any fault.
    ///
    /// Never panics: a panicking action is caught and reported as
    /// [`PoolFault::JobPanicked`].
    pub(crate) fn execute(self, metrics: &MetricsCollector, observers: &ObserverSet) -> JobOutcome {
        let Job { payload, action } = self;

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(move || action(payload)));
        let elapsed = started.elapsed();

        metrics.record_duration(elapsed);

        let outcome = match result {
            Ok(Ok(())) => JobOutcome::Completed(elapsed),
            Ok(Err(message)) => JobOutcome::Failed(message),
            Err(panic) => JobOutcome::Panicked(panic_message(panic.as_ref())),
        };

        match &outcome {
            JobOutcome::Completed(elapsed) => {
                trace!(elapsed_us = elapsed.as_micros() as u64, "Job completed");
            }
            JobOutcome::Failed(message) => {
                warn!(error = %message, "Job failed");
                metrics.record_fault();
                observers.fault(PoolFault::JobFailed(message.clone()));
            }
            JobOutcome::Panicked(message) => {
                warn!(panic = %message, "Job panicked");
                metrics.record_fault();
                observers.fault(PoolFault::JobPanicked(message.clone()));
            }
        }

        outcome
    }
}

impl<T: fmt::Debug> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(Duration),
    Failed(String),
    Panicked(String),
}

impl JobOutcome {
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Completed(_))
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
