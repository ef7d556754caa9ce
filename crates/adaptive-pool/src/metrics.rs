//! Metrics collection for the pool
//!
//! Rolling job durations, concurrency, queue depth and smoothed CPU. Written by
//! workers and the control loop, read by callers through [`MetricsSnapshot`].
//! Reads may be slightly stale relative to concurrent writers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// `f64` stored as raw bits in an `AtomicU64`.
///
/// Single writer / many readers; loads never observe a torn value.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Bounded window of recent durations. Oldest samples are evicted first.
#[derive(Debug)]
struct DurationWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
    sum: Duration,
}

impl DurationWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: Duration::ZERO,
        }
    }

    fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(evicted);
            }
        }
        self.samples.push_back(sample);
        self.sum = self.sum.saturating_add(sample);
    }

    fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum / self.samples.len() as u32)
    }
}

/// Point-in-time view of pool metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Highest concurrency ever observed
    pub max_concurrency: usize,
    /// Fastest job ever recorded
    pub best_duration: Option<Duration>,
    /// Slowest job ever recorded
    pub worst_duration: Option<Duration>,
    /// Average over the rolling window
    pub average_duration: Option<Duration>,
    /// Workers in flight at the last control loop tick
    pub current_concurrency: usize,
    /// Concurrency the controller is currently aiming for
    pub target_concurrency: usize,
    /// Jobs waiting in the queue at the last control loop tick
    pub queue_length: usize,
    /// Smoothed CPU utilization in percent
    pub smoothed_cpu: f64,
    /// Jobs that have finished, including faulted ones
    pub completed_jobs: u64,
    /// Jobs whose action failed or panicked
    pub faulted_jobs: u64,
}

/// Thread-safe metrics aggregator
#[derive(Debug)]
pub struct MetricsCollector {
    window: Mutex<DurationWindow>,
    best_micros: AtomicU64,
    worst_micros: AtomicU64,
    current_concurrency: AtomicUsize,
    max_concurrency: AtomicUsize,
    target_concurrency: AtomicUsize,
    queue_length: AtomicUsize,
    smoothed_cpu: AtomicF64,
    completed: AtomicU64,
    faulted: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector keeping at most `window` duration samples
    pub fn new(window: usize) -> Self {
        Self {
            window: Mutex::new(DurationWindow::new(window)),
            best_micros: AtomicU64::new(u64::MAX),
            worst_micros: AtomicU64::new(0),
            current_concurrency: AtomicUsize::new(0),
            max_concurrency: AtomicUsize::new(0),
            target_concurrency: AtomicUsize::new(0),
            queue_length: AtomicUsize::new(0),
            smoothed_cpu: AtomicF64::new(0.0),
            completed: AtomicU64::new(0),
            faulted: AtomicU64::new(0),
        }
    }

    /// Record a finished job's duration
    pub fn record_duration(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;

        self.window.lock().push(duration);
        self.best_micros.fetch_min(micros, Ordering::Relaxed);
        self.worst_micros.fetch_max(micros, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a job whose action faulted. Its duration is recorded separately.
    pub fn record_fault(&self) {
        self.faulted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the current number of in-flight workers
    pub fn record_concurrency(&self, n: usize) {
        self.current_concurrency.store(n, Ordering::Relaxed);
        self.max_concurrency.fetch_max(n, Ordering::Relaxed);
    }

    pub fn record_target_concurrency(&self, n: usize) {
        self.target_concurrency.store(n, Ordering::Relaxed);
    }

    pub fn record_queue_length(&self, n: usize) {
        self.queue_length.store(n, Ordering::Relaxed);
    }

    pub fn record_smoothed_cpu(&self, value: f64) {
        self.smoothed_cpu.store(value);
    }

    /// Average duration over the rolling window, if any job finished yet
    pub fn average_duration(&self) -> Option<Duration> {
        self.window.lock().average()
    }

    /// Number of samples currently held in the rolling window
    pub fn window_len(&self) -> usize {
        self.window.lock().samples.len()
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let best = self.best_micros.load(Ordering::Relaxed);
        let worst = self.worst_micros.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);

        MetricsSnapshot {
            max_concurrency: self.max_concurrency.load(Ordering::Relaxed),
            best_duration: (best != u64::MAX).then(|| Duration::from_micros(best)),
            worst_duration: (completed > 0).then(|| Duration::from_micros(worst)),
            average_duration: self.average_duration(),
            current_concurrency: self.current_concurrency.load(Ordering::Relaxed),
            target_concurrency: self.target_concurrency.load(Ordering::Relaxed),
            queue_length: self.queue_length.load(Ordering::Relaxed),
            smoothed_cpu: self.smoothed_cpu.load(),
            completed_jobs: completed,
            faulted_jobs: self.faulted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f64_round_trips_values() {
        let value = AtomicF64::new(12.5);
        assert_eq!(value.load(), 12.5);
        value.store(99.75);
        assert_eq!(value.load(), 99.75);
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = MetricsCollector::new(10);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.best_duration, None);
        assert_eq!(snapshot.worst_duration, None);
        assert_eq!(snapshot.average_duration, None);
        assert_eq!(snapshot.completed_jobs, 0);
    }

    #[test]
    fn test_record_duration_tracks_best_worst_average() {
        let metrics = MetricsCollector::new(10);
        for ms in [30, 10, 20] {
            metrics.record_duration(Duration::from_millis(ms));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.best_duration, Some(Duration::from_millis(10)));
        assert_eq!(snapshot.worst_duration, Some(Duration::from_millis(30)));
        assert_eq!(snapshot.average_duration, Some(Duration::from_millis(20)));
        assert_eq!(snapshot.completed_jobs, 3);
    }

    #[test]
    fn test_window_evicts_oldest_first() {
        let metrics = MetricsCollector::new(3);
        for ms in [100, 1, 2, 3] {
            metrics.record_duration(Duration::from_millis(ms));
        }

        assert_eq!(metrics.window_len(), 3);
        // 100ms sample evicted; best/worst are all-time
        assert_eq!(metrics.average_duration(), Some(Duration::from_millis(2)));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.worst_duration, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_window_never_exceeds_bound() {
        let metrics = MetricsCollector::new(5);
        for i in 0..1000 {
            metrics.record_duration(Duration::from_micros(i));
            assert!(metrics.window_len() <= 5);
        }
    }

    #[test]
    fn test_concurrency_tracks_running_max() {
        let metrics = MetricsCollector::new(10);
        metrics.record_concurrency(2);
        metrics.record_concurrency(5);
        metrics.record_concurrency(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.current_concurrency, 1);
        assert_eq!(snapshot.max_concurrency, 5);
    }

    #[test]
    fn test_overwrites() {
        let metrics = MetricsCollector::new(10);
        metrics.record_queue_length(7);
        metrics.record_queue_length(3);
        metrics.record_smoothed_cpu(42.0);
        metrics.record_target_concurrency(4);
        metrics.record_fault();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_length, 3);
        assert_eq!(snapshot.smoothed_cpu, 42.0);
        assert_eq!(snapshot.target_concurrency, 4);
        assert_eq!(snapshot.faulted_jobs, 1);
    }
}
