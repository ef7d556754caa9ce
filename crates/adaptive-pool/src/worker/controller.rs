//! Adaptive concurrency algorithm
//!
//! Pure state machine driven once per control loop tick: smooth the CPU
//! sample, then move the target concurrency by at most a small step. Kept free
//! of I/O and timers so every branch is testable synchronously.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// EMA weight given to the newest CPU sample
pub const SMOOTHING_FACTOR: f64 = 0.3;

/// Margin (percentage points) kept below the configured ceiling
pub const HEADROOM_BUFFER: f64 = 5.0;

/// Jobs faster than this ramp concurrency up two at a time
pub const SHORT_JOB_THRESHOLD: Duration = Duration::from_millis(100);

/// Outcome of one adjustment step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    /// CPU throttling disabled, target pinned to the maximum
    Pinned,
    /// CPU above the effective ceiling, target reduced by one
    Decreased,
    /// CPU comfortably below the ceiling, target raised
    Increased,
    /// Increase withheld because average job duration rose since the last tick
    HeldForContention,
    /// Nothing to do
    Unchanged,
}

/// Controller state owned by the control loop
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    max_parallelism: usize,
    max_cpu_usage: f64,
    throttling: bool,
    smoothed_cpu: f64,
    target: usize,
    baseline: Option<Duration>,
}

impl ConcurrencyController {
    /// Create a controller.
    ///
    /// With throttling on the target starts at 1 and ramps up; with it off the
    /// target starts (and stays) at `max_parallelism`.
    pub fn new(max_parallelism: usize, max_cpu_usage: f64, throttling: bool) -> Self {
        let max_parallelism = max_parallelism.max(1);
        Self {
            max_parallelism,
            max_cpu_usage,
            throttling,
            smoothed_cpu: 0.0,
            target: if throttling { 1 } else { max_parallelism },
            baseline: None,
        }
    }

    /// Fold a CPU sample into the moving average.
    ///
    /// `None` means the monitor gave no signal this tick; the average is left as is.
    /// A non-finite sample is treated the same way.
    pub fn observe(&mut self, sample: Option<f64>) -> f64 {
        if let Some(sample) = sample.filter(|s| s.is_finite()) {
            let sample = sample.clamp(0.0, 100.0);
            self.smoothed_cpu =
                SMOOTHING_FACTOR * sample + (1.0 - SMOOTHING_FACTOR) * self.smoothed_cpu;
        }
        self.smoothed_cpu
    }

    /// Recompute target concurrency from the smoothed CPU and the current
    /// average job duration. The average becomes the new contention baseline
    /// whichever branch is taken.
    pub fn adjust(&mut self, average: Option<Duration>) -> Adjustment {
        let outcome = self.decide(average);
        self.baseline = average;
        outcome
    }

    fn decide(&mut self, average: Option<Duration>) -> Adjustment {
        if !self.throttling {
            self.target = self.max_parallelism;
            return Adjustment::Pinned;
        }

        let ceiling = self.effective_ceiling();

        if self.smoothed_cpu > ceiling && self.target > 1 {
            self.target -= 1;
            return Adjustment::Decreased;
        }

        if self.smoothed_cpu < ceiling - HEADROOM_BUFFER && self.target < self.max_parallelism {
            if let (Some(baseline), Some(current)) = (self.baseline, average) {
                if current > baseline {
                    return Adjustment::HeldForContention;
                }
            }

            let step = if average.unwrap_or(Duration::ZERO) < SHORT_JOB_THRESHOLD {
                2
            } else {
                1
            };
            self.target = (self.target + step).min(self.max_parallelism);
            return Adjustment::Increased;
        }

        Adjustment::Unchanged
    }

    /// Ceiling the smoothed CPU is compared against
    pub fn effective_ceiling(&self) -> f64 {
        self.max_cpu_usage - HEADROOM_BUFFER
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn smoothed_cpu(&self) -> f64 {
        self.smoothed_cpu
    }

    pub fn baseline(&self) -> Option<Duration> {
        self.baseline
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    pub fn throttling(&self) -> bool {
        self.throttling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Option<Duration> {
        Some(Duration::from_millis(n))
    }

    /// Controller with its smoothed CPU driven close to `cpu`
    fn controller_at(cpu: f64, max: usize, ceiling: f64) -> ConcurrencyController {
        let mut c = ConcurrencyController::new(max, ceiling, true);
        for _ in 0..100 {
            c.observe(Some(cpu));
        }
        c
    }

    #[test]
    fn test_ema_smoothing() {
        let mut c = ConcurrencyController::new(4, 50.0, true);
        assert_eq!(c.observe(Some(100.0)), 30.0);
        let second = c.observe(Some(100.0));
        assert!((second - 51.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_sample_keeps_average() {
        let mut c = ConcurrencyController::new(4, 50.0, true);
        c.observe(Some(100.0));
        assert_eq!(c.observe(None), 30.0);
    }

    #[test]
    fn test_non_finite_sample_keeps_average() {
        let mut c = ConcurrencyController::new(4, 50.0, true);
        c.observe(Some(100.0));
        assert_eq!(c.observe(Some(f64::NAN)), 30.0);
        assert_eq!(c.observe(Some(f64::INFINITY)), 30.0);

        // still reacts to real readings afterwards
        for _ in 0..50 {
            c.observe(Some(100.0));
        }
        assert!(c.smoothed_cpu() > 99.0);
        c.target = 3;
        assert_eq!(c.adjust(ms(10)), Adjustment::Decreased);
        assert_eq!(c.target(), 2);
    }

    #[test]
    fn test_samples_are_clamped() {
        let mut c = ConcurrencyController::new(4, 50.0, true);
        assert_eq!(c.observe(Some(250.0)), 30.0);
    }

    #[test]
    fn test_disabled_throttling_pins_to_max() {
        let mut c = ConcurrencyController::new(6, 100.0, false);
        assert_eq!(c.target(), 6);
        c.observe(Some(100.0));
        assert_eq!(c.adjust(ms(500)), Adjustment::Pinned);
        assert_eq!(c.target(), 6);
    }

    #[test]
    fn test_high_cpu_decrements_by_one() {
        let mut c = controller_at(95.0, 8, 50.0);
        c.target = 5;
        assert_eq!(c.adjust(ms(10)), Adjustment::Decreased);
        assert_eq!(c.target(), 4);
        assert_eq!(c.baseline(), ms(10));
    }

    #[test]
    fn test_high_cpu_never_goes_below_one() {
        let mut c = controller_at(95.0, 8, 50.0);
        assert_eq!(c.target(), 1);
        assert_eq!(c.adjust(ms(10)), Adjustment::Unchanged);
        assert_eq!(c.target(), 1);
    }

    #[test]
    fn test_low_cpu_short_jobs_step_by_two() {
        let mut c = controller_at(10.0, 8, 50.0);
        assert_eq!(c.adjust(ms(5)), Adjustment::Increased);
        assert_eq!(c.target(), 3);
    }

    #[test]
    fn test_low_cpu_long_jobs_step_by_one() {
        let mut c = controller_at(10.0, 8, 50.0);
        assert_eq!(c.adjust(ms(250)), Adjustment::Increased);
        assert_eq!(c.target(), 2);
    }

    #[test]
    fn test_no_samples_counts_as_short() {
        let mut c = controller_at(10.0, 8, 50.0);
        assert_eq!(c.adjust(None), Adjustment::Increased);
        assert_eq!(c.target(), 3);
    }

    #[test]
    fn test_increase_clamps_to_max() {
        let mut c = controller_at(10.0, 2, 50.0);
        c.adjust(ms(5));
        assert_eq!(c.target(), 2);
        assert_eq!(c.adjust(ms(5)), Adjustment::Unchanged);
    }

    #[test]
    fn test_rising_duration_holds_concurrency() {
        let mut c = controller_at(10.0, 8, 50.0);
        c.adjust(ms(20));
        let before = c.target();

        assert_eq!(c.adjust(ms(40)), Adjustment::HeldForContention);
        assert_eq!(c.target(), before);
        // baseline moves even when holding
        assert_eq!(c.baseline(), ms(40));

        // stable duration releases the hold
        assert_eq!(c.adjust(ms(40)), Adjustment::Increased);
    }

    #[test]
    fn test_dead_band_between_thresholds() {
        // ceiling 45, increase only below 40
        let mut c = controller_at(42.0, 8, 50.0);
        c.target = 3;
        assert_eq!(c.adjust(ms(10)), Adjustment::Unchanged);
        assert_eq!(c.target(), 3);
    }

    #[test]
    fn test_target_stays_in_bounds() {
        let mut c = ConcurrencyController::new(4, 60.0, true);
        let readings = [0.0, 100.0, 20.0, 90.0, 5.0, 100.0, 0.0, 70.0];
        for (i, cpu) in readings.iter().cycle().take(200).enumerate() {
            c.observe(Some(*cpu));
            c.adjust(ms((i % 7) as u64 * 30));
            assert!(c.target() >= 1 && c.target() <= 4);
        }
    }

    #[test]
    fn test_adjustment_serialization() {
        let json = serde_json::to_string(&Adjustment::HeldForContention).unwrap();
        assert_eq!(json, "\"held_for_contention\"");
    }
}
