//! Pool settings
//!
//! Immutable configuration handed to [`AdaptivePool`](crate::AdaptivePool) at
//! construction. Invalid settings are rejected up front by [`PoolSettings::validate`].

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fallback core count when `available_parallelism` cannot be determined.
pub const FALLBACK_CPU_COUNT: usize = 4;

/// CPU ceiling at or above which CPU-based throttling is disabled.
pub const CPU_THROTTLING_DISABLED_AT: f64 = 100.0;

/// Settings for an adaptive worker pool
///
/// # Example
///
/// ```
/// use adaptive_pool::PoolSettings;
/// use std::time::Duration;
///
/// let settings = PoolSettings::new()
///     .with_max_cpu_usage(75.0)
///     .with_max_degree_of_parallelism(8)
///     .with_queue_buffer_multiplier(4)
///     .with_tick_interval(Duration::from_millis(50));
///
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSettings {
    /// Pool name, attached to tracing spans
    pub name: String,

    /// CPU ceiling in percent (>= 100 disables CPU throttling)
    pub max_cpu_usage: f64,

    /// Hard cap on concurrent workers (None = host core count)
    pub max_degree_of_parallelism: Option<usize>,

    /// Queue may hold at most `target_concurrency * queue_buffer_multiplier` jobs
    /// before producers are held back
    pub queue_buffer_multiplier: usize,

    /// Control loop period
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Polling interval used by waiting producers and `wait_for_idle`
    #[serde(with = "duration_millis")]
    pub admission_poll_interval: Duration,

    /// Number of recent job durations kept for the rolling average
    pub sample_window: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            name: format!("pool-{}", Uuid::now_v7()),
            max_cpu_usage: CPU_THROTTLING_DISABLED_AT,
            max_degree_of_parallelism: None,
            queue_buffer_multiplier: 2,
            tick_interval: Duration::from_millis(100),
            admission_poll_interval: Duration::from_millis(20),
            sample_window: 100,
        }
    }
}

impl PoolSettings {
    /// Create settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the CPU ceiling in percent
    pub fn with_max_cpu_usage(mut self, percent: f64) -> Self {
        self.max_cpu_usage = percent;
        self
    }

    /// Set the maximum number of concurrent workers
    pub fn with_max_degree_of_parallelism(mut self, max: usize) -> Self {
        self.max_degree_of_parallelism = Some(max);
        self
    }

    /// Set the queue buffer multiplier
    pub fn with_queue_buffer_multiplier(mut self, multiplier: usize) -> Self {
        self.queue_buffer_multiplier = multiplier;
        self
    }

    /// Set the control loop tick interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the admission polling interval
    pub fn with_admission_poll_interval(mut self, interval: Duration) -> Self {
        self.admission_poll_interval = interval;
        self
    }

    /// Set the rolling duration window size
    pub fn with_sample_window(mut self, window: usize) -> Self {
        self.sample_window = window;
        self
    }

    /// Whether CPU readings should gate admission and concurrency
    pub fn cpu_throttling_enabled(&self) -> bool {
        self.max_cpu_usage < CPU_THROTTLING_DISABLED_AT
    }

    /// Effective concurrency cap, resolving `None` to the host core count
    pub fn effective_max_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
            .unwrap_or_else(host_core_count)
            .max(1)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_cpu_usage.is_finite() || self.max_cpu_usage <= 0.0 {
            return Err(ConfigError::InvalidCpuCeiling(self.max_cpu_usage));
        }
        if self.max_degree_of_parallelism == Some(0) {
            return Err(ConfigError::ZeroParallelism);
        }
        if self.queue_buffer_multiplier == 0 {
            return Err(ConfigError::ZeroBufferMultiplier);
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("tick_interval"));
        }
        if self.admission_poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("admission_poll_interval"));
        }
        if self.sample_window == 0 {
            return Err(ConfigError::ZeroSampleWindow);
        }
        Ok(())
    }

    /// Create settings from environment variables
    ///
    /// Environment variables:
    /// - `ADAPTIVE_POOL_MAX_CPU`: CPU ceiling in percent (default: 100, disabled)
    /// - `ADAPTIVE_POOL_MAX_PARALLELISM`: worker cap (default: host core count)
    /// - `ADAPTIVE_POOL_QUEUE_BUFFER_MULTIPLIER`: queue bound multiplier (default: 2)
    /// - `ADAPTIVE_POOL_TICK_MS`: control loop period (default: 100)
    /// - `ADAPTIVE_POOL_POLL_MS`: admission polling interval (default: 20)
    /// - `ADAPTIVE_POOL_SAMPLE_WINDOW`: rolling window size (default: 100)
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            name: env::var("ADAPTIVE_POOL_NAME").unwrap_or(defaults.name),
            max_cpu_usage: parse_env("ADAPTIVE_POOL_MAX_CPU").unwrap_or(defaults.max_cpu_usage),
            max_degree_of_parallelism: parse_env("ADAPTIVE_POOL_MAX_PARALLELISM")
                .or(defaults.max_degree_of_parallelism),
            queue_buffer_multiplier: parse_env("ADAPTIVE_POOL_QUEUE_BUFFER_MULTIPLIER")
                .unwrap_or(defaults.queue_buffer_multiplier),
            tick_interval: parse_env("ADAPTIVE_POOL_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            admission_poll_interval: parse_env("ADAPTIVE_POOL_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.admission_poll_interval),
            sample_window: parse_env("ADAPTIVE_POOL_SAMPLE_WINDOW")
                .unwrap_or(defaults.sample_window),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Number of logical cores available to this process
pub fn host_core_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_CPU_COUNT)
}

/// Configuration errors, raised at pool construction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// CPU ceiling is not a positive finite percentage
    #[error("max_cpu_usage must be a positive percentage, got {0}")]
    InvalidCpuCeiling(f64),

    /// Explicit parallelism of zero
    #[error("max_degree_of_parallelism must be at least 1")]
    ZeroParallelism,

    /// Buffer multiplier of zero
    #[error("queue_buffer_multiplier must be at least 1")]
    ZeroBufferMultiplier,

    /// A polling or tick interval of zero
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),

    /// Empty duration window
    #[error("sample_window must be at least 1")]
    ZeroSampleWindow,
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PoolSettings::default();
        assert!(settings.name.starts_with("pool-"));
        assert_eq!(settings.max_cpu_usage, 100.0);
        assert_eq!(settings.max_degree_of_parallelism, None);
        assert_eq!(settings.queue_buffer_multiplier, 2);
        assert_eq!(settings.tick_interval, Duration::from_millis(100));
        assert!(!settings.cpu_throttling_enabled());
        assert!(settings.validate().is_ok());
    }

    // Single test so no other test races on these variables
    #[test]
    fn test_from_env_parses_and_falls_back() {
        let vars = [
            ("ADAPTIVE_POOL_NAME", "from-env"),
            ("ADAPTIVE_POOL_MAX_CPU", " 65.5 "),
            ("ADAPTIVE_POOL_MAX_PARALLELISM", "3"),
            ("ADAPTIVE_POOL_QUEUE_BUFFER_MULTIPLIER", "four"),
            ("ADAPTIVE_POOL_TICK_MS", "250"),
            ("ADAPTIVE_POOL_POLL_MS", "-1"),
            ("ADAPTIVE_POOL_SAMPLE_WINDOW", ""),
        ];
        for (key, value) in vars {
            env::set_var(key, value);
        }

        let settings = PoolSettings::from_env();
        assert_eq!(settings.name, "from-env");
        assert_eq!(settings.max_cpu_usage, 65.5);
        assert_eq!(settings.max_degree_of_parallelism, Some(3));
        assert_eq!(settings.tick_interval, Duration::from_millis(250));

        // unparsable values keep the defaults
        let defaults = PoolSettings::default();
        assert_eq!(settings.queue_buffer_multiplier, defaults.queue_buffer_multiplier);
        assert_eq!(
            settings.admission_poll_interval,
            defaults.admission_poll_interval
        );
        assert_eq!(settings.sample_window, defaults.sample_window);

        for (key, _) in vars {
            env::remove_var(key);
        }
        let settings = PoolSettings::from_env();
        assert!(settings.name.starts_with("pool-"));
        assert_eq!(settings.max_cpu_usage, 100.0);
        assert_eq!(settings.max_degree_of_parallelism, None);
    }

    #[test]
    fn test_settings_builder() {
        let settings = PoolSettings::new()
            .with_name("ingest")
            .with_max_cpu_usage(60.0)
            .with_max_degree_of_parallelism(3)
            .with_queue_buffer_multiplier(5)
            .with_tick_interval(Duration::from_millis(50))
            .with_admission_poll_interval(Duration::from_millis(5))
            .with_sample_window(10);

        assert_eq!(settings.name, "ingest");
        assert!(settings.cpu_throttling_enabled());
        assert_eq!(settings.effective_max_parallelism(), 3);
        assert_eq!(settings.queue_buffer_multiplier, 5);
        assert_eq!(settings.sample_window, 10);
    }

    #[test]
    fn test_unset_parallelism_uses_host_cores() {
        let settings = PoolSettings::default();
        assert_eq!(settings.effective_max_parallelism(), host_core_count());
        assert!(settings.effective_max_parallelism() >= 1);
    }

    #[test]
    fn test_throttling_disabled_above_hundred() {
        let settings = PoolSettings::new().with_max_cpu_usage(150.0);
        assert!(!settings.cpu_throttling_enabled());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert_eq!(
            PoolSettings::new().with_queue_buffer_multiplier(0).validate(),
            Err(ConfigError::ZeroBufferMultiplier)
        );
        assert_eq!(
            PoolSettings::new().with_max_degree_of_parallelism(0).validate(),
            Err(ConfigError::ZeroParallelism)
        );
        assert!(matches!(
            PoolSettings::new().with_max_cpu_usage(-1.0).validate(),
            Err(ConfigError::InvalidCpuCeiling(_))
        ));
        assert!(matches!(
            PoolSettings::new().with_max_cpu_usage(f64::NAN).validate(),
            Err(ConfigError::InvalidCpuCeiling(_))
        ));
        assert_eq!(
            PoolSettings::new()
                .with_tick_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroInterval("tick_interval"))
        );
        assert_eq!(
            PoolSettings::new().with_sample_window(0).validate(),
            Err(ConfigError::ZeroSampleWindow)
        );
    }

    #[test]
    fn test_serialization() {
        let settings = PoolSettings::new()
            .with_name("serde")
            .with_max_degree_of_parallelism(2);
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"tick_interval\":100"));
        let parsed: PoolSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(settings, parsed);
    }
}
