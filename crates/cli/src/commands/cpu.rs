// CPU sampling command

use std::time::Duration;

use adaptive_pool::worker::ConcurrencyController;
use adaptive_pool::{CpuMonitor, SystemCpuMonitor};
use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Args)]
pub struct CpuArgs {
    /// Number of readings to take
    #[arg(long, default_value_t = 10)]
    pub samples: usize,

    /// Delay between readings in milliseconds
    #[arg(long, default_value_t = 500)]
    pub interval_ms: u64,
}

#[derive(Debug, Serialize)]
struct CpuSample {
    sample: usize,
    raw: f64,
    smoothed: f64,
}

/// Take `samples` readings from `monitor`, smoothing them the way the pool does
async fn collect(
    monitor: &dyn CpuMonitor,
    samples: usize,
    interval: Duration,
) -> Result<Vec<CpuSample>> {
    // Throttling flag only affects adjust(); observe() applies the same EMA the pool uses
    let mut smoother = ConcurrencyController::new(1, 100.0, false);
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately; the monitor needs a gap before its first delta
    ticker.tick().await;

    let mut readings = Vec::with_capacity(samples);
    for sample in 1..=samples {
        ticker.tick().await;
        let raw = monitor
            .current_usage()
            .with_context(|| format!("Failed to read CPU usage from {}", monitor.name()))?;
        let smoothed = smoother.observe(Some(raw));
        readings.push(CpuSample {
            sample,
            raw,
            smoothed,
        });
    }
    Ok(readings)
}

pub async fn run(args: CpuArgs, output: OutputFormat) -> Result<()> {
    let monitor = SystemCpuMonitor::new();
    let interval = Duration::from_millis(args.interval_ms.max(1));
    let readings = collect(&monitor, args.samples, interval).await?;

    if !output.is_text() {
        return output.print_value(&readings);
    }

    if readings.is_empty() {
        println!("No samples taken.");
        return Ok(());
    }

    print_table_header(&[("SAMPLE", 8), ("RAW %", 8), ("SMOOTHED %", 10)]);
    for reading in &readings {
        print_table_row(&[
            (&reading.sample.to_string(), 8),
            (&format!("{:.1}", reading.raw), 8),
            (&format!("{:.1}", reading.smoothed), 10),
        ]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_pool::ManualCpuMonitor;

    #[tokio::test]
    async fn test_collect_smooths_readings() {
        let monitor = ManualCpuMonitor::new(100.0);
        let readings = collect(&monitor, 2, Duration::from_millis(1)).await.unwrap();

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].raw, 100.0);
        assert_eq!(readings[0].smoothed, 30.0);
        assert!((readings[1].smoothed - 51.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_collect_surfaces_monitor_errors() {
        let monitor = ManualCpuMonitor::new(10.0);
        monitor.set_failing(true);
        let err = collect(&monitor, 1, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ManualCpuMonitor"));
    }
}
