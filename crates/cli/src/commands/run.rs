// Synthetic load command

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adaptive_pool::{
    AdaptivePool, MetricsSnapshot, PoolFault, PoolObserver, PoolSettings, TracingObserver,
};
use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::info;

use crate::output::{format_duration, print_field, OutputFormat};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Number of jobs to submit
    #[arg(long, default_value_t = 200)]
    pub jobs: u64,

    /// CPU time each job spins for, in milliseconds
    #[arg(long, default_value_t = 20)]
    pub work_ms: u64,

    /// CPU ceiling in percent (100 or more disables throttling)
    #[arg(long, env = "ADAPTIVE_POOL_MAX_CPU", default_value_t = 80.0)]
    pub max_cpu: f64,

    /// Maximum concurrent workers (default: host core count)
    #[arg(long, env = "ADAPTIVE_POOL_MAX_PARALLELISM")]
    pub max_parallelism: Option<usize>,

    /// Queue bound as a multiple of target concurrency
    #[arg(long, env = "ADAPTIVE_POOL_QUEUE_BUFFER_MULTIPLIER", default_value_t = 2)]
    pub buffer_multiplier: usize,

    /// Control loop tick interval in milliseconds
    #[arg(long, env = "ADAPTIVE_POOL_TICK_MS", default_value_t = 100)]
    pub tick_ms: u64,

    /// Make every Nth job fail (0 = never)
    #[arg(long, default_value_t = 0)]
    pub fail_every: u64,
}

impl RunArgs {
    fn settings(&self) -> PoolSettings {
        let settings = PoolSettings::from_env()
            .with_name("cli-run")
            .with_max_cpu_usage(self.max_cpu)
            .with_queue_buffer_multiplier(self.buffer_multiplier)
            .with_tick_interval(Duration::from_millis(self.tick_ms));

        match self.max_parallelism {
            Some(max) => settings.with_max_degree_of_parallelism(max),
            None => settings,
        }
    }
}

/// Counts faults reported by the pool
#[derive(Default)]
struct FaultCounter(AtomicU64);

impl PoolObserver for FaultCounter {
    fn on_fault(&self, _fault: &PoolFault) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "FaultCounter"
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    jobs: u64,
    elapsed_ms: u64,
    throughput_per_sec: f64,
    faults_observed: u64,
    metrics: MetricsSnapshot,
}

/// Busy-spin for `work` so jobs really consume CPU
fn spin(work: Duration) {
    let started = Instant::now();
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    while started.elapsed() < work {
        for _ in 0..1_000 {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
        }
        std::hint::black_box(state);
    }
}

pub async fn run(args: RunArgs, output: OutputFormat, quiet: bool) -> Result<()> {
    let settings = args.settings();
    let faults = Arc::new(FaultCounter::default());

    let pool = Arc::new(
        AdaptivePool::<u64>::builder(settings)
            .observer(faults.clone())
            .observer(Arc::new(TracingObserver))
            .build()
            .context("Failed to start adaptive pool")?,
    );

    let pb = if quiet || !output.is_text() {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(args.jobs)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}",
            )
            .context("Invalid progress bar template")?
            .progress_chars("=> "),
    );

    // Live target/cpu readout next to the bar
    let reporter = {
        let pool = pool.clone();
        let pb = pb.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            loop {
                ticker.tick().await;
                let metrics = pool.metrics();
                pb.set_message(format!(
                    "target {} running {} cpu {:.0}%",
                    metrics.target_concurrency, metrics.current_concurrency, metrics.smoothed_cpu
                ));
            }
        })
    };

    info!(
        jobs = args.jobs,
        work_ms = args.work_ms,
        pool = pool.name(),
        "Submitting synthetic workload"
    );

    let started = Instant::now();
    let work = Duration::from_millis(args.work_ms);
    let fail_every = args.fail_every;

    for n in 1..=args.jobs {
        let pb = pb.clone();
        pool.submit(n, move |n| -> Result<(), String> {
            spin(work);
            pb.inc(1);
            if fail_every > 0 && n % fail_every == 0 {
                return Err(format!("job {n} failed on request"));
            }
            Ok(())
        })
        .await
        .context("Failed to submit job")?;
    }

    pool.wait_for_idle()
        .await
        .context("Pool stopped before the workload drained")?;
    let elapsed = started.elapsed();

    reporter.abort();
    pb.finish_and_clear();
    pool.shutdown().await.context("Failed to shut down pool")?;

    let report = RunReport {
        jobs: args.jobs,
        elapsed_ms: elapsed.as_millis() as u64,
        throughput_per_sec: args.jobs as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        faults_observed: faults.0.load(Ordering::Relaxed),
        metrics: pool.metrics(),
    };

    if output.is_text() {
        print_report(&report);
        Ok(())
    } else {
        output.print_value(&report)
    }
}

fn print_report(report: &RunReport) {
    let m = &report.metrics;
    print_field("Jobs", &report.jobs.to_string());
    print_field("Elapsed", &format!("{} ms", report.elapsed_ms));
    print_field(
        "Throughput",
        &format!("{:.1} jobs/s", report.throughput_per_sec),
    );
    print_field("Completed", &m.completed_jobs.to_string());
    print_field("Faulted", &m.faulted_jobs.to_string());
    print_field("Faults observed", &report.faults_observed.to_string());
    print_field("Max concurrency", &m.max_concurrency.to_string());
    print_field("Target concurrency", &m.target_concurrency.to_string());
    print_field("Smoothed CPU", &format!("{:.1}%", m.smoothed_cpu));
    print_field("Best duration", &format_duration(m.best_duration));
    print_field("Worst duration", &format_duration(m.worst_duration));
    print_field("Average duration", &format_duration(m.average_duration));
}
