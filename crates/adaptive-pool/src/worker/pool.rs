//! Adaptive worker pool
//!
//! Owns the job queue, the control loop and the worker bookkeeping. Producers
//! go through admission; the control loop samples CPU, moves the target
//! concurrency and launches workers from the queue.

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::admission::{Admission, AdmissionState};
use super::controller::ConcurrencyController;
use super::job::{panic_message, IntoJobResult, Job};
use crate::config::{ConfigError, PoolSettings};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::monitor::{CpuMonitor, MonitorError, NoopCpuMonitor, SystemCpuMonitor};
use crate::observer::{ObserverSet, PoolEvent, PoolFault, PoolObserver};

/// Pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Control loop is ticking and launching workers
    Running,
    /// Control loop is alive but skips ticks; jobs accumulate in the queue
    Paused,
    /// Shut down; no further workers will be launched
    Stopped,
}

/// Pool errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// Settings failed validation
    #[error("invalid pool settings: {0}")]
    Config(#[from] ConfigError),

    /// Built outside a tokio runtime without an explicit handle
    #[error("no tokio runtime available, build inside a runtime or pass a handle")]
    NoRuntime,

    /// Submission after shutdown, or queued work stranded by shutdown
    #[error("pool has been shut down")]
    ShutDown,

    /// A cancellable submission was aborted while waiting for admission
    #[error("submission cancelled")]
    Cancelled,

    /// Admission refused a non-waiting submission
    #[error("submission rejected: {0}")]
    Backpressure(Admission),

    /// The control loop task ended abnormally
    #[error("control loop terminated: {0}")]
    ControlLoop(String),
}

/// A job handed back by a submission that did not enqueue it
pub struct Rejected<T> {
    job: Job<T>,
    error: PoolError,
}

impl<T> Rejected<T> {
    fn new(job: Job<T>, error: PoolError) -> Self {
        Self { job, error }
    }

    /// Why the job was not enqueued
    pub fn error(&self) -> &PoolError {
        &self.error
    }

    pub fn into_job(self) -> Job<T> {
        self.job
    }

    pub fn into_payload(self) -> T {
        self.job.into_payload()
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<T> std::error::Error for Rejected<T> {}

impl<T> From<Rejected<T>> for PoolError {
    fn from(rejected: Rejected<T>) -> Self {
        rejected.error
    }
}

/// State shared by producers, the control loop and workers
struct Shared<T> {
    settings: PoolSettings,
    sender: Sender<Job<T>>,
    receiver: Receiver<Job<T>>,
    admission: AdmissionState,
    /// Serializes check-then-enqueue across producers; the control loop never takes it
    enqueue_lock: Mutex<()>,
    metrics: MetricsCollector,
    observers: ObserverSet,
    /// Jobs enqueued and not yet finished (queued + in flight)
    outstanding: AtomicUsize,
    paused: AtomicBool,
    stopped: AtomicBool,
}

/// Builder for [`AdaptivePool`]
///
/// Without an explicit monitor, a [`SystemCpuMonitor`] is used when the CPU
/// ceiling is below 100% and a [`NoopCpuMonitor`] otherwise.
pub struct PoolBuilder<T> {
    settings: PoolSettings,
    monitor: Option<Box<dyn CpuMonitor>>,
    observers: ObserverSet,
    runtime: Option<Handle>,
    _payload: PhantomData<fn(T)>,
}

impl<T: Send + 'static> PoolBuilder<T> {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            monitor: None,
            observers: ObserverSet::default(),
            runtime: None,
            _payload: PhantomData,
        }
    }

    /// Inject the CPU monitor
    pub fn cpu_monitor(mut self, monitor: impl CpuMonitor + 'static) -> Self {
        self.monitor = Some(Box::new(monitor));
        self
    }

    /// Register an observer for CPU readings, adjustments and faults
    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observers.add(observer);
        self
    }

    /// Runtime to spawn the control loop and workers on (default: current runtime)
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Validate settings and start the pool. The control loop starts immediately.
    pub fn build(self) -> Result<AdaptivePool<T>, PoolError> {
        let PoolBuilder {
            settings,
            monitor,
            observers,
            runtime,
            ..
        } = self;

        settings.validate()?;

        let runtime = match runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| PoolError::NoRuntime)?,
        };

        let monitor: Box<dyn CpuMonitor> = match monitor {
            Some(monitor) => monitor,
            None if settings.cpu_throttling_enabled() => Box::new(SystemCpuMonitor::new()),
            None => Box::new(NoopCpuMonitor),
        };

        let throttling = settings.cpu_throttling_enabled() && !monitor.is_noop();
        let max_parallelism = settings.effective_max_parallelism();
        let controller =
            ConcurrencyController::new(max_parallelism, settings.max_cpu_usage, throttling);
        let admission = AdmissionState::new(
            settings.max_cpu_usage,
            throttling,
            settings.queue_buffer_multiplier,
            controller.target(),
        );
        let metrics = MetricsCollector::new(settings.sample_window);
        metrics.record_target_concurrency(controller.target());

        info!(
            pool = %settings.name,
            monitor = monitor.name(),
            throttling,
            max_cpu_usage = settings.max_cpu_usage,
            max_parallelism,
            queue_buffer_multiplier = settings.queue_buffer_multiplier,
            observers = observers.len(),
            "Starting adaptive pool"
        );

        let (sender, receiver) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            settings,
            sender,
            receiver,
            admission,
            enqueue_lock: Mutex::new(()),
            metrics,
            observers,
            outstanding: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let handle = runtime.spawn(control_loop(
            Arc::clone(&shared),
            controller,
            monitor,
            shutdown_rx,
        ));

        Ok(AdaptivePool {
            shared,
            shutdown_tx,
            loop_handle: Mutex::new(Some(handle)),
        })
    }
}

/// CPU-aware worker pool
///
/// Jobs run on tokio's blocking thread pool. The number running at once
/// follows a target that the control loop moves with host CPU load, bounded by
/// `max_degree_of_parallelism`.
///
/// # Example
///
/// ```no_run
/// use adaptive_pool::{AdaptivePool, PoolSettings};
///
/// # async fn run() -> Result<(), adaptive_pool::PoolError> {
/// let pool = AdaptivePool::new(PoolSettings::new().with_max_cpu_usage(80.0))?;
///
/// for n in 0..100u64 {
///     pool.submit(n, |n| {
///         let _ = (0..n).sum::<u64>();
///     })
///     .await?;
/// }
///
/// pool.wait_for_idle().await?;
/// pool.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct AdaptivePool<T> {
    shared: Arc<Shared<T>>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> AdaptivePool<T> {
    /// Start a pool with default monitor and no observers
    pub fn new(settings: PoolSettings) -> Result<Self, PoolError> {
        PoolBuilder::new(settings).build()
    }

    pub fn builder(settings: PoolSettings) -> PoolBuilder<T> {
        PoolBuilder::new(settings)
    }

    /// Submit a job, waiting for admission.
    ///
    /// Waits while smoothed CPU is above the ceiling or the queue is over its
    /// bound, polling every `admission_poll_interval`. There is no upper bound
    /// on the wait; use [`submit_cancellable`](Self::submit_cancellable) to
    /// abort it.
    pub async fn submit<F, R>(&self, payload: T, action: F) -> Result<(), PoolError>
    where
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoJobResult,
    {
        self.submit_job(Job::new(payload, action)).await
    }

    pub async fn submit_job(&self, job: Job<T>) -> Result<(), PoolError> {
        let mut job = job;
        loop {
            match self.enqueue(job) {
                Ok(()) => return Ok(()),
                Err(Rejected {
                    job: returned,
                    error: PoolError::Backpressure(reason),
                }) => {
                    trace!(%reason, "Submission waiting for admission");
                    job = returned;
                    tokio::time::sleep(self.shared.settings.admission_poll_interval).await;
                }
                Err(rejected) => return Err(rejected.error),
            }
        }
    }

    /// Like [`submit`](Self::submit) but gives up when `token` is cancelled.
    /// The payload is dropped on cancellation.
    pub async fn submit_cancellable<F, R>(
        &self,
        payload: T,
        action: F,
        token: &CancellationToken,
    ) -> Result<(), PoolError>
    where
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoJobResult,
    {
        let job = Job::new(payload, action);
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Submission cancelled while waiting for admission");
                Err(PoolError::Cancelled)
            }
            result = self.submit_job(job) => result,
        }
    }

    /// Submit from a synchronous context, blocking the calling thread.
    ///
    /// Do not call this from an async task; use [`submit`](Self::submit).
    pub fn submit_blocking<F, R>(&self, payload: T, action: F) -> Result<(), PoolError>
    where
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoJobResult,
    {
        let mut job = Job::new(payload, action);
        loop {
            match self.enqueue(job) {
                Ok(()) => return Ok(()),
                Err(Rejected {
                    job: returned,
                    error: PoolError::Backpressure(_),
                }) => {
                    job = returned;
                    std::thread::sleep(self.shared.settings.admission_poll_interval);
                }
                Err(rejected) => return Err(rejected.error),
            }
        }
    }

    /// Enqueue without waiting. A refused job is handed back in [`Rejected`].
    pub fn try_submit<F, R>(&self, payload: T, action: F) -> Result<(), Rejected<T>>
    where
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoJobResult,
    {
        self.enqueue(Job::new(payload, action))
    }

    fn enqueue(&self, job: Job<T>) -> Result<(), Rejected<T>> {
        if self.is_stopped() {
            return Err(Rejected::new(job, PoolError::ShutDown));
        }

        // The queue can only shrink between check and send while this is held
        let _guard = self.shared.enqueue_lock.lock();

        let decision = self.shared.admission.check(self.shared.receiver.len());
        if !decision.is_admit() {
            return Err(Rejected::new(job, PoolError::Backpressure(decision)));
        }

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        // Cannot disconnect: `shared` owns the receiver for as long as `self` lives
        let _ = self.shared.sender.send(job);
        Ok(())
    }
}

impl<T> AdaptivePool<T> {
    /// Wait until the queue is empty and no worker is in flight.
    ///
    /// Best effort under concurrent producers: when it returns, every job
    /// enqueued before the call has finished, but new jobs may already be
    /// queued. A pool kept continuously busy can delay the return
    /// indefinitely, as can a paused pool with queued jobs.
    ///
    /// Returns [`PoolError::ShutDown`] if the pool was shut down with jobs
    /// still queued, since those will never run.
    pub async fn wait_for_idle(&self) -> Result<(), PoolError> {
        while !self.check_idle()? {
            tokio::time::sleep(self.shared.settings.admission_poll_interval).await;
        }
        Ok(())
    }

    /// Blocking variant of [`wait_for_idle`](Self::wait_for_idle)
    pub fn wait_for_idle_blocking(&self) -> Result<(), PoolError> {
        while !self.check_idle()? {
            std::thread::sleep(self.shared.settings.admission_poll_interval);
        }
        Ok(())
    }

    fn check_idle(&self) -> Result<bool, PoolError> {
        if self.shared.outstanding.load(Ordering::Acquire) == 0 {
            return Ok(true);
        }
        if self.is_stopped() && !self.shared.receiver.is_empty() {
            return Err(PoolError::ShutDown);
        }
        Ok(false)
    }

    /// Stop launching workers on subsequent ticks. In-flight jobs finish normally.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::AcqRel) {
            info!(pool = %self.shared.settings.name, "Pool paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::AcqRel) {
            info!(pool = %self.shared.settings.name, "Pool resumed");
        }
    }

    /// Stop the control loop and wait for its current tick to finish.
    ///
    /// In-flight jobs are not cancelled and queued jobs are not launched; call
    /// [`wait_for_idle`](Self::wait_for_idle) first for a full drain. Calling
    /// this again is a no-op.
    #[instrument(skip(self), fields(pool = %self.shared.settings.name))]
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            debug!("Pool already shut down");
            return Ok(());
        }

        info!(
            queued = self.queue_len(),
            in_flight = self.in_flight(),
            "Shutting down adaptive pool"
        );
        let _ = self.shutdown_tx.send(true);

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| PoolError::ControlLoop(e.to_string()))?;
        }

        info!("Adaptive pool stopped");
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        if self.is_stopped() {
            PoolStatus::Stopped
        } else if self.shared.paused.load(Ordering::Acquire) {
            PoolStatus::Paused
        } else {
            PoolStatus::Running
        }
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Jobs waiting to be launched
    pub fn queue_len(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Jobs launched and not yet finished (approximate under concurrent use)
    pub fn in_flight(&self) -> usize {
        self.shared
            .outstanding
            .load(Ordering::Acquire)
            .saturating_sub(self.queue_len())
    }

    pub fn target_concurrency(&self) -> usize {
        self.shared.admission.target()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn name(&self) -> &str {
        &self.shared.settings.name
    }
}

impl<T> Drop for AdaptivePool<T> {
    fn drop(&mut self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            debug!(pool = %self.shared.settings.name, "Pool dropped, stopping control loop");
            let _ = self.shutdown_tx.send(true);
        }
    }
}

impl<T> fmt::Debug for AdaptivePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptivePool")
            .field("name", &self.shared.settings.name)
            .field("status", &self.status())
            .field("queue_len", &self.queue_len())
            .field("target_concurrency", &self.target_concurrency())
            .finish()
    }
}

// ============================================================================
// Control loop
// ============================================================================

async fn control_loop<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    mut controller: ConcurrencyController,
    monitor: Box<dyn CpuMonitor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(shared.settings.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut running: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shared.paused.load(Ordering::Acquire) {
                    trace!("Control loop paused, skipping tick");
                } else {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        tick(&shared, &mut controller, monitor.as_ref(), &mut running)
                    }));
                    if let Err(panic) = result {
                        let message = panic_message(panic.as_ref());
                        error!(panic = %message, "Control loop tick panicked");
                        shared.observers.fault(PoolFault::TickPanicked(message));
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Control loop: shutdown requested");
                break;
            }
        }
    }

    running.retain(|handle| !handle.is_finished());
    debug!(
        pool = %shared.settings.name,
        in_flight = running.len(),
        queued = shared.receiver.len(),
        "Control loop exited"
    );
}

/// One control loop iteration: sample, adjust, launch
fn tick<T: Send + 'static>(
    shared: &Arc<Shared<T>>,
    controller: &mut ConcurrencyController,
    monitor: &dyn CpuMonitor,
    running: &mut Vec<JoinHandle<()>>,
) {
    let raw = sample_cpu(shared, monitor);
    let smoothed = controller.observe(raw);
    shared.admission.set_smoothed_cpu(smoothed);
    shared.metrics.record_smoothed_cpu(smoothed);
    shared
        .observers
        .publish(&PoolEvent::CpuSampled { raw, smoothed });

    let from = controller.target();
    let adjustment = controller.adjust(shared.metrics.average_duration());
    let target = controller.target();
    shared.admission.set_target(target);
    shared.metrics.record_target_concurrency(target);
    if from != target {
        debug!(
            from,
            to = target,
            ?adjustment,
            smoothed_cpu = smoothed,
            "Target concurrency adjusted"
        );
        shared.observers.publish(&PoolEvent::ConcurrencyAdjusted {
            from,
            to: target,
            adjustment,
        });
    }

    running.retain(|handle| !handle.is_finished());
    shared.metrics.record_concurrency(running.len());
    shared.metrics.record_queue_length(shared.receiver.len());

    let mut launched = 0usize;
    while running.len() < target {
        let Ok(job) = shared.receiver.try_recv() else {
            break;
        };
        running.push(spawn_worker(shared, job));
        launched += 1;
    }

    if launched > 0 {
        shared.metrics.record_concurrency(running.len());
        shared.metrics.record_queue_length(shared.receiver.len());
    }

    trace!(
        smoothed_cpu = smoothed,
        target,
        running = running.len(),
        launched,
        queued = shared.receiver.len(),
        "Tick complete"
    );
}

/// Read the monitor once. Errors, panics and non-finite readings are
/// reported as faults and count as no signal for this tick.
fn sample_cpu<T>(shared: &Shared<T>, monitor: &dyn CpuMonitor) -> Option<f64> {
    let result = match panic::catch_unwind(AssertUnwindSafe(|| monitor.current_usage())) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(monitor = monitor.name(), panic = %message, "CPU monitor panicked");
            shared.observers.fault(PoolFault::MonitorPanicked(message));
            return None;
        }
    };

    match result {
        Ok(usage) if usage.is_finite() => Some(usage),
        Ok(usage) => {
            warn!(monitor = monitor.name(), usage, "CPU monitor returned a non-finite reading");
            shared
                .observers
                .fault(PoolFault::MonitorFailed(MonitorError::InvalidReading(usage)));
            None
        }
        Err(e) => {
            warn!(monitor = monitor.name(), error = %e, "CPU sample failed");
            shared.observers.fault(PoolFault::MonitorFailed(e));
            None
        }
    }
}

fn spawn_worker<T: Send + 'static>(shared: &Arc<Shared<T>>, job: Job<T>) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        job.execute(&shared.metrics, &shared.observers);
        shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    })
}
