// Pool observers
//
// Explicit observer registration for CPU readings, concurrency adjustments and
// runtime faults. Observers are registered when the pool is built and are
// notified synchronously from the control loop and from workers, so they must
// be fast and non-blocking. For heavy processing, forward into a channel with
// `ChannelObserver` and consume elsewhere.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::monitor::MonitorError;
use crate::worker::Adjustment;

// ============================================================================
// Events
// ============================================================================

/// Runtime faults. They never escape the pool; observers are the only way to see them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolFault {
    /// A job's action returned an error
    #[error("job failed: {0}")]
    JobFailed(String),

    /// A job's action panicked
    #[error("job panicked: {0}")]
    JobPanicked(String),

    /// The CPU monitor could not produce a reading this tick
    #[error("cpu monitor failed: {0}")]
    MonitorFailed(#[from] MonitorError),

    /// The CPU monitor panicked while sampling; the tick continues without a reading
    #[error("cpu monitor panicked: {0}")]
    MonitorPanicked(String),

    /// A control loop tick panicked; the loop carries on with the next tick
    #[error("control loop tick panicked: {0}")]
    TickPanicked(String),
}

/// Everything the pool publishes to observers
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A tick sampled the CPU. `raw` is `None` when the monitor failed.
    CpuSampled { raw: Option<f64>, smoothed: f64 },

    /// The target concurrency changed
    ConcurrencyAdjusted {
        from: usize,
        to: usize,
        adjustment: Adjustment,
    },

    /// A job or tick faulted
    Fault(PoolFault),
}

// ============================================================================
// PoolObserver Trait
// ============================================================================

/// Trait for receiving pool notifications.
///
/// Every method has a no-op default; implement the ones you care about.
///
/// # Example
///
/// ```
/// use adaptive_pool::{PoolFault, PoolObserver};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct FaultCounter(AtomicUsize);
///
/// impl PoolObserver for FaultCounter {
///     fn on_fault(&self, _fault: &PoolFault) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait PoolObserver: Send + Sync {
    /// Called once per tick with the smoothed reading
    fn on_cpu_usage(&self, _raw: Option<f64>, _smoothed: f64) {}

    /// Called when target concurrency changes
    fn on_adjustment(&self, _from: usize, _to: usize, _adjustment: Adjustment) {}

    /// Called for every job or control loop fault
    fn on_fault(&self, _fault: &PoolFault) {}

    /// Dispatch an event to the typed callbacks
    fn on_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::CpuSampled { raw, smoothed } => self.on_cpu_usage(*raw, *smoothed),
            PoolEvent::ConcurrencyAdjusted {
                from,
                to,
                adjustment,
            } => self.on_adjustment(*from, *to, *adjustment),
            PoolEvent::Fault(fault) => self.on_fault(fault),
        }
    }

    /// Human-readable name for logging
    fn name(&self) -> &'static str {
        "PoolObserver"
    }
}

// ============================================================================
// ObserverSet
// ============================================================================

/// Fan-out to every registered observer
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn PoolObserver>>,
}

impl ObserverSet {
    pub fn new(observers: Vec<Arc<dyn PoolObserver>>) -> Self {
        Self { observers }
    }

    pub fn add(&mut self, observer: Arc<dyn PoolObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn publish(&self, event: &PoolEvent) {
        for observer in &self.observers {
            trace!(observer = observer.name(), ?event, "Dispatching pool event");
            observer.on_event(event);
        }
    }

    pub fn fault(&self, fault: PoolFault) {
        self.publish(&PoolEvent::Fault(fault));
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.observers.iter().map(|o| o.name()))
            .finish()
    }
}

// ============================================================================
// Built-in observers
// ============================================================================

/// Forwards every event into an unbounded channel.
///
/// Sending never blocks. Events sent after the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PoolObserver for ChannelObserver {
    fn on_event(&self, event: &PoolEvent) {
        let _ = self.tx.send(event.clone());
    }

    fn name(&self) -> &'static str {
        "ChannelObserver"
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_cpu_usage(&self, raw: Option<f64>, smoothed: f64) {
        trace!(?raw, smoothed, "CPU sampled");
    }

    fn on_adjustment(&self, from: usize, to: usize, adjustment: Adjustment) {
        debug!(from, to, ?adjustment, "Target concurrency adjusted");
    }

    fn on_fault(&self, fault: &PoolFault) {
        warn!(%fault, "Pool fault");
    }

    fn name(&self) -> &'static str {
        "TracingObserver"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        cpu: AtomicUsize,
        faults: AtomicUsize,
    }

    impl PoolObserver for Counting {
        fn on_cpu_usage(&self, _raw: Option<f64>, _smoothed: f64) {
            self.cpu.fetch_add(1, Ordering::Relaxed);
        }

        fn on_fault(&self, _fault: &PoolFault) {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_on_event_dispatches_to_typed_callbacks() {
        let counting = Counting::default();
        counting.on_event(&PoolEvent::CpuSampled {
            raw: Some(10.0),
            smoothed: 3.0,
        });
        counting.on_event(&PoolEvent::Fault(PoolFault::JobFailed("boom".into())));
        counting.on_event(&PoolEvent::ConcurrencyAdjusted {
            from: 1,
            to: 3,
            adjustment: Adjustment::Increased,
        });

        assert_eq!(counting.cpu.load(Ordering::Relaxed), 1);
        assert_eq!(counting.faults.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_observer_set_fans_out() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let mut set = ObserverSet::default();
        assert!(set.is_empty());
        set.add(a.clone());
        set.add(b.clone());
        assert_eq!(set.len(), 2);

        set.fault(PoolFault::TickPanicked("oops".into()));

        assert_eq!(a.faults.load(Ordering::Relaxed), 1);
        assert_eq!(b.faults.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_channel_observer_forwards_events() {
        let (observer, mut rx) = ChannelObserver::new();
        let event = PoolEvent::Fault(PoolFault::JobPanicked("kaboom".into()));
        observer.on_event(&event);

        assert_eq!(rx.try_recv().unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_event(&PoolEvent::CpuSampled {
            raw: None,
            smoothed: 0.0,
        });
    }

    #[test]
    fn test_fault_display() {
        let fault = PoolFault::from(MonitorError::InvalidReading(120.0));
        assert_eq!(
            fault.to_string(),
            "cpu monitor failed: invalid cpu reading: 120"
        );
    }
}
