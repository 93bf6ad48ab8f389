//! Heartbeat-based failure detection for pending futures.
//!
//! Every future handed to [`FutureMonitor::monitor`] is filed under
//! its updater body in the [`FutureRegistry`]. A single background
//! thread walks the registry and probes one updater at a time, waiting
//! the monitoring interval after each probe so outbound probe traffic
//! stays bounded no matter how many bodies are awaited.
//!
//! When a probe comes back DEAD, fails in transport, or panics, every
//! future still awaited on that updater is failed with an
//! [`UpdaterFailure`], and the [`FailureListener`] (usually the
//! [`crate::recovery::RecoveryCoordinator`]) is told.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::instrument;

use crate::common::LoopHandle;
use crate::common::ShutdownSignal;
use crate::errors::panic_message;
use crate::errors::Reraise;
use crate::errors::Result;
use crate::errors::VigilError;
use crate::future::FutureReply;
use crate::future::UpdaterFailure;
use crate::identity::BodyId;
use crate::metrics::MonitorMetrics;
use crate::with_timer;

mod probe;
mod registry;

pub use probe::Heartbeat;
pub use probe::LivenessProbe;
pub use registry::FutureRegistry;
pub use registry::MonitoredBody;

/// Receives failure signals for bodies found dead.
pub trait FailureListener: Send + Sync {
    fn failure_detected(&self, body: &BodyId);
}

/// Settings fixed when the monitor is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Pause after each probe. `None` disables the background loop.
    pub interval: Option<Duration>,
    /// Fault tolerance supervises liveness itself; new futures are
    /// not monitored to avoid two detectors racing.
    pub fault_tolerance: bool,
}

/// Result of probing one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No awaited future left; no probe was sent.
    Nothing,
    Alive,
    /// The body failed; this many futures were resolved.
    Failed(usize),
}

pub struct FutureMonitor {
    registry: Arc<FutureRegistry>,
    probe: Arc<dyn LivenessProbe>,
    listener: Option<Arc<dyn FailureListener>>,
    config: MonitorConfig,
    started: AtomicBool,
    metrics: MonitorMetrics,
}

impl FutureMonitor {
    pub fn new(probe: Arc<dyn LivenessProbe>, config: MonitorConfig) -> Self {
        Self {
            registry: Arc::new(FutureRegistry::new()),
            probe,
            listener: None,
            config,
            started: AtomicBool::new(false),
            metrics: MonitorMetrics::new(),
        }
    }

    /// Report failed bodies to `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn FailureListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn registry(&self) -> &FutureRegistry {
        &self.registry
    }

    pub fn config(&self) -> MonitorConfig {
        self.config
    }

    /// Start watching `future` until it resolves.
    ///
    /// No-op if it already resolved or fault tolerance is enabled. Safe
    /// to call concurrently with a sweep and with [`Self::unmonitor`].
    pub fn monitor<T>(&self, future: &FutureReply<T>)
    where
        T: Clone + Send + 'static,
    {
        if self.config.fault_tolerance {
            return;
        }
        let handle = future.monitorable();
        if !handle.watch(Arc::downgrade(&self.registry)) {
            return;
        }
        self.registry.insert(handle.clone());

        // The future may have resolved between `watch` and `insert`;
        // its own removal then ran before there was anything to remove.
        if !handle.is_awaited() {
            self.registry.remove(handle.updater(), handle.future_id());
        }
    }

    /// Stop watching `future`. No-op if it was never monitored.
    pub fn unmonitor<T>(&self, future: &FutureReply<T>)
    where
        T: Clone + Send + 'static,
    {
        self.registry.remove(future.updater(), future.id());
    }

    /// Probe `body` once, through one of its awaited futures.
    #[instrument(name = "probe_body", skip_all, fields(body = %body))]
    pub fn probe_body(&self, body: &BodyId) -> ProbeOutcome {
        let Some(location) = self.registry.representative(body) else {
            return ProbeOutcome::Nothing;
        };

        let labels: [KeyValue; 0] = [];
        self.metrics.probe_count.add(1, &labels);
        let res = with_timer!(
            self.metrics.probe_duration,
            labels,
            std::panic::catch_unwind(AssertUnwindSafe(|| self.probe.probe(body)))
        );
        let cause = match res {
            Ok(Ok(Heartbeat::Alive)) => {
                tracing::trace!("Body is alive");
                return ProbeOutcome::Alive;
            }
            Ok(Ok(Heartbeat::Dead)) => "body has been terminated".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(payload) => format!("probe panicked: {}", panic_message(payload.as_ref())),
        };

        let failure = UpdaterFailure {
            body: body.clone(),
            location,
            cause,
        };
        let failed = self.registry.fail_all(body, &failure);
        tracing::warn!(
            location = %failure.location,
            failed,
            "Probe failed, futures updated with failure: {}",
            failure.cause
        );
        self.metrics.probe_failure_count.add(1, &labels);
        self.metrics.future_failed_count.add(failed as u64, &labels);

        if let Some(listener) = &self.listener {
            listener.failure_detected(body);
        }
        ProbeOutcome::Failed(failed)
    }

    /// One pass over all monitored bodies.
    ///
    /// Waits `interval` after every probe sent, or once at the end if
    /// nothing was probed. Returns `true` if `shutdown` fired.
    fn sweep(&self, interval: Duration, shutdown: &ShutdownSignal) -> bool {
        let mut probed = false;
        for body in self.registry.bodies() {
            if self.probe_body(&body) != ProbeOutcome::Nothing {
                probed = true;
                if shutdown.wait(interval) {
                    return true;
                }
            }
        }
        !probed && shutdown.wait(interval)
    }

    /// Start the monitoring thread.
    ///
    /// Returns `None` if monitoring is disabled. May only succeed once
    /// per monitor.
    pub fn start(self: &Arc<Self>) -> Result<Option<LoopHandle>> {
        let Some(interval) = self.config.interval else {
            tracing::info!("Future monitoring is disabled");
            return Ok(None);
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VigilError::AlreadyStarted);
        }

        let name = "vigil-future-monitor".to_string();
        let shutdown = ShutdownSignal::new();
        let this = self.clone();
        let shutdown_t = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::info!(?interval, "Future monitoring start");
                while !this.sweep(interval, &shutdown_t) {}
                tracing::info!("Future monitoring stop");
            })
            .reraise("error spawning future monitor thread")?;
        Ok(Some(LoopHandle::new(name, shutdown, thread)))
    }
}
