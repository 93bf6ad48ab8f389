//! Starting and stopping the supervision stack as a whole.
//!
//! [`Supervision::start`] reads a [`Config`] and wires the
//! [`FutureMonitor`] to the [`RecoveryCoordinator`] so that a body
//! found dead is both failed out of every pending future and queued
//! for recovery. With fault tolerance on, the [`FaultDetector`] takes
//! over liveness checks instead.

use std::sync::Arc;

use crate::common::LoopHandle;
use crate::config::Config;
use crate::errors::Reraise;
use crate::errors::Result;
use crate::metrics::initialize_metrics;
use crate::monitor::FailureListener;
use crate::monitor::FutureMonitor;
use crate::monitor::LivenessProbe;
use crate::monitor::MonitorConfig;
use crate::recovery::CheckpointStore;
use crate::recovery::FaultDetector;
use crate::recovery::InMemCheckpointStore;
use crate::recovery::InMemLocations;
use crate::recovery::LocationServer;
use crate::recovery::RecoveryCoordinator;
use crate::recovery::ResumeEndpoint;
use crate::recovery::SqliteCheckpointStore;
use crate::recovery::TargetChooser;
use crate::tracing::VigilTracer;
use crate::webserver::start_server_runtime;
use crate::webserver::ApiServer;
use crate::webserver::ApiState;

/// The outside world, as seen by supervision.
pub struct Collaborators {
    pub probe: Arc<dyn LivenessProbe>,
    pub targets: Arc<dyn TargetChooser>,
    pub endpoint: Arc<dyn ResumeEndpoint>,
    /// Defaults to what the config names: SQLite if a database path is
    /// set, in memory otherwise.
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    /// Defaults to an in-memory table.
    pub locations: Option<Arc<dyn LocationServer>>,
}

impl Collaborators {
    pub fn new(
        probe: Arc<dyn LivenessProbe>,
        targets: Arc<dyn TargetChooser>,
        endpoint: Arc<dyn ResumeEndpoint>,
    ) -> Self {
        Self {
            probe,
            targets,
            endpoint,
            checkpoints: None,
            locations: None,
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_locations(mut self, locations: Arc<dyn LocationServer>) -> Self {
        self.locations = Some(locations);
        self
    }
}

pub fn checkpoint_store_from_config(config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    match &config.checkpoint_db {
        Some(path) => Ok(Arc::new(SqliteCheckpointStore::open(path)?)),
        None => Ok(Arc::new(InMemCheckpointStore::new())),
    }
}

/// Start the monitor loop, and the fault detector if asked to.
///
/// Either every loop is running or none is.
fn start_loops(
    config: &Config,
    monitor: &Arc<FutureMonitor>,
    coordinator: &Arc<RecoveryCoordinator>,
    probe: Arc<dyn LivenessProbe>,
) -> Result<Vec<LoopHandle>> {
    let mut loops = Vec::new();
    if let Some(handle) = monitor.start()? {
        loops.push(handle);
    }
    if config.fault_tolerance {
        let detector = FaultDetector::new(
            coordinator.clone(),
            probe,
            config.fault_detection_interval(),
        );
        match detector.start() {
            Ok(handle) => loops.push(handle),
            Err(err) => {
                for handle in loops {
                    handle.shutdown();
                }
                return Err(err);
            }
        }
    }
    Ok(loops)
}

/// Running supervision: the monitor, the coordinator and whatever
/// background threads the config asked for.
pub struct Supervision {
    config: Config,
    monitor: Arc<FutureMonitor>,
    coordinator: Arc<RecoveryCoordinator>,
    loops: Vec<LoopHandle>,
    api: Option<ApiServer>,
    _tracer: VigilTracer,
}

impl Supervision {
    pub fn start(config: Config, collab: Collaborators) -> Result<Self> {
        config.validate()?;

        let tracer = VigilTracer::new()?;
        // Only the setup needs the runtime entered; exporters keep
        // running on the tracer's own threads.
        drop(tracer.setup(config.otlp(), config.log_level.as_deref())?);
        initialize_metrics().reraise("error initializing metrics")?;

        let checkpoints = match collab.checkpoints {
            Some(checkpoints) => checkpoints,
            None => checkpoint_store_from_config(&config)?,
        };
        let locations = collab
            .locations
            .unwrap_or_else(|| Arc::new(InMemLocations::new()));
        let coordinator = Arc::new(RecoveryCoordinator::new(
            config.max_workers,
            checkpoints,
            collab.targets,
            collab.endpoint,
            locations,
        ));

        let listener: Arc<dyn FailureListener> = coordinator.clone();
        let monitor = Arc::new(
            FutureMonitor::new(
                collab.probe.clone(),
                MonitorConfig {
                    interval: config.monitoring_interval(),
                    fault_tolerance: config.fault_tolerance,
                },
            )
            .with_listener(listener),
        );

        // Bind the API first; a failure here leaves no thread behind.
        let api = config
            .api_port
            .map(|port| {
                start_server_runtime(
                    ApiState {
                        monitor: monitor.clone(),
                        coordinator: coordinator.clone(),
                    },
                    port,
                )
            })
            .transpose()?;
        let loops = match start_loops(&config, &monitor, &coordinator, collab.probe) {
            Ok(loops) => loops,
            Err(err) => {
                if let Some(api) = api {
                    api.shutdown();
                }
                return Err(err);
            }
        };

        tracing::info!(
            monitoring = ?config.monitoring_interval(),
            fault_tolerance = config.fault_tolerance,
            max_workers = config.max_workers,
            "Supervision started"
        );
        Ok(Self {
            config,
            monitor,
            coordinator,
            loops,
            api,
            _tracer: tracer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<FutureMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &Arc<RecoveryCoordinator> {
        &self.coordinator
    }

    pub fn api(&self) -> Option<&ApiServer> {
        self.api.as_ref()
    }

    /// Stop background threads and the API, then let queued jobs
    /// finish.
    pub fn shutdown(self) {
        for handle in self.loops {
            handle.shutdown();
        }
        if let Some(api) = self.api {
            api.shutdown();
        }
        self.coordinator.shutdown();
        tracing::info!("Supervision stopped");
    }
}
