//! Turning a detected failure into a checkpoint-based restart.
//!
//! The [`RecoveryCoordinator`] keeps one state per supervised body.
//! A failure signal moves a RUNNING body to RECOVERING and queues a
//! [`RecoveryJob`] on the worker pool; the job ships the body's latest
//! checkpoint to a target host and asks it to resume. Nothing here
//! moves a body back to RUNNING: the resumed body registers again, or
//! someone calls [`RecoveryCoordinator::update_state`].
//!
//! The coordinator talks to the rest of the system only through the
//! collaborator traits re-exported here.

use std::sync::Arc;

use dashmap::DashMap;
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;
use crate::errors::VigilError;
use crate::identity::BodyId;
use crate::metrics::RecoveryMetrics;
use crate::monitor::FailureListener;
use crate::pool::Job;
use crate::pool::JobBarrier;
use crate::pool::WorkerIndex;
use crate::pool::WorkerPool;

mod detector;
mod job;
mod location;
mod sqlite;
mod store;
mod target;

pub use detector::FaultDetector;
pub use job::Checkpoint;
pub use job::Incarnation;
pub use job::RecoveryJob;
pub use job::ResumeEndpoint;
use job::RecoveryTask;
pub use location::InMemLocations;
pub use location::LocationServer;
pub use sqlite::SqliteCheckpointStore;
pub use store::CheckpointStore;
pub use store::InMemCheckpointStore;
pub use target::HashedTargets;
pub use target::RandomTargets;
pub use target::TargetChooser;

/// Supervision state of one body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyState {
    Running,
    Recovering,
    /// Set from outside through [`RecoveryCoordinator::update_state`].
    Custom(String),
}

/// What [`RecoveryCoordinator::failure_detected`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A recovery job was queued.
    Recovering(Incarnation),
    /// A recovery for this body is already under way.
    AlreadyRecovering,
    /// The body is not supervised.
    Unknown,
    /// The body is in a custom state; failures are left to whoever set
    /// it.
    Ignored(String),
    /// The body went RECOVERING but no job could be queued. It stays
    /// RECOVERING until something outside registers it again.
    Abandoned(String),
}

pub struct RecoveryCoordinator {
    states: Arc<DashMap<BodyId, BodyState>>,
    /// Last attempt number per body. Entries outlive `unregister` and
    /// `initialize`, so this holds one counter for every body that has
    /// ever failed during the coordinator's lifetime.
    incarnations: DashMap<BodyId, u64>,
    pool: WorkerPool,
    checkpoints: Arc<dyn CheckpointStore>,
    targets: Arc<dyn TargetChooser>,
    endpoint: Arc<dyn ResumeEndpoint>,
    locations: Arc<dyn LocationServer>,
    metrics: RecoveryMetrics,
}

impl RecoveryCoordinator {
    pub fn new(
        max_workers: usize,
        checkpoints: Arc<dyn CheckpointStore>,
        targets: Arc<dyn TargetChooser>,
        endpoint: Arc<dyn ResumeEndpoint>,
        locations: Arc<dyn LocationServer>,
    ) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            incarnations: DashMap::new(),
            pool: WorkerPool::new(max_workers),
            checkpoints,
            targets,
            endpoint,
            locations,
            metrics: RecoveryMetrics::new(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn locations(&self) -> &Arc<dyn LocationServer> {
        &self.locations
    }

    /// Supervise `body` as RUNNING, and add a worker if the pool has
    /// room.
    ///
    /// Registering again resets the body to RUNNING.
    pub fn register(&self, body: BodyId) -> Result<()> {
        tracing::debug!(%body, "Registering body");
        self.states.insert(body, BodyState::Running);
        self.pool.grow()?;
        Ok(())
    }

    /// Stop supervising `body`. No-op if it was never registered.
    pub fn unregister(&self, body: &BodyId) {
        if self.states.remove(body).is_some() {
            tracing::debug!(%body, "Unregistered body");
        }
        self.locations.forget(body);
    }

    pub fn state(&self, body: &BodyId) -> Option<BodyState> {
        self.states.get(body).map(|state| state.clone())
    }

    /// Overwrite the state of `body`, registered or not.
    pub fn update_state(&self, body: BodyId, state: BodyState) {
        tracing::debug!(%body, ?state, "State updated");
        self.states.insert(body, state);
    }

    /// Number of supervised bodies.
    pub fn system_size(&self) -> usize {
        self.states.len()
    }

    /// Supervised bodies currently RUNNING.
    pub fn running_bodies(&self) -> Vec<BodyId> {
        self.states
            .iter()
            .filter(|entry| *entry.value() == BodyState::Running)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn states_snapshot(&self) -> Vec<(BodyId, BodyState)> {
        let mut rows: Vec<_> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// React to `body` having been found dead.
    ///
    /// Only the signal that moves a body from RUNNING to RECOVERING
    /// starts a recovery; repeats while RECOVERING are absorbed.
    pub fn failure_detected(&self, body: &BodyId) -> FailureOutcome {
        // The shard write lock makes check-and-set one step.
        match self.states.get_mut(body) {
            None => {
                tracing::debug!(%body, "Failure of unsupervised body ignored");
                return FailureOutcome::Unknown;
            }
            Some(mut state) => {
                if let BodyState::Custom(custom) = &*state {
                    tracing::debug!(%body, state = %custom, "Failure ignored in custom state");
                    return FailureOutcome::Ignored(custom.clone());
                }
                if *state == BodyState::Recovering {
                    tracing::debug!(%body, "Already recovering");
                    self.metrics.recovery_duplicate_count.add(1, &[]);
                    return FailureOutcome::AlreadyRecovering;
                }
                *state = BodyState::Recovering;
            }
        }

        self.metrics.recovery_started_count.add(1, &[]);
        match self.recover(body) {
            Ok(incarnation) => {
                tracing::info!(%body, %incarnation, "Recovery started");
                FailureOutcome::Recovering(incarnation)
            }
            Err(err) => {
                tracing::error!(%body, "Unable to start recovery: {err}");
                self.metrics
                    .recovery_job_failed_count
                    .add(1, &[KeyValue::new("stage", "submit")]);
                FailureOutcome::Abandoned(err.to_string())
            }
        }
    }

    fn next_incarnation(&self, body: &BodyId) -> Incarnation {
        let mut counter = self.incarnations.entry(body.clone()).or_insert(0);
        *counter += 1;
        Incarnation(*counter)
    }

    fn recover(&self, body: &BodyId) -> Result<Incarnation> {
        let checkpoint = self
            .checkpoints
            .latest(body)?
            .ok_or_else(|| VigilError::NoCheckpoint(body.clone()))?;
        let current = self.locations.lookup(body);
        let target = self.targets.choose(body, current.as_ref())?;
        let incarnation = self.next_incarnation(body);

        let job = RecoveryJob::new(checkpoint, incarnation, target);
        self.pool.submit(RecoveryTask {
            job,
            states: self.states.clone(),
            endpoint: self.endpoint.clone(),
            locations: self.locations.clone(),
            metrics: self.metrics.clone(),
        })?;
        Ok(incarnation)
    }

    pub fn submit_job<J: Job>(&self, job: J) -> Result<WorkerIndex> {
        self.pool.submit(job)
    }

    pub fn submit_job_with_barrier<J: Job>(&self, job: J) -> Result<JobBarrier> {
        self.pool.submit_with_barrier(job)
    }

    /// Forget every body and replace the pool with an empty one.
    ///
    /// Jobs already queued still run on the old workers, which then
    /// exit without taking new work. Incarnation counters survive so
    /// later attempts still number above earlier ones.
    pub fn initialize(&self) {
        tracing::info!(bodies = self.states.len(), "Resetting recovery coordinator");
        self.states.clear();
        drop(self.pool.reset());
    }

    /// Stop the pool and wait for queued jobs to finish.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl FailureListener for RecoveryCoordinator {
    fn failure_detected(&self, body: &BodyId) {
        RecoveryCoordinator::failure_detected(self, body);
    }
}
