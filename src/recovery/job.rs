use std::fmt;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde::Serialize;

use super::location::LocationServer;
use super::BodyState;
use crate::errors::Result;
use crate::errors::VigilError;
use crate::identity::BodyId;
use crate::identity::HostRef;
use crate::metrics::RecoveryMetrics;
use crate::pool::Job;
use crate::with_timer;

/// Recovery attempt number for one body.
///
/// Starts at 1 and grows by one on every attempt, across
/// re-registrations, so a resumed body can always tell a newer attempt
/// from a stale one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Incarnation(pub u64);

impl fmt::Display for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque snapshot of a body.
///
/// The content of `state` is produced and consumed elsewhere; this
/// crate only stores and ships it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub body: BodyId,
    /// Sequence number; higher is newer.
    pub index: u64,
    pub taken_at: DateTime<Utc>,
    pub state: Vec<u8>,
}

impl Checkpoint {
    pub fn new(body: BodyId, index: u64, state: Vec<u8>) -> Self {
        Self {
            body,
            index,
            taken_at: Utc::now(),
            state,
        }
    }
}

/// Runtime on a host that can restart a body from a checkpoint.
pub trait ResumeEndpoint: Send + Sync {
    fn resume(&self, target: &HostRef, checkpoint: &Checkpoint, incarnation: Incarnation)
        -> Result<()>;
}

impl<F> ResumeEndpoint for F
where
    F: Fn(&HostRef, &Checkpoint, Incarnation) -> Result<()> + Send + Sync,
{
    fn resume(
        &self,
        target: &HostRef,
        checkpoint: &Checkpoint,
        incarnation: Incarnation,
    ) -> Result<()> {
        self(target, checkpoint, incarnation)
    }
}

/// Everything needed to restart one body once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryJob {
    checkpoint: Checkpoint,
    incarnation: Incarnation,
    target: HostRef,
}

impl RecoveryJob {
    pub fn new(checkpoint: Checkpoint, incarnation: Incarnation, target: HostRef) -> Self {
        Self {
            checkpoint,
            incarnation,
            target,
        }
    }

    pub fn body(&self) -> &BodyId {
        &self.checkpoint.body
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn target(&self) -> &HostRef {
        &self.target
    }
}

/// A [`RecoveryJob`] bound to the collaborators that carry it out.
pub(crate) struct RecoveryTask {
    pub(crate) job: RecoveryJob,
    /// The coordinator's state table. A body missing from it was
    /// unregistered while the job was in flight.
    pub(crate) states: Arc<DashMap<BodyId, BodyState>>,
    pub(crate) endpoint: Arc<dyn ResumeEndpoint>,
    pub(crate) locations: Arc<dyn LocationServer>,
    pub(crate) metrics: RecoveryMetrics,
}

impl Job for RecoveryTask {
    fn describe(&self) -> String {
        format!(
            "recover {} as incarnation {} on {}",
            self.job.body(),
            self.job.incarnation,
            self.job.target
        )
    }

    /// Ship the checkpoint and ask the target to resume.
    ///
    /// A failure is returned for the worker to log; there is no retry
    /// and the body stays RECOVERING.
    fn execute(self: Box<Self>) -> Result<()> {
        let job = &self.job;
        let labels = [KeyValue::new("target", job.target.url().to_string())];
        let res = with_timer!(
            self.metrics.resume_duration,
            labels,
            self.endpoint
                .resume(&job.target, &job.checkpoint, job.incarnation)
        );
        match res {
            Ok(()) => {
                // Hold the entry so a concurrent unregister either runs
                // before the check or forgets the location after us.
                match self.states.get(job.body()) {
                    Some(_entry) => self.locations.update(job.body(), job.target.url().clone()),
                    None => tracing::debug!(
                        body = %job.body(),
                        "Body unregistered during recovery, location not recorded"
                    ),
                }
                tracing::info!(
                    body = %job.body(),
                    incarnation = %job.incarnation,
                    target = %job.target,
                    checkpoint = job.checkpoint.index,
                    "Body resumed"
                );
                Ok(())
            }
            Err(err) => {
                self.metrics.recovery_job_failed_count.add(1, &labels);
                Err(VigilError::Resume {
                    body: job.body().clone(),
                    target: job.target.clone(),
                    msg: err.to_string(),
                })
            }
        }
    }
}
