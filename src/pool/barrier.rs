use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use crate::common::lock;

/// How a job submitted with a barrier ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    /// The worker went away before running the job.
    Abandoned,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Default)]
struct BarrierState {
    outcome: Mutex<Option<JobOutcome>>,
    released: Condvar,
}

/// Single-use handle for waiting on one job.
///
/// Released exactly once, after the job has finished running (or
/// once it is certain it never will). Any number of threads may wait,
/// before or after the release.
#[derive(Clone)]
pub struct JobBarrier {
    state: Arc<BarrierState>,
}

impl JobBarrier {
    pub(crate) fn new() -> (Self, BarrierRelease) {
        let state = Arc::new(BarrierState::default());
        (
            Self {
                state: state.clone(),
            },
            BarrierRelease { state: Some(state) },
        )
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state.outcome).is_some()
    }

    pub fn wait(&self) -> JobOutcome {
        let mut outcome = lock(&self.state.outcome);
        loop {
            if let Some(found) = &*outcome {
                return found.clone();
            }
            outcome = self
                .state
                .released
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = lock(&self.state.outcome);
        loop {
            if let Some(found) = &*outcome {
                return Some(found.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            outcome = self
                .state
                .released
                .wait_timeout(outcome, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Worker's side of a [`JobBarrier`].
///
/// Dropping it unreleased releases the barrier as
/// [`JobOutcome::Abandoned`], so waiters never hang on a job that was
/// thrown away with its queue.
pub(crate) struct BarrierRelease {
    state: Option<Arc<BarrierState>>,
}

impl BarrierRelease {
    pub(crate) fn release(mut self, outcome: JobOutcome) {
        if let Some(state) = self.state.take() {
            Self::publish(&state, outcome);
        }
    }

    fn publish(state: &BarrierState, outcome: JobOutcome) {
        *lock(&state.outcome) = Some(outcome);
        state.released.notify_all();
    }
}

impl Drop for BarrierRelease {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            Self::publish(&state, JobOutcome::Abandoned);
        }
    }
}

#[test]
fn release_wakes_all_waiters() {
    let (barrier, release) = JobBarrier::new();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let barrier = barrier.clone();
            std::thread::spawn(move || barrier.wait())
        })
        .collect();
    std::thread::sleep(Duration::from_millis(10));
    assert!(!barrier.is_released());
    release.release(JobOutcome::Completed);
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), JobOutcome::Completed);
    }
    // Idempotent after release.
    assert_eq!(barrier.wait(), JobOutcome::Completed);
}

#[test]
fn dropped_release_abandons() {
    let (barrier, release) = JobBarrier::new();
    drop(release);
    assert_eq!(barrier.wait(), JobOutcome::Abandoned);
}

#[test]
fn wait_timeout_before_release() {
    let (barrier, _release) = JobBarrier::new();
    assert_eq!(barrier.wait_timeout(Duration::from_millis(5)), None);
}
