//! Bounded pool of single-threaded FIFO workers.
//!
//! Each worker owns one queue and one thread; the pool only decides
//! which worker gets the next job. Choosing the worker, advancing the
//! round-robin pointer and growing the pool all happen inside one
//! short critical section. Jobs never run while that lock is held.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::common::lock;
use crate::errors::Result;
use crate::metrics::PoolMetrics;

mod barrier;
mod worker;

pub use barrier::JobBarrier;
pub use barrier::JobOutcome;
use barrier::BarrierRelease;
use worker::Worker;

/// Identifies a worker across the lifetime of its pool, including
/// workers replaced by a reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WorkerIndex(pub usize);

impl fmt::Display for WorkerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unit of work run on a pool worker.
pub trait Job: Send + 'static {
    /// Name used in logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    fn execute(self: Box<Self>) -> Result<()>;
}

impl<F> Job for F
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    fn describe(&self) -> String {
        "closure".to_string()
    }

    fn execute(self: Box<Self>) -> Result<()> {
        (*self)()
    }
}

struct Slots {
    workers: Vec<Worker>,
    next: usize,
    spawned: usize,
}

pub struct WorkerPool {
    max: usize,
    slots: Mutex<Slots>,
    metrics: PoolMetrics,
}

impl WorkerPool {
    /// Empty pool that will hold at most `max` workers.
    ///
    /// A cap of zero is treated as one.
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            slots: Mutex::new(Slots {
                workers: Vec::with_capacity(max),
                next: 0,
                spawned: 0,
            }),
            metrics: PoolMetrics::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn size(&self) -> usize {
        lock(&self.slots).workers.len()
    }

    /// Add one worker unless the pool is full.
    ///
    /// Returns whether a worker was added.
    pub fn grow(&self) -> Result<bool> {
        let mut slots = lock(&self.slots);
        self.grow_locked(&mut slots)
    }

    fn grow_locked(&self, slots: &mut Slots) -> Result<bool> {
        if slots.workers.len() >= self.max {
            return Ok(false);
        }
        let index = WorkerIndex(slots.spawned);
        let worker = Worker::spawn(index, self.metrics.clone())?;
        slots.spawned += 1;
        slots.workers.push(worker);
        tracing::debug!(worker = %index, size = slots.workers.len(), "Pool grew");
        Ok(true)
    }

    fn dispatch(&self, job: Box<dyn Job>, release: Option<BarrierRelease>) -> Result<WorkerIndex> {
        let mut slots = lock(&self.slots);
        if slots.workers.is_empty() {
            self.grow_locked(&mut slots)?;
        }
        let idx = slots.next % slots.workers.len();
        slots.next = slots.next.wrapping_add(1);

        let worker = &slots.workers[idx];
        worker.add_job(job, release)?;
        Ok(worker.index())
    }

    /// Hand `job` to the next worker in round-robin order.
    ///
    /// Returns the worker chosen. The job runs later, on that worker's
    /// thread.
    pub fn submit<J: Job>(&self, job: J) -> Result<WorkerIndex> {
        self.dispatch(Box::new(job), None)
    }

    /// Like [`Self::submit`], but also return a barrier released after
    /// the job has run, whatever its outcome.
    pub fn submit_with_barrier<J: Job>(&self, job: J) -> Result<JobBarrier> {
        let (barrier, release) = JobBarrier::new();
        self.dispatch(Box::new(job), Some(release))?;
        Ok(barrier)
    }

    /// Stop every worker and start over with an empty pool.
    ///
    /// Jobs already queued still run on the old workers, which then
    /// exit. Returns the old workers so the caller can join them.
    pub(crate) fn reset(&self) -> Vec<Worker> {
        let old = {
            let mut slots = lock(&self.slots);
            slots.next = 0;
            std::mem::take(&mut slots.workers)
        };
        for worker in &old {
            worker.kill_me();
        }
        old
    }

    /// Stop every worker and wait for their queues to drain.
    pub fn shutdown(&self) {
        for worker in self.reset() {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers finish what they have queued in the background.
        drop(self.reset());
    }
}
