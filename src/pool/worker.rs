use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use opentelemetry::KeyValue;

use super::barrier::BarrierRelease;
use super::barrier::JobOutcome;
use super::Job;
use super::WorkerIndex;
use crate::errors::panic_message;
use crate::errors::prepend_tname;
use crate::errors::Reraise;
use crate::errors::Result;
use crate::errors::VigilError;
use crate::metrics::PoolMetrics;

pub(crate) enum Envelope {
    Run(Box<dyn Job>, Option<BarrierRelease>),
    Stop,
}

/// One background thread draining one FIFO queue.
pub(crate) struct Worker {
    index: WorkerIndex,
    tx: Sender<Envelope>,
    alive: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(index: WorkerIndex, metrics: PoolMetrics) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let thread = std::thread::Builder::new()
            .name(format!("vigil-worker-{index}"))
            .spawn(move || worker_main(rx, metrics))
            .reraise("error spawning pool worker thread")?;
        Ok(Self {
            index,
            tx,
            alive,
            thread,
        })
    }

    pub(crate) fn index(&self) -> WorkerIndex {
        self.index
    }

    /// Enqueue `job` behind everything already queued.
    ///
    /// Returns immediately. A barrier attached here is released by the
    /// worker once the job has run, or as abandoned if the job is
    /// never run.
    pub(crate) fn add_job(&self, job: Box<dyn Job>, release: Option<BarrierRelease>) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(VigilError::WorkerStopped(self.index));
        }
        // A send error hands the envelope back; dropping it abandons
        // the barrier.
        self.tx
            .send(Envelope::Run(job, release))
            .map_err(|_| VigilError::WorkerStopped(self.index))
    }

    /// Refuse new jobs and exit once the jobs already queued are done.
    pub(crate) fn kill_me(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            tracing::debug!(worker = %self.index, "Stopping worker");
            // Thread already gone means there is nothing to stop.
            let _ = self.tx.send(Envelope::Stop);
        }
    }

    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!(worker = %self.index, "Worker thread panicked");
        }
    }
}

fn worker_main(rx: Receiver<Envelope>, metrics: PoolMetrics) {
    tracing::trace!("Worker start");
    let labels: [KeyValue; 0] = [];
    while let Ok(envelope) = rx.recv() {
        let (job, release) = match envelope {
            Envelope::Run(job, release) => (job, release),
            Envelope::Stop => break,
        };
        let description = job.describe();
        let span = tracing::debug_span!("job", job = %description).entered();

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| job.execute())) {
            Ok(Ok(())) => JobOutcome::Completed,
            Ok(Err(err)) => {
                tracing::error!("{}", prepend_tname(format!("Job failed: {err}")));
                JobOutcome::Failed(err.to_string())
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!("{}", prepend_tname(format!("Job panicked: {msg}")));
                metrics.job_panic_count.add(1, &labels);
                JobOutcome::Panicked(msg)
            }
        };
        metrics.job_count.add(1, &labels);
        drop(span);

        if let Some(release) = release {
            release.release(outcome);
        }
    }
    tracing::trace!("Worker stop");
}
