use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use super::FailureOutcome;
use super::RecoveryCoordinator;
use crate::common::LoopHandle;
use crate::common::ShutdownSignal;
use crate::errors::Reraise;
use crate::errors::Result;
use crate::identity::BodyId;
use crate::monitor::Heartbeat;
use crate::monitor::LivenessProbe;

/// Periodically probes every RUNNING supervised body and reports the
/// dead ones to the coordinator.
///
/// Used when fault tolerance is on, in place of future monitoring.
pub struct FaultDetector {
    coordinator: Arc<RecoveryCoordinator>,
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
}

impl FaultDetector {
    pub fn new(
        coordinator: Arc<RecoveryCoordinator>,
        probe: Arc<dyn LivenessProbe>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            probe,
            interval,
        }
    }

    fn is_alive(&self, body: &BodyId) -> bool {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.probe.probe(body))) {
            Ok(Ok(Heartbeat::Alive)) => true,
            Ok(Ok(Heartbeat::Dead)) => false,
            Ok(Err(err)) => {
                tracing::debug!(%body, "Fault detection probe failed: {err}");
                false
            }
            Err(_) => {
                tracing::debug!(%body, "Fault detection probe panicked");
                false
            }
        }
    }

    /// Probe every RUNNING body once.
    ///
    /// Returns the bodies for which a recovery was started.
    pub fn sweep(&self) -> Vec<BodyId> {
        let mut recovering = Vec::new();
        for body in self.coordinator.running_bodies() {
            if self.is_alive(&body) {
                continue;
            }
            tracing::warn!(%body, "Fault detected");
            if let FailureOutcome::Recovering(_) = self.coordinator.failure_detected(&body) {
                recovering.push(body);
            }
        }
        recovering
    }

    pub fn start(self) -> Result<LoopHandle> {
        let name = "vigil-fault-detector".to_string();
        let shutdown = ShutdownSignal::new();
        let shutdown_t = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::info!(interval = ?self.interval, "Fault detection start");
                while !shutdown_t.wait(self.interval) {
                    self.sweep();
                }
                tracing::info!("Fault detection stop");
            })
            .reraise("error spawning fault detector thread")?;
        Ok(LoopHandle::new(name, shutdown, thread))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::identity::HostRef;
    use crate::recovery::BodyState;
    use crate::recovery::Checkpoint;
    use crate::recovery::HashedTargets;
    use crate::recovery::InMemCheckpointStore;
    use crate::recovery::InMemLocations;
    use crate::recovery::Incarnation;
    use crate::recovery::ResumeEndpoint;

    struct NoopEndpoint;

    impl ResumeEndpoint for NoopEndpoint {
        fn resume(&self, _: &HostRef, _: &Checkpoint, _: Incarnation) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator() -> Arc<RecoveryCoordinator> {
        let coordinator = RecoveryCoordinator::new(
            1,
            Arc::new(InMemCheckpointStore::new()),
            Arc::new(HashedTargets::new(vec![HostRef::from("tcp://h9:1099")])),
            Arc::new(NoopEndpoint),
            Arc::new(InMemLocations::new()),
        );
        for body in ["alive", "dead", "gone"] {
            let body = BodyId::from(body);
            coordinator
                .checkpoints()
                .store(Checkpoint::new(body.clone(), 1, vec![]))
                .unwrap();
            coordinator.register(body).unwrap();
        }
        Arc::new(coordinator)
    }

    fn probe(body: &BodyId) -> io::Result<Heartbeat> {
        match body.0.as_str() {
            "dead" => Ok(Heartbeat::Dead),
            "gone" => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            _ => Ok(Heartbeat::Alive),
        }
    }

    #[test]
    fn sweep_recovers_unresponsive_bodies() {
        let coordinator = coordinator();
        let detector = FaultDetector::new(coordinator.clone(), Arc::new(probe), Duration::ZERO);

        let mut found = detector.sweep();
        found.sort();
        assert_eq!(found, vec![BodyId::from("dead"), BodyId::from("gone")]);
        assert_eq!(
            coordinator.state(&BodyId::from("alive")),
            Some(BodyState::Running)
        );

        // Bodies already recovering are not probed again.
        assert!(detector.sweep().is_empty());
    }

    #[test]
    fn background_loop_stops_on_shutdown() {
        let coordinator = coordinator();
        let handle = FaultDetector::new(
            coordinator.clone(),
            Arc::new(probe),
            Duration::from_millis(5),
        )
        .start()
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while coordinator.state(&BodyId::from("dead")) != Some(BodyState::Recovering) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
    }
}
