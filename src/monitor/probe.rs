use serde::Deserialize;
use serde::Serialize;

use crate::identity::BodyId;

/// Answer to a liveness probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Heartbeat {
    Alive,
    Dead,
}

/// Transport used to ask a body whether it is still alive.
///
/// Implementations own their network timeout; a probe that cannot get
/// an answer in time must return an error rather than block forever.
pub trait LivenessProbe: Send + Sync {
    fn probe(&self, body: &BodyId) -> std::io::Result<Heartbeat>;
}

impl<F> LivenessProbe for F
where
    F: Fn(&BodyId) -> std::io::Result<Heartbeat> + Send + Sync,
{
    fn probe(&self, body: &BodyId) -> std::io::Result<Heartbeat> {
        self(body)
    }
}
