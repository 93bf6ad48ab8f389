//! Placeholder results of asynchronous calls.
//!
//! A [`FutureReply`] is created by the invocation layer when it sends
//! a request and is resolved exactly once: either by the reply
//! arriving, or by the [`crate::monitor::FutureMonitor`] deciding the
//! body that was supposed to answer (the "updater") is gone.
//!
//! The monitor only keeps a type-erased [`Monitorable`] handle on the
//! shared state, so futures of any result type can share a registry.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

use crate::common::lock;
use crate::identity::BodyId;
use crate::identity::FutureId;
use crate::identity::NodeUrl;
use crate::monitor::FutureRegistry;

/// The updater of a future was found dead or unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("awaited body {body} on {location} failed its liveness probe: {cause}")]
pub struct UpdaterFailure {
    pub body: BodyId,
    pub location: NodeUrl,
    pub cause: String,
}

/// Why a future resolved without a value.
///
/// Lets callers tell a failed remote method apart from a lost
/// updater.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("remote method failed: {0}")]
    Method(String),
    #[error(transparent)]
    UpdaterFailed(#[from] UpdaterFailure),
}

/// What the future registry needs to know about a future.
pub(crate) trait Monitorable: Send + Sync {
    fn future_id(&self) -> FutureId;

    fn updater(&self) -> &BodyId;

    fn updater_location(&self) -> &NodeUrl;

    fn is_awaited(&self) -> bool;

    /// Resolve with `failure` if still awaited.
    ///
    /// Returns `true` only if this call did the resolving.
    fn fail(&self, failure: &UpdaterFailure) -> bool;

    /// Ask to be removed from `registry` on resolution.
    ///
    /// Returns `false` if the future has already resolved, in which
    /// case it must not be registered.
    fn watch(&self, registry: Weak<FutureRegistry>) -> bool;
}

struct Slot<T> {
    outcome: Option<Result<T, ReplyError>>,
    watcher: Option<Weak<FutureRegistry>>,
}

struct Shared<T> {
    id: FutureId,
    updater: BodyId,
    location: NodeUrl,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    /// Write-once transition out of the awaited state.
    fn complete(&self, result: Result<T, ReplyError>) -> bool {
        let watcher = {
            let mut slot = lock(&self.slot);
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(result);
            slot.watcher.take()
        };
        self.ready.notify_all();

        // Lock released above: the registry may be holding one of its
        // own locks while it calls back into `fail`.
        if let Some(registry) = watcher.and_then(|w| w.upgrade()) {
            registry.remove(&self.updater, self.id);
        }
        true
    }
}

impl<T> Monitorable for Shared<T>
where
    T: Send + 'static,
{
    fn future_id(&self) -> FutureId {
        self.id
    }

    fn updater(&self) -> &BodyId {
        &self.updater
    }

    fn updater_location(&self) -> &NodeUrl {
        &self.location
    }

    fn is_awaited(&self) -> bool {
        lock(&self.slot).outcome.is_none()
    }

    fn fail(&self, failure: &UpdaterFailure) -> bool {
        self.complete(Err(ReplyError::UpdaterFailed(failure.clone())))
    }

    fn watch(&self, registry: Weak<FutureRegistry>) -> bool {
        let mut slot = lock(&self.slot);
        if slot.outcome.is_some() {
            return false;
        }
        slot.watcher = Some(registry);
        true
    }
}

/// Placeholder for the result of one asynchronous call.
///
/// Cloning gives another handle on the same result.
pub struct FutureReply<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FutureReply<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for FutureReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureReply")
            .field("id", &self.shared.id)
            .field("updater", &self.shared.updater)
            .field("awaited", &lock(&self.shared.slot).outcome.is_none())
            .finish()
    }
}

impl<T> FutureReply<T>
where
    T: Clone + Send + 'static,
{
    /// A new, awaited future that `updater` is expected to resolve.
    pub fn new(updater: BodyId, location: NodeUrl) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: FutureId::next(),
                updater,
                location,
                slot: Mutex::new(Slot {
                    outcome: None,
                    watcher: None,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> FutureId {
        self.shared.id
    }

    pub fn updater(&self) -> &BodyId {
        &self.shared.updater
    }

    pub fn updater_location(&self) -> &NodeUrl {
        &self.shared.location
    }

    pub fn is_awaited(&self) -> bool {
        self.shared.is_awaited()
    }

    /// Record the outcome of the call.
    ///
    /// Returns `false` and drops `result` if the future was already
    /// resolved, e.g. by the monitor failing it first.
    pub fn resolve(&self, result: Result<T, ReplyError>) -> bool {
        self.shared.complete(result)
    }

    /// Record a successful reply.
    pub fn reply(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Current outcome, if resolved.
    pub fn try_get(&self) -> Option<Result<T, ReplyError>> {
        lock(&self.shared.slot).outcome.clone()
    }

    /// Block until resolved.
    pub fn wait(&self) -> Result<T, ReplyError> {
        let mut slot = lock(&self.shared.slot);
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until resolved or `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, ReplyError>> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.shared.slot);
        loop {
            if let Some(outcome) = &slot.outcome {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn monitorable(&self) -> Arc<dyn Monitorable> {
        self.shared.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> UpdaterFailure {
        UpdaterFailure {
            body: BodyId::from("b1"),
            location: NodeUrl::from("tcp://h1:1099"),
            cause: "connection refused".into(),
        }
    }

    #[test]
    fn resolves_once() {
        let fut: FutureReply<u32> = FutureReply::new(BodyId::from("b1"), NodeUrl::default());
        assert!(fut.is_awaited());
        assert!(fut.reply(7));
        assert!(!fut.reply(8));
        assert!(!fut.is_awaited());
        assert_eq!(fut.wait(), Ok(7));
    }

    #[test]
    fn failure_is_distinguishable_from_method_error() {
        let fut: FutureReply<u32> = FutureReply::new(BodyId::from("b1"), NodeUrl::default());
        assert!(fut.monitorable().fail(&failure()));
        match fut.wait() {
            Err(ReplyError::UpdaterFailed(f)) => {
                assert_eq!(f.body, BodyId::from("b1"));
                assert_eq!(f.location, NodeUrl::from("tcp://h1:1099"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let fut: FutureReply<u32> = FutureReply::new(BodyId::from("b1"), NodeUrl::default());
        fut.resolve(Err(ReplyError::Method("division by zero".into())));
        assert!(!fut.monitorable().fail(&failure()));
        assert_eq!(
            fut.try_get(),
            Some(Err(ReplyError::Method("division by zero".into())))
        );
    }

    #[test]
    fn wait_blocks_until_reply() {
        let fut: FutureReply<String> = FutureReply::new(BodyId::from("b2"), NodeUrl::default());
        let fut_t = fut.clone();
        let t = std::thread::spawn(move || fut_t.wait());
        std::thread::sleep(Duration::from_millis(10));
        fut.reply("done".into());
        assert_eq!(t.join().unwrap(), Ok("done".to_string()));
    }

    #[test]
    fn wait_timeout_expires() {
        let fut: FutureReply<u8> = FutureReply::new(BodyId::from("b3"), NodeUrl::default());
        assert_eq!(fut.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn watch_refused_after_resolution() {
        let fut: FutureReply<u8> = FutureReply::new(BodyId::from("b4"), NodeUrl::default());
        fut.reply(1);
        assert!(!fut.monitorable().watch(Weak::new()));
    }

    #[test]
    fn failure_message_names_body_and_location() {
        let text = ReplyError::from(failure()).to_string();
        assert!(text.contains("b1"));
        assert!(text.contains("tcp://h1:1099"));
    }
}
