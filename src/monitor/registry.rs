//! Futures awaiting a reply, grouped by the body that will send it.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::future::Monitorable;
use crate::future::UpdaterFailure;
use crate::identity::BodyId;
use crate::identity::FutureId;
use crate::identity::NodeUrl;

struct Watched {
    location: NodeUrl,
    futures: Vec<Arc<dyn Monitorable>>,
}

/// One row of [`FutureRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredBody {
    pub body: BodyId,
    pub location: NodeUrl,
    pub pending: usize,
}

/// Map of updater body to the futures it still owes a reply.
///
/// A body has an entry iff at least one of its futures is registered.
/// Every mutation is a single per-key atomic step on the underlying
/// [`DashMap`], so an entry can't be emptied by one thread while
/// another is appending to it.
#[derive(Default)]
pub struct FutureRegistry {
    bodies: DashMap<BodyId, Watched>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bodies with registered futures.
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Number of futures registered under `body`.
    pub fn pending(&self, body: &BodyId) -> usize {
        self.bodies
            .get(body)
            .map(|watched| watched.futures.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, body: &BodyId, id: FutureId) -> bool {
        self.bodies
            .get(body)
            .map(|watched| watched.futures.iter().any(|f| f.future_id() == id))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<MonitoredBody> {
        let mut rows: Vec<_> = self
            .bodies
            .iter()
            .map(|entry| MonitoredBody {
                body: entry.key().clone(),
                location: entry.location.clone(),
                pending: entry.futures.len(),
            })
            .collect();
        rows.sort_by(|a, b| a.body.cmp(&b.body));
        rows
    }

    /// Bodies currently holding futures.
    ///
    /// A copy, so the caller can probe without holding any shard lock.
    pub(crate) fn bodies(&self) -> Vec<BodyId> {
        self.bodies.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) fn insert(&self, future: Arc<dyn Monitorable>) {
        let mut watched = self
            .bodies
            .entry(future.updater().clone())
            .or_insert_with(|| Watched {
                location: future.updater_location().clone(),
                futures: Vec::new(),
            });
        let id = future.future_id();
        if !watched.futures.iter().any(|f| f.future_id() == id) {
            watched.futures.push(future);
        }
    }

    /// Drop one future, and the body's entry with it if that was the
    /// last one.
    ///
    /// Unknown bodies and futures are ignored.
    pub(crate) fn remove(&self, body: &BodyId, id: FutureId) -> bool {
        let mut found = false;
        self.bodies.remove_if_mut(body, |_, watched| {
            let before = watched.futures.len();
            watched.futures.retain(|f| f.future_id() != id);
            found = watched.futures.len() != before;
            watched.futures.is_empty()
        });
        found
    }

    /// Location of `body` if it has at least one future still awaited
    /// right now, i.e. if there is a reason to probe it.
    pub(crate) fn representative(&self, body: &BodyId) -> Option<NodeUrl> {
        let watched = self.bodies.get(body)?;
        watched
            .futures
            .iter()
            .any(|f| f.is_awaited())
            .then(|| watched.location.clone())
    }

    /// Fail every awaited future of `body` with `failure`.
    ///
    /// This is deliberately a broadcast: all futures sharing an updater
    /// share its fate, even though only one probe was sent. The whole
    /// entry leaves the registry in one step, so each future is
    /// resolved exactly once, and a future registered after this call
    /// starts a fresh entry.
    ///
    /// Returns how many futures this call resolved.
    pub(crate) fn fail_all(&self, body: &BodyId, failure: &UpdaterFailure) -> usize {
        let Some((_, watched)) = self.bodies.remove(body) else {
            return 0;
        };
        watched
            .futures
            .iter()
            .filter(|future| future.fail(failure))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureReply;

    fn reply(body: &str) -> FutureReply<u32> {
        FutureReply::new(BodyId::from(body), NodeUrl::from("tcp://h1:1099"))
    }

    #[test]
    fn insert_is_idempotent() {
        let registry = FutureRegistry::new();
        let f = reply("x");
        registry.insert(f.monitorable());
        registry.insert(f.monitorable());
        assert_eq!(registry.pending(&BodyId::from("x")), 1);
    }

    #[test]
    fn removing_last_future_drops_body() {
        let registry = FutureRegistry::new();
        let f1 = reply("y");
        let f2 = reply("y");
        registry.insert(f1.monitorable());
        registry.insert(f2.monitorable());

        assert!(registry.remove(&BodyId::from("y"), f1.id()));
        assert_eq!(registry.pending(&BodyId::from("y")), 1);
        assert!(registry.contains(&BodyId::from("y"), f2.id()));

        assert!(registry.remove(&BodyId::from("y"), f2.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry = FutureRegistry::new();
        assert!(!registry.remove(&BodyId::from("nobody"), reply("nobody").id()));
        let f = reply("z");
        registry.insert(f.monitorable());
        assert!(!registry.remove(&BodyId::from("z"), reply("z").id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn representative_skips_resolved() {
        let registry = FutureRegistry::new();
        let f = reply("r");
        registry.insert(f.monitorable());
        assert_eq!(
            registry.representative(&BodyId::from("r")),
            Some(NodeUrl::from("tcp://h1:1099"))
        );
        // Resolve without the watcher hook so the entry lingers.
        f.reply(3);
        assert_eq!(registry.representative(&BodyId::from("r")), None);
    }

    #[test]
    fn fail_all_resolves_each_awaited_future_once() {
        let registry = FutureRegistry::new();
        let f1 = reply("d");
        let f2 = reply("d");
        let f3 = reply("d");
        registry.insert(f1.monitorable());
        registry.insert(f2.monitorable());
        registry.insert(f3.monitorable());
        f3.reply(1);

        let failure = UpdaterFailure {
            body: BodyId::from("d"),
            location: NodeUrl::from("tcp://h1:1099"),
            cause: "dead".into(),
        };
        assert_eq!(registry.fail_all(&BodyId::from("d"), &failure), 2);
        assert_eq!(registry.fail_all(&BodyId::from("d"), &failure), 0);
        assert!(registry.is_empty());
        assert!(f1.try_get().unwrap().is_err());
        assert!(f2.try_get().unwrap().is_err());
        assert_eq!(f3.try_get(), Some(Ok(1)));
    }

    #[test]
    fn snapshot_lists_bodies() {
        let registry = FutureRegistry::new();
        registry.insert(reply("b").monitorable());
        registry.insert(reply("a").monitorable());
        registry.insert(reply("a").monitorable());
        let rows = registry.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].body, BodyId::from("a"));
        assert_eq!(rows[0].pending, 2);
        assert_eq!(rows[1].pending, 1);
    }
}
