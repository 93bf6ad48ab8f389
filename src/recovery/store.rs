use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::job::Checkpoint;
use crate::errors::Result;
use crate::identity::BodyId;

/// Where the latest checkpoint of each body is kept.
pub trait CheckpointStore: Send + Sync {
    /// Record `checkpoint`. Older checkpoints of the same body may be
    /// dropped.
    fn store(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Newest checkpoint of `body`, by index.
    fn latest(&self, body: &BodyId) -> Result<Option<Checkpoint>>;

    /// Drop all checkpoints of `body`.
    fn discard(&self, body: &BodyId) -> Result<()>;
}

/// Keeps only the newest checkpoint per body, in memory.
#[derive(Default)]
pub struct InMemCheckpointStore {
    ckpts: DashMap<BodyId, Checkpoint>,
}

impl InMemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemCheckpointStore {
    fn store(&self, checkpoint: Checkpoint) -> Result<()> {
        match self.ckpts.entry(checkpoint.body.clone()) {
            Entry::Occupied(mut entry) => {
                if checkpoint.index >= entry.get().index {
                    entry.insert(checkpoint);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(checkpoint);
            }
        }
        Ok(())
    }

    fn latest(&self, body: &BodyId) -> Result<Option<Checkpoint>> {
        Ok(self.ckpts.get(body).map(|ckpt| ckpt.clone()))
    }

    fn discard(&self, body: &BodyId) -> Result<()> {
        self.ckpts.remove(body);
        Ok(())
    }
}

#[test]
fn keeps_newest_checkpoint() {
    let store = InMemCheckpointStore::new();
    let body = BodyId::from("a");
    store.store(Checkpoint::new(body.clone(), 2, vec![2])).unwrap();
    store.store(Checkpoint::new(body.clone(), 1, vec![1])).unwrap();
    assert_eq!(store.latest(&body).unwrap().unwrap().state, vec![2]);
    store.store(Checkpoint::new(body.clone(), 3, vec![3])).unwrap();
    assert_eq!(store.latest(&body).unwrap().unwrap().index, 3);

    store.discard(&body).unwrap();
    assert_eq!(store.latest(&body).unwrap(), None);
}
