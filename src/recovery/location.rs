use dashmap::DashMap;

use crate::identity::BodyId;
use crate::identity::NodeUrl;

/// Tracks where each supervised body currently runs.
pub trait LocationServer: Send + Sync {
    fn update(&self, body: &BodyId, location: NodeUrl);

    fn lookup(&self, body: &BodyId) -> Option<NodeUrl>;

    fn forget(&self, body: &BodyId);
}

#[derive(Default)]
pub struct InMemLocations {
    locations: DashMap<BodyId, NodeUrl>,
}

impl InMemLocations {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationServer for InMemLocations {
    fn update(&self, body: &BodyId, location: NodeUrl) {
        self.locations.insert(body.clone(), location);
    }

    fn lookup(&self, body: &BodyId) -> Option<NodeUrl> {
        self.locations.get(body).map(|loc| loc.clone())
    }

    fn forget(&self, body: &BodyId) {
        self.locations.remove(body);
    }
}

#[test]
fn update_overwrites_and_forget_removes() {
    let locations = InMemLocations::new();
    let body = BodyId::from("a");
    assert_eq!(locations.lookup(&body), None);
    locations.update(&body, NodeUrl::from("tcp://h1:1099"));
    locations.update(&body, NodeUrl::from("tcp://h2:1099"));
    assert_eq!(locations.lookup(&body), Some(NodeUrl::from("tcp://h2:1099")));
    locations.forget(&body);
    locations.forget(&body);
    assert_eq!(locations.lookup(&body), None);
}
