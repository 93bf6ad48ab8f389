//! Identities shared by the monitor and the recovery coordinator.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

/// Globally unique id of a remote body.
///
/// Nothing is assumed about the contents beyond equality and
/// hashing; the string form is only for logs and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyId(pub String);

impl BodyId {
    /// Mint a fresh random id.
    pub fn random() -> Self {
        Self(format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..)))
    }
}

impl std::fmt::Display for BodyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for BodyId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Last known network location of a body.
///
/// Only used for diagnostics in failure messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeUrl(pub String);

impl Default for NodeUrl {
    fn default() -> Self {
        Self("[unknown]".to_owned())
    }
}

impl std::fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for NodeUrl {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A host runtime that can resume a body from a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostRef(pub NodeUrl);

impl HostRef {
    pub fn url(&self) -> &NodeUrl {
        &self.0
    }
}

impl std::fmt::Display for HostRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for HostRef {
    fn from(s: &str) -> Self {
        Self(NodeUrl::from(s))
    }
}

/// Process-local id of a single future.
///
/// Used by the registry to find a future again on removal without
/// comparing pointers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(u64);

static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(0);

impl FutureId {
    pub(crate) fn next() -> Self {
        Self(NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use serde_test::{assert_tokens, Token};

    use super::*;

    #[test]
    fn body_id_serializes_as_plain_string() {
        assert_tokens(&BodyId::from("body-7"), &[Token::Str("body-7")]);
    }

    #[test]
    fn host_ref_serializes_as_plain_string() {
        assert_tokens(&HostRef::from("tcp://h2:1099"), &[Token::Str("tcp://h2:1099")]);
    }

    #[test]
    fn random_ids_differ() {
        let a = BodyId::random();
        let b = BodyId::random();
        assert_ne!(a, b);
        assert_eq!(a.0.len(), 32);
    }

    #[test]
    fn unknown_location_default() {
        assert_eq!(NodeUrl::default().to_string(), "[unknown]");
    }

    #[test]
    fn future_ids_are_unique() {
        let a = FutureId::next();
        let b = FutureId::next();
        assert!(b > a);
    }
}
