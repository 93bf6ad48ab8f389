//! Picking the host a failed body is restarted on.

use crate::errors::Result;
use crate::errors::VigilError;
use crate::identity::BodyId;
use crate::identity::HostRef;
use crate::identity::NodeUrl;

pub trait TargetChooser: Send + Sync {
    /// Host to resume `body` on. `current` is where it last ran, if
    /// known; choosers avoid it when they have an alternative.
    fn choose(&self, body: &BodyId, current: Option<&NodeUrl>) -> Result<HostRef>;
}

/// Hosts other than `current`, or every host if there is no other.
fn candidates<'a>(hosts: &'a [HostRef], current: Option<&NodeUrl>) -> Vec<&'a HostRef> {
    let others: Vec<_> = hosts
        .iter()
        .filter(|host| Some(host.url()) != current)
        .collect();
    if others.is_empty() {
        hosts.iter().collect()
    } else {
        others
    }
}

/// Stable choice: the same body over the same hosts always lands on
/// the same target.
pub struct HashedTargets {
    hosts: Vec<HostRef>,
}

impl HashedTargets {
    pub fn new(hosts: Vec<HostRef>) -> Self {
        Self { hosts }
    }
}

impl TargetChooser for HashedTargets {
    fn choose(&self, body: &BodyId, current: Option<&NodeUrl>) -> Result<HostRef> {
        let found = candidates(&self.hosts, current);
        if found.is_empty() {
            return Err(VigilError::NoTarget(body.clone()));
        }
        let idx = seahash::hash(body.0.as_bytes()) as usize % found.len();
        Ok(found[idx].clone())
    }
}

/// Spreads restarts uniformly at random.
pub struct RandomTargets {
    hosts: Vec<HostRef>,
}

impl RandomTargets {
    pub fn new(hosts: Vec<HostRef>) -> Self {
        Self { hosts }
    }
}

impl TargetChooser for RandomTargets {
    fn choose(&self, body: &BodyId, current: Option<&NodeUrl>) -> Result<HostRef> {
        let found = candidates(&self.hosts, current);
        if found.is_empty() {
            return Err(VigilError::NoTarget(body.clone()));
        }
        Ok(found[fastrand::usize(..found.len())].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<HostRef> {
        vec![
            HostRef::from("tcp://h1:1099"),
            HostRef::from("tcp://h2:1099"),
            HostRef::from("tcp://h3:1099"),
        ]
    }

    #[test]
    fn hashed_is_stable() {
        let chooser = HashedTargets::new(hosts());
        let body = BodyId::from("a");
        let first = chooser.choose(&body, None).unwrap();
        for _ in 0..10 {
            assert_eq!(chooser.choose(&body, None).unwrap(), first);
        }
    }

    #[test]
    fn avoids_current_location() {
        let current = NodeUrl::from("tcp://h2:1099");
        let hashed = HashedTargets::new(hosts());
        let random = RandomTargets::new(hosts());
        for i in 0..50 {
            let body = BodyId(format!("body-{i}"));
            assert_ne!(hashed.choose(&body, Some(&current)).unwrap().url(), &current);
            assert_ne!(random.choose(&body, Some(&current)).unwrap().url(), &current);
        }
    }

    #[test]
    fn single_host_is_reused() {
        let only = HostRef::from("tcp://h1:1099");
        let chooser = HashedTargets::new(vec![only.clone()]);
        let found = chooser
            .choose(&BodyId::from("a"), Some(only.url()))
            .unwrap();
        assert_eq!(found, only);
    }

    #[test]
    fn no_hosts_is_an_error() {
        let body = BodyId::from("a");
        assert!(matches!(
            HashedTargets::new(vec![]).choose(&body, None),
            Err(VigilError::NoTarget(found)) if found == body
        ));
        assert!(matches!(
            RandomTargets::new(vec![]).choose(&body, None),
            Err(VigilError::NoTarget(_))
        ));
    }
}
