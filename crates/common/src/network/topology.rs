use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;

/// Which peers on a topic connect to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Every pair of peers connects
    #[default]
    Mesh,
    /// Peers only connect to the hub
    Star(PublicKey),
}

impl Topology {
    /// Whether `local` and `remote` should hold a connection
    pub fn should_connect(&self, local: &PublicKey, remote: &PublicKey) -> bool {
        if local == remote {
            return false;
        }
        match self {
            Topology::Mesh => true,
            Topology::Star(hub) => local == hub || remote == hub,
        }
    }

    /// The side that dials; the smaller key, so a pair never opens two connections
    pub fn is_initiator(local: &PublicKey, remote: &PublicKey) -> bool {
        local < remote
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_star_only_connects_through_hub() {
        let hub = SecretKey::generate().public();
        let a = SecretKey::generate().public();
        let b = SecretKey::generate().public();

        let star = Topology::Star(hub);
        assert!(star.should_connect(&a, &hub));
        assert!(star.should_connect(&hub, &b));
        assert!(!star.should_connect(&a, &b));
        assert!(Topology::Mesh.should_connect(&a, &b));
        assert!(!Topology::Mesh.should_connect(&a, &a));
        assert_ne!(Topology::is_initiator(&a, &b), Topology::is_initiator(&b, &a));
    }
}
