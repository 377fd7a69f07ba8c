use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::url_utils::DUMMY_HASH;

/// Reputation tier of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStatus {
    Virgin,
    Junior,
    Senior,
    Principal,
}

impl SeedStatus {
    /// Tiers allowed to take part in distributed indexing.
    pub fn can_index_remotely(&self) -> bool {
        matches!(self, SeedStatus::Senior | SeedStatus::Principal)
    }
}

/// Identity record of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub hash: String,
    pub name: String,
    /// `host:port` the peer listens on.
    pub address: String,
    pub status: SeedStatus,
}

impl Seed {
    pub fn new(hash: &str, name: &str, address: &str, status: SeedStatus) -> Self {
        Self {
            hash: hash.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            status,
        }
    }
}

/// Provides the local peer's own seed.
pub trait PeerIdentity: Send + Sync {
    fn my_seed(&self) -> Seed;
}

/// Local identity that can be promoted or demoted at runtime.
pub struct LocalPeer {
    seed: RwLock<Seed>,
}

impl LocalPeer {
    pub fn new(seed: Seed) -> Self {
        if seed.hash == DUMMY_HASH {
            warn!("Local peer uses the dummy hash; every initiator will look local");
        }
        Self {
            seed: RwLock::new(seed),
        }
    }

    pub fn set_status(&self, status: SeedStatus) {
        self.seed.write().status = status;
    }
}

impl PeerIdentity for LocalPeer {
    fn my_seed(&self) -> Seed {
        self.seed.read().clone()
    }
}

/// Shared view of which peers are reachable.
pub trait PeerDirectory: Send + Sync {
    fn peer_departure(&self, seed: &Seed, reason: &str);

    fn peer_arrival(&self, seed: Seed);

    fn get_connected(&self, hash: &str) -> Option<Seed>;
}

#[derive(Default)]
pub struct MemoryPeerDirectory {
    connected: DashMap<String, Seed>,
    departed: DashMap<String, (Seed, String)>,
}

impl MemoryPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, hash: &str) -> bool {
        self.connected.contains_key(hash)
    }

    /// Reason given when `hash` last departed.
    pub fn departure_reason(&self, hash: &str) -> Option<String> {
        self.departed.get(hash).map(|e| e.value().1.clone())
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }
}

impl PeerDirectory for MemoryPeerDirectory {
    fn peer_departure(&self, seed: &Seed, reason: &str) {
        self.connected.remove(&seed.hash);
        self.departed
            .insert(seed.hash.clone(), (seed.clone(), reason.to_string()));
    }

    fn peer_arrival(&self, seed: Seed) {
        self.departed.remove(&seed.hash);
        self.connected.insert(seed.hash.clone(), seed);
    }

    fn get_connected(&self, hash: &str) -> Option<Seed> {
        self.connected.get(hash).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Seed {
        Seed::new("peerhash0001", "alpha", "127.0.0.1:8090", SeedStatus::Senior)
    }

    #[test]
    fn test_remote_indexing_tiers() {
        assert!(!SeedStatus::Virgin.can_index_remotely());
        assert!(!SeedStatus::Junior.can_index_remotely());
        assert!(SeedStatus::Senior.can_index_remotely());
        assert!(SeedStatus::Principal.can_index_remotely());
    }

    #[test]
    fn test_directory_departure_and_arrival() {
        let dir = MemoryPeerDirectory::new();
        dir.peer_arrival(peer());
        assert!(dir.is_connected("peerhash0001"));

        dir.peer_departure(&peer(), "transfer failed");
        assert!(dir.get_connected("peerhash0001").is_none());
        assert_eq!(
            dir.departure_reason("peerhash0001").as_deref(),
            Some("transfer failed")
        );

        dir.peer_arrival(peer());
        assert_eq!(dir.get_connected("peerhash0001"), Some(peer()));
        assert!(dir.departure_reason("peerhash0001").is_none());
    }

    #[test]
    fn test_local_peer_status_change() {
        let local = LocalPeer::new(peer());
        local.set_status(SeedStatus::Junior);
        assert_eq!(local.my_seed().status, SeedStatus::Junior);
    }
}
