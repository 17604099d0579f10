//! Discovered-peer registry — peers seen via presence announcements.
//!
//! Discovery feeds this map; losing an entry here means the peer's
//! announcements stopped, which does not close an already-open link.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use snapmesh_core::PeerId;

/// Tracked state for a discovered peer.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,

    /// Address the announcement arrived from.
    pub addr: IpAddr,

    /// TCP port the peer accepts links on.
    pub port: u16,

    /// Last time an announcement arrived from this peer.
    pub last_seen: Instant,
}

/// The discovered-peer registry — shared between the discovery listener,
/// expiry task, and connection logic. Keyed on peer id.
pub type PeerRegistry = Arc<DashMap<PeerId, DiscoveredPeer>>;

/// Create a new empty peer registry.
pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registry_creates_empty() {
        let registry = new_registry();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }
}
