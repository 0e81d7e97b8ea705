//! The peer registry: a dual-key lookup onto a single record store.
//!
//! A peer can be looked up by its network endpoint or by its peer id, but
//! both keys resolve to one shared record, so a single lock acquisition
//! can update both indexes atomically instead of relying on a manually
//! maintained invariant between two separate maps.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::RwLock;

use crate::{peer::Peer, PeerId};

/// A stable, non-owning identifier for a registered peer, used as the
/// holder identity in the piece table so that pieces never need an owning
/// reference to a peer record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PeerKey(pub(crate) u64);

struct Inner {
    by_addr: HashMap<SocketAddr, PeerKey>,
    by_id: HashMap<PeerId, PeerKey>,
    peers: HashMap<PeerKey, Arc<Peer>>,
    next_key: AtomicU64,
}

/// The per-torrent peer registry, reachable concurrently from the network
/// accept loop, the event dispatcher, and the choke scheduler.
pub(crate) struct PeerRegistry {
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_addr: HashMap::new(),
                by_id: HashMap::new(),
                peers: HashMap::new(),
                next_key: AtomicU64::new(0),
            }),
        }
    }

    /// Looks up an existing peer by either key, binding whichever key was
    /// missing, or creates a fresh record with both keys installed.
    ///
    /// Runs under a single registry lock acquisition: a peer first seen at
    /// one address and later reconnecting from another, but announcing the
    /// same peer id, is always resolved to the same record, reachable
    /// under all of its observed keys.
    pub(crate) async fn get_or_create(
        &self,
        addr: SocketAddr,
        peer_id: Option<PeerId>,
        rate_smoothing_iterations: usize,
    ) -> Arc<Peer> {
        let mut inner = self.inner.write().await;

        if let Some(id) = peer_id {
            if let Some(&key) = inner.by_id.get(&id) {
                inner.by_addr.insert(addr, key);
                return Arc::clone(&inner.peers[&key]);
            }
        }
        if let Some(&key) = inner.by_addr.get(&addr) {
            if let Some(id) = peer_id {
                inner.by_id.insert(id, key);
            }
            return Arc::clone(&inner.peers[&key]);
        }

        let key = PeerKey(inner.next_key.fetch_add(1, Ordering::Relaxed));
        let peer = Arc::new(Peer::new(key, addr, peer_id, rate_smoothing_iterations));
        inner.by_addr.insert(addr, key);
        if let Some(id) = peer_id {
            inner.by_id.insert(id, key);
        }
        inner.peers.insert(key, Arc::clone(&peer));
        peer
    }

    /// Binds `peer_id` to an already-registered peer's key, once its
    /// handshake completes and the id becomes known.
    pub(crate) async fn bind_peer_id(&self, key: PeerKey, peer_id: PeerId) {
        let mut inner = self.inner.write().await;
        inner.by_id.insert(peer_id, key);
    }

    /// Unbinds both keys for a peer and drops the registry's reference to
    /// its record. Called from failed-connection and disconnect paths.
    pub(crate) async fn remove(&self, peer: &Peer) {
        let mut inner = self.inner.write().await;
        let key = peer.key;
        inner.by_addr.remove(&peer.addr);
        if let Some(id) = *peer.peer_id.read().await {
            inner.by_id.remove(&id);
        }
        inner.peers.remove(&key);
    }

    pub(crate) async fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.inner.read().await.peers.values().cloned().collect()
    }

    /// Looks up a registered peer by its stable registry key.
    pub(crate) async fn get(&self, key: PeerKey) -> Option<Arc<Peer>> {
        self.inner.read().await.peers.get(&key).cloned()
    }

    /// True if `addr` is already bound to some registered peer.
    pub(crate) async fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.inner.read().await.by_addr.contains_key(addr)
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sockaddr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), port)
    }

    #[tokio::test]
    async fn dual_key_resolves_same_record() {
        let registry = PeerRegistry::new();
        let id = [7u8; 20];

        let a = registry.get_or_create(sockaddr(6881), Some(id), 2).await;
        let b = registry.get_or_create(sockaddr(7000), Some(id), 2).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn endpoint_first_then_id_binds_both_keys() {
        let registry = PeerRegistry::new();
        let id = [9u8; 20];
        let addr = sockaddr(6881);

        let a = registry.get_or_create(addr, None, 2).await;
        let b = registry.get_or_create(addr, Some(id), 2).await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.get_or_create(addr, Some(id), 2).await;
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_unbinds_both_keys() {
        let registry = PeerRegistry::new();
        let id = [3u8; 20];
        let addr = sockaddr(6881);
        let peer = registry.get_or_create(addr, Some(id), 2).await;
        registry.remove(&peer).await;
        assert_eq!(registry.len().await, 0);

        let fresh = registry.get_or_create(addr, Some(id), 2).await;
        assert!(!Arc::ptr_eq(&peer, &fresh));
    }
}
