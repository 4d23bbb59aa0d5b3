//! Address-keyed peer store.

use std::collections::{HashMap, HashSet};

use super::info::{Address, Peer};

/// Mapping from hex-encoded address to [`Peer`].
#[derive(Debug, Clone, Default)]
pub struct PeerStore {
    peers: HashMap<String, Peer>,
}

impl PeerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a peer list. Later duplicates replace earlier ones.
    pub fn from_peers(peers: impl IntoIterator<Item = Peer>) -> Self {
        let mut store = Self::new();
        for peer in peers {
            store.add_peer(peer);
        }
        store
    }

    /// Insert or replace a peer. Returns the previous entry for the same address.
    pub fn add_peer(&mut self, peer: Peer) -> Option<Peer> {
        self.peers.insert(peer.key(), peer)
    }

    /// Remove a peer by address.
    pub fn remove_peer(&mut self, address: &Address) -> Option<Peer> {
        self.peers.remove(&address.to_hex())
    }

    /// Look up a peer by address.
    pub fn get_peer(&self, address: &Address) -> Option<&Peer> {
        self.peers.get(&address.to_hex())
    }

    /// Look up a peer by its string-encoded address.
    pub fn get_peer_from_str(&self, key: &str) -> Option<&Peer> {
        self.peers.get(key)
    }

    /// Whether a peer with this address is stored.
    pub fn contains(&self, address: &Address) -> bool {
        self.peers.contains_key(&address.to_hex())
    }

    /// All peers, in no particular order.
    pub fn peer_list(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Set difference over address identity between two peer lists.
///
/// Returns `(added, removed)`: peers in `after` but not `before`, and peers
/// in `before` but not `after`.
pub fn delta(before: &[Peer], after: &[Peer]) -> (Vec<Peer>, Vec<Peer>) {
    let before_keys: HashSet<&Address> = before.iter().map(|p| &p.address).collect();
    let after_keys: HashSet<&Address> = after.iter().map(|p| &p.address).collect();

    let mut added_seen = HashSet::new();
    let added = after
        .iter()
        .filter(|p| !before_keys.contains(&p.address) && added_seen.insert(&p.address))
        .cloned()
        .collect();

    let mut removed_seen = HashSet::new();
    let removed = before
        .iter()
        .filter(|p| !after_keys.contains(&p.address) && removed_seen.insert(&p.address))
        .cloned()
        .collect();

    (added, removed)
}
