//! Membership manager.
//!
//! All additions and removals go through a single-consumer event channel,
//! so concurrent callers are linearized. Each call returns only after its
//! event has been applied to both the store and the sorted view.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::error::{P2pError, P2pResult};

use super::info::{Address, Peer};
use super::store::PeerStore;
use super::view::SortedPeersView;

/// Membership change waiting to be applied.
enum MembershipEvent {
    Add(Peer, oneshot::Sender<()>),
    Remove(Address, oneshot::Sender<()>),
}

#[derive(Debug)]
struct Membership {
    store: PeerStore,
    view: SortedPeersView,
}

impl Membership {
    fn apply(&mut self, event: MembershipEvent) -> oneshot::Sender<()> {
        match event {
            MembershipEvent::Add(peer, done) => {
                tracing::debug!(peer = %peer, "Adding peer");
                self.store.add_peer(peer.clone());
                self.view.add(peer);
                done
            }
            MembershipEvent::Remove(address, done) => {
                tracing::debug!(address = %address, "Removing peer");
                self.store.remove_peer(&address);
                self.view.remove(&address);
                done
            }
        }
    }
}

/// Owns the peer store and sorted view for the local node.
#[derive(Debug, Clone)]
pub struct PeerManager {
    self_addr: Address,
    state: Arc<RwLock<Membership>>,
    event_tx: mpsc::Sender<MembershipEvent>,
}

impl std::fmt::Debug for MembershipEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipEvent::Add(peer, _) => write!(f, "Add({})", peer),
            MembershipEvent::Remove(addr, _) => write!(f, "Remove({})", addr),
        }
    }
}

impl PeerManager {
    /// Create a manager seeded with `peers` and spawn its event consumer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(self_addr: Address, peers: impl IntoIterator<Item = Peer>) -> Self {
        let store = PeerStore::from_peers(peers);
        let view = SortedPeersView::new(&self_addr, &store);
        let state = Arc::new(RwLock::new(Membership { store, view }));

        let (event_tx, mut event_rx) = mpsc::channel::<MembershipEvent>(1);
        let consumer_state = state.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let done = consumer_state.write().apply(event);
                let _ = done.send(());
            }
        });

        Self {
            self_addr,
            state,
            event_tx,
        }
    }

    /// The local node's address.
    pub fn self_address(&self) -> &Address {
        &self.self_addr
    }

    /// Add a peer, waiting until the change is visible.
    pub async fn add_peer(&self, peer: Peer) -> P2pResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.post(MembershipEvent::Add(peer, done_tx), done_rx).await
    }

    /// Remove a peer, waiting until the change is visible.
    pub async fn remove_peer(&self, address: Address) -> P2pResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.post(MembershipEvent::Remove(address, done_tx), done_rx).await
    }

    async fn post(&self, event: MembershipEvent, done: oneshot::Receiver<()>) -> P2pResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| P2pError::ChannelSend("Membership channel closed".to_string()))?;
        done.await
            .map_err(|_| P2pError::ChannelSend("Membership event dropped".to_string()))
    }

    /// Peers in self-anchored sorted order.
    pub fn sorted_peers(&self) -> Vec<Peer> {
        self.state.read().view.peers().to_vec()
    }

    /// Addresses in self-anchored sorted order.
    pub fn sorted_addrs(&self) -> Vec<String> {
        self.state.read().view.addrs().to_vec()
    }

    /// All known peers, unordered.
    pub fn peer_list(&self) -> Vec<Peer> {
        self.state.read().store.peer_list()
    }

    /// Look up a peer by address.
    pub fn get_peer(&self, address: &Address) -> Option<Peer> {
        self.state.read().store.get_peer(address).cloned()
    }

    /// Whether the local node is missing from its own view.
    pub fn is_client_only(&self) -> bool {
        self.state.read().view.is_client_only()
    }

    /// Number of known peers, self included.
    pub fn len(&self) -> usize {
        self.state.read().store.len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> Peer {
        Peer::new(Address::new(vec![byte]), format!("127.0.0.1:{}", 5000 + byte as u16))
    }

    #[tokio::test]
    async fn test_initial_view_is_anchored() {
        let manager = PeerManager::new(Address::new(vec![3]), vec![peer(1), peer(3), peer(5)]);
        assert_eq!(manager.sorted_addrs(), vec!["03", "05", "01"]);
        assert_eq!(manager.len(), 3);
        assert!(!manager.is_client_only());
    }

    #[tokio::test]
    async fn test_add_and_remove_are_applied_before_return() {
        let manager = PeerManager::new(Address::new(vec![3]), vec![peer(3)]);

        manager.add_peer(peer(4)).await.unwrap();
        manager.add_peer(peer(2)).await.unwrap();
        assert_eq!(manager.sorted_addrs(), vec!["03", "04", "02"]);
        assert!(manager.get_peer(&Address::new(vec![4])).is_some());

        manager.remove_peer(Address::new(vec![4])).await.unwrap();
        assert_eq!(manager.sorted_addrs(), vec!["03", "02"]);
        assert!(manager.get_peer(&Address::new(vec![4])).is_none());

        // Absent peers are ignored.
        manager.remove_peer(Address::new(vec![9])).await.unwrap();
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_linearized() {
        let manager = PeerManager::new(Address::new(vec![0]), vec![peer(0)]);

        let mut handles = Vec::new();
        for byte in 1..=20u8 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move { m.add_peer(peer(byte)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let addrs = manager.sorted_addrs();
        assert_eq!(addrs.len(), 21);
        assert_eq!(addrs[0], "00");
        let mut sorted = addrs.clone();
        sorted.sort();
        assert_eq!(addrs, sorted);
    }
}
