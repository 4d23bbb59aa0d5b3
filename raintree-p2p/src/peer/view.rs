//! Self-anchored sorted view of the peer set.
//!
//! Addresses are sorted lexicographically and then rotated so the local
//! node sits at index 0. Everything after index 0 stays ascending, wrapping
//! once from the largest address back to the smallest:
//!
//! ```text
//! sorted:   [a, c, e, g, k]      self = e
//! view:     [e, g, k | a, c]
//!            front    back
//! ```

use super::info::{Address, Peer};
use super::store::PeerStore;

/// Sorted addresses and peers, kept in lockstep.
#[derive(Debug, Clone, Default)]
pub struct SortedPeersView {
    self_addr: String,
    sorted_addrs: Vec<String>,
    sorted_peers: Vec<Peer>,
}

impl SortedPeersView {
    /// Build the view from a store, anchored at `self_addr`.
    pub fn new(self_addr: &Address, store: &PeerStore) -> Self {
        let mut peers = store.peer_list();
        peers.sort_by_key(|p| p.key());

        let self_key = self_addr.to_hex();
        let mut sorted_addrs: Vec<String> = peers.iter().map(Peer::key).collect();
        let mut sorted_peers = peers;

        let i = sorted_addrs.partition_point(|a| a.as_str() < self_key.as_str());
        if sorted_addrs.get(i) != Some(&self_key) {
            tracing::warn!(
                address = %self_key,
                mode = "client-only",
                "Self address not found in peer store, messages can be sent but not propagated"
            );
        }

        sorted_addrs.rotate_left(i);
        sorted_peers.rotate_left(i);

        Self {
            self_addr: self_key,
            sorted_addrs,
            sorted_peers,
        }
    }

    /// Addresses in view order.
    pub fn addrs(&self) -> &[String] {
        &self.sorted_addrs
    }

    /// Peers in view order.
    pub fn peers(&self) -> &[Peer] {
        &self.sorted_peers
    }

    /// Number of peers in the view.
    pub fn len(&self) -> usize {
        self.sorted_addrs.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.sorted_addrs.is_empty()
    }

    /// Whether the local node is absent, in which case index 0 is just the
    /// first address after where it would be.
    pub fn is_client_only(&self) -> bool {
        self.sorted_addrs.first() != Some(&self.self_addr)
    }

    /// Position of an address in the view, if present.
    pub fn position(&self, address: &Address) -> Option<usize> {
        let key = address.to_hex();
        let i = self.addr_index(&key);
        (self.sorted_addrs.get(i) == Some(&key)).then_some(i)
    }

    /// Insert a peer at its sorted position. A peer already present is
    /// replaced in place.
    pub fn add(&mut self, peer: Peer) {
        let key = peer.key();
        let i = self.addr_index(&key);

        if self.sorted_addrs.get(i) == Some(&key) {
            self.sorted_peers[i] = peer;
            return;
        }

        self.sorted_addrs.insert(i, key);
        self.sorted_peers.insert(i, peer);
    }

    /// Remove a peer by address. Removing an absent peer is a no-op.
    pub fn remove(&mut self, address: &Address) -> bool {
        let key = address.to_hex();
        let i = self.addr_index(&key);

        if self.sorted_addrs.get(i) != Some(&key) {
            tracing::debug!(address = %key, "Not found in sorted view");
            return false;
        }

        self.sorted_addrs.remove(i);
        self.sorted_peers.remove(i);
        true
    }

    /// Index at which `key` is stored, or at which it should be inserted.
    ///
    /// The view is always `[addrs >= self ascending][addrs < self ascending]`,
    /// whether or not the local address itself is present.
    fn addr_index(&self, key: &str) -> usize {
        let anchor = self.self_addr.as_str();
        let wrap = self.sorted_addrs.partition_point(|a| a.as_str() >= anchor);
        let (front, back) = self.sorted_addrs.split_at(wrap);

        if key >= anchor {
            front.partition_point(|a| a.as_str() < key)
        } else {
            front.len() + back.partition_point(|a| a.as_str() < key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::from_hex(s).unwrap()
    }

    fn peer(s: &str) -> Peer {
        Peer::new(addr(s), format!("{}:4000", s))
    }

    fn view_of(self_addr: &str, peers: &[&str]) -> SortedPeersView {
        let store = PeerStore::from_peers(peers.iter().map(|p| peer(p)));
        SortedPeersView::new(&addr(self_addr), &store)
    }

    /// Ascending after index 0, wrapping at most once back below the anchor.
    fn is_wrap_sorted(view: &SortedPeersView) -> bool {
        let addrs = view.addrs();
        if addrs.len() < 2 {
            return true;
        }
        let mut wraps = 0;
        for pair in addrs[1..].windows(2) {
            if pair[1] < pair[0] {
                wraps += 1;
            }
        }
        let wrapped_below_anchor = addrs[1..].iter().skip_while(|a| a.as_str() > addrs[0].as_str());
        wraps <= 1 && wrapped_below_anchor.into_iter().all(|a| a < &addrs[0])
    }

    fn assert_lockstep(view: &SortedPeersView) {
        assert_eq!(view.addrs().len(), view.peers().len());
        for (a, p) in view.addrs().iter().zip(view.peers()) {
            assert_eq!(a, &p.key());
        }
    }

    #[test]
    fn test_construction_anchors_self() {
        let view = view_of("30", &["50", "10", "30", "40", "20"]);
        assert_eq!(view.addrs(), &["30", "40", "50", "10", "20"]);
        assert!(!view.is_client_only());
        assert_lockstep(&view);
    }

    #[test]
    fn test_self_anchoring_any_insert_order() {
        let orders = [["a0", "b0", "c0"], ["c0", "a0", "b0"], ["b0", "c0", "a0"]];
        for order in orders {
            let mut view = view_of("90", &["90"]);
            for p in order {
                view.add(peer(p));
            }
            assert_eq!(view.addrs()[0], "90");
            assert_eq!(view.addrs(), &["90", "a0", "b0", "c0"]);
            assert_lockstep(&view);
        }

        let orders = [["10", "a0", "50"], ["50", "10", "a0"], ["a0", "50", "10"]];
        for order in orders {
            let mut view = view_of("40", &["40"]);
            for p in order {
                view.add(peer(p));
            }
            assert_eq!(view.addrs(), &["40", "50", "a0", "10"]);
            assert!(is_wrap_sorted(&view));
        }
    }

    #[test]
    fn test_add_into_front_and_back() {
        let mut view = view_of("30", &["10", "30", "50"]);
        assert_eq!(view.addrs(), &["30", "50", "10"]);

        view.add(peer("40"));
        assert_eq!(view.addrs(), &["30", "40", "50", "10"]);

        view.add(peer("20"));
        assert_eq!(view.addrs(), &["30", "40", "50", "10", "20"]);

        view.add(peer("05"));
        assert_eq!(view.addrs(), &["30", "40", "50", "05", "10", "20"]);

        view.add(peer("60"));
        assert_eq!(view.addrs(), &["30", "40", "50", "60", "05", "10", "20"]);
        assert!(is_wrap_sorted(&view));
        assert_lockstep(&view);
    }

    #[test]
    fn test_add_existing_replaces() {
        let mut view = view_of("30", &["10", "30"]);
        view.add(Peer::new(addr("10"), "elsewhere:1"));
        assert_eq!(view.len(), 2);
        assert_eq!(view.peers()[1].service_url, "elsewhere:1");
    }

    #[test]
    fn test_remove() {
        let mut view = view_of("30", &["10", "20", "30", "40", "50"]);

        assert!(view.remove(&addr("40")));
        assert_eq!(view.addrs(), &["30", "50", "10", "20"]);

        assert!(view.remove(&addr("10")));
        assert_eq!(view.addrs(), &["30", "50", "20"]);
        assert_lockstep(&view);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut view = view_of("30", &["10", "30", "50"]);
        assert!(!view.remove(&addr("20")));
        assert!(!view.remove(&addr("ff")));
        assert_eq!(view.addrs(), &["30", "50", "10"]);
    }

    #[test]
    fn test_position() {
        let view = view_of("30", &["10", "30", "50"]);
        assert_eq!(view.position(&addr("30")), Some(0));
        assert_eq!(view.position(&addr("50")), Some(1));
        assert_eq!(view.position(&addr("10")), Some(2));
        assert_eq!(view.position(&addr("20")), None);
    }

    #[test]
    fn test_client_only_mode() {
        let mut view = view_of("35", &["10", "30", "50"]);
        assert!(view.is_client_only());
        assert_eq!(view.addrs(), &["50", "10", "30"]);

        // Joining later puts self in front without disturbing the order.
        view.add(peer("35"));
        assert_eq!(view.addrs(), &["35", "50", "10", "30"]);
        assert!(!view.is_client_only());
    }

    #[test]
    fn test_client_only_updates_stay_anchored() {
        let mut view = view_of("35", &["10", "30"]);
        assert_eq!(view.addrs(), &["10", "30"]);

        view.add(peer("40"));
        assert_eq!(view.addrs(), &["40", "10", "30"]);

        view.add(peer("20"));
        view.add(peer("90"));
        assert_eq!(view.addrs(), &["40", "90", "10", "20", "30"]);
        assert_eq!(view.position(&addr("20")), Some(3));

        assert!(view.remove(&addr("40")));
        assert!(view.remove(&addr("10")));
        assert_eq!(view.addrs(), &["90", "20", "30"]);
        assert!(!view.remove(&addr("35")));

        view.add(peer("35"));
        assert_eq!(view.addrs(), &["35", "90", "20", "30"]);
        assert!(!view.is_client_only());
        assert!(is_wrap_sorted(&view));
        assert_lockstep(&view);
    }

    #[test]
    fn test_empty_view() {
        let mut view = view_of("30", &[]);
        assert!(view.is_empty());
        assert!(!view.remove(&addr("10")));
        view.add(peer("10"));
        assert_eq!(view.addrs(), &["10"]);
    }
}
