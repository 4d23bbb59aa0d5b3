//! Gossip bookkeeping for RainTree broadcasts.
//!
//! This module handles:
//! - Deduplication of delivered broadcasts, keyed by broadcast nonce
//! - Deduplication of relayed tree levels, keyed by (nonce, level)
//! - The messages handed to the application

pub mod filter;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::peer::Address;

pub use filter::SeenFilter;

/// How an inbound application payload reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Point-to-point `send` or `request`.
    Direct,
    /// RainTree broadcast or its redundant copy.
    Broadcast,
}

/// Application payload delivered through the node inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Originator address for broadcasts, remote socket address for direct messages.
    pub from: String,
    /// Request nonce for direct messages expecting a reply, broadcast nonce
    /// otherwise; 0 when neither applies.
    pub nonce: u64,
    /// Delivery path.
    pub kind: MessageKind,
    /// Application bytes.
    pub payload: Bytes,
}

impl InboundMessage {
    /// A broadcast payload from `source`.
    pub fn broadcast(source: &Address, nonce: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            from: source.to_hex(),
            nonce,
            kind: MessageKind::Broadcast,
            payload: payload.into(),
        }
    }

    /// A point-to-point payload from the socket at `peer_addr`.
    pub fn direct(peer_addr: impl Into<String>, nonce: u32, payload: Bytes) -> Self {
        Self {
            from: peer_addr.into(),
            nonce: nonce as u64,
            kind: MessageKind::Direct,
            payload,
        }
    }

    /// Whether the sender waits for a `respond` with this nonce.
    pub fn expects_response(&self) -> bool {
        self.kind == MessageKind::Direct && self.nonce != 0
    }
}

/// Seen-sets shared by every packet handler of a node.
#[derive(Debug)]
pub struct GossipState {
    delivered: Mutex<SeenFilter<u64>>,
    relayed: Mutex<SeenFilter<(u64, u32)>>,
}

impl GossipState {
    /// Create empty seen-sets holding up to `capacity` entries each.
    pub fn new(capacity: usize) -> Self {
        Self {
            delivered: Mutex::new(SeenFilter::new(capacity)),
            relayed: Mutex::new(SeenFilter::new(capacity)),
        }
    }

    /// Record a broadcast we originated so echoes are not delivered back to us.
    pub fn mark_originated(&self, nonce: u64) {
        self.delivered.lock().mark_seen(nonce);
    }

    /// Whether this broadcast is new to the application. Marks it delivered.
    pub fn first_delivery(&self, nonce: u64) -> bool {
        self.delivered.lock().check(nonce)
    }

    /// Whether this tree level of the broadcast still needs relaying. Marks it relayed.
    pub fn first_relay(&self, nonce: u64, level: u32) -> bool {
        self.relayed.lock().check((nonce, level))
    }

    /// Number of broadcasts delivered or originated.
    pub fn delivered_len(&self) -> usize {
        self.delivered.lock().len()
    }
}

impl Default for GossipState {
    fn default() -> Self {
        Self {
            delivered: Mutex::new(SeenFilter::default()),
            relayed: Mutex::new(SeenFilter::default()),
        }
    }
}
