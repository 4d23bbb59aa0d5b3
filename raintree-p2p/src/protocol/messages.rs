//! Protocol envelope carried in wrapped frames.
//!
//! Unwrapped frames hold raw application bytes; wrapped frames hold one
//! [`Message`] serialized with a deterministic bincode configuration.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::P2pResult;
use crate::peer::Address;

/// Fixed-size integers, little-endian, no trailing bytes.
fn config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// A payload travelling down the RainTree, or sent point-to-point as part
/// of the redundancy pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipMessage {
    /// Broadcast identifier, shared by every copy of the same broadcast.
    pub nonce: u64,
    /// Level the receiver resumes traversal from.
    pub level: u32,
    /// Whether the receiver should keep relaying.
    pub broadcast: bool,
    /// Originator of the broadcast.
    pub source: Address,
    /// Application payload.
    pub payload: Vec<u8>,
}

/// Acknowledges receipt of a gossip hop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckMessage {
    /// Node acknowledging.
    pub acker: Address,
    /// Broadcast nonce being acknowledged.
    pub nonce: u64,
}

/// All envelope messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    /// Broadcast hop or redundant copy.
    Gossip(GossipMessage),
    /// Hop acknowledgment.
    Ack(AckMessage),
    /// Liveness probe with a nonce.
    Ping(u64),
    /// Probe answer echoing the nonce.
    Pong(u64),
}

impl Message {
    /// Get a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Gossip(_) => "gossip",
            Message::Ack(_) => "ack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }

    /// Serialize for a wrapped frame body.
    pub fn to_bytes(&self) -> P2pResult<Vec<u8>> {
        Ok(config().serialize(self)?)
    }

    /// Parse a wrapped frame body.
    pub fn from_bytes(bytes: &[u8]) -> P2pResult<Self> {
        Ok(config().deserialize(bytes)?)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Gossip(g) => write!(
                f,
                "Gossip(nonce={}, level={}, broadcast={}, source={}, len={})",
                g.nonce,
                g.level,
                g.broadcast,
                g.source,
                g.payload.len()
            ),
            Message::Ack(a) => write!(f, "Ack(acker={}, nonce={})", a.acker, a.nonce),
            Message::Ping(n) => write!(f, "Ping({})", n),
            Message::Pong(n) => write!(f, "Pong({})", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gossip() -> Message {
        Message::Gossip(GossipMessage {
            nonce: 7,
            level: 2,
            broadcast: true,
            source: Address::new(vec![0xab]),
            payload: b"vote".to_vec(),
        })
    }

    #[test]
    fn test_message_names() {
        assert_eq!(gossip().name(), "gossip");
        assert_eq!(Message::Ping(42).name(), "ping");
        assert_eq!(Message::Pong(42).name(), "pong");
    }

    #[test]
    fn test_message_display() {
        let msg = Message::Ping(12345);
        assert_eq!(format!("{}", msg), "Ping(12345)");

        assert_eq!(
            format!("{}", gossip()),
            "Gossip(nonce=7, level=2, broadcast=true, source=ab, len=4)"
        );
    }

    #[test]
    fn test_envelope_bytes() {
        let msg = gossip();
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);

        // Variant tag is a fixed little-endian u32.
        let ping = Message::Ping(1).to_bytes().unwrap();
        assert_eq!(&ping[..4], &[2, 0, 0, 0]);
        assert_eq!(ping.len(), 12);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::Pong(9).to_bytes().unwrap();
        bytes.push(0);
        assert!(Message::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Message::from_bytes(&[0xff, 0xff, 0xff, 0xff]).is_err());
        assert!(Message::from_bytes(&[]).is_err());
    }
}
