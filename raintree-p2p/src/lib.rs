//! RainTree peer-to-peer transport.
//!
//! This crate moves opaque byte payloads between network participants
//! over plain TCP, including:
//!
//! - A 9-byte binary frame header carrying flags, a request nonce and the body length
//! - Duplex sockets multiplexing requests and responses over one stream
//! - Address-keyed connection pools with explicit capacity limits
//! - RainTree broadcast, reaching `N` peers in `O(log3 N)` levels
//! - A self-anchored sorted peer view with serialized membership updates
//!
//! # Architecture
//!
//! Every socket runs its own read and write task. Frames nobody is waiting
//! for flow into one shared sink that the node drains.
//!
//! ```text
//! Main Task (P2pNode::run())
//! ├── Listener (accept incoming, register inbound sockets)
//! ├── Sink drain (one handler task per packet)
//! ├── Socket 1 ── read loop ─┐
//! │           └── write loop │ requests resolved by nonce,
//! ├── Socket 2 ── read loop ─┤ everything else to the sink
//! │           └── write loop ┘
//! └── Membership (single consumer of add/remove events)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use raintree_p2p::{Address, P2pConfig, P2pNode, Peer};
//!
//! let me = Address::from_hex("a1")?;
//! let config = P2pConfig::new("0.0.0.0:42069".parse()?).with_address(me.clone());
//! let validators = vec![
//!     Peer::new(me, "10.0.0.1:42069"),
//!     Peer::new(Address::from_hex("b2")?, "10.0.0.2:42069"),
//! ];
//!
//! let mut node = P2pNode::new(config, validators)?;
//! let mut inbox = node.inbox_receiver();
//! let handle = node.handle();
//! tokio::spawn(node.run());
//!
//! handle.broadcast(&b"block"[..]).await?;
//! ```

pub mod config;
pub mod error;

pub mod protocol;
pub mod peer;
pub mod socket;
pub mod registry;
pub mod raintree;
pub mod gossip;
pub mod node;

// Re-export main types
pub use config::{P2pConfig, Protocol, WIRE_HEADER_LENGTH};
pub use error::{P2pError, P2pResult};
pub use gossip::{InboundMessage, MessageKind};
pub use node::{P2pHandle, P2pNode};
pub use peer::{Address, ConnectionDirection, Peer, PeerManager, PeerStore, SortedPeersView};
pub use protocol::{Encoding, Message};
pub use raintree::RainTree;
pub use registry::ConnectionRegistry;
pub use socket::{Dialer, Packet, Socket, SocketState, TcpDialer};
