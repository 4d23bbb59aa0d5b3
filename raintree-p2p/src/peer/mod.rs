//! Peer membership.
//!
//! This module provides:
//! - Peer identity and reachability
//! - The address-keyed peer store and membership delta
//! - The self-anchored sorted view RainTree indexes into
//! - A manager that serializes membership changes

pub mod info;
pub mod manager;
pub mod store;
pub mod view;

// Re-export main types
pub use info::{Address, ConnectionDirection, Peer};
pub use manager::PeerManager;
pub use store::{delta, PeerStore};
pub use view::SortedPeersView;
