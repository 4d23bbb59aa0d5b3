//! P2P protocol layer.
//!
//! This module contains:
//! - The 9-byte wire header codec
//! - A stream codec built on it
//! - The envelope carried in wrapped frames

pub mod framing;
pub mod messages;
pub mod wire;

// Re-export main types
pub use framing::FrameCodec;
pub use messages::{AckMessage, GossipMessage, Message};
pub use wire::{Encoding, Frame, WireHeader};
