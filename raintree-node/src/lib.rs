//! RainTree node library.
//!
//! This library provides the components for building and running a RainTree
//! P2P node. It is used by the `raintree-node` binary and can also be
//! used for testing and embedding.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
