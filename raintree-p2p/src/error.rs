//! P2P error types.

use std::io;
use thiserror::Error;

use crate::peer::ConnectionDirection;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Flag byte has one of the reserved high bits set.
    #[error("codec wire flag error: invalid flag")]
    InvalidFlag(u8),

    /// Fewer bytes were supplied than the header announced.
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    /// Declared body length exceeds what the connection buffer accepts.
    #[error("cannot read a buffer of length {size}, the accepted body length is {max}")]
    BodyTooLarge { size: usize, max: usize },

    /// Remote side closed the connection.
    #[error("Peer hung up: {addr}")]
    PeerHangUp { addr: String },

    /// Connection failed for a reason other than a hang-up.
    #[error("Unexpected socket error on {addr}: {reason}")]
    Unexpected { addr: String, reason: String },

    /// No response arrived for a request within the configured timeout.
    #[error("Request timed out: addr={addr}, nonce={nonce}")]
    RequestTimedOut { addr: String, nonce: u32 },

    /// Connection timed out.
    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: String },

    /// Socket is not open.
    #[error("Socket closed: {addr}")]
    SocketClosed { addr: String },

    /// Socket was already opened once.
    #[error("Socket already open: {addr}")]
    SocketAlreadyOpen { addr: String },

    /// Maximum connections reached.
    #[error("Maximum {direction} connections reached: {max}")]
    MaxConnectionsReached {
        direction: ConnectionDirection,
        max: usize,
    },

    /// Peer sent an unexpected message.
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    /// Invalid peer address.
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Node is shutting down.
    #[error("Node shutting down")]
    Shutdown,
}

impl P2pError {
    /// Classify an I/O error observed on the connection to `addr`.
    ///
    /// End-of-stream and the usual "connection went away" kinds are a
    /// graceful hang-up; everything else is unexpected.
    pub fn from_io(err: io::Error, addr: &str) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => P2pError::PeerHangUp {
                addr: addr.to_string(),
            },
            _ => P2pError::Unexpected {
                addr: addr.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// Whether this error is an orderly disconnect rather than an anomaly.
    pub fn is_hang_up(&self) -> bool {
        matches!(self, P2pError::PeerHangUp { .. })
    }

    /// Whether this error is a malformed frame.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            P2pError::InvalidFlag(_) | P2pError::TruncatedFrame { .. } | P2pError::BodyTooLarge { .. }
        )
    }
}

impl From<bincode::Error> for P2pError {
    fn from(err: bincode::Error) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
