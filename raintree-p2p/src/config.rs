//! P2P configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{P2pError, P2pResult};
use crate::peer::Address;

/// Fixed size of the wire header: flags, nonce and body length.
pub const WIRE_HEADER_LENGTH: usize = 9;

/// Default per-connection read/write buffer size (4 MiB).
pub const DEFAULT_READ_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default maximum outbound connections.
pub const DEFAULT_MAX_OUTBOUND: usize = 32;

/// Default maximum inbound connections.
pub const DEFAULT_MAX_INBOUND: usize = 32;

/// Default request/response timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3_000;

/// Default dial timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default capacity of the shared inbound packet sink.
pub const DEFAULT_SINK_CAPACITY: usize = 100;

/// Default capacity of the gossip de-duplication caches.
pub const DEFAULT_SEEN_CACHE_CAPACITY: usize = 10_000;

/// Transport protocol used by the listener and dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP.
    #[default]
    Tcp,
    /// Placeholder used by tests that never touch the network.
    Empty,
}

/// Configuration for the P2P node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Transport protocol.
    pub protocol: Protocol,

    /// This node's identity address.
    pub address: Address,

    /// Address to bind the listener to.
    pub listen_address: SocketAddr,

    /// Address other peers should use to reach us, if different from the listener.
    pub external_address: Option<String>,

    /// Bootstrap service URLs dialed on startup.
    pub peers: Vec<String>,

    /// Maximum number of inbound connections.
    pub max_inbound: usize,

    /// Maximum number of outbound connections.
    pub max_outbound: usize,

    /// Size of a connection's read/write buffer, header included.
    pub read_write_buffer_size: usize,

    /// Timeout for request/response exchanges, in milliseconds.
    pub request_timeout_ms: u64,

    /// Timeout for establishing outbound connections, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Capacity of the shared inbound packet sink.
    pub sink_capacity: usize,

    /// Whether a broadcast originator also sends to every peer directly.
    pub redundancy: bool,

    /// Number of broadcast nonces remembered for de-duplication.
    pub seen_cache_capacity: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            address: Address::default(),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 42069)),
            external_address: None,
            peers: Vec::new(),
            max_inbound: DEFAULT_MAX_INBOUND,
            max_outbound: DEFAULT_MAX_OUTBOUND,
            read_write_buffer_size: DEFAULT_READ_WRITE_BUFFER_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            redundancy: true,
            seen_cache_capacity: DEFAULT_SEEN_CACHE_CAPACITY,
        }
    }
}

impl P2pConfig {
    /// Create a new configuration with the specified listen address.
    pub fn new(listen_address: SocketAddr) -> Self {
        Self {
            listen_address,
            ..Default::default()
        }
    }

    /// Set this node's identity address.
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    /// Set the externally reachable address.
    pub fn with_external_address(mut self, external: impl Into<String>) -> Self {
        self.external_address = Some(external.into());
        self
    }

    /// Add bootstrap peers to dial on startup.
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    /// Set the maximum inbound connections.
    pub fn with_max_inbound(mut self, count: usize) -> Self {
        self.max_inbound = count;
        self
    }

    /// Set the maximum outbound connections.
    pub fn with_max_outbound(mut self, count: usize) -> Self {
        self.max_outbound = count;
        self
    }

    /// Set the read/write buffer size.
    pub fn with_read_write_buffer_size(mut self, size: usize) -> Self {
        self.read_write_buffer_size = size;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the sink capacity.
    pub fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    /// Enable or disable the originator's redundancy pass.
    pub fn with_redundancy(mut self, enabled: bool) -> Self {
        self.redundancy = enabled;
        self
    }

    /// Set the de-duplication cache capacity.
    pub fn with_seen_cache_capacity(mut self, capacity: usize) -> Self {
        self.seen_cache_capacity = capacity;
        self
    }

    /// Largest body a single frame may carry.
    pub fn max_body_length(&self) -> usize {
        self.read_write_buffer_size.saturating_sub(WIRE_HEADER_LENGTH)
    }

    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connection timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the total maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_outbound + self.max_inbound
    }

    /// Reject configurations the transport cannot run with.
    pub fn validate(&self) -> P2pResult<()> {
        if self.protocol != Protocol::Tcp {
            return Err(P2pError::InvalidConfig(format!(
                "unsupported protocol {:?}",
                self.protocol
            )));
        }
        if self.read_write_buffer_size <= WIRE_HEADER_LENGTH {
            return Err(P2pError::InvalidConfig(format!(
                "read_write_buffer_size must exceed the {} byte header",
                WIRE_HEADER_LENGTH
            )));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(P2pError::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if self.sink_capacity == 0 {
            return Err(P2pError::InvalidConfig("sink_capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = P2pConfig::default();
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.max_outbound, DEFAULT_MAX_OUTBOUND);
        assert_eq!(config.max_inbound, DEFAULT_MAX_INBOUND);
        assert_eq!(config.max_connections(), DEFAULT_MAX_OUTBOUND + DEFAULT_MAX_INBOUND);
        assert_eq!(config.max_body_length(), DEFAULT_READ_WRITE_BUFFER_SIZE - 9);
        assert!(config.redundancy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = P2pConfig::new("127.0.0.1:9999".parse().unwrap())
            .with_max_outbound(6)
            .with_max_inbound(4)
            .with_request_timeout(Duration::from_millis(250))
            .with_external_address("node1:9999")
            .with_redundancy(false);

        assert_eq!(config.listen_address.port(), 9999);
        assert_eq!(config.max_outbound, 6);
        assert_eq!(config.max_inbound, 4);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.external_address.as_deref(), Some("node1:9999"));
        assert!(!config.redundancy);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let small = P2pConfig::default().with_read_write_buffer_size(WIRE_HEADER_LENGTH);
        assert!(matches!(small.validate(), Err(P2pError::InvalidConfig(_))));

        let zero_timeout = P2pConfig::default().with_request_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let mut empty = P2pConfig::default();
        empty.protocol = Protocol::Empty;
        assert!(empty.validate().is_err());

        let no_sink = P2pConfig::default().with_sink_capacity(0);
        assert!(no_sink.validate().is_err());
    }

    #[test]
    fn test_json_uses_defaults_for_missing_fields() {
        let json = r#"{ "listen_address": "127.0.0.1:4000", "protocol": "tcp", "redundancy": false }"#;
        let config: P2pConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_address.port(), 4000);
        assert!(!config.redundancy);
        assert_eq!(config.sink_capacity, DEFAULT_SINK_CAPACITY);
    }
}
