//! Command-line argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use raintree_p2p::Address;

/// RainTree P2P node.
#[derive(Parser, Debug, Clone)]
#[command(name = "raintree-node")]
#[command(about = "Standalone RainTree P2P node")]
#[command(version)]
pub struct Cli {
    /// JSON configuration file with `p2p` settings and the `validators` set.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// P2P listen address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Hex-encoded identity address of this node.
    #[arg(long)]
    pub address: Option<Address>,

    /// Address other peers use to reach this node (host:port).
    #[arg(long)]
    pub external_address: Option<String>,

    /// Comma-separated list of bootstrap service URLs.
    #[arg(long, value_delimiter = ',')]
    pub peers: Option<Vec<String>>,

    /// Disable the direct fallback pass after each broadcast.
    #[arg(long)]
    pub no_redundancy: bool,

    /// Broadcast this text once the node is up.
    #[arg(long)]
    pub announce: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["raintree-node"]);
        assert!(cli.config.is_none());
        assert!(cli.listen.is_none());
        assert!(cli.address.is_none());
        assert!(!cli.no_redundancy);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_peers_list() {
        let cli = Cli::parse_from([
            "raintree-node",
            "--peers",
            "10.0.0.1:42069,node-b:42069",
        ]);
        let peers = cli.peers.unwrap();
        assert_eq!(peers, vec!["10.0.0.1:42069", "node-b:42069"]);
    }

    #[test]
    fn test_address_is_hex() {
        let cli = Cli::parse_from(["raintree-node", "--address", "a1b2"]);
        assert_eq!(cli.address.unwrap(), Address::new(vec![0xa1, 0xb2]));

        let result = Cli::try_parse_from(["raintree-node", "--address", "not-hex"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "raintree-node",
            "--listen",
            "127.0.0.1:4000",
            "--no-redundancy",
            "--announce",
            "hello",
        ]);
        assert_eq!(cli.listen.unwrap().port(), 4000);
        assert!(cli.no_redundancy);
        assert_eq!(cli.announce.as_deref(), Some("hello"));
    }
}
