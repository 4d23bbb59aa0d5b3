//! Node configuration.
//!
//! Settings come from an optional JSON file and are then overridden by
//! whatever flags were given on the command line.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use raintree_p2p::{P2pConfig, Peer};

use crate::cli::Cli;

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Transport settings.
    pub p2p: P2pConfig,

    /// Genesis validator set.
    pub validators: Vec<Peer>,
}

impl NodeConfig {
    /// Load a configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Build the configuration from CLI arguments, reading `--config` first.
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.p2p.validate()?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.p2p.listen_address = listen;
        }
        if let Some(address) = &cli.address {
            self.p2p.address = address.clone();
        }
        if let Some(external) = &cli.external_address {
            self.p2p.external_address = Some(external.clone());
        }
        if let Some(peers) = &cli.peers {
            self.p2p.peers = peers.clone();
        }
        if cli.no_redundancy {
            self.p2p.redundancy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use raintree_p2p::Address;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.p2p.listen_address.port(), 42069);
        assert!(config.p2p.redundancy);
        assert!(config.validators.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "p2p": {{
                    "address": "aa",
                    "listen_address": "127.0.0.1:5000",
                    "max_inbound": 4
                }},
                "validators": [
                    {{ "address": "aa", "service_url": "127.0.0.1:5000" }},
                    {{ "address": "bb", "service_url": "127.0.0.1:5001" }}
                ]
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.p2p.address, Address::new(vec![0xaa]));
        assert_eq!(config.p2p.listen_address.port(), 5000);
        assert_eq!(config.p2p.max_inbound, 4);
        // Unset fields keep their defaults.
        assert_eq!(config.p2p.max_outbound, 32);
        assert_eq!(config.validators.len(), 2);
        assert_eq!(config.validators[1].service_url, "127.0.0.1:5001");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "p2p": {{ "address": "aa", "redundancy": true }} }}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cli = Cli::parse_from([
            "raintree-node",
            "--config",
            path.as_str(),
            "--address",
            "cc",
            "--no-redundancy",
            "--peers",
            "127.0.0.1:7000",
        ]);
        let config = NodeConfig::from_cli(&cli).unwrap();
        assert_eq!(config.p2p.address, Address::new(vec![0xcc]));
        assert!(!config.p2p.redundancy);
        assert_eq!(config.p2p.peers, vec!["127.0.0.1:7000"]);
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());

        let missing = Path::new("/definitely/not/here.json");
        assert!(NodeConfig::from_file(missing).is_err());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "p2p": {{ "request_timeout_ms": 0 }} }}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cli = Cli::parse_from(["raintree-node", "--config", path.as_str()]);
        assert!(NodeConfig::from_cli(&cli).is_err());
    }
}
