//! Configuration file management.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lodestone_dht::node::NodeConfig;
use lodestone_dht::{ALPHA, K};

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// UDP address to bind. Port 0 = OS-assigned ephemeral port.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Seed node addresses to bootstrap from.
    #[serde(default)]
    pub seeds: Vec<SocketAddr>,
    /// Bucket capacity and lookup result size.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Lookup parallelism factor.
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    /// Per-RPC timeout in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4100))
}

fn default_k() -> usize {
    K
}

fn default_alpha() -> usize {
    ALPHA
}

fn default_call_timeout_ms() -> u64 {
    5000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            seeds: Vec::new(),
            k: default_k(),
            alpha: default_alpha(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl DaemonConfig {
    /// Load a configuration file, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&text)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// The node configuration this daemon configuration describes.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            bind_addr: self.listen_addr,
            k: self.k,
            alpha: self.alpha,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr.port(), 4100);
        assert!(config.seeds.is_empty());
        assert_eq!(config.k, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.call_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: DaemonConfig = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:4200"
            seeds = ["10.0.0.1:4100", "10.0.0.2:4100"]
            "#,
        )
        .expect("parse config");

        assert_eq!(config.listen_addr.port(), 4200);
        assert_eq!(config.seeds.len(), 2);
        // Unspecified fields fall back to their defaults.
        assert_eq!(config.k, 20);
        assert_eq!(config.call_timeout_ms, 5000);
    }

    #[test]
    fn test_node_config_conversion() {
        let config = DaemonConfig {
            call_timeout_ms: 1500,
            ..Default::default()
        };
        let node_config = config.node_config();
        assert_eq!(node_config.call_timeout, Duration::from_millis(1500));
        assert_eq!(node_config.k, 20);
    }
}
