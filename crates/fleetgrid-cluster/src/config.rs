//! fleet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use fleetgrid_state::{HostAndPort, NodeIdentity};

use crate::error::{ClusterError, ClusterResult};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_IDLE_MS: u64 = 30_000;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub unique_id: String,
    pub listeners: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A peer whose latest snapshot is older than this is evicted.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_idle_ms: DEFAULT_MAX_IDLE_MS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_max_idle_ms() -> u64 {
    DEFAULT_MAX_IDLE_MS
}

fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub unique_id: String,
    pub listeners: Vec<String>,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a single-node fleet.toml.
    pub fn scaffold(unique_id: &str, listener: &str) -> Self {
        ClusterConfig {
            node: NodeConfig {
                unique_id: unique_id.to_string(),
                listeners: vec![listener.to_string()],
                properties: BTreeMap::new(),
            },
            cluster: ClusterSettings::default(),
            peers: Vec::new(),
        }
    }

    /// The identity this process runs as.
    pub fn local_identity(&self) -> ClusterResult<NodeIdentity> {
        let mut identity =
            NodeIdentity::new(&self.node.unique_id, parse_listeners(&self.node.listeners)?);
        identity.properties = self.node.properties.clone();
        Ok(identity)
    }

    /// Statically configured peers, excluding the local node.
    pub fn peer_identities(&self) -> ClusterResult<Vec<NodeIdentity>> {
        self.peers
            .iter()
            .filter(|peer| peer.unique_id != self.node.unique_id)
            .map(|peer| {
                Ok(NodeIdentity::new(
                    &peer.unique_id,
                    parse_listeners(&peer.listeners)?,
                ))
            })
            .collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.cluster.max_idle_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.query_timeout_ms)
    }
}

fn parse_listeners(listeners: &[String]) -> ClusterResult<Vec<HostAndPort>> {
    listeners
        .iter()
        .map(|l| l.parse::<HostAndPort>().map_err(ClusterError::Listener))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let config = ClusterConfig::scaffold("node-1", "0.0.0.0:1410");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("node-1"));
        assert!(toml_str.contains("heartbeat_interval_ms = 1000"));
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[node]
unique_id = "node-1"
listeners = ["10.0.0.1:1410"]
"#;
        let config: ClusterConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.unique_id, "node-1");
        assert_eq!(config.max_idle(), Duration::from_secs(30));
        assert_eq!(config.query_timeout(), Duration::from_secs(20));
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_peer_identities_skip_self() {
        let toml_str = r#"
[node]
unique_id = "node-1"
listeners = ["10.0.0.1:1410"]

[[peers]]
unique_id = "node-1"
listeners = ["10.0.0.1:1410"]

[[peers]]
unique_id = "node-2"
listeners = ["10.0.0.2:1410"]
"#;
        let config: ClusterConfig = toml::from_str(toml_str).unwrap();
        let peers = config.peer_identities().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].unique_id, "node-2");
        assert_eq!(peers[0].listeners[0], HostAndPort::new("10.0.0.2", 1410));
    }

    #[test]
    fn test_bad_listener_is_rejected() {
        let mut config = ClusterConfig::scaffold("node-1", "nowhere");
        assert!(matches!(
            config.local_identity(),
            Err(ClusterError::Listener(_))
        ));
        config.node.listeners = vec!["127.0.0.1:1410".into()];
        assert!(config.local_identity().is_ok());
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        let mut config = ClusterConfig::scaffold("node-1", "10.0.0.1:1410");
        config.cluster.max_idle_ms = 5_000;
        config.peers.push(PeerConfig {
            unique_id: "node-2".into(),
            listeners: vec!["10.0.0.2:1410".into()],
        });
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = ClusterConfig::from_file(&path).unwrap();
        assert_eq!(loaded.max_idle(), Duration::from_secs(5));
        assert_eq!(loaded.peer_identities().unwrap()[0].unique_id, "node-2");
    }
}
