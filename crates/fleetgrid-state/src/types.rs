//! Domain types for the FleetGrid state store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier of a node in the cluster.
pub type NodeId = String;

/// A network listener a node accepts cluster connections on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in listener '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in listener '{s}'"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in listener '{s}': {e}"))?;
        Ok(Self::new(host, port))
    }
}

/// Stable identity of a cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeIdentity {
    pub unique_id: NodeId,
    /// Addresses the node accepts cluster connections on.
    pub listeners: Vec<HostAndPort>,
    /// Free-form metadata, e.g. region or rack.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl NodeIdentity {
    pub fn new(unique_id: impl Into<String>, listeners: Vec<HostAndPort>) -> Self {
        Self {
            unique_id: unique_id.into(),
            listeners,
            properties: BTreeMap::new(),
        }
    }
}
