//! Node health snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use fleetgrid_state::NodeIdentity;

/// Immutable, timestamped record of a node's health and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Milliseconds since the epoch; strictly increasing per node.
    pub creation_time: u64,
    /// When the node process started, in epoch milliseconds.
    pub startup_time: u64,
    pub identity: NodeIdentity,
    #[serde(default)]
    pub used_memory: u64,
    #[serde(default)]
    pub max_memory: u64,
    #[serde(default)]
    pub current_services: u32,
    #[serde(default)]
    pub draining: bool,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl NodeSnapshot {
    pub fn new(identity: NodeIdentity, creation_time: u64, startup_time: u64) -> Self {
        Self {
            creation_time,
            startup_time,
            identity,
            used_memory: 0,
            max_memory: 0,
            current_services: 0,
            draining: false,
            modules: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

/// Fills the counters, modules and properties of the local snapshot.
pub trait SnapshotConfigurer: Send + Sync {
    fn configure(&self, snapshot: &mut NodeSnapshot);
}

impl<F> SnapshotConfigurer for F
where
    F: Fn(&mut NodeSnapshot) + Send + Sync,
{
    fn configure(&self, snapshot: &mut NodeSnapshot) {
        self(snapshot)
    }
}

/// The current and previous snapshot, published together.
#[derive(Debug, Clone)]
pub struct SnapshotPair {
    pub current: Arc<NodeSnapshot>,
    pub previous: Arc<NodeSnapshot>,
}

/// Lock-free holder of a node's [`SnapshotPair`].
#[derive(Default)]
pub struct SnapshotSlot {
    pair: ArcSwapOption<SnapshotPair>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pair(&self) -> Option<Arc<SnapshotPair>> {
        self.pair.load_full()
    }

    pub fn current(&self) -> Option<Arc<NodeSnapshot>> {
        self.pair.load().as_ref().map(|p| Arc::clone(&p.current))
    }

    pub fn previous(&self) -> Option<Arc<NodeSnapshot>> {
        self.pair.load().as_ref().map(|p| Arc::clone(&p.previous))
    }

    /// Shift current to previous and install `snapshot`.
    ///
    /// The first snapshot becomes both current and previous. Returns
    /// `true` if the slot was empty before.
    pub fn publish(&self, snapshot: NodeSnapshot) -> bool {
        let snapshot = Arc::new(snapshot);
        let before = self.pair.rcu(|pair| {
            let previous = match pair {
                Some(pair) => Arc::clone(&pair.current),
                None => Arc::clone(&snapshot),
            };
            Some(Arc::new(SnapshotPair {
                current: Arc::clone(&snapshot),
                previous,
            }))
        });
        before.is_none()
    }

    pub fn clear(&self) {
        self.pair.store(None);
    }
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
