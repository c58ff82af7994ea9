//! StateStore — redb-backed persistence of the cluster configuration.
//!
//! Provides typed CRUD operations over known cluster nodes and the local
//! node identity. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTER_NODES).map_err(map_err!(Table))?;
        txn.open_table(LOCAL).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Cluster nodes ──────────────────────────────────────────────

    /// Insert or update a known cluster node.
    pub fn put_cluster_node(&self, node: &NodeIdentity) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTER_NODES).map_err(map_err!(Table))?;
            table
                .insert(node.unique_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %node.unique_id, "cluster node stored");
        Ok(())
    }

    /// Get a known cluster node by unique id.
    pub fn get_cluster_node(&self, unique_id: &str) -> StateResult<Option<NodeIdentity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTER_NODES).map_err(map_err!(Table))?;
        match table.get(unique_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeIdentity =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all known cluster nodes, ordered by unique id.
    pub fn list_cluster_nodes(&self) -> StateResult<Vec<NodeIdentity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTER_NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeIdentity =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Delete a known cluster node. Returns true if it existed.
    pub fn delete_cluster_node(&self, unique_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CLUSTER_NODES).map_err(map_err!(Table))?;
            existed = table.remove(unique_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %unique_id, existed, "cluster node deleted");
        Ok(existed)
    }

    /// Replace the whole set of known cluster nodes in one transaction.
    pub fn replace_cluster_nodes(&self, nodes: &[NodeIdentity]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTER_NODES).map_err(map_err!(Table))?;
            table
                .retain(|_, _| false)
                .map_err(map_err!(Write))?;
            for node in nodes {
                let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
                table
                    .insert(node.unique_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = nodes.len(), "cluster nodes replaced");
        Ok(())
    }

    // ── Local node ─────────────────────────────────────────────────

    /// Persist the identity this process runs as.
    pub fn put_local_identity(&self, identity: &NodeIdentity) -> StateResult<()> {
        let value = serde_json::to_vec(identity).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCAL).map_err(map_err!(Table))?;
            table
                .insert(LOCAL_IDENTITY_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The identity this process last ran as, if any.
    pub fn local_identity(&self) -> StateResult<Option<NodeIdentity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCAL).map_err(map_err!(Table))?;
        match table.get(LOCAL_IDENTITY_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let identity: NodeIdentity =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }
}
