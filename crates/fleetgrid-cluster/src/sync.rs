//! Cluster data sync: keyed handlers exchanging shared state as JSON.
//!
//! A requester sends every entry it knows; the receiver applies each one
//! unless it conflicts with a different local value. Conflicting local
//! values are kept and sent back so the requester can merge them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Owner of one kind of shared state.
pub trait DataSyncHandler: Send + Sync {
    fn key(&self) -> &str;

    /// Display name of one entry, for logs.
    fn name(&self, value: &Value) -> String;

    /// Every entry this node knows.
    fn data(&self) -> Vec<Value>;

    /// The local counterpart of `incoming`, if any.
    fn current(&self, incoming: &Value) -> Option<Value>;

    fn write(&self, value: Value);

    /// Apply incoming entries even when they conflict.
    fn always_force_apply(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub key: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Apply without conflict checks and expect no response.
    pub force: bool,
    pub entries: Vec<SyncEntry>,
}

/// What applying a payload did.
#[derive(Debug, Default, PartialEq)]
pub struct SyncOutcome {
    pub applied: usize,
    /// Local values kept over conflicting incoming ones.
    pub conflicts: Vec<SyncEntry>,
}

impl SyncOutcome {
    /// The payload answering a sync request.
    pub fn into_response(self) -> SyncPayload {
        SyncPayload {
            force: false,
            entries: self.conflicts,
        }
    }
}

#[derive(Default)]
pub struct DataSyncRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn DataSyncHandler>>>,
}

impl DataSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a handler with the same key already exists.
    pub fn register_handler(&self, handler: Arc<dyn DataSyncHandler>) -> bool {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(handler.key()) {
            return false;
        }
        handlers.insert(handler.key().to_string(), handler);
        true
    }

    pub fn unregister_handler(&self, key: &str) -> bool {
        self.handlers.write().remove(key).is_some()
    }

    pub fn has_handler(&self, key: &str) -> bool {
        self.handlers.read().contains_key(key)
    }

    /// Collect the entries of the `selected` handlers, or all when empty.
    pub fn prepare_cluster_data(&self, force: bool, selected: &[&str]) -> SyncPayload {
        let handlers = self.handlers.read();
        let entries = handlers
            .values()
            .filter(|h| selected.is_empty() || selected.contains(&h.key()))
            .flat_map(|h| {
                h.data().into_iter().map(|data| SyncEntry {
                    key: h.key().to_string(),
                    data,
                })
            })
            .collect();
        SyncPayload { force, entries }
    }

    /// Apply `payload`; `force` skips conflict checks like `payload.force`.
    pub fn handle(&self, payload: &SyncPayload, force: bool) -> SyncOutcome {
        let force = force || payload.force;
        let mut outcome = SyncOutcome::default();

        for entry in &payload.entries {
            let Some(handler) = self.handlers.read().get(&entry.key).cloned() else {
                debug!(key = %entry.key, "no sync handler registered, entry skipped");
                continue;
            };

            let current = handler.current(&entry.data);
            let apply = force
                || handler.always_force_apply()
                || current.as_ref().is_none_or(|c| *c == entry.data);
            if apply {
                handler.write(entry.data.clone());
                outcome.applied += 1;
            } else if let Some(current) = current {
                warn!(
                    key = %entry.key,
                    entry = %handler.name(&entry.data),
                    "sync conflict, keeping local value"
                );
                outcome.conflicts.push(SyncEntry {
                    key: entry.key.clone(),
                    data: current,
                });
            }
        }
        outcome
    }
}
