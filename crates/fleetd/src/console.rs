//! Built-in command lines answered for remote `run_command` requests.

use std::sync::Arc;

use fleetgrid_cluster::{CommandExecutor, ServiceDirectory, ServiceRegistry};
use fleetgrid_state::{NodeIdentity, StateStore};

pub struct Console {
    store: StateStore,
    services: Arc<ServiceDirectory>,
}

impl Console {
    pub fn new(store: StateStore, services: Arc<ServiceDirectory>) -> Self {
        Self { store, services }
    }
}

impl CommandExecutor for Console {
    fn execute(&self, command_line: &str) -> Vec<String> {
        let mut words = command_line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("nodes"), _) => match self.store.list_cluster_nodes() {
                Ok(nodes) => nodes.iter().map(describe).collect(),
                Err(err) => vec![format!("error: {err}")],
            },
            (Some("services"), filter) => self
                .services
                .services()
                .into_iter()
                .filter(|s| filter.is_none_or(|group| s.groups.iter().any(|g| g == group)))
                .map(|s| format!("{} {} {:?}", s.name, s.node, s.lifecycle))
                .collect(),
            (Some(other), _) => vec![format!("unknown command: {other}")],
            (None, _) => Vec::new(),
        }
    }
}

pub fn describe(node: &NodeIdentity) -> String {
    let listeners: Vec<String> = node.listeners.iter().map(ToString::to_string).collect();
    format!("{} {}", node.unique_id, listeners.join(","))
}
