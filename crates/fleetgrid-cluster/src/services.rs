//! Service registry seam and the in-memory directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use fleetgrid_state::NodeId;
use fleetgrid_task::Task;

use crate::channel::ChannelRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLifecycle {
    Prepared,
    Running,
    Stopped,
    Deleted,
}

/// Replicated, cluster-wide view of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    /// Node hosting the service.
    pub node: NodeId,
    pub task: String,
    #[serde(default)]
    pub groups: Vec<String>,
    pub environment: String,
    pub lifecycle: ServiceLifecycle,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, node: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            task: task.into(),
            groups: Vec::new(),
            environment: String::new(),
            lifecycle: ServiceLifecycle::Running,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_groups(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: ServiceLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// A service running on this node, with its channel once connected.
#[derive(Clone)]
pub struct LocalService {
    pub info: ServiceInfo,
    pub channel: Option<ChannelRef>,
}

/// What to create when asking a node for a new service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub task: String,
    #[serde(default)]
    pub groups: Vec<String>,
    pub environment: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Creates services on one specific node.
pub trait ServiceFactory: Send + Sync {
    fn create_service(&self, config: ServiceConfiguration) -> Task<Option<ServiceInfo>>;
}

/// Factory for nodes that cannot create services.
pub struct NoServiceFactory;

impl ServiceFactory for NoServiceFactory {
    fn create_service(&self, _config: ServiceConfiguration) -> Task<Option<ServiceInfo>> {
        Task::completed(None)
    }
}

pub type LifecycleListener = Arc<dyn Fn(&ServiceInfo) + Send + Sync>;

/// Local services plus the replicated view of every known service.
pub trait ServiceRegistry: Send + Sync {
    fn local_services(&self) -> Vec<LocalService>;

    fn local_service(&self, name: &str) -> Option<LocalService>;

    fn services(&self) -> Vec<ServiceInfo>;

    fn service(&self, name: &str) -> Option<ServiceInfo>;

    /// Record a lifecycle change and notify local listeners.
    ///
    /// A [`ServiceLifecycle::Deleted`] update removes the service.
    fn update_service(&self, info: ServiceInfo);

    fn services_by_task(&self, task: &str) -> Vec<ServiceInfo> {
        self.services()
            .into_iter()
            .filter(|s| s.task.eq_ignore_ascii_case(task))
            .collect()
    }

    fn services_by_group(&self, group: &str) -> Vec<ServiceInfo> {
        self.services()
            .into_iter()
            .filter(|s| s.groups.iter().any(|g| g.eq_ignore_ascii_case(group)))
            .collect()
    }

    fn services_by_environment(&self, environment: &str) -> Vec<ServiceInfo> {
        self.services()
            .into_iter()
            .filter(|s| s.environment.eq_ignore_ascii_case(environment))
            .collect()
    }

    fn services_on_node(&self, node: &str) -> Vec<ServiceInfo> {
        self.services()
            .into_iter()
            .filter(|s| s.node == node)
            .collect()
    }
}

// ── In-memory directory ────────────────────────────────────────────

/// Thread-safe in-memory [`ServiceRegistry`].
pub struct ServiceDirectory {
    local_node: NodeId,
    services: RwLock<BTreeMap<String, ServiceInfo>>,
    channels: RwLock<HashMap<String, ChannelRef>>,
    listeners: RwLock<Vec<LifecycleListener>>,
}

impl ServiceDirectory {
    pub fn new(local_node: impl Into<String>) -> Self {
        Self {
            local_node: local_node.into(),
            services: RwLock::new(BTreeMap::new()),
            channels: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Register a service hosted by this node.
    pub fn register_local(&self, mut info: ServiceInfo, channel: Option<ChannelRef>) {
        info.node = self.local_node.clone();
        if let Some(channel) = channel {
            self.channels.write().insert(info.name.clone(), channel);
        }
        self.update_service(info);
    }

    /// Bind the channel of a local service once it connects.
    pub fn attach_channel(&self, name: &str, channel: ChannelRef) {
        self.channels.write().insert(name.to_string(), channel);
    }

    pub fn on_lifecycle_change(&self, listener: impl Fn(&ServiceInfo) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    fn notify(&self, info: &ServiceInfo) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let call = std::panic::AssertUnwindSafe(|| listener(info));
            if std::panic::catch_unwind(call).is_err() {
                error!(service = %info.name, "lifecycle listener panicked");
            }
        }
    }

    fn is_local(&self, info: &ServiceInfo) -> bool {
        info.node == self.local_node
    }
}

impl ServiceRegistry for ServiceDirectory {
    fn local_services(&self) -> Vec<LocalService> {
        let channels = self.channels.read();
        self.services
            .read()
            .values()
            .filter(|info| self.is_local(info))
            .map(|info| LocalService {
                info: info.clone(),
                channel: channels.get(&info.name).cloned(),
            })
            .collect()
    }

    fn local_service(&self, name: &str) -> Option<LocalService> {
        let info = self.services.read().get(name).cloned()?;
        if !self.is_local(&info) {
            return None;
        }
        Some(LocalService {
            channel: self.channels.read().get(name).cloned(),
            info,
        })
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.services.read().values().cloned().collect()
    }

    fn service(&self, name: &str) -> Option<ServiceInfo> {
        self.services.read().get(name).cloned()
    }

    fn update_service(&self, info: ServiceInfo) {
        if info.lifecycle == ServiceLifecycle::Deleted {
            self.services.write().remove(&info.name);
            self.channels.write().remove(&info.name);
        } else {
            self.services.write().insert(info.name.clone(), info.clone());
        }
        debug!(service = %info.name, node = %info.node, lifecycle = ?info.lifecycle, "service updated");
        self.notify(&info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn directory() -> ServiceDirectory {
        let directory = ServiceDirectory::new("node-1");
        directory.register_local(ServiceInfo::new("lobby-1", "", "lobby").with_groups(&["lobby"]), None);
        directory.update_service(
            ServiceInfo::new("bedwars-1", "node-2", "bedwars")
                .with_groups(&["Lobby", "minigames"])
                .with_environment("minecraft"),
        );
        directory
    }

    #[test]
    fn filters_match_case_insensitively() {
        let directory = directory();
        assert_eq!(directory.services_by_group("LOBBY").len(), 2);
        assert_eq!(directory.services_by_task("bedwars").len(), 1);
        assert_eq!(directory.services_by_environment("MINECRAFT").len(), 1);
        assert_eq!(directory.services_on_node("node-2").len(), 1);
    }

    #[test]
    fn local_services_only_cover_this_node() {
        let directory = directory();
        let local = directory.local_services();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].info.name, "lobby-1");
        assert!(directory.local_service("bedwars-1").is_none());
    }

    #[test]
    fn deleted_update_removes_and_notifies() {
        let directory = directory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        directory.on_lifecycle_change(move |info| s.lock().push((info.name.clone(), info.lifecycle)));

        let gone = directory
            .service("bedwars-1")
            .unwrap()
            .with_lifecycle(ServiceLifecycle::Deleted);
        directory.update_service(gone);

        assert!(directory.service("bedwars-1").is_none());
        assert_eq!(
            seen.lock().as_slice(),
            [("bedwars-1".to_string(), ServiceLifecycle::Deleted)]
        );
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let directory = directory();
        let calls = Arc::new(Mutex::new(0));
        directory.on_lifecycle_change(|_| panic!("listener bug"));
        let c = calls.clone();
        directory.on_lifecycle_change(move |_| *c.lock() += 1);

        directory.update_service(ServiceInfo::new("lobby-2", "node-1", "lobby"));
        assert_eq!(*calls.lock(), 1);
    }
}
