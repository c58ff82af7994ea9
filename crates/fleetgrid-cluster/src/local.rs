//! The node server representing this process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use fleetgrid_state::NodeIdentity;
use fleetgrid_task::Task;

use crate::channel::ChannelRef;
use crate::error::ClusterResult;
use crate::message::{ChannelMessage, ChannelMessageTarget, ids};
use crate::node::{CommandExecutor, NodeServer};
use crate::provider::NodeServerProvider;
use crate::services::ServiceFactory;
use crate::snapshot::{NodeSnapshot, SnapshotConfigurer, SnapshotSlot, epoch_millis};

type ShutdownHook = Box<dyn Fn() + Send + Sync>;

/// Hooks the embedding process provides to the local node.
pub(crate) struct LocalHooks {
    pub startup_time: u64,
    pub configurer: Option<Arc<dyn SnapshotConfigurer>>,
    pub executor: Option<Arc<dyn CommandExecutor>>,
    pub factory: Arc<dyn ServiceFactory>,
}

pub struct LocalNodeServer {
    identity: NodeIdentity,
    provider: Weak<NodeServerProvider>,
    startup_time: u64,
    running: AtomicBool,
    draining: AtomicBool,
    snapshots: SnapshotSlot,
    last_creation_time: AtomicU64,
    configurer: Option<Arc<dyn SnapshotConfigurer>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    factory: Arc<dyn ServiceFactory>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
}

impl LocalNodeServer {
    pub(crate) fn new(
        identity: NodeIdentity,
        provider: Weak<NodeServerProvider>,
        hooks: LocalHooks,
    ) -> Self {
        Self {
            identity,
            provider,
            startup_time: hooks.startup_time,
            running: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            snapshots: SnapshotSlot::new(),
            last_creation_time: AtomicU64::new(0),
            configurer: hooks.configurer,
            executor: hooks.executor,
            factory: hooks.factory,
            shutdown_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Mark the process running, take a first snapshot and elect.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        self.update_local_snapshot();
        if let Some(provider) = self.provider.upgrade() {
            provider.select_head_node();
        }
        info!(node = %self.identity.unique_id, "local node started");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn startup_time(&self) -> u64 {
        self.startup_time
    }

    /// Run `hook` when the cluster asks this node to shut down.
    pub fn on_shutdown(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shutdown_hooks.lock().push(Box::new(hook));
    }

    /// Build and publish a fresh snapshot without broadcasting it.
    pub fn update_local_snapshot(&self) -> NodeSnapshot {
        let mut snapshot = NodeSnapshot::new(
            self.identity.clone(),
            self.next_creation_time(),
            self.startup_time,
        );
        snapshot.draining = self.is_draining();
        if let Some(provider) = self.provider.upgrade() {
            snapshot.current_services = provider.services().local_services().len() as u32;
        }
        if let Some(configurer) = &self.configurer {
            configurer.configure(&mut snapshot);
        }
        self.snapshots.publish(snapshot.clone());
        snapshot
    }

    /// Refresh the local snapshot and broadcast it to every peer.
    pub fn publish_snapshot_update(&self) -> ClusterResult<()> {
        let snapshot = self.update_local_snapshot();
        let message = ChannelMessage::internal(ids::UPDATE_NODE_INFO_SNAPSHOT)
            .sender(&self.identity.unique_id)
            .target(ChannelMessageTarget::all_nodes())
            .json(&snapshot)?
            .build();
        if let Some(provider) = self.provider.upgrade() {
            provider.broadcast(message);
        }
        Ok(())
    }

    /// Strictly increasing, close to the wall clock.
    fn next_creation_time(&self) -> u64 {
        let now = epoch_millis();
        let last = match self.last_creation_time.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |last| Some(now.max(last + 1)),
        ) {
            Ok(last) | Err(last) => last,
        };
        now.max(last + 1)
    }
}

impl NodeServer for LocalNodeServer {
    fn identity(&self) -> NodeIdentity {
        self.identity.clone()
    }

    fn is_local(&self) -> bool {
        true
    }

    fn is_head_node(&self) -> bool {
        self.provider
            .upgrade()
            .is_some_and(|p| p.head_node_name() == self.identity.unique_id)
    }

    fn is_available(&self) -> bool {
        self.is_running() && !self.identity.unique_id.is_empty()
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn drain(&self, draining: bool) {
        if self.draining.swap(draining, Ordering::AcqRel) != draining {
            info!(node = %self.identity.unique_id, draining, "drain state changed");
        }
    }

    fn snapshot(&self) -> Option<Arc<NodeSnapshot>> {
        self.snapshots.current()
    }

    fn last_snapshot(&self) -> Option<Arc<NodeSnapshot>> {
        self.snapshots.previous()
    }

    fn update_snapshot(&self, snapshot: NodeSnapshot) {
        self.snapshots.publish(snapshot);
    }

    fn channel(&self) -> Option<ChannelRef> {
        None
    }

    fn run_command(&self, command_line: &str) -> Task<Vec<String>> {
        let output = match &self.executor {
            Some(executor) => executor.execute(command_line),
            None => Vec::new(),
        };
        Task::completed(output)
    }

    fn service_factory(&self) -> Arc<dyn ServiceFactory> {
        Arc::clone(&self.factory)
    }

    fn shutdown(&self) {
        info!(node = %self.identity.unique_id, "shutdown requested");
        self.running.store(false, Ordering::Release);
        for hook in self.shutdown_hooks.lock().iter() {
            hook();
        }
    }

    fn close(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ServiceInfo, ServiceRegistry};
    use crate::testing::*;

    #[test]
    fn unavailable_until_started() {
        let (provider, _) = provider("node-1", 100);
        let local = provider.local_node();
        assert!(!local.is_available());
        assert!(local.snapshot().is_none());

        local.start();
        assert!(local.is_available());
        assert!(local.channel().is_none());
        assert_eq!(local.snapshot().unwrap().startup_time, 100);
    }

    #[test]
    fn creation_times_strictly_increase() {
        let (provider, _) = provider("node-1", 100);
        let local = provider.local_node();
        let first = local.update_local_snapshot();
        let second = local.update_local_snapshot();
        let third = local.update_local_snapshot();

        assert!(first.creation_time < second.creation_time);
        assert!(second.creation_time < third.creation_time);
        assert_eq!(local.last_snapshot().unwrap().creation_time, second.creation_time);
    }

    #[test]
    fn snapshot_carries_drain_flag_services_and_configured_fields() {
        let services = Arc::new(crate::services::ServiceDirectory::new("node-1"));
        services.register_local(ServiceInfo::new("lobby-1", "node-1", "lobby"), None);
        let provider = NodeServerProvider::builder(
            identity("node-1"),
            fleetgrid_state::StateStore::open_in_memory().unwrap(),
            services.clone(),
        )
        .with_snapshot_configurer(Arc::new(|snapshot: &mut NodeSnapshot| {
            snapshot.max_memory = 4096;
            snapshot.modules.push("bridge".into());
        }))
        .build()
        .unwrap();
        let local = provider.local_node();

        local.drain(true);
        let snapshot = local.update_local_snapshot();

        assert!(snapshot.draining);
        assert_eq!(snapshot.current_services, 1);
        assert_eq!(snapshot.max_memory, 4096);
        assert_eq!(snapshot.modules, vec!["bridge"]);
        assert_eq!(services.local_services().len(), 1);
    }

    #[test]
    fn run_command_uses_the_executor() {
        let services = Arc::new(crate::services::ServiceDirectory::new("node-1"));
        let provider = NodeServerProvider::builder(
            identity("node-1"),
            fleetgrid_state::StateStore::open_in_memory().unwrap(),
            services,
        )
        .with_command_executor(Arc::new(|line: &str| vec![format!("ran {line}")]))
        .build()
        .unwrap();

        let output = provider.local_node().run_command("list").get().unwrap();
        assert_eq!(output, vec!["ran list"]);
    }

    #[test]
    fn run_command_without_executor_is_empty() {
        let (provider, _) = provider("node-1", 100);
        assert!(provider.local_node().run_command("list").get().unwrap().is_empty());
    }

    #[test]
    fn shutdown_runs_hooks_and_stops() {
        let (provider, _) = provider("node-1", 100);
        let local = provider.local_node();
        local.start();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        local.on_shutdown(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        local.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!local.is_available());
    }
}
