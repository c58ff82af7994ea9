//! NodeServerProvider — membership, heartbeat, head selection and
//! dead-node detection.
//!
//! Owns the local node server and a copy-on-write list of remote node
//! servers. The head node is derived from the locally visible membership
//! and recomputed whenever it may have changed; it is advisory and two
//! nodes may briefly disagree on it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleetgrid_state::{NodeIdentity, StateStore};

use crate::channel::ChannelRef;
use crate::config::{ClusterConfig, DEFAULT_MAX_IDLE_MS};
use crate::disconnect::NodeDisconnectHandler;
use crate::error::{ClusterError, ClusterResult};
use crate::local::{LocalHooks, LocalNodeServer};
use crate::message::{ChannelMessage, ChannelMessageTarget, ids};
use crate::messenger::fan_out;
use crate::node::{CommandExecutor, NodeServer};
use crate::packet::Packet;
use crate::remote::RemoteNodeServer;
use crate::services::{NoServiceFactory, ServiceFactory, ServiceRegistry};
use crate::snapshot::{SnapshotConfigurer, epoch_millis};
use crate::sync::DataSyncRegistry;

/// A node taking part in head selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadCandidate<'a> {
    pub name: &'a str,
    pub startup_time: u64,
}

/// Pick the head among `local` and the available `remotes`.
///
/// The oldest node wins. The local node keeps the role on a tie; ties
/// among remotes go to the smallest name.
pub fn elect_head<'a>(local: HeadCandidate<'a>, remotes: &[HeadCandidate<'a>]) -> &'a str {
    let mut head = local;
    let mut head_is_local = true;
    for candidate in remotes {
        let older = candidate.startup_time < head.startup_time;
        let wins_tie = !head_is_local
            && candidate.startup_time == head.startup_time
            && candidate.name < head.name;
        if older || wins_tie {
            head = *candidate;
            head_is_local = false;
        }
    }
    head.name
}

pub struct NodeServerProvider {
    me: Weak<NodeServerProvider>,
    local_name: String,
    local: Arc<LocalNodeServer>,
    remotes: ArcSwap<Vec<Arc<RemoteNodeServer>>>,
    head: ArcSwap<String>,
    store: StateStore,
    services: Arc<dyn ServiceRegistry>,
    disconnect: Arc<NodeDisconnectHandler>,
    data_sync: Arc<DataSyncRegistry>,
    max_idle: Duration,
    shutdown: watch::Sender<bool>,
}

impl NodeServerProvider {
    /// Start building a provider for the local `identity`.
    pub fn builder(
        identity: NodeIdentity,
        store: StateStore,
        services: Arc<dyn ServiceRegistry>,
    ) -> ProviderBuilder {
        ProviderBuilder {
            identity,
            store,
            services,
            max_idle: Duration::from_millis(DEFAULT_MAX_IDLE_MS),
            startup_time: None,
            configurer: None,
            executor: None,
            factory: None,
            data_sync: None,
        }
    }

    // ── Lookups ────────────────────────────────────────────────────

    /// The local node server.
    pub fn local_node(&self) -> &Arc<LocalNodeServer> {
        &self.local
    }

    /// Name of the local node.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Service registry shared with the local node.
    pub fn services(&self) -> Arc<dyn ServiceRegistry> {
        Arc::clone(&self.services)
    }

    /// Registered cluster data synchronizers.
    pub fn data_sync(&self) -> &Arc<DataSyncRegistry> {
        &self.data_sync
    }

    /// Durable store for the local identity and known peers.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Any node server by name, the local one included.
    pub fn node(&self, name: &str) -> Option<Arc<dyn NodeServer>> {
        if name == self.local_name {
            return Some(self.local.clone() as Arc<dyn NodeServer>);
        }
        self.remote_node(name).map(|node| node as Arc<dyn NodeServer>)
    }

    /// A remote node server by name.
    pub fn remote_node(&self, name: &str) -> Option<Arc<RemoteNodeServer>> {
        self.remotes.load().iter().find(|n| n.name() == name).cloned()
    }

    /// Every registered remote node server.
    pub fn remote_nodes(&self) -> Vec<Arc<RemoteNodeServer>> {
        self.remotes.load_full().to_vec()
    }

    /// The remote node bound to the channel with `channel_id`.
    pub fn node_by_channel(&self, channel_id: u64) -> Option<Arc<RemoteNodeServer>> {
        self.remotes
            .load()
            .iter()
            .find(|n| n.channel().is_some_and(|c| c.id() == channel_id))
            .cloned()
    }

    /// The local node first, then every remote node.
    pub fn node_servers(&self) -> Vec<Arc<dyn NodeServer>> {
        let mut nodes: Vec<Arc<dyn NodeServer>> = vec![self.local.clone() as Arc<dyn NodeServer>];
        nodes.extend(self.remotes.load().iter().map(|n| n.clone() as Arc<dyn NodeServer>));
        nodes
    }

    /// Node servers that are connected and have published a snapshot.
    pub fn available_node_servers(&self) -> Vec<Arc<dyn NodeServer>> {
        self.node_servers()
            .into_iter()
            .filter(|n| n.is_available())
            .collect()
    }

    /// Channels of every connected peer.
    pub fn connected_node_channels(&self) -> Vec<ChannelRef> {
        self.remotes.load().iter().filter_map(|n| n.channel()).collect()
    }

    /// Whether at least one peer is connected.
    pub fn has_any_connection(&self) -> bool {
        self.remotes.load().iter().any(|n| n.is_connected())
    }

    // ── Head node ──────────────────────────────────────────────────

    /// Name of the current head node.
    pub fn head_node_name(&self) -> String {
        (**self.head.load()).clone()
    }

    /// The current head node, falling back to the local one.
    pub fn head_node(&self) -> Arc<dyn NodeServer> {
        self.node(&self.head_node_name())
            .unwrap_or_else(|| self.local.clone() as Arc<dyn NodeServer>)
    }

    /// Recompute the head from the currently available nodes.
    pub fn select_head_node(&self) -> Arc<dyn NodeServer> {
        let available: Vec<(String, u64)> = self
            .remotes
            .load()
            .iter()
            .filter(|n| n.is_available())
            .filter_map(|n| n.snapshot().map(|s| (n.name(), s.startup_time)))
            .collect();
        let remotes: Vec<HeadCandidate<'_>> = available
            .iter()
            .map(|(name, startup_time)| HeadCandidate {
                name: name.as_str(),
                startup_time: *startup_time,
            })
            .collect();
        let local = HeadCandidate {
            name: &self.local_name,
            startup_time: self.local.startup_time(),
        };

        let head = elect_head(local, &remotes).to_string();
        let previous = self.head.swap(Arc::new(head.clone()));
        if *previous != head {
            info!(head = %head, previous = %previous, "head node changed");
        }
        self.head_node()
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Add a peer, persist it and tell the rest of the cluster.
    pub fn add_node(&self, identity: NodeIdentity) -> ClusterResult<()> {
        self.ensure_remote(&identity.unique_id)?;
        self.store.put_cluster_node(&identity)?;
        self.register_node(identity.clone());
        self.broadcast_json(ids::REGISTER_KNOWN_NODE, &identity)
    }

    /// Remove a peer, forget it and tell the rest of the cluster.
    pub fn remove_node(&self, name: &str) -> ClusterResult<bool> {
        self.ensure_remote(name)?;
        let existed = self.store.delete_cluster_node(name)?;
        let removed = self.unregister_node(name);
        self.broadcast_json(ids::REMOVE_KNOWN_NODE, name)?;
        Ok(existed || removed)
    }

    /// Record a peer announced by another node. Not rebroadcast.
    pub fn register_known_node(&self, identity: NodeIdentity) -> ClusterResult<()> {
        if identity.unique_id == self.local_name {
            return Ok(());
        }
        self.store.put_cluster_node(&identity)?;
        self.register_node(identity);
        Ok(())
    }

    /// Forget a peer removed by another node. Not rebroadcast.
    pub fn forget_known_node(&self, name: &str) -> ClusterResult<bool> {
        if name == self.local_name {
            return Ok(false);
        }
        let existed = self.store.delete_cluster_node(name)?;
        Ok(self.unregister_node(name) || existed)
    }

    /// Make the known peers exactly `identities`, persisting the result.
    pub fn set_cluster_nodes(&self, identities: Vec<NodeIdentity>) -> ClusterResult<()> {
        let peers: Vec<NodeIdentity> = identities
            .into_iter()
            .filter(|i| i.unique_id != self.local_name)
            .collect();
        self.store.replace_cluster_nodes(&peers)?;

        for node in self.remote_nodes() {
            let name = node.name();
            if !peers.iter().any(|p| p.unique_id == name) {
                self.unregister_node(&name);
            }
        }
        for peer in peers {
            self.register_node(peer);
        }
        Ok(())
    }

    /// Create a remote node server, or update the identity of a known one.
    pub fn register_node(&self, identity: NodeIdentity) -> Arc<RemoteNodeServer> {
        let name = identity.unique_id.clone();
        let candidate = Arc::new(RemoteNodeServer::new(
            identity.clone(),
            self.local_name.clone(),
            self.me.clone(),
            Arc::clone(&self.disconnect),
            Arc::clone(&self.data_sync),
        ));

        let mut existing = None;
        self.remotes.rcu(|nodes| {
            existing = nodes.iter().find(|n| n.name() == name).cloned();
            if existing.is_some() {
                return Arc::clone(nodes);
            }
            let mut next = Vec::clone(nodes);
            next.push(Arc::clone(&candidate));
            Arc::new(next)
        });

        match existing {
            Some(node) => {
                node.set_identity(identity);
                debug!(node = %name, "node identity updated");
                node
            }
            None => {
                info!(node = %name, "node registered");
                candidate
            }
        }
    }

    /// Drop and close a remote node server. Returns whether it existed.
    pub fn unregister_node(&self, name: &str) -> bool {
        let mut removed = None;
        self.remotes.rcu(|nodes| {
            removed = nodes.iter().find(|n| n.name() == name).cloned();
            if removed.is_none() {
                return Arc::clone(nodes);
            }
            Arc::new(nodes.iter().filter(|n| n.name() != name).cloned().collect())
        });

        match removed {
            Some(node) => {
                node.close();
                info!(node = %name, "node unregistered");
                true
            }
            None => false,
        }
    }

    fn ensure_remote(&self, name: &str) -> ClusterResult<()> {
        if name == self.local_name {
            return Err(ClusterError::LocalNode(name.to_string()));
        }
        Ok(())
    }

    // ── Connections ────────────────────────────────────────────────

    /// Bind an incoming peer connection to its node server.
    pub fn accept_connection(&self, identity: &NodeIdentity, channel: ChannelRef) -> bool {
        let Some(node) = self.remote_node(&identity.unique_id) else {
            warn!(node = %identity.unique_id, address = %channel.address(), "connection from unknown node rejected");
            return false;
        };
        if !node.accept_channel(identity, channel.clone()) {
            warn!(node = %identity.unique_id, address = %channel.address(), "duplicate connection rejected");
            return false;
        }
        info!(node = %identity.unique_id, channel = channel.id(), "node connected");
        // A snapshot may have arrived before the channel.
        if node.is_available() {
            self.select_head_node();
        }
        true
    }

    /// A peer channel went away; close the node server bound to it.
    pub fn handle_channel_closed(&self, channel_id: u64) {
        if let Some(node) = self.node_by_channel(channel_id) {
            warn!(node = %node.name(), channel = channel_id, "node channel closed");
            node.close();
        }
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    /// One heartbeat: evict dead peers, then publish the local snapshot.
    pub fn tick(&self) {
        self.tick_at(epoch_millis());
    }

    /// [`NodeServerProvider::tick`] with an explicit clock.
    pub fn tick_at(&self, now: u64) {
        if !self.local.is_available() {
            return;
        }
        self.check_for_dead_nodes_at(now);
        if let Err(err) = self.local.publish_snapshot_update() {
            error!(%err, "failed to publish local snapshot");
        }
    }

    /// Evict idle peers as of now.
    pub fn check_for_dead_nodes(&self) -> Vec<String> {
        self.check_for_dead_nodes_at(epoch_millis())
    }

    /// Close every available peer whose snapshot is older than the idle
    /// threshold at `now`. Returns the evicted names.
    pub fn check_for_dead_nodes_at(&self, now: u64) -> Vec<String> {
        let max_idle = self.max_idle.as_millis() as u64;
        let mut evicted = Vec::new();
        for node in self.remotes.load_full().iter() {
            if !node.is_available() {
                continue;
            }
            let Some(snapshot) = node.snapshot() else {
                continue;
            };
            let idle = now.saturating_sub(snapshot.creation_time);
            if idle > max_idle {
                let name = node.name();
                warn!(
                    node = %name,
                    idle_secs = idle as f64 / 1000.0,
                    max_idle_secs = max_idle as f64 / 1000.0,
                    "node idled too long, closing"
                );
                node.close();
                evicted.push(name);
            }
        }
        evicted
    }

    /// Run [`NodeServerProvider::tick`] every `interval` until closed.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(node = %provider.local_name, ?interval, "heartbeat loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => provider.tick(),
                    _ = shutdown.changed() => {
                        info!(node = %provider.local_name, "heartbeat loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    // ── Cluster broadcast ──────────────────────────────────────────

    /// Send `message` to every connected peer.
    pub fn broadcast(&self, message: ChannelMessage) {
        fan_out(message, &self.connected_node_channels());
    }

    fn broadcast_json<T: serde::Serialize + ?Sized>(&self, id: &str, body: &T) -> ClusterResult<()> {
        let message = ChannelMessage::internal(id)
            .sender(&self.local_name)
            .target(ChannelMessageTarget::all_nodes())
            .json(body)?
            .build();
        self.broadcast(message);
        Ok(())
    }

    /// Queue `packet` on every connected peer.
    pub fn send_packet(&self, packet: Packet) {
        for channel in self.connected_node_channels() {
            channel.send(packet.clone());
        }
    }

    /// Write `packet` to every connected peer, flushing each.
    pub fn send_packet_sync(&self, packet: Packet) {
        for channel in self.connected_node_channels() {
            channel.send_sync(packet.clone());
        }
    }

    /// Push all local cluster data to every peer, overwriting theirs.
    pub fn sync_data_into_cluster(&self) -> ClusterResult<()> {
        let payload = self.data_sync.prepare_cluster_data(true, &[]);
        self.broadcast_json(ids::SYNC_CLUSTER_DATA, &payload)
    }

    /// Close every remote node server and stop the heartbeat loop.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        for node in self.remote_nodes() {
            node.close();
        }
        self.select_head_node();
        info!(node = %self.local_name, "node server provider closed");
    }
}

// ── Builder ────────────────────────────────────────────────────────

/// Configures and builds a [`NodeServerProvider`].
pub struct ProviderBuilder {
    identity: NodeIdentity,
    store: StateStore,
    services: Arc<dyn ServiceRegistry>,
    max_idle: Duration,
    startup_time: Option<u64>,
    configurer: Option<Arc<dyn SnapshotConfigurer>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    factory: Option<Arc<dyn ServiceFactory>>,
    data_sync: Option<Arc<DataSyncRegistry>>,
}

impl ProviderBuilder {
    /// Builder seeded from the local identity and timings in `config`.
    pub fn from_config(
        config: &ClusterConfig,
        store: StateStore,
        services: Arc<dyn ServiceRegistry>,
    ) -> ClusterResult<Self> {
        Ok(NodeServerProvider::builder(config.local_identity()?, store, services)
            .with_max_idle(config.max_idle()))
    }

    /// Snapshot age after which a peer counts as dead.
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Override the local startup time (epoch milliseconds).
    pub fn with_startup_time(mut self, startup_time: u64) -> Self {
        self.startup_time = Some(startup_time);
        self
    }

    /// Hook that decorates each published local snapshot.
    pub fn with_snapshot_configurer(mut self, configurer: Arc<dyn SnapshotConfigurer>) -> Self {
        self.configurer = Some(configurer);
        self
    }

    /// Executor for commands sent by peers.
    pub fn with_command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Factory for services created on request of peers.
    pub fn with_service_factory(mut self, factory: Arc<dyn ServiceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Share an existing data sync registry.
    pub fn with_data_sync(mut self, data_sync: Arc<DataSyncRegistry>) -> Self {
        self.data_sync = Some(data_sync);
        self
    }

    /// Persist the local identity and load known peers from the store.
    pub fn build(self) -> ClusterResult<Arc<NodeServerProvider>> {
        let peers = self.store.list_cluster_nodes()?;
        self.store.put_local_identity(&self.identity)?;

        let local_name = self.identity.unique_id.clone();
        let identity = self.identity;
        let data_sync = self.data_sync.unwrap_or_default();
        let disconnect = Arc::new(NodeDisconnectHandler::new(
            &local_name,
            Arc::clone(&self.services),
        ));
        let hooks = LocalHooks {
            startup_time: self.startup_time.unwrap_or_else(epoch_millis),
            configurer: self.configurer,
            executor: self.executor,
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(NoServiceFactory) as Arc<dyn ServiceFactory>),
        };
        let (shutdown, _) = watch::channel(false);
        let store = self.store;
        let services = self.services;
        let max_idle = self.max_idle;

        let provider = Arc::new_cyclic(|me: &Weak<NodeServerProvider>| NodeServerProvider {
            me: me.clone(),
            local: Arc::new(LocalNodeServer::new(identity, me.clone(), hooks)),
            remotes: ArcSwap::from_pointee(Vec::new()),
            head: ArcSwap::from_pointee(local_name.clone()),
            local_name,
            store,
            services,
            disconnect,
            data_sync,
            max_idle,
            shutdown,
        });

        for peer in peers {
            if peer.unique_id != provider.local_name {
                provider.register_node(peer);
            }
        }
        debug!(node = %provider.local_name, peers = provider.remotes.load().len(), "node server provider ready");
        Ok(provider)
    }
}
