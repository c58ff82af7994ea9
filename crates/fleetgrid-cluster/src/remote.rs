//! Node servers for peers, reached over a bound channel.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use fleetgrid_state::NodeIdentity;
use fleetgrid_task::Task;

use crate::channel::ChannelRef;
use crate::disconnect::NodeDisconnectHandler;
use crate::message::{ChannelMessage, ChannelMessageTarget, ids};
use crate::messenger::{fan_in, fan_out};
use crate::node::NodeServer;
use crate::provider::NodeServerProvider;
use crate::services::{ServiceConfiguration, ServiceFactory, ServiceInfo};
use crate::snapshot::{NodeSnapshot, SnapshotSlot};
use crate::sync::{DataSyncRegistry, SyncPayload};

type ChannelSlot = Arc<RwLock<Option<ChannelRef>>>;

pub struct RemoteNodeServer {
    identity: RwLock<NodeIdentity>,
    local_node: String,
    provider: Weak<NodeServerProvider>,
    channel: ChannelSlot,
    snapshots: SnapshotSlot,
    disconnect: Arc<NodeDisconnectHandler>,
    data_sync: Arc<DataSyncRegistry>,
}

impl RemoteNodeServer {
    pub(crate) fn new(
        identity: NodeIdentity,
        local_node: String,
        provider: Weak<NodeServerProvider>,
        disconnect: Arc<NodeDisconnectHandler>,
        data_sync: Arc<DataSyncRegistry>,
    ) -> Self {
        Self {
            identity: RwLock::new(identity),
            local_node,
            provider,
            channel: Arc::new(RwLock::new(None)),
            snapshots: SnapshotSlot::new(),
            disconnect,
            data_sync,
        }
    }

    /// Bind `channel` if none is bound and `identity` is the configured one.
    pub fn accept_channel(&self, identity: &NodeIdentity, channel: ChannelRef) -> bool {
        let mut bound = self.channel.write();
        if bound.is_some() || identity.unique_id != self.identity.read().unique_id {
            return false;
        }
        *bound = Some(channel);
        true
    }

    pub(crate) fn set_identity(&self, identity: NodeIdentity) {
        *self.identity.write() = identity;
    }

    pub fn is_connected(&self) -> bool {
        self.channel.read().is_some()
    }

    /// Exchange cluster data with this peer.
    ///
    /// A forced sync is one-way. Otherwise the peer answers with the
    /// values it kept over ours, which are applied locally. Resolves to the
    /// number of entries applied.
    pub fn sync_cluster_data(&self, force: bool) -> Task<usize> {
        let Some(channel) = self.channel() else {
            return Task::completed(0);
        };
        let payload = self.data_sync.prepare_cluster_data(force, &[]);
        let Some(message) = self.message(ids::SYNC_CLUSTER_DATA, &payload) else {
            return Task::completed(0);
        };
        if force {
            fan_out(message, &[channel]);
            return Task::completed(0);
        }

        let data_sync = Arc::clone(&self.data_sync);
        fan_in(message, &[channel]).map(move |responses| {
            responses
                .iter()
                .filter_map(|m| m.json::<SyncPayload>().ok())
                .map(|payload| data_sync.handle(&payload, true).applied)
                .sum()
        })
    }

    fn message<T: Serialize + ?Sized>(&self, id: &str, body: &T) -> Option<ChannelMessage> {
        internal_message(&self.local_node, &self.name(), id, body, false)
    }

    fn send_one_way(&self, id: &str, body: &impl Serialize, sync: bool) {
        let Some(channel) = self.channel() else {
            debug!(node = %self.name(), message = id, "not connected, message dropped");
            return;
        };
        if let Some(message) = internal_message(&self.local_node, &self.name(), id, body, sync) {
            fan_out(message, &[channel]);
        }
    }
}

impl NodeServer for RemoteNodeServer {
    fn identity(&self) -> NodeIdentity {
        self.identity.read().clone()
    }

    fn is_local(&self) -> bool {
        false
    }

    fn is_head_node(&self) -> bool {
        let name = self.name();
        self.provider
            .upgrade()
            .is_some_and(|p| p.head_node_name() == name)
    }

    fn is_available(&self) -> bool {
        self.is_connected() && self.snapshots.current().is_some()
    }

    fn is_draining(&self) -> bool {
        self.snapshot().is_some_and(|s| s.draining)
    }

    fn drain(&self, draining: bool) {
        self.send_one_way(ids::CHANGE_DRAINING_STATE, &draining, false);
    }

    fn snapshot(&self) -> Option<Arc<NodeSnapshot>> {
        self.snapshots.current()
    }

    fn last_snapshot(&self) -> Option<Arc<NodeSnapshot>> {
        self.snapshots.previous()
    }

    /// Snapshots not newer than the current one are ignored.
    fn update_snapshot(&self, snapshot: NodeSnapshot) {
        if let Some(current) = self.snapshots.current() {
            if snapshot.creation_time <= current.creation_time {
                debug!(
                    node = %self.name(),
                    received = snapshot.creation_time,
                    current = current.creation_time,
                    "stale snapshot ignored"
                );
                return;
            }
        }
        if self.snapshots.publish(snapshot) {
            debug!(node = %self.name(), "first snapshot received");
            if let Some(provider) = self.provider.upgrade() {
                provider.select_head_node();
            }
        }
    }

    fn channel(&self) -> Option<ChannelRef> {
        self.channel.read().clone()
    }

    fn run_command(&self, command_line: &str) -> Task<Vec<String>> {
        let Some(channel) = self.channel() else {
            return Task::completed(Vec::new());
        };
        let Some(message) = self.message(ids::SEND_COMMAND_LINE, command_line) else {
            return Task::completed(Vec::new());
        };
        fan_in(message, &[channel]).map(|responses| first_json(&responses).unwrap_or_default())
    }

    fn service_factory(&self) -> Arc<dyn ServiceFactory> {
        Arc::new(RemoteServiceFactory {
            local_node: self.local_node.clone(),
            node: self.name(),
            channel: Arc::clone(&self.channel),
        })
    }

    fn shutdown(&self) {
        self.send_one_way(ids::CLUSTER_NODE_SHUTDOWN, &(), true);
    }

    fn close(&self) {
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            channel.close();
        }
        self.snapshots.clear();

        let name = self.name();
        self.disconnect.handle_node_close(&name);
        if let Some(provider) = self.provider.upgrade() {
            provider.select_head_node();
        }
        info!(node = %name, "node server closed");
    }
}

/// Creates services on a peer by querying it.
struct RemoteServiceFactory {
    local_node: String,
    node: String,
    channel: ChannelSlot,
}

impl ServiceFactory for RemoteServiceFactory {
    fn create_service(&self, config: ServiceConfiguration) -> Task<Option<ServiceInfo>> {
        let Some(channel) = self.channel.read().clone() else {
            return Task::completed(None);
        };
        let Some(message) =
            internal_message(&self.local_node, &self.node, ids::CREATE_CLOUD_SERVICE, &config, false)
        else {
            return Task::completed(None);
        };
        fan_in(message, &[channel])
            .map(|responses| first_json::<Option<ServiceInfo>>(&responses).flatten())
    }
}

fn internal_message<T: Serialize + ?Sized>(
    sender: &str,
    node: &str,
    id: &str,
    body: &T,
    sync: bool,
) -> Option<ChannelMessage> {
    match ChannelMessage::internal(id)
        .sender(sender)
        .target(ChannelMessageTarget::node(node))
        .send_sync(sync)
        .json(body)
    {
        Ok(builder) => Some(builder.build()),
        Err(err) => {
            error!(%err, node, message = id, "failed to encode node message");
            None
        }
    }
}

fn first_json<T: DeserializeOwned>(responses: &[ChannelMessage]) -> Option<T> {
    responses.first().and_then(|m| m.json().ok())
}
