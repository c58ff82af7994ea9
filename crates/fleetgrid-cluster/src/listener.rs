//! Inbound message handling.
//!
//! Internal control messages are dispatched by id. Any other message is
//! offered to the registered local handlers and then re-delivered to the
//! local services it targets, with redirect disallowed so it never leaves
//! this node again.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};

use fleetgrid_state::NodeIdentity;
use fleetgrid_task::Task;

use crate::channel::ChannelRef;
use crate::error::ClusterResult;
use crate::memory::PacketHandler;
use crate::message::{ChannelMessage, ids};
use crate::messenger::Messenger;
use crate::node::NodeServer;
use crate::packet::Packet;
use crate::provider::NodeServerProvider;
use crate::remote::RemoteNodeServer;
use crate::services::{ServiceConfiguration, ServiceInfo};
use crate::snapshot::NodeSnapshot;
use crate::sync::SyncPayload;

/// Application handler for messages addressed to this node.
pub trait ChannelMessageHandler: Send + Sync {
    /// Handle `message`; the returned message answers queries.
    fn handle(&self, message: &ChannelMessage) -> Option<ChannelMessage>;
}

impl<F> ChannelMessageHandler for F
where
    F: Fn(&ChannelMessage) -> Option<ChannelMessage> + Send + Sync,
{
    fn handle(&self, message: &ChannelMessage) -> Option<ChannelMessage> {
        self(message)
    }
}

pub struct ClusterMessageListener {
    messenger: Arc<Messenger>,
    handlers: RwLock<Vec<Arc<dyn ChannelMessageHandler>>>,
}

impl ClusterMessageListener {
    pub fn new(messenger: Arc<Messenger>) -> Self {
        Self {
            messenger,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler(&self, handler: impl ChannelMessageHandler + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    fn provider(&self) -> &Arc<NodeServerProvider> {
        self.messenger.provider()
    }

    /// Handle one inbound message. For queries the task resolves to the
    /// answers to send back.
    pub fn handle_message(
        &self,
        from: Option<&ChannelRef>,
        message: ChannelMessage,
        query: bool,
    ) -> Task<Vec<ChannelMessage>> {
        if message.is_internal() {
            let response = match self.dispatch_internal(from, &message, query) {
                Ok(response) => response,
                Err(err) => {
                    warn!(%err, message = message.message(), "failed to handle internal message");
                    Task::completed(Vec::new())
                }
            };
            message.content().release();
            return response;
        }

        let handlers = self.handlers.read().clone();
        let local: Vec<ChannelMessage> = handlers
            .iter()
            .filter_map(|handler| handler.handle(&message))
            .collect();

        if !query {
            self.messenger.send_with(message, false);
            return Task::completed(local);
        }
        self.messenger
            .send_query_with(message, false)
            .map(move |mut answers| {
                let mut all = local;
                all.append(&mut answers);
                all
            })
    }

    fn dispatch_internal(
        &self,
        from: Option<&ChannelRef>,
        message: &ChannelMessage,
        query: bool,
    ) -> ClusterResult<Task<Vec<ChannelMessage>>> {
        let provider = self.provider();
        let local_name = provider.local_name().to_string();

        match message.message() {
            ids::UPDATE_NODE_INFO_SNAPSHOT => {
                let snapshot: NodeSnapshot = message.json()?;
                match self.origin(from, message) {
                    Some(node) => node.update_snapshot(snapshot),
                    None => debug!(
                        node = %snapshot.identity.unique_id,
                        "snapshot from unknown node ignored"
                    ),
                }
            }
            ids::SYNC_CLUSTER_DATA => {
                let payload: SyncPayload = message.json()?;
                let outcome = provider.data_sync().handle(&payload, false);
                debug!(applied = outcome.applied, conflicts = outcome.conflicts.len(), "cluster data synced");
                if query && !payload.force {
                    let response = outcome.into_response();
                    return Ok(Task::completed(reply(&local_name, ids::SYNC_CLUSTER_DATA, &response)));
                }
            }
            ids::CLUSTER_NODE_SHUTDOWN => provider.local_node().shutdown(),
            ids::REGISTER_KNOWN_NODE => {
                let identity: NodeIdentity = message.json()?;
                provider.register_known_node(identity)?;
            }
            ids::REMOVE_KNOWN_NODE => {
                let name: String = message.json()?;
                provider.forget_known_node(&name)?;
            }
            ids::UPDATE_SERVICE_LIFECYCLE => {
                let service: ServiceInfo = message.json()?;
                provider.services().update_service(service);
            }
            ids::CHANGE_DRAINING_STATE => {
                let draining: bool = message.json()?;
                provider.local_node().drain(draining);
            }
            ids::SEND_COMMAND_LINE => {
                let command_line: String = message.json()?;
                let output = provider.local_node().run_command(&command_line);
                return Ok(output.map(move |lines| reply(&local_name, ids::SEND_COMMAND_LINE, &lines)));
            }
            ids::CREATE_CLOUD_SERVICE => {
                let config: ServiceConfiguration = message.json()?;
                let created = provider.local_node().service_factory().create_service(config);
                return Ok(created.map(move |service| reply(&local_name, ids::CREATE_CLOUD_SERVICE, &service)));
            }
            other => debug!(message = other, "unknown internal message ignored"),
        }
        Ok(Task::completed(Vec::new()))
    }

    /// The peer a message came from: by channel, else by stamped sender.
    fn origin(&self, from: Option<&ChannelRef>, message: &ChannelMessage) -> Option<Arc<RemoteNodeServer>> {
        let provider = self.provider();
        from.and_then(|channel| provider.node_by_channel(channel.id()))
            .or_else(|| message.sender().and_then(|name| provider.remote_node(name)))
    }
}

impl PacketHandler for ClusterMessageListener {
    fn handle_packet(&self, channel: &ChannelRef, packet: Packet) {
        match packet.decode_message() {
            Ok(message) => {
                self.handle_message(Some(channel), message, false);
            }
            Err(err) => warn!(%err, channel = channel.id(), "undecodable packet dropped"),
        }
    }

    fn handle_query(&self, channel: &ChannelRef, packet: Packet) -> Task<Packet> {
        let message = match packet.decode_message() {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, channel = channel.id(), "undecodable query answered empty");
                return Task::completed(Packet::empty());
            }
        };
        self.handle_message(Some(channel), message, true)
            .map(|responses| {
                Packet::query_response(&responses).unwrap_or_else(|err| {
                    error!(%err, "failed to encode query response");
                    Packet::empty()
                })
            })
    }

    fn channel_closed(&self, channel: &ChannelRef) {
        self.provider().handle_channel_closed(channel.id());
    }
}

fn reply<T: Serialize + ?Sized>(sender: &str, id: &str, body: &T) -> Vec<ChannelMessage> {
    match ChannelMessage::internal(id).sender(sender).json(body) {
        Ok(builder) => vec![builder.build()],
        Err(err) => {
            error!(%err, message = id, "failed to encode reply");
            Vec::new()
        }
    }
}
