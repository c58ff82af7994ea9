//! Routed channel messages and their logical targets.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buffer::{MessageBuffer, SharedBuffer};
use crate::error::{ClusterError, ClusterResult};

/// Channel carrying cluster-internal control messages.
pub const INTERNAL_CHANNEL: &str = "fleetgrid:internal";

/// Message ids reserved on [`INTERNAL_CHANNEL`].
pub mod ids {
    pub const SYNC_CLUSTER_DATA: &str = "sync_cluster_data";
    pub const CLUSTER_NODE_SHUTDOWN: &str = "cluster_node_shutdown";
    pub const UPDATE_NODE_INFO_SNAPSHOT: &str = "update_node_info_snapshot";
    pub const REGISTER_KNOWN_NODE: &str = "register_known_node";
    pub const REMOVE_KNOWN_NODE: &str = "remove_known_node";
    pub const UPDATE_SERVICE_LIFECYCLE: &str = "update_service_lifecycle";
    pub const CHANGE_DRAINING_STATE: &str = "change_draining_state";
    pub const SEND_COMMAND_LINE: &str = "send_command_line";
    pub const CREATE_CLOUD_SERVICE: &str = "create_cloud_service";
}

// ── Targets ────────────────────────────────────────────────────────

/// Logical recipient of a message. `None` names mean "every".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum ChannelMessageTarget {
    All,
    Node(Option<String>),
    Service(Option<String>),
    Task(String),
    Group(String),
    Environment(String),
}

impl ChannelMessageTarget {
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node(Some(name.into()))
    }

    pub fn all_nodes() -> Self {
        Self::Node(None)
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(Some(name.into()))
    }

    pub fn all_services() -> Self {
        Self::Service(None)
    }

    pub fn task(name: impl Into<String>) -> Self {
        Self::Task(name.into())
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::Group(name.into())
    }

    pub fn environment(name: impl Into<String>) -> Self {
        Self::Environment(name.into())
    }
}

impl fmt::Display for ChannelMessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Node(name) => write!(f, "NODE[{}]", name.as_deref().unwrap_or("*")),
            Self::Service(name) => write!(f, "SERVICE[{}]", name.as_deref().unwrap_or("*")),
            Self::Task(name) => write!(f, "TASK[{name}]"),
            Self::Group(name) => write!(f, "GROUP[{name}]"),
            Self::Environment(name) => write!(f, "ENVIRONMENT[{name}]"),
        }
    }
}

// ── Message ────────────────────────────────────────────────────────

/// A routed application-level message.
///
/// Clones share the same body buffer without taking a reference; the
/// reference taken by [`ChannelMessageBuilder::build`] belongs to whoever
/// sends the message.
#[derive(Clone)]
pub struct ChannelMessage {
    channel: String,
    message: String,
    sender: Option<String>,
    content: Arc<dyn MessageBuffer>,
    targets: Vec<ChannelMessageTarget>,
    send_sync: bool,
}

impl ChannelMessage {
    pub fn builder(channel: impl Into<String>, message: impl Into<String>) -> ChannelMessageBuilder {
        ChannelMessageBuilder {
            channel: channel.into(),
            message: message.into(),
            sender: None,
            content: None,
            targets: Vec::new(),
            send_sync: false,
        }
    }

    /// Builder for a message on [`INTERNAL_CHANNEL`].
    pub fn internal(message: impl Into<String>) -> ChannelMessageBuilder {
        Self::builder(INTERNAL_CHANNEL, message)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Node the message originated from, if stamped.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn content(&self) -> &Arc<dyn MessageBuffer> {
        &self.content
    }

    pub fn targets(&self) -> &[ChannelMessageTarget] {
        &self.targets
    }

    pub fn send_sync(&self) -> bool {
        self.send_sync
    }

    pub fn is_internal(&self) -> bool {
        self.channel == INTERNAL_CHANNEL
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> ClusterResult<T> {
        Ok(serde_json::from_slice(&self.content.content())?)
    }

    // ── Wire frames ───────────────────────────────────────────────

    pub fn encode(&self) -> ClusterResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.to_frame())?))
    }

    pub fn decode(bytes: &[u8]) -> ClusterResult<Self> {
        let frame: MessageFrame = serde_json::from_slice(bytes)?;
        Self::from_frame(frame)
    }

    /// Encode a collection, the body format of query responses.
    pub fn encode_all(messages: &[ChannelMessage]) -> ClusterResult<Bytes> {
        let frames: Vec<_> = messages.iter().map(Self::to_frame).collect();
        Ok(Bytes::from(serde_json::to_vec(&frames)?))
    }

    pub fn decode_all(bytes: &[u8]) -> ClusterResult<Vec<ChannelMessage>> {
        let frames: Vec<MessageFrame> = serde_json::from_slice(bytes)?;
        frames.into_iter().map(Self::from_frame).collect()
    }

    fn to_frame(&self) -> MessageFrame {
        MessageFrame {
            channel: self.channel.clone(),
            message: self.message.clone(),
            sender: self.sender.clone(),
            targets: self.targets.clone(),
            send_sync: self.send_sync,
            content: hex::encode(self.content.content()),
        }
    }

    fn from_frame(frame: MessageFrame) -> ClusterResult<Self> {
        let content = hex::decode(&frame.content).map_err(|e| ClusterError::Content(e.to_string()))?;
        let mut builder = Self::builder(frame.channel, frame.message)
            .targets(frame.targets)
            .send_sync(frame.send_sync)
            .content(content);
        builder.sender = frame.sender;
        Ok(builder.build())
    }
}

impl fmt::Debug for ChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelMessage")
            .field("channel", &self.channel)
            .field("message", &self.message)
            .field("sender", &self.sender)
            .field("targets", &self.targets)
            .field("send_sync", &self.send_sync)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ChannelMessage {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel
            && self.message == other.message
            && self.sender == other.sender
            && self.targets == other.targets
            && self.send_sync == other.send_sync
            && self.content.content() == other.content.content()
    }
}

#[derive(Serialize, Deserialize)]
struct MessageFrame {
    channel: String,
    message: String,
    #[serde(default)]
    sender: Option<String>,
    targets: Vec<ChannelMessageTarget>,
    #[serde(default)]
    send_sync: bool,
    content: String,
}

// ── Builder ────────────────────────────────────────────────────────

pub struct ChannelMessageBuilder {
    channel: String,
    message: String,
    sender: Option<String>,
    content: Option<Arc<dyn MessageBuffer>>,
    targets: Vec<ChannelMessageTarget>,
    send_sync: bool,
}

impl ChannelMessageBuilder {
    pub fn sender(mut self, node: impl Into<String>) -> Self {
        self.sender = Some(node.into());
        self
    }

    pub fn target(mut self, target: ChannelMessageTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = ChannelMessageTarget>) -> Self {
        self.targets.extend(targets);
        self
    }

    pub fn send_sync(mut self, send_sync: bool) -> Self {
        self.send_sync = send_sync;
        self
    }

    /// Use raw bytes as the body.
    pub fn content(self, content: impl Into<Bytes>) -> Self {
        self.buffer(Arc::new(SharedBuffer::new(content)))
    }

    /// Use `value` encoded as JSON as the body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> ClusterResult<Self> {
        Ok(self.content(serde_json::to_vec(value)?))
    }

    /// Use a caller-provided buffer as the body.
    pub fn buffer(mut self, buffer: Arc<dyn MessageBuffer>) -> Self {
        self.content = Some(buffer);
        self
    }

    /// Finish the message, taking the sender's reference on the body.
    pub fn build(self) -> ChannelMessage {
        let content = self
            .content
            .unwrap_or_else(|| Arc::new(SharedBuffer::empty()));
        content.acquire();
        ChannelMessage {
            channel: self.channel,
            message: self.message,
            sender: self.sender,
            content,
            targets: self.targets,
            send_sync: self.send_sync,
        }
    }
}
