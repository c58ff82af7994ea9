//! Transport packets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::MessageBuffer;
use crate::error::ClusterResult;
use crate::message::ChannelMessage;

pub const HEADER_KIND: &str = "kind";
pub const KIND_CHANNEL_MESSAGE: &str = "channel_message";
pub const KIND_QUERY_RESPONSE: &str = "query_response";

/// A header map plus an opaque body.
///
/// A packet may retain one reference of the message body it was built
/// from. The reference is released exactly once: by [`Packet::release`]
/// or, failing that, on drop.
pub struct Packet {
    header: BTreeMap<String, String>,
    content: Bytes,
    retained: Option<Arc<dyn MessageBuffer>>,
}

impl Packet {
    pub fn new(header: BTreeMap<String, String>, content: impl Into<Bytes>) -> Self {
        Self {
            header,
            content: content.into(),
            retained: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new(), Bytes::new())
    }

    /// A packet carrying one encoded channel message.
    pub fn channel_message(payload: Bytes) -> Self {
        Self::new(kind_header(KIND_CHANNEL_MESSAGE), payload)
    }

    /// A query response carrying a collection of messages.
    pub fn query_response(messages: &[ChannelMessage]) -> ClusterResult<Self> {
        Ok(Self::new(
            kind_header(KIND_QUERY_RESPONSE),
            ChannelMessage::encode_all(messages)?,
        ))
    }

    /// Hold a body reference until the packet is released.
    pub fn retaining(mut self, buffer: Arc<dyn MessageBuffer>) -> Self {
        if let Some(previous) = self.retained.replace(buffer) {
            previous.release();
        }
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.header
    }

    pub fn kind(&self) -> Option<&str> {
        self.header(HEADER_KIND)
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn is_readable(&self) -> bool {
        !self.content.is_empty()
    }

    pub fn is_retaining(&self) -> bool {
        self.retained.is_some()
    }

    pub fn decode_message(&self) -> ClusterResult<ChannelMessage> {
        ChannelMessage::decode(&self.content)
    }

    pub fn decode_messages(&self) -> ClusterResult<Vec<ChannelMessage>> {
        ChannelMessage::decode_all(&self.content)
    }

    /// Give back the retained body reference, if any.
    pub fn release(&mut self) {
        if let Some(buffer) = self.retained.take() {
            buffer.release();
        }
    }
}

/// Clones never retain a body reference.
impl Clone for Packet {
    fn clone(&self) -> Self {
        Self::new(self.header.clone(), self.content.clone())
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("len", &self.content.len())
            .field("retaining", &self.is_retaining())
            .finish()
    }
}

fn kind_header(kind: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(HEADER_KIND.to_string(), kind.to_string())])
}
