//! The transport seam.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fleetgrid_task::Task;

use crate::packet::Packet;

/// A bidirectional connection to a peer node or a local service process.
pub trait Channel: Send + Sync {
    /// Identity used for deduplication during target resolution.
    fn id(&self) -> u64;

    fn address(&self) -> String;

    fn send(&self, packet: Packet);

    /// Send and wait until the packet has been written.
    fn send_sync(&self, packet: Packet);

    /// Send and complete the returned task with the response packet.
    ///
    /// Implementations must eventually complete, fail or cancel the task.
    fn send_query(&self, packet: Packet) -> Task<Packet>;

    fn close(&self);

    fn is_open(&self) -> bool;
}

pub type ChannelRef = Arc<dyn Channel>;

/// Allocates channel ids. One sequence per transport instance.
#[derive(Debug)]
pub struct ChannelIdSequence {
    next: AtomicU64,
}

impl ChannelIdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ChannelIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects channels keyed by id, dropping duplicates.
#[derive(Default)]
pub struct ChannelSet {
    channels: BTreeMap<u64, ChannelRef>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: ChannelRef) {
        self.channels.entry(channel.id()).or_insert(channel);
    }

    pub fn extend(&mut self, channels: impl IntoIterator<Item = ChannelRef>) {
        for channel in channels {
            self.insert(channel);
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.channels.keys().copied().collect()
    }

    pub fn into_vec(self) -> Vec<ChannelRef> {
        self.channels.into_values().collect()
    }
}
