//! In-process transport.
//!
//! [`MemoryChannel::pair`] creates two connected ends. A packet sent on
//! one end is handed synchronously to the [`PacketHandler`] bound to the
//! other end, on the sending thread. Closing either end closes both and
//! notifies both handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::anyhow;
use parking_lot::RwLock;
use tracing::trace;

use fleetgrid_task::Task;

use crate::channel::{Channel, ChannelIdSequence, ChannelRef};
use crate::packet::Packet;

/// Receives packets arriving on a channel.
pub trait PacketHandler: Send + Sync {
    fn handle_packet(&self, channel: &ChannelRef, packet: Packet);

    /// Answer a query. The returned task completes with the response.
    fn handle_query(&self, channel: &ChannelRef, packet: Packet) -> Task<Packet>;

    fn channel_closed(&self, _channel: &ChannelRef) {}
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    id: u64,
    address: String,
    me: Weak<MemoryChannel>,
    peer: OnceLock<Weak<MemoryChannel>>,
    handler: RwLock<Option<Arc<dyn PacketHandler>>>,
    open: AtomicBool,
}

impl MemoryChannel {
    /// Create two connected ends. `left` talks to the node at
    /// `left_address`, `right` to the node at `right_address`.
    pub fn pair(
        ids: &ChannelIdSequence,
        left_address: &str,
        right_address: &str,
    ) -> (Arc<Self>, Arc<Self>) {
        let left = Self::end(ids.next_id(), left_address);
        let right = Self::end(ids.next_id(), right_address);
        let _ = left.peer.set(Arc::downgrade(&right));
        let _ = right.peer.set(Arc::downgrade(&left));
        (left, right)
    }

    fn end(id: u64, address: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            address: address.to_string(),
            me: me.clone(),
            peer: OnceLock::new(),
            handler: RwLock::new(None),
            open: AtomicBool::new(true),
        })
    }

    /// Route packets arriving on this end to `handler`.
    pub fn bind(&self, handler: Arc<dyn PacketHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn peer(&self) -> Option<Arc<MemoryChannel>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn handler(&self) -> Option<(ChannelRef, Arc<dyn PacketHandler>)> {
        let handler = self.handler.read().clone()?;
        let me: ChannelRef = self.me.upgrade()?;
        Some((me, handler))
    }

    fn deliver(&self, packet: Packet) {
        match self.handler() {
            Some((me, handler)) => handler.handle_packet(&me, packet),
            None => trace!(channel = self.id, "no handler bound, packet dropped"),
        }
    }

    fn deliver_query(&self, packet: Packet) -> Task<Packet> {
        match self.handler() {
            Some((me, handler)) => handler.handle_query(&me, packet),
            None => Task::completed(Packet::empty()),
        }
    }

    fn closed(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some((me, handler)) = self.handler() {
            handler.channel_closed(&me);
        }
        true
    }
}

impl Channel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn send(&self, packet: Packet) {
        if !self.is_open() {
            trace!(channel = self.id, "send on closed channel");
            return;
        }
        if let Some(peer) = self.peer() {
            peer.deliver(packet);
        }
    }

    fn send_sync(&self, packet: Packet) {
        self.send(packet);
    }

    fn send_query(&self, packet: Packet) -> Task<Packet> {
        let peer = self.peer().filter(|_| self.is_open());
        match peer {
            Some(peer) => peer.deliver_query(packet),
            None => {
                let task = Task::new();
                task.fail(anyhow!("channel {} is closed", self.id));
                task
            }
        }
    }

    fn close(&self) {
        self.closed();
        if let Some(peer) = self.peer() {
            peer.closed();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
