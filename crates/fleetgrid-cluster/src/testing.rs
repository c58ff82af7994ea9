//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::Mutex;

use fleetgrid_state::{HostAndPort, NodeIdentity, StateStore};
use fleetgrid_task::Task;

use crate::buffer::MessageBuffer;
use crate::channel::{Channel, ChannelRef};
use crate::message::ChannelMessage;
use crate::packet::Packet;
use crate::provider::NodeServerProvider;
use crate::services::ServiceDirectory;

pub enum QueryBehavior {
    Respond(Vec<ChannelMessage>),
    Fail,
    /// Keep the query pending until the test completes it.
    Silent,
}

/// Channel recording what is sent over it.
pub struct RecordingChannel {
    id: u64,
    address: String,
    open: AtomicBool,
    pub sent: Mutex<Vec<ChannelMessage>>,
    pub sync_sends: AtomicUsize,
    pub query: Mutex<QueryBehavior>,
    pub pending: Mutex<Vec<Task<Packet>>>,
}

impl RecordingChannel {
    pub fn new(id: u64, address: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            address: address.to_string(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            sync_sends: AtomicUsize::new(0),
            query: Mutex::new(QueryBehavior::Respond(Vec::new())),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn respond_with(&self, messages: Vec<ChannelMessage>) {
        *self.query.lock() = QueryBehavior::Respond(messages);
    }

    pub fn set_query(&self, behavior: QueryBehavior) {
        *self.query.lock() = behavior;
    }

    pub fn sent_ids(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.message().to_string()).collect()
    }

    fn record(&self, packet: &Packet) {
        if let Ok(message) = packet.decode_message() {
            self.sent.lock().push(message);
        }
    }
}

impl Channel for RecordingChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn send(&self, packet: Packet) {
        self.record(&packet);
    }

    fn send_sync(&self, packet: Packet) {
        self.sync_sends.fetch_add(1, Ordering::SeqCst);
        self.record(&packet);
    }

    fn send_query(&self, packet: Packet) -> Task<Packet> {
        self.record(&packet);
        match &*self.query.lock() {
            QueryBehavior::Respond(messages) => match Packet::query_response(messages) {
                Ok(response) => Task::completed(response),
                Err(_) => Task::completed(Packet::empty()),
            },
            QueryBehavior::Fail => {
                let task = Task::new();
                task.fail(anyhow!("peer unreachable"));
                task
            }
            QueryBehavior::Silent => {
                let task = Task::new();
                self.pending.lock().push(task.clone());
                task
            }
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub fn channel_ref(channel: &Arc<RecordingChannel>) -> ChannelRef {
    channel.clone()
}

/// Buffer counting every acquire and release.
#[derive(Debug, Default)]
pub struct CountingBuffer {
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
}

impl MessageBuffer for CountingBuffer {
    fn acquire(&self) {
        self.acquires.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) -> bool {
        let released = self.releases.fetch_add(1, Ordering::SeqCst) + 1;
        released == self.acquires.load(Ordering::SeqCst)
    }

    fn content(&self) -> Bytes {
        Bytes::from_static(b"{}")
    }

    fn ref_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst) - self.releases.load(Ordering::SeqCst)
    }
}

pub fn identity(name: &str) -> NodeIdentity {
    NodeIdentity::new(name, vec![HostAndPort::new("127.0.0.1", 1410)])
}

/// A provider for `name` over an in-memory store.
pub fn provider(name: &str, startup_time: u64) -> (Arc<NodeServerProvider>, Arc<ServiceDirectory>) {
    let services = Arc::new(ServiceDirectory::new(name));
    let provider = NodeServerProvider::builder(
        identity(name),
        StateStore::open_in_memory().unwrap(),
        services.clone(),
    )
    .with_startup_time(startup_time)
    .build()
    .unwrap();
    (provider, services)
}
