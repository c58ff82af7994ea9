//! Target resolution, fan-out sends and fan-in queries.
//!
//! ```text
//! send(message)
//!   targets ──► resolve ──► dedup by channel id ──► one packet per channel
//!                                                   (one body reference each)
//!   caller's body reference released after the loop
//!
//! send_query(message)
//!   channels ──► CountingTask(results, n) ──► n query packets
//!   each response: merge messages if readable, count down always
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use fleetgrid_task::{CountingTask, Task, TaskEvent};

use crate::channel::{ChannelRef, ChannelSet};
use crate::config::DEFAULT_QUERY_TIMEOUT_MS;
use crate::message::{ChannelMessage, ChannelMessageTarget};
use crate::node::NodeServer;
use crate::packet::Packet;
use crate::provider::NodeServerProvider;
use crate::services::{ServiceInfo, ServiceRegistry};

type QueryResults = Arc<Mutex<Vec<ChannelMessage>>>;

pub struct Messenger {
    provider: Arc<NodeServerProvider>,
    services: Arc<dyn ServiceRegistry>,
    query_timeout: Duration,
}

impl Messenger {
    /// Messenger over the membership and service registry of `provider`.
    pub fn new(provider: Arc<NodeServerProvider>) -> Self {
        let services = provider.services();
        Self {
            provider,
            services,
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
        }
    }

    /// Bound used by [`Messenger::send_query_blocking`].
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// The provider whose membership drives resolution.
    pub fn provider(&self) -> &Arc<NodeServerProvider> {
        &self.provider
    }

    /// Current bound for blocking queries.
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    // ── Sending ────────────────────────────────────────────────────

    /// Send to every channel the targets resolve to, crossing nodes.
    pub fn send(&self, message: ChannelMessage) {
        self.send_with(message, true);
    }

    /// Send, optionally keeping the message on this node. Without
    /// redirect no peer channel is ever chosen.
    pub fn send_with(&self, message: ChannelMessage, allow_redirect: bool) {
        let channels = self.find_channels(message.targets(), allow_redirect);
        trace!(message = message.message(), channels = channels.len(), "sending channel message");
        fan_out(message, &channels);
    }

    /// Query every resolved channel and collect the answers.
    pub fn send_query(&self, message: ChannelMessage) -> Task<Vec<ChannelMessage>> {
        self.send_query_with(message, true)
    }

    /// Like [`Messenger::send_query`], optionally kept on this node.
    pub fn send_query_with(
        &self,
        message: ChannelMessage,
        allow_redirect: bool,
    ) -> Task<Vec<ChannelMessage>> {
        let channels = self.find_channels(message.targets(), allow_redirect);
        fan_in(message, &channels)
    }

    /// Query and wait up to the configured timeout. Never fails.
    pub fn send_query_blocking(&self, message: ChannelMessage) -> Vec<ChannelMessage> {
        self.send_query(message)
            .get_or_default_timeout(Vec::new(), self.query_timeout)
    }

    // ── Resolution ─────────────────────────────────────────────────

    /// Resolve targets into live channels, each channel at most once.
    pub fn find_channels(
        &self,
        targets: &[ChannelMessageTarget],
        allow_redirect: bool,
    ) -> Vec<ChannelRef> {
        let mut channels = ChannelSet::new();
        for target in targets {
            self.resolve(target, allow_redirect, &mut channels);
        }
        channels.into_vec()
    }

    fn resolve(&self, target: &ChannelMessageTarget, allow_redirect: bool, out: &mut ChannelSet) {
        match target {
            ChannelMessageTarget::All | ChannelMessageTarget::Service(None) => {
                out.extend(self.local_service_channels());
                if allow_redirect {
                    out.extend(self.provider.connected_node_channels());
                }
            }
            ChannelMessageTarget::Node(None) => {
                if allow_redirect {
                    out.extend(self.provider.connected_node_channels());
                }
            }
            ChannelMessageTarget::Node(Some(name)) => {
                if allow_redirect {
                    out.extend(self.provider.node(name).and_then(|node| node.channel()));
                }
            }
            ChannelMessageTarget::Service(Some(name)) => {
                out.extend(self.service_channel(name, allow_redirect));
            }
            ChannelMessageTarget::Task(task) => {
                self.resolve_services(self.services.services_by_task(task), allow_redirect, out);
            }
            ChannelMessageTarget::Group(group) => {
                self.resolve_services(self.services.services_by_group(group), allow_redirect, out);
            }
            ChannelMessageTarget::Environment(environment) => {
                let matching = self.services.services_by_environment(environment);
                self.resolve_services(matching, allow_redirect, out);
            }
        }
    }

    fn resolve_services(&self, services: Vec<ServiceInfo>, allow_redirect: bool, out: &mut ChannelSet) {
        for service in services {
            out.extend(self.service_channel(&service.name, allow_redirect));
        }
    }

    fn service_channel(&self, name: &str, allow_redirect: bool) -> Option<ChannelRef> {
        if let Some(local) = self.services.local_service(name) {
            return local.channel;
        }
        if !allow_redirect {
            return None;
        }
        let service = self.services.service(name)?;
        self.provider.node(&service.node)?.channel()
    }

    fn local_service_channels(&self) -> Vec<ChannelRef> {
        self.services
            .local_services()
            .into_iter()
            .filter_map(|service| service.channel)
            .collect()
    }
}

// ── Fan-out / fan-in ───────────────────────────────────────────────

/// Send `message` on every channel, then release the caller's reference.
pub(crate) fn fan_out(message: ChannelMessage, channels: &[ChannelRef]) {
    if !channels.is_empty() {
        match message.encode() {
            Ok(payload) => {
                for channel in channels {
                    message.content().acquire();
                    let packet = Packet::channel_message(payload.clone())
                        .retaining(Arc::clone(message.content()));
                    if message.send_sync() {
                        channel.send_sync(packet);
                    } else {
                        channel.send(packet);
                    }
                }
            }
            Err(err) => error!(%err, message = message.message(), "failed to encode channel message"),
        }
    }
    message.content().release();
}

/// Query every channel and collect the answers.
///
/// Completes once every channel has answered, failed or been cancelled.
/// Failed channels contribute nothing.
pub(crate) fn fan_in(message: ChannelMessage, channels: &[ChannelRef]) -> Task<Vec<ChannelMessage>> {
    if channels.is_empty() {
        message.content().release();
        return Task::completed(Vec::new());
    }
    let payload = match message.encode() {
        Ok(payload) => payload,
        Err(err) => {
            error!(%err, message = message.message(), "failed to encode channel query");
            message.content().release();
            return Task::completed(Vec::new());
        }
    };

    let results: QueryResults = Arc::new(Mutex::new(Vec::new()));
    let join = CountingTask::new(results, channels.len());
    for channel in channels {
        message.content().acquire();
        let packet = Packet::channel_message(payload.clone()).retaining(Arc::clone(message.content()));
        let join = join.clone();
        let channel_id = channel.id();
        channel.send_query(packet).when_done(move |event| {
            match event {
                TaskEvent::Completed(response) if response.is_readable() => {
                    match response.decode_messages() {
                        Ok(messages) => join.result().lock().extend(messages),
                        Err(err) => debug!(%err, channel = channel_id, "unreadable query response"),
                    }
                }
                TaskEvent::Completed(_) => {}
                TaskEvent::Cancelled => debug!(channel = channel_id, "query cancelled"),
                TaskEvent::Failed(err) => debug!(%err, channel = channel_id, "query failed"),
            }
            join.count_down();
        });
    }
    message.content().release();

    join.task().map(|results| std::mem::take(&mut *results.lock()))
}
