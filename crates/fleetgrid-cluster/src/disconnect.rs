//! Peer-loss cleanup.
//!
//! When a peer goes away, the services it hosted are dropped from the
//! local view and the local services are told about it. The rest of the
//! cluster is not informed; each node cleans up its own view.

use std::sync::Arc;

use tracing::{error, info};

use crate::channel::ChannelRef;
use crate::message::{ChannelMessage, ChannelMessageTarget, ids};
use crate::messenger::fan_out;
use crate::services::{ServiceLifecycle, ServiceRegistry};

pub struct NodeDisconnectHandler {
    local_node: String,
    services: Arc<dyn ServiceRegistry>,
}

impl NodeDisconnectHandler {
    pub fn new(local_node: impl Into<String>, services: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            local_node: local_node.into(),
            services,
        }
    }

    /// Invalidate every service hosted by `node`. Returns how many.
    pub fn handle_node_close(&self, node: &str) -> usize {
        let owned = self.services.services_on_node(node);
        if owned.is_empty() {
            return 0;
        }

        let local_channels: Vec<ChannelRef> = self
            .services
            .local_services()
            .into_iter()
            .filter_map(|service| service.channel)
            .collect();

        let count = owned.len();
        for service in owned {
            let deleted = service.with_lifecycle(ServiceLifecycle::Deleted);
            self.services.update_service(deleted.clone());

            if local_channels.is_empty() {
                continue;
            }
            let message = match ChannelMessage::internal(ids::UPDATE_SERVICE_LIFECYCLE)
                .sender(&self.local_node)
                .target(ChannelMessageTarget::all_services())
                .json(&deleted)
            {
                Ok(builder) => builder.build(),
                Err(err) => {
                    error!(%err, service = %deleted.name, "failed to encode lifecycle update");
                    continue;
                }
            };
            fan_out(message, &local_channels);
        }

        info!(node = %node, services = count, "invalidated services of disconnected node");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::services::{ServiceDirectory, ServiceInfo};
    use crate::testing::*;

    fn directory() -> Arc<ServiceDirectory> {
        let services = Arc::new(ServiceDirectory::new("node-1"));
        services.update_service(ServiceInfo::new("lobby-2", "node-2", "lobby"));
        services.update_service(ServiceInfo::new("bedwars-2", "node-2", "bedwars"));
        services.update_service(ServiceInfo::new("lobby-3", "node-3", "lobby"));
        services
    }

    #[test]
    fn services_of_the_lost_node_are_deleted_locally() {
        let services = directory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        services.on_lifecycle_change(move |info| s.lock().push((info.name.clone(), info.lifecycle)));
        let handler = NodeDisconnectHandler::new("node-1", services.clone());

        assert_eq!(handler.handle_node_close("node-2"), 2);

        assert!(services.services_on_node("node-2").is_empty());
        assert!(services.service("lobby-3").is_some());
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, lifecycle)| *lifecycle == ServiceLifecycle::Deleted));
    }

    #[test]
    fn local_services_are_told_about_each_deletion() {
        let services = directory();
        let local = RecordingChannel::new(10, "lobby-1");
        services.register_local(ServiceInfo::new("lobby-1", "node-1", "lobby"), Some(channel_ref(&local)));
        let handler = NodeDisconnectHandler::new("node-1", services.clone());

        handler.handle_node_close("node-2");

        let sent = local.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.message() == ids::UPDATE_SERVICE_LIFECYCLE));
        assert_eq!(sent[0].targets(), [ChannelMessageTarget::all_services()]);
        let update: ServiceInfo = sent[0].json().unwrap();
        assert_eq!(update.node, "node-2");
        assert_eq!(update.lifecycle, ServiceLifecycle::Deleted);
    }

    #[test]
    fn nothing_happens_for_a_node_without_services() {
        let services = directory();
        let local = RecordingChannel::new(10, "lobby-1");
        services.register_local(ServiceInfo::new("lobby-1", "node-1", "lobby"), Some(channel_ref(&local)));
        let handler = NodeDisconnectHandler::new("node-1", services.clone());

        assert_eq!(handler.handle_node_close("node-9"), 0);
        assert!(local.sent.lock().is_empty());
        assert_eq!(services.services().len(), 4);
    }
}
