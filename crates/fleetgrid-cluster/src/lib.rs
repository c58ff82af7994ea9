//! fleetgrid-cluster — cluster coordination and cross-node messaging for
//! FleetGrid.
//!
//! Tracks which nodes make up the cluster, detects dead peers through
//! heartbeat snapshots, derives an advisory head node, and routes channel
//! messages to nodes and services with fan-out sends and fan-in queries.
//!
//! # Architecture
//!
//! ```text
//! NodeServerProvider
//!   ├── LocalNodeServer      (this process, publishes snapshots)
//!   ├── RemoteNodeServer*    (one per peer, bound channel + snapshots)
//!   ├── tick (every 1s)
//!   │   ├── check_for_dead_nodes → close idle peers
//!   │   └── publish local snapshot → update_node_info_snapshot
//!   └── select_head_node     (oldest available node)
//!
//! Messenger
//!   ├── find_channels        (targets → deduplicated live channels)
//!   ├── send                 (fan-out, one body reference per channel)
//!   └── send_query           (fan-in over a CountingTask)
//!
//! ClusterMessageListener     (inbound packets → internal dispatch or
//!                             re-delivery to local services)
//! NodeDisconnectHandler      (peer loss → invalidate its services)
//! ```

pub mod buffer;
pub mod channel;
pub mod config;
pub mod disconnect;
pub mod error;
pub mod listener;
pub mod local;
pub mod memory;
pub mod message;
pub mod messenger;
pub mod node;
pub mod packet;
pub mod provider;
pub mod remote;
pub mod services;
pub mod snapshot;
pub mod sync;

pub use buffer::{MessageBuffer, SharedBuffer};
pub use channel::{Channel, ChannelIdSequence, ChannelRef, ChannelSet};
pub use config::ClusterConfig;
pub use disconnect::NodeDisconnectHandler;
pub use error::{ClusterError, ClusterResult};
pub use listener::{ChannelMessageHandler, ClusterMessageListener};
pub use local::LocalNodeServer;
pub use memory::{MemoryChannel, PacketHandler};
pub use message::{ChannelMessage, ChannelMessageBuilder, ChannelMessageTarget, INTERNAL_CHANNEL};
pub use messenger::Messenger;
pub use node::{CommandExecutor, NodeServer};
pub use packet::Packet;
pub use provider::{HeadCandidate, NodeServerProvider, ProviderBuilder, elect_head};
pub use remote::RemoteNodeServer;
pub use services::{
    LocalService, ServiceConfiguration, ServiceDirectory, ServiceFactory, ServiceInfo,
    ServiceLifecycle, ServiceRegistry,
};
pub use snapshot::{NodeSnapshot, SnapshotConfigurer, SnapshotPair};
pub use sync::{DataSyncHandler, DataSyncRegistry, SyncEntry, SyncPayload};

#[cfg(test)]
pub(crate) mod testing;
