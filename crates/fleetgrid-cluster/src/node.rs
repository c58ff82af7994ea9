//! The node server contract shared by the local and remote variants.

use std::sync::Arc;

use fleetgrid_state::NodeIdentity;
use fleetgrid_task::Task;

use crate::channel::ChannelRef;
use crate::services::ServiceFactory;
use crate::snapshot::NodeSnapshot;

/// Runs a command line on the local node and returns its output lines.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command_line: &str) -> Vec<String>;
}

impl<F> CommandExecutor for F
where
    F: Fn(&str) -> Vec<String> + Send + Sync,
{
    fn execute(&self, command_line: &str) -> Vec<String> {
        self(command_line)
    }
}

/// One member of the cluster.
pub trait NodeServer: Send + Sync {
    fn identity(&self) -> NodeIdentity;

    fn name(&self) -> String {
        self.identity().unique_id
    }

    fn is_local(&self) -> bool;

    /// Whether the owning provider currently selects this node as head.
    fn is_head_node(&self) -> bool;

    fn is_available(&self) -> bool;

    fn is_draining(&self) -> bool;

    /// Stop or resume accepting new services.
    fn drain(&self, draining: bool);

    fn snapshot(&self) -> Option<Arc<NodeSnapshot>>;

    fn last_snapshot(&self) -> Option<Arc<NodeSnapshot>>;

    /// Publish `snapshot`, shifting the current one to previous.
    fn update_snapshot(&self, snapshot: NodeSnapshot);

    /// The bound channel. Always `None` for the local node.
    fn channel(&self) -> Option<ChannelRef>;

    fn run_command(&self, command_line: &str) -> Task<Vec<String>>;

    fn service_factory(&self) -> Arc<dyn ServiceFactory>;

    /// Ask the node process to stop.
    fn shutdown(&self);

    fn close(&self);
}
