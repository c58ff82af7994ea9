//! Error types for cluster coordination.

use thiserror::Error;

use fleetgrid_state::StateError;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur while coordinating the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("malformed message content: {0}")]
    Content(String),

    #[error("invalid listener address: {0}")]
    Listener(String),

    #[error("node '{0}' is the local node")]
    LocalNode(String),
}
