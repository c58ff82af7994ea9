//! Error types for task retrieval.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Opaque failure payload carried by a failed task.
///
/// Shared so that every failure listener (including late ones) can
/// observe the same error.
pub type TaskFailure = Arc<anyhow::Error>;

/// Result type alias for blocking task retrieval.
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors returned by the blocking getters of a task.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out after {0:?} waiting for task")]
    Timeout(Duration),

    #[error("task failed: {0}")]
    Failed(TaskFailure),
}
