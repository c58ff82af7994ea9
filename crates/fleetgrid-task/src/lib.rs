//! fleetgrid-task — asynchronous result containers for FleetGrid.
//!
//! A [`Task`] is a shareable handle to a value that becomes available
//! later. Consumers either park the calling thread with [`Task::get`] /
//! [`Task::get_timeout`], or register listeners that fire exactly once
//! with the terminal outcome.
//!
//! A [`CountingTask`] is the fan-in variant: it completes with a shared,
//! pre-existing result container once a counter has been driven down to
//! zero by independent contributors.
//!
//! # Threading
//!
//! ```text
//! complete()/cancel() ──► listeners (registration order, completing thread)
//!                     └─► parked get() callers woken
//! late on_complete()  ──► replayed immediately on the registering thread
//! ```
//!
//! Code running on network I/O threads should use the listener API
//! instead of the blocking getters.

pub mod counting;
pub mod error;
pub mod task;

pub use counting::CountingTask;
pub use error::{TaskError, TaskFailure, TaskResult};
pub use task::{Task, TaskEvent, TaskState};
