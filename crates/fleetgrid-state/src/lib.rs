//! fleetgrid-state — embedded cluster configuration store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), keeps the durable part of the
//! cluster view: the statically known peer nodes and the identity of the
//! local node. Everything else about membership (snapshots, availability,
//! head node) is derived at runtime and never persisted.
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns.
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
