//! redb table definitions for the FleetGrid state store.

use redb::TableDefinition;

/// Known cluster peers keyed by `{unique_id}`.
pub const CLUSTER_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_nodes");

/// Single-row facts about this process keyed by a fixed name.
pub const LOCAL: TableDefinition<&str, &[u8]> = TableDefinition::new("local");

/// Key of the local node identity in [`LOCAL`].
pub const LOCAL_IDENTITY_KEY: &str = "identity";
