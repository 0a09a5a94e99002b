//! redb table definitions for the Zoekt state store.
//!
//! Entity tables use `u64` keys (allocated from `SEQUENCES`) and `&[u8]`
//! values holding JSON-serialized domain types. Ids grow monotonically, so
//! a higher id always means a more recently created record.

use redb::TableDefinition;

/// Search nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

/// Enabled namespaces keyed by `{enabled_namespace_id}`.
pub const ENABLED_NAMESPACES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("enabled_namespaces");

/// Replicas keyed by `{replica_id}`.
pub const REPLICAS: TableDefinition<u64, &[u8]> = TableDefinition::new("replicas");

/// Indices keyed by `{index_id}`.
pub const INDICES: TableDefinition<u64, &[u8]> = TableDefinition::new("indices");

/// Repositories keyed by `{repository_id}`.
pub const REPOSITORIES: TableDefinition<u64, &[u8]> = TableDefinition::new("repositories");

/// Tasks keyed by `{task_id}`.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Last allocated id per entity table, keyed by table name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
