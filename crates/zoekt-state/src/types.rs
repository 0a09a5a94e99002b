//! Domain types for the Zoekt state store.
//!
//! These types represent the persisted state of search nodes, enabled
//! namespaces, replicas, indices, repositories and tasks. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a search node.
pub type NodeId = u64;

/// Unique identifier for an enabled namespace record.
pub type EnabledNamespaceId = u64;

/// Identifier of a tenant's root namespace in the product domain.
pub type NamespaceId = u64;

/// Identifier of a project in the product domain.
pub type ProjectId = u64;

pub type ReplicaId = u64;
pub type IndexId = u64;
pub type RepositoryId = u64;
pub type TaskId = u64;

// ── Node ──────────────────────────────────────────────────────────

/// A physical host running the search-index server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    /// Total storage capacity (bytes).
    pub total_bytes: i64,
    /// Index format the node currently writes. Repositories indexed with a
    /// different version need a reindex.
    pub schema_version: u32,
    /// Unix timestamp of last heartbeat.
    pub last_seen_at: u64,
}

/// Aggregate storage bookkeeping for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStorage {
    pub node_id: NodeId,
    pub total_bytes: i64,
    /// Sum of `reserved_storage_bytes` across the node's indices.
    pub reserved_bytes: i64,
    /// Sum of `used_storage_bytes` across the node's indices.
    pub used_bytes: i64,
}

impl NodeStorage {
    /// Capacity not yet promised to any index. Negative when the node is
    /// over-committed.
    pub fn unclaimed_bytes(&self) -> i64 {
        self.total_bytes - self.reserved_bytes
    }
}

// ── Enabled namespace ─────────────────────────────────────────────

/// A tenant opted into search indexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnabledNamespace {
    pub id: EnabledNamespaceId,
    pub root_namespace_id: NamespaceId,
    /// Desired replica count; `None` falls back to the global default.
    pub number_of_replicas_override: Option<u32>,
    pub created_at: u64,
}

impl EnabledNamespace {
    pub fn desired_replicas(&self, default_count: u32) -> u32 {
        self.number_of_replicas_override.unwrap_or(default_count)
    }
}

// ── Replica ───────────────────────────────────────────────────────

/// Lifecycle of a replica. Declaration order is maturity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Pending,
    Ready,
}

/// A redundant copy of a namespace's indexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub id: ReplicaId,
    pub enabled_namespace_id: EnabledNamespaceId,
    pub root_namespace_id: NamespaceId,
    pub state: ReplicaState,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Index ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Pending,
    Initializing,
    Ready,
    Orphaned,
    PendingDeletion,
}

impl IndexState {
    /// States whose indices are on their way out.
    pub fn should_be_deleted(self) -> bool {
        matches!(self, IndexState::Orphaned | IndexState::PendingDeletion)
    }
}

/// Storage-pressure classification of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkLevel {
    Healthy,
    Overprovisioned,
    LowWatermarkExceeded,
    HighWatermarkExceeded,
    CriticalWatermarkExceeded,
}

impl WatermarkLevel {
    pub const ALL: [WatermarkLevel; 5] = [
        WatermarkLevel::Healthy,
        WatermarkLevel::Overprovisioned,
        WatermarkLevel::LowWatermarkExceeded,
        WatermarkLevel::HighWatermarkExceeded,
        WatermarkLevel::CriticalWatermarkExceeded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WatermarkLevel::Healthy => "healthy",
            WatermarkLevel::Overprovisioned => "overprovisioned",
            WatermarkLevel::LowWatermarkExceeded => "low_watermark_exceeded",
            WatermarkLevel::HighWatermarkExceeded => "high_watermark_exceeded",
            WatermarkLevel::CriticalWatermarkExceeded => "critical_watermark_exceeded",
        }
    }

    /// Look up a level by its wire symbol. Unknown symbols yield `None`.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == symbol)
    }
}

impl std::fmt::Display for WatermarkLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-namespace index placed on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Index {
    pub id: IndexId,
    pub enabled_namespace_id: EnabledNamespaceId,
    pub root_namespace_id: NamespaceId,
    /// Owning replica; cleared when the replica is deleted.
    pub replica_id: Option<ReplicaId>,
    pub node_id: NodeId,
    pub state: IndexState,
    pub watermark_level: WatermarkLevel,
    /// Capacity allocated to this index on its node. Can drift negative.
    pub reserved_storage_bytes: i64,
    /// Observed consumption, refreshed from task completions.
    pub used_storage_bytes: i64,
    /// Optimistic concurrency token, bumped on every update.
    pub lock_version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Fields needed to place a new index.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIndex {
    pub enabled_namespace_id: EnabledNamespaceId,
    pub root_namespace_id: NamespaceId,
    pub replica_id: ReplicaId,
    pub node_id: NodeId,
    pub reserved_storage_bytes: i64,
}

// ── Repository ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    Pending,
    Ready,
    Failed,
    Orphaned,
    PendingDeletion,
}

impl RepositoryState {
    pub fn should_be_deleted(self) -> bool {
        matches!(
            self,
            RepositoryState::Orphaned | RepositoryState::PendingDeletion
        )
    }
}

/// Indexed content of one project inside an index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: RepositoryId,
    pub index_id: IndexId,
    pub project_id: ProjectId,
    pub state: RepositoryState,
    pub size_bytes: i64,
    /// Schema version the content was last indexed with (0 = never).
    pub schema_version: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IndexRepo,
    ForceIndexRepo,
    DeleteRepo,
}

impl TaskType {
    /// Index and force-index tasks share one in-flight slot per repository.
    pub fn is_indexing(self) -> bool {
        matches!(self, TaskType::IndexRepo | TaskType::ForceIndexRepo)
    }

    /// Whether two task types compete for the same in-flight slot.
    pub fn same_nature(self, other: TaskType) -> bool {
        self.is_indexing() == other.is_indexing()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Processing)
    }
}

/// A unit of work dispatched to a node for one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub node_id: NodeId,
    pub index_id: IndexId,
    pub repository_id: RepositoryId,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub retries_left: u32,
    /// Last error reported by the node.
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Fields needed to enqueue a task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub node_id: NodeId,
    pub index_id: IndexId,
    pub repository_id: RepositoryId,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_symbols_round_trip_through_lookup() {
        for level in WatermarkLevel::ALL {
            assert_eq!(WatermarkLevel::from_symbol(level.as_str()), Some(level));
        }
        assert_eq!(WatermarkLevel::from_symbol("medium_watermark"), None);
    }

    #[test]
    fn watermark_serde_matches_symbol() {
        let json = serde_json::to_string(&WatermarkLevel::HighWatermarkExceeded).unwrap();
        assert_eq!(json, "\"high_watermark_exceeded\"");
    }

    #[test]
    fn replica_states_order_by_maturity() {
        assert!(ReplicaState::Pending < ReplicaState::Ready);
    }

    #[test]
    fn task_nature() {
        assert!(TaskType::IndexRepo.same_nature(TaskType::ForceIndexRepo));
        assert!(!TaskType::IndexRepo.same_nature(TaskType::DeleteRepo));
        assert!(TaskType::DeleteRepo.same_nature(TaskType::DeleteRepo));
    }

    #[test]
    fn node_unclaimed_can_go_negative() {
        let storage = NodeStorage {
            node_id: 1,
            total_bytes: 100,
            reserved_bytes: 110,
            used_bytes: 50,
        };
        assert_eq!(storage.unclaimed_bytes(), -10);
    }

    #[test]
    fn desired_replicas_falls_back_to_default() {
        let mut ns = EnabledNamespace {
            id: 1,
            root_namespace_id: 9,
            number_of_replicas_override: None,
            created_at: 0,
        };
        assert_eq!(ns.desired_replicas(1), 1);
        ns.number_of_replicas_override = Some(3);
        assert_eq!(ns.desired_replicas(1), 3);
    }
}
