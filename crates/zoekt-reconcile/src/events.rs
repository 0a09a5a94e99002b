//! The closed set of reconciliation events.
//!
//! Every event maps to exactly one handler in [`Reconciler::handle`]. Events
//! are plain data and serialize as `{"type": "<snake_case_name>", ...}`.
//!
//! [`Reconciler::handle`]: crate::Reconciler::handle

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use zoekt_state::{IndexId, NamespaceId, NodeId, ProjectId, RepositoryId, TaskId};

/// Project attributes whose change requires the project to be force
/// reindexed.
pub const REINDEX_FEATURES: [&str; 3] = ["archived", "visibility_level", "repository_access_level"];

/// Delivery contract of an event on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every publication is delivered.
    AtLeastOnce,
    /// At most one copy queued and at most one rerun pending while running.
    UntilExecuted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Storage
    AdjustReservedStorage,
    IndexWatermarkChanged,
    IndexOverWatermark {
        index_ids: Vec<IndexId>,
        watermark: String,
    },
    NodeWithNegativeUnclaimedStorage {
        node_ids: Vec<NodeId>,
    },
    IndexToEvict {
        #[serde(default)]
        index_ids: Vec<IndexId>,
    },

    // Replicas
    TooManyReplicas,
    MissingReplicas,
    NamespaceOffboarded {
        root_namespace_id: NamespaceId,
    },

    // Lifecycle
    OrphanedIndex {
        index_ids: Vec<IndexId>,
    },
    OrphanedRepo {
        repository_ids: Vec<RepositoryId>,
    },
    IndexMarkedAsToDelete,
    RepoMarkedAsToDelete,
    MarkIndicesReady,

    // Indexing
    RepoToIndex,
    RepoToReindex {
        #[serde(default)]
        zoekt_node_id: Option<NodeId>,
    },
    InitialIndexing {
        index_id: IndexId,
    },
    ProjectArchived {
        project_id: ProjectId,
        namespace_id: NamespaceId,
        root_namespace_id: NamespaceId,
    },
    ProjectVisibilityChanged {
        project_id: ProjectId,
        namespace_id: NamespaceId,
        root_namespace_id: NamespaceId,
    },
    ProjectFeaturesChanged {
        project_id: ProjectId,
        namespace_id: NamespaceId,
        root_namespace_id: NamespaceId,
        features: Vec<String>,
    },
    GroupArchived {
        group_id: NamespaceId,
        root_namespace_id: NamespaceId,
    },
    GroupVisibilityChanged {
        group_id: NamespaceId,
        root_namespace_id: NamespaceId,
    },
    TaskSucceeded {
        repository_id: RepositoryId,
        task_id: TaskId,
    },

    // Rollout
    SaasRollout,
}

impl Event {
    /// Stable snake_case name, identical to the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Event::AdjustReservedStorage => "adjust_reserved_storage",
            Event::IndexWatermarkChanged => "index_watermark_changed",
            Event::IndexOverWatermark { .. } => "index_over_watermark",
            Event::NodeWithNegativeUnclaimedStorage { .. } => {
                "node_with_negative_unclaimed_storage"
            }
            Event::IndexToEvict { .. } => "index_to_evict",
            Event::TooManyReplicas => "too_many_replicas",
            Event::MissingReplicas => "missing_replicas",
            Event::NamespaceOffboarded { .. } => "namespace_offboarded",
            Event::OrphanedIndex { .. } => "orphaned_index",
            Event::OrphanedRepo { .. } => "orphaned_repo",
            Event::IndexMarkedAsToDelete => "index_marked_as_to_delete",
            Event::RepoMarkedAsToDelete => "repo_marked_as_to_delete",
            Event::MarkIndicesReady => "mark_indices_ready",
            Event::RepoToIndex => "repo_to_index",
            Event::RepoToReindex { .. } => "repo_to_reindex",
            Event::InitialIndexing { .. } => "initial_indexing",
            Event::ProjectArchived { .. } => "project_archived",
            Event::ProjectVisibilityChanged { .. } => "project_visibility_changed",
            Event::ProjectFeaturesChanged { .. } => "project_features_changed",
            Event::GroupArchived { .. } => "group_archived",
            Event::GroupVisibilityChanged { .. } => "group_visibility_changed",
            Event::TaskSucceeded { .. } => "task_succeeded",
            Event::SaasRollout => "saas_rollout",
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Event::AdjustReservedStorage | Event::IndexToEvict { .. } => Delivery::UntilExecuted,
            _ => Delivery::AtLeastOnce,
        }
    }

    /// Fold a later publication of the same deduplicated event into this
    /// one. Eviction requests union their index ids.
    pub fn absorb(&mut self, later: Event) {
        if let (Event::IndexToEvict { index_ids }, Event::IndexToEvict { index_ids: more }) =
            (self, later)
        {
            let merged: BTreeSet<IndexId> = index_ids.drain(..).chain(more).collect();
            index_ids.extend(merged);
        }
    }
}

/// Events the worker publishes on every scheduling tick.
pub fn periodic_events() -> Vec<Event> {
    vec![
        Event::IndexWatermarkChanged,
        Event::AdjustReservedStorage,
        Event::TooManyReplicas,
        Event::MissingReplicas,
        Event::IndexToEvict { index_ids: vec![] },
        Event::IndexMarkedAsToDelete,
        Event::RepoMarkedAsToDelete,
        Event::RepoToIndex,
        Event::RepoToReindex {
            zoekt_node_id: None,
        },
        Event::MarkIndicesReady,
        Event::SaasRollout,
    ]
}
