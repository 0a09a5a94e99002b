//! Event handlers.
//!
//! The [`Reconciler`] owns everything a handler needs and routes each
//! [`Event`] to exactly one handler. Handlers are split by concern:
//!
//! - `storage`: reservations, watermarks, over-committed nodes, eviction
//! - `replicas`: replica count convergence and namespace offboarding
//! - `lifecycle`: orphaning, deletion and readiness of indices/repositories
//! - `indexing`: task creation for indexing, reindexing and usage refresh
//! - `rollout`: subscription-driven onboarding
//!
//! Every handler is safe to run again with the same input. A handler only
//! fails as a whole for malformed input or an unreachable store or
//! directory; per-record failures land in its [`BatchReport`].
//!
//! [`BatchReport`]: crate::report::BatchReport

mod indexing;
mod lifecycle;
mod replicas;
mod rollout;
mod storage;

use std::sync::Arc;

use tracing::debug;
use zoekt_core::ZoektConfig;
use zoekt_state::StateStore;

use crate::directory::NamespaceDirectory;
use crate::error::ReconcileResult;
use crate::events::Event;
use crate::report::Outcome;

pub struct Reconciler {
    state: StateStore,
    config: Arc<ZoektConfig>,
    directory: Arc<dyn NamespaceDirectory>,
}

impl Reconciler {
    pub fn new(
        state: StateStore,
        config: Arc<ZoektConfig>,
        directory: Arc<dyn NamespaceDirectory>,
    ) -> Self {
        Self {
            state,
            config,
            directory,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn config(&self) -> &ZoektConfig {
        &self.config
    }

    /// Run the handler for `event`.
    pub fn handle(&self, event: &Event) -> ReconcileResult<Outcome> {
        debug!(event = event.name(), "handling event");
        match event {
            Event::AdjustReservedStorage => self.adjust_reserved_storage(),
            Event::IndexWatermarkChanged => self.index_watermark_changed(),
            Event::IndexOverWatermark {
                index_ids,
                watermark,
            } => self.index_over_watermark(index_ids, watermark),
            Event::NodeWithNegativeUnclaimedStorage { node_ids } => {
                self.node_with_negative_unclaimed_storage(node_ids)
            }
            Event::IndexToEvict { index_ids } => self.index_to_evict(index_ids),

            Event::TooManyReplicas => self.too_many_replicas(),
            Event::MissingReplicas => self.missing_replicas(),
            Event::NamespaceOffboarded { root_namespace_id } => {
                self.namespace_offboarded(*root_namespace_id)
            }

            Event::OrphanedIndex { index_ids } => self.orphaned_index(index_ids),
            Event::OrphanedRepo { repository_ids } => self.orphaned_repo(repository_ids),
            Event::IndexMarkedAsToDelete => self.index_marked_as_to_delete(),
            Event::RepoMarkedAsToDelete => self.repo_marked_as_to_delete(),
            Event::MarkIndicesReady => self.mark_indices_ready(),

            Event::RepoToIndex => self.repo_to_index(),
            Event::RepoToReindex { zoekt_node_id } => self.repo_to_reindex(*zoekt_node_id),
            Event::InitialIndexing { index_id } => self.initial_indexing(*index_id),
            Event::ProjectArchived {
                project_id,
                root_namespace_id,
                ..
            } => self.force_reindex_projects("project_archived", *root_namespace_id, &[*project_id]),
            Event::ProjectVisibilityChanged {
                project_id,
                root_namespace_id,
                ..
            } => self.force_reindex_projects(
                "project_visibility_changed",
                *root_namespace_id,
                &[*project_id],
            ),
            Event::ProjectFeaturesChanged {
                project_id,
                root_namespace_id,
                features,
                ..
            } => self.project_features_changed(*project_id, *root_namespace_id, features),
            Event::GroupArchived {
                group_id,
                root_namespace_id,
            } => self.group_changed("group_archived", *group_id, *root_namespace_id),
            Event::GroupVisibilityChanged {
                group_id,
                root_namespace_id,
            } => self.group_changed("group_visibility_changed", *group_id, *root_namespace_id),
            Event::TaskSucceeded {
                repository_id,
                task_id,
            } => self.update_index_used_bytes(*repository_id, *task_id),

            Event::SaasRollout => self.saas_rollout(),
        }
    }
}
