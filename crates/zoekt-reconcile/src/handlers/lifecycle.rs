//! Index and repository lifecycle: orphaning, deletion and readiness.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};
use zoekt_state::{
    Index, IndexId, IndexState, ReplicaState, Repository, RepositoryId, RepositoryState, TaskType,
};

use super::Reconciler;
use crate::error::ReconcileResult;
use crate::report::{BatchReport, Outcome, RecordRef};

impl Reconciler {
    fn repositories_by_index(&self) -> ReconcileResult<HashMap<IndexId, Vec<Repository>>> {
        let mut grouped: HashMap<IndexId, Vec<Repository>> = HashMap::new();
        for repo in self.state.list_repositories()? {
            grouped.entry(repo.index_id).or_default().push(repo);
        }
        Ok(grouped)
    }

    pub(crate) fn orphaned_index(&self, index_ids: &[IndexId]) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("orphaned_index");
        for &index_id in index_ids {
            let Some(index) = self.state.get_index(index_id)? else {
                report.skip();
                continue;
            };
            if index.state.should_be_deleted() {
                report.skip();
                continue;
            }
            let mut updated = index;
            updated.state = IndexState::Orphaned;
            report.record(RecordRef::Index(index_id), self.state.update_index(&updated));
        }
        Ok(Outcome::done(report))
    }

    pub(crate) fn orphaned_repo(&self, repository_ids: &[RepositoryId]) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("orphaned_repo");
        for &repository_id in repository_ids {
            let live = self
                .state
                .get_repository(repository_id)?
                .is_some_and(|r| !r.state.should_be_deleted());
            if !live {
                report.skip();
                continue;
            }
            report.record(
                RecordRef::Repository(repository_id),
                self.state
                    .set_repositories_state(&[repository_id], RepositoryState::Orphaned),
            );
        }
        Ok(Outcome::done(report))
    }

    /// Tear down indices marked for deletion.
    ///
    /// An empty index is destroyed. Otherwise its repositories are marked
    /// for deletion and the index waits for their delete tasks; indices that
    /// are only waiting do not take up room in the page.
    pub(crate) fn index_marked_as_to_delete(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("index_marked_as_to_delete");
        let mut repos = self.repositories_by_index()?;

        let batch: Vec<(Index, Vec<Repository>)> = self
            .state
            .list_indices()?
            .into_iter()
            .filter(|i| i.state.should_be_deleted())
            .filter_map(|index| {
                let owned = repos.remove(&index.id).unwrap_or_default();
                let actionable = owned.is_empty()
                    || owned
                        .iter()
                        .any(|r| r.state != RepositoryState::PendingDeletion);
                actionable.then_some((index, owned))
            })
            .take(self.config.batching.batch_size)
            .collect();

        let mut destroyed = 0;
        let mut marked = 0;
        for (index, owned) in batch {
            if owned.is_empty() {
                if let Some(true) =
                    report.record(RecordRef::Index(index.id), self.state.delete_index(index.id))
                {
                    destroyed += 1;
                }
                continue;
            }
            let ids: Vec<RepositoryId> = owned
                .iter()
                .filter(|r| r.state != RepositoryState::PendingDeletion)
                .map(|r| r.id)
                .collect();
            if let Some(changed) = report.record(
                RecordRef::Index(index.id),
                self.state
                    .set_repositories_state(&ids, RepositoryState::PendingDeletion),
            ) {
                marked += changed;
            }
        }
        if destroyed + marked > 0 {
            info!(
                indices_destroyed = destroyed,
                repositories_marked = marked,
                "indices torn down"
            );
        }
        Ok(Outcome::done(report))
    }

    /// Enqueue delete tasks for repositories marked for deletion.
    pub(crate) fn repo_marked_as_to_delete(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("repo_marked_as_to_delete");
        let in_flight = self.state.in_flight_by_repository()?;
        let indices: HashMap<IndexId, Index> = self
            .state
            .list_indices()?
            .into_iter()
            .map(|i| (i.id, i))
            .collect();

        let batch: Vec<Repository> = self
            .state
            .list_repositories()?
            .into_iter()
            .filter(|r| r.state.should_be_deleted())
            .filter(|r| {
                !in_flight
                    .get(&r.id)
                    .is_some_and(|types| types.contains(&TaskType::DeleteRepo))
            })
            .take(self.config.batching.batch_size)
            .collect();

        for repo in &batch {
            let Some(index) = indices.get(&repo.index_id) else {
                report.skip();
                continue;
            };
            self.enqueue_for(&mut report, index, repo, TaskType::DeleteRepo);
        }
        if report.processed > 0 {
            info!(tasks_created = report.processed, "delete tasks enqueued");
        }
        Ok(Outcome::done(report))
    }

    /// Promote initializing indices whose repositories have all been
    /// attempted, then promote replicas whose indices are all ready.
    pub(crate) fn mark_indices_ready(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("mark_indices_ready");
        let repos = self.repositories_by_index()?;
        let busy: HashSet<IndexId> = self
            .state
            .list_in_flight_tasks()?
            .into_iter()
            .filter(|t| t.task_type.is_indexing())
            .map(|t| t.index_id)
            .collect();

        let batch: Vec<Index> = self
            .state
            .list_indices()?
            .into_iter()
            .filter(|i| i.state == IndexState::Initializing && !busy.contains(&i.id))
            .filter(|i| {
                repos.get(&i.id).is_none_or(|owned| {
                    owned.iter().all(|r| r.state != RepositoryState::Pending)
                })
            })
            .take(self.config.batching.batch_size)
            .collect();

        let mut replicas = BTreeSet::new();
        for index in batch {
            let index_id = index.id;
            let mut updated = index;
            updated.state = IndexState::Ready;
            if let Some(ready) =
                report.record(RecordRef::Index(index_id), self.state.update_index(&updated))
                && let Some(replica_id) = ready.replica_id
            {
                replicas.insert(replica_id);
            }
        }

        for replica_id in replicas {
            let all_ready = self
                .state
                .list_indices_for_replica(replica_id)?
                .iter()
                .all(|i| i.state == IndexState::Ready);
            if !all_ready {
                continue;
            }
            report.record(
                RecordRef::Replica(replica_id),
                self.state.set_replica_state(replica_id, ReplicaState::Ready),
            );
            debug!(replica_id, "replica ready");
        }
        Ok(Outcome::done(report))
    }
}
