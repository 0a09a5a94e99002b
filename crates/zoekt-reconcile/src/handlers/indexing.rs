//! Indexing handlers: initial indexing, pending and outdated repositories,
//! and force reindexing after project or group changes.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};
use zoekt_state::{
    Index, IndexId, IndexState, NamespaceId, Node, NodeId, ProjectId, Repository, RepositoryId,
    RepositoryState, StateResult, TaskType,
};

use super::Reconciler;
use crate::error::ReconcileResult;
use crate::events::{Event, REINDEX_FEATURES};
use crate::report::{BatchReport, Outcome, RecordRef};
use crate::tasks::enqueue;

impl Reconciler {
    fn live_indices(&self) -> ReconcileResult<HashMap<IndexId, Index>> {
        Ok(self
            .state
            .list_indices()?
            .into_iter()
            .filter(|i| !i.state.should_be_deleted())
            .map(|i| (i.id, i))
            .collect())
    }

    pub(super) fn enqueue_for(
        &self,
        report: &mut BatchReport,
        index: &Index,
        repo: &Repository,
        task_type: TaskType,
    ) -> bool {
        let result = enqueue(
            &self.state,
            self.config.tasks.retries,
            index,
            repo,
            task_type,
        );
        match result {
            Ok(Some(_)) => {
                report.processed += 1;
                true
            }
            Ok(None) => {
                report.skip();
                false
            }
            Err(e) => {
                report.fail(RecordRef::Repository(repo.id), e);
                false
            }
        }
    }

    /// Enqueue index tasks for pending repositories with nothing in flight.
    pub(crate) fn repo_to_index(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("repo_to_index");
        let in_flight = self.state.in_flight_by_repository()?;
        let indices = self.live_indices()?;

        let candidates: Vec<Repository> = self
            .state
            .list_repositories()?
            .into_iter()
            .filter(|r| r.state == RepositoryState::Pending)
            .filter(|r| !in_flight.contains_key(&r.id) && indices.contains_key(&r.index_id))
            .collect();
        let total = candidates.len();
        let page = total.min(self.config.batching.batch_size);

        for repo in candidates.iter().take(page) {
            if let Some(index) = indices.get(&repo.index_id) {
                self.enqueue_for(&mut report, index, repo, TaskType::IndexRepo);
            }
        }
        if report.processed > 0 {
            info!(tasks_created = report.processed, remaining = total - page, "index tasks enqueued");
        }
        Ok(Outcome::done(report).reschedule_if(
            self.config.rescheduling.repo_to_index,
            total > page,
            Event::RepoToIndex,
        ))
    }

    /// Reindex repositories built with an older schema than their node
    /// writes, keeping in-flight indexing under the configured ceiling.
    pub(crate) fn repo_to_reindex(&self, zoekt_node_id: Option<NodeId>) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("repo_to_reindex");
        let nodes: HashMap<NodeId, Node> = match zoekt_node_id {
            Some(node_id) => match self.state.get_node(node_id)? {
                Some(node) => HashMap::from([(node_id, node)]),
                None => {
                    debug!(node_id, "reindex requested for unknown node");
                    report.skip();
                    return Ok(Outcome::done(report));
                }
            },
            None => self
                .state
                .list_nodes()?
                .into_iter()
                .map(|n| (n.id, n))
                .collect(),
        };

        // The ceiling is fleet-wide; the node scope only narrows candidates.
        let in_flight = self.state.list_in_flight_tasks()?;
        let indexing = in_flight
            .iter()
            .filter(|t| t.task_type.is_indexing())
            .count();
        let slots = self.config.batching.reindex_limit.saturating_sub(indexing);
        if slots == 0 {
            debug!(in_flight = indexing, "reindex ceiling reached");
            return Ok(Outcome::done(report));
        }
        let busy: HashSet<RepositoryId> = in_flight.iter().map(|t| t.repository_id).collect();

        let indices: HashMap<IndexId, Index> = self
            .live_indices()?
            .into_iter()
            .filter(|(_, i)| nodes.contains_key(&i.node_id))
            .collect();
        let outdated: Vec<(Repository, IndexId)> = self
            .state
            .list_repositories()?
            .into_iter()
            .filter(|r| r.state == RepositoryState::Ready && !busy.contains(&r.id))
            .filter_map(|r| {
                let index = indices.get(&r.index_id)?;
                let node = nodes.get(&index.node_id)?;
                (r.schema_version != node.schema_version).then_some((r, index.id))
            })
            .collect();
        let total = outdated.len();
        let page = total.min(slots);

        for (repo, index_id) in outdated.iter().take(page) {
            if let Some(index) = indices.get(index_id) {
                self.enqueue_for(&mut report, index, repo, TaskType::IndexRepo);
            }
        }
        if report.processed > 0 {
            info!(
                tasks_created = report.processed,
                in_flight = indexing,
                remaining = total - page,
                "reindex tasks enqueued"
            );
        }
        Ok(Outcome::done(report).reschedule_if(
            self.config.rescheduling.repo_to_reindex,
            total > page,
            Event::RepoToReindex { zoekt_node_id },
        ))
    }

    fn find_or_create_repository(
        &self,
        index_id: IndexId,
        project_id: ProjectId,
    ) -> StateResult<Repository> {
        if let Some(repo) = self.state.find_repository(index_id, project_id)? {
            return Ok(repo);
        }
        match self.state.create_repository(index_id, project_id) {
            Err(e) if e.is_conflict() => self
                .state
                .find_repository(index_id, project_id)?
                .ok_or(e),
            other => other,
        }
    }

    /// Populate a freshly placed index with one repository and index task
    /// per project of its namespace. Only pending indices are touched.
    pub(crate) fn initial_indexing(&self, index_id: IndexId) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("initial_indexing");
        let Some(index) = self.state.get_index(index_id)? else {
            debug!(index_id, "index gone before initial indexing");
            report.skip();
            return Ok(Outcome::done(report));
        };
        if index.state != IndexState::Pending {
            debug!(index_id, state = ?index.state, "index already initialized");
            report.skip();
            return Ok(Outcome::done(report));
        }

        let projects = self.directory.projects_for_namespace(index.root_namespace_id)?;
        let mut created = 0;
        for &project_id in &projects {
            let Some(repo) = report.record(
                RecordRef::Project(project_id),
                self.find_or_create_repository(index_id, project_id),
            ) else {
                continue;
            };
            if self.enqueue_for(&mut report, &index, &repo, TaskType::IndexRepo) {
                created += 1;
            }
        }

        let mut updated = index;
        updated.state = IndexState::Initializing;
        report.record(RecordRef::Index(index_id), self.state.update_index(&updated));
        info!(
            index_id,
            projects = projects.len(),
            tasks_created = created,
            "initial indexing started"
        );
        Ok(Outcome::done(report))
    }

    /// Force reindex the given projects in every live index of the
    /// namespace.
    pub(crate) fn force_reindex_projects(
        &self,
        handler: &'static str,
        root_namespace_id: NamespaceId,
        projects: &[ProjectId],
    ) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new(handler);
        let Some(ns) = self.state.find_enabled_namespace(root_namespace_id)? else {
            debug!(handler, root_namespace_id, "namespace not enabled");
            report.skip();
            return Ok(Outcome::done(report));
        };
        if !self.directory.is_namespace_enabled(root_namespace_id)? {
            debug!(handler, root_namespace_id, "search disabled for namespace");
            report.skip();
            return Ok(Outcome::done(report));
        }

        let wanted: HashSet<ProjectId> = projects.iter().copied().collect();
        for index in self.state.list_indices_for_namespace(ns.id)? {
            if index.state.should_be_deleted() {
                continue;
            }
            for repo in self.state.list_repositories_for_index(index.id)? {
                if wanted.contains(&repo.project_id) && !repo.state.should_be_deleted() {
                    self.enqueue_for(&mut report, &index, &repo, TaskType::ForceIndexRepo);
                }
            }
        }
        if report.processed > 0 {
            info!(
                handler,
                root_namespace_id,
                tasks_created = report.processed,
                "force reindex enqueued"
            );
        }
        Ok(Outcome::done(report))
    }

    pub(crate) fn project_features_changed(
        &self,
        project_id: ProjectId,
        root_namespace_id: NamespaceId,
        features: &[String],
    ) -> ReconcileResult<Outcome> {
        if !features
            .iter()
            .any(|f| REINDEX_FEATURES.contains(&f.as_str()))
        {
            debug!(project_id, ?features, "no search-relevant feature changed");
            let mut report = BatchReport::new("project_features_changed");
            report.skip();
            return Ok(Outcome::done(report));
        }
        self.force_reindex_projects("project_features_changed", root_namespace_id, &[project_id])
    }

    pub(crate) fn group_changed(
        &self,
        handler: &'static str,
        group_id: NamespaceId,
        root_namespace_id: NamespaceId,
    ) -> ReconcileResult<Outcome> {
        let projects = self.directory.projects_in_group(group_id)?;
        if projects.is_empty() {
            debug!(handler, group_id, "group has no projects");
            return Ok(Outcome::done(BatchReport::new(handler)));
        }
        self.force_reindex_projects(handler, root_namespace_id, &projects)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use crate::directory::{StaticDirectory, Subscription};
    use crate::events::Event;
    use crate::report::Continuation;
    use zoekt_core::ZoektConfig;
    use zoekt_state::{IndexState, Node, RepositoryState, TaskType};

    fn ready_repo(r: &crate::handlers::Reconciler, index_id: u64, project_id: u64, schema: u32) -> u64 {
        let mut repo = r.state().create_repository(index_id, project_id).unwrap();
        repo.state = RepositoryState::Ready;
        repo.schema_version = schema;
        r.state().put_repository(&repo).unwrap();
        repo.id
    }

    #[test]
    fn initial_indexing_creates_one_task_per_project() {
        let dir = StaticDirectory::new().with_tenant(1, Subscription::Active, &[10, 11, 12, 13, 14]);
        let r = reconciler(dir);
        let node = node(&r, 1_000);
        let ns = namespace(&r, 1);
        let (_, index) = placed(&r, &ns, &node, 100, 0);

        let outcome = r
            .handle(&Event::InitialIndexing { index_id: index.id })
            .unwrap();
        assert!(outcome.report.is_clean());
        assert_eq!(r.state().list_repositories_for_index(index.id).unwrap().len(), 5);
        let tasks = r.state().list_tasks().unwrap();
        assert_eq!(tasks.len(), 5);
        assert!(tasks.iter().all(|t| t.task_type == TaskType::IndexRepo));
        assert_eq!(
            r.state().get_index(index.id).unwrap().unwrap().state,
            IndexState::Initializing
        );

        let replay = r
            .handle(&Event::InitialIndexing { index_id: index.id })
            .unwrap();
        assert_eq!(replay.report.processed, 0);
        assert_eq!(r.state().list_tasks().unwrap().len(), 5);
    }

    #[test]
    fn repo_to_index_skips_in_flight() {
        let mut config = ZoektConfig::default();
        config.batching.batch_size = 2;
        config.rescheduling.repo_to_index = true;
        let r = reconciler_with(config, StaticDirectory::new());
        let node = node(&r, 1_000);
        let ns = namespace(&r, 1);
        let (_, index) = placed(&r, &ns, &node, 100, 0);
        for project in 1..=3 {
            r.state().create_repository(index.id, project).unwrap();
        }

        let first = r.handle(&Event::RepoToIndex).unwrap();
        assert_eq!(first.report.processed, 2);
        assert_eq!(first.continuation, Continuation::Reschedule(Event::RepoToIndex));
        let second = r.handle(&Event::RepoToIndex).unwrap();
        assert_eq!(second.report.processed, 1);
        assert_eq!(second.continuation, Continuation::Done);
        let third = r.handle(&Event::RepoToIndex).unwrap();
        assert_eq!(third.report.processed, 0);
        assert_eq!(r.state().list_tasks().unwrap().len(), 3);
    }

    #[test]
    fn reindex_respects_in_flight_ceiling() {
        let mut config = ZoektConfig::default();
        config.batching.reindex_limit = 3;
        let r = reconciler_with(config, StaticDirectory::new());
        let node = node(&r, 1_000);
        r.state()
            .put_node(&Node {
                schema_version: 2,
                ..node.clone()
            })
            .unwrap();
        let ns = namespace(&r, 1);
        let (_, index) = placed(&r, &ns, &node, 100, 0);
        for project in 1..=5 {
            ready_repo(&r, index.id, project, 1);
        }
        let current = ready_repo(&r, index.id, 6, 2);

        let first = r.handle(&Event::RepoToReindex { zoekt_node_id: None }).unwrap();
        assert_eq!(first.report.processed, 3);
        let second = r.handle(&Event::RepoToReindex { zoekt_node_id: None }).unwrap();
        assert_eq!(second.report.processed, 0);

        let tasks = r.state().list_tasks().unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.repository_id != current));
    }

    #[test]
    fn scoped_reindex_shares_the_fleet_ceiling() {
        let mut config = ZoektConfig::default();
        config.batching.reindex_limit = 3;
        let r = reconciler_with(config, StaticDirectory::new());
        let ns = namespace(&r, 1);
        let mut node_ids = Vec::new();
        for _ in 0..2 {
            let node = node(&r, 1_000);
            r.state()
                .put_node(&Node {
                    schema_version: 2,
                    ..node.clone()
                })
                .unwrap();
            let (_, index) = placed(&r, &ns, &node, 100, 0);
            for project in 1..=5 {
                ready_repo(&r, index.id, project, 1);
            }
            node_ids.push(node.id);
        }

        let first = r
            .handle(&Event::RepoToReindex {
                zoekt_node_id: Some(node_ids[0]),
            })
            .unwrap();
        assert_eq!(first.report.processed, 3);
        let second = r
            .handle(&Event::RepoToReindex {
                zoekt_node_id: Some(node_ids[1]),
            })
            .unwrap();
        assert_eq!(second.report.processed, 0);

        let in_flight = r.state().list_in_flight_tasks().unwrap();
        assert_eq!(in_flight.len(), 3);
        assert!(in_flight.iter().all(|t| t.node_id == node_ids[0]));
    }

    #[test]
    fn reindex_for_unknown_node_is_noop() {
        let r = reconciler(StaticDirectory::new());
        let outcome = r
            .handle(&Event::RepoToReindex {
                zoekt_node_id: Some(42),
            })
            .unwrap();
        assert_eq!(outcome.report.skipped, 1);
    }

    #[test]
    fn project_changes_force_reindex() {
        let dir = StaticDirectory::new()
            .with_tenant(1, Subscription::Active, &[10, 11])
            .with_group(5, &[11]);
        let r = reconciler(dir);
        let node = node(&r, 1_000);
        let ns = namespace(&r, 1);
        let (_, index) = placed(&r, &ns, &node, 100, 0);
        ready_repo(&r, index.id, 10, 1);
        let grouped = ready_repo(&r, index.id, 11, 1);

        let archived = r
            .handle(&Event::ProjectArchived {
                project_id: 10,
                namespace_id: 1,
                root_namespace_id: 1,
            })
            .unwrap();
        assert_eq!(archived.report.processed, 1);

        let group = r
            .handle(&Event::GroupVisibilityChanged {
                group_id: 5,
                root_namespace_id: 1,
            })
            .unwrap();
        assert_eq!(group.report.processed, 1);

        let tasks = r.state().list_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.task_type == TaskType::ForceIndexRepo));
        assert!(tasks.iter().any(|t| t.repository_id == grouped));
    }

    #[test]
    fn irrelevant_features_are_ignored() {
        let dir = StaticDirectory::new().with_tenant(1, Subscription::Active, &[10]);
        let r = reconciler(dir);
        let node = node(&r, 1_000);
        let ns = namespace(&r, 1);
        let (_, index) = placed(&r, &ns, &node, 100, 0);
        ready_repo(&r, index.id, 10, 1);

        let event = |features: &[&str]| Event::ProjectFeaturesChanged {
            project_id: 10,
            namespace_id: 1,
            root_namespace_id: 1,
            features: features.iter().map(|f| f.to_string()).collect(),
        };
        let ignored = r.handle(&event(&["wiki_access_level"])).unwrap();
        assert_eq!(ignored.report.processed, 0);
        let relevant = r.handle(&event(&["wiki_access_level", "visibility_level"])).unwrap();
        assert_eq!(relevant.report.processed, 1);
    }

    #[test]
    fn disabled_namespaces_are_not_reindexed() {
        let dir = StaticDirectory::new()
            .with_tenant(1, Subscription::Active, &[10])
            .disable_search(1);
        let r = reconciler(dir);
        let node = node(&r, 1_000);
        let ns = namespace(&r, 1);
        let (_, index) = placed(&r, &ns, &node, 100, 0);
        ready_repo(&r, index.id, 10, 1);

        let outcome = r
            .handle(&Event::ProjectVisibilityChanged {
                project_id: 10,
                namespace_id: 1,
                root_namespace_id: 1,
            })
            .unwrap();
        assert_eq!(outcome.report.processed, 0);
        assert!(r.state().list_tasks().unwrap().is_empty());
    }
}
