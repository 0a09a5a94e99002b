//! Replica convergence: trimming surplus replicas, placing missing ones and
//! offboarding namespaces.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};
use zoekt_state::{
    EnabledNamespace, EnabledNamespaceId, IndexId, NamespaceId, NewIndex, NodeId, NodeStorage,
    Replica,
};

use super::Reconciler;
use crate::error::ReconcileResult;
use crate::events::Event;
use crate::report::{BatchReport, Outcome, RecordRef};

impl Reconciler {
    fn replicas_by_namespace(&self) -> ReconcileResult<HashMap<EnabledNamespaceId, Vec<Replica>>> {
        let mut grouped: HashMap<EnabledNamespaceId, Vec<Replica>> = HashMap::new();
        for replica in self.state.list_replicas()? {
            grouped
                .entry(replica.enabled_namespace_id)
                .or_default()
                .push(replica);
        }
        Ok(grouped)
    }

    /// Delete replicas beyond each namespace's desired count, least mature
    /// and newest first.
    pub(crate) fn too_many_replicas(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("too_many_replicas");
        let default_count = self.config.replicas.default_count;
        let mut grouped = self.replicas_by_namespace()?;

        let over: Vec<(EnabledNamespace, Vec<Replica>)> = self
            .state
            .list_enabled_namespaces()?
            .into_iter()
            .filter_map(|ns| {
                let replicas = grouped.remove(&ns.id)?;
                (replicas.len() > ns.desired_replicas(default_count) as usize)
                    .then_some((ns, replicas))
            })
            .collect();
        let total = over.len();
        let page = total.min(self.config.batching.batch_size);

        for (ns, mut replicas) in over.into_iter().take(page) {
            replicas.sort_by(|a, b| a.state.cmp(&b.state).then(b.id.cmp(&a.id)));
            let surplus = replicas.len() - ns.desired_replicas(default_count) as usize;
            for replica in replicas.iter().take(surplus) {
                match self.state.delete_replica(replica.id) {
                    Ok(true) => report.processed += 1,
                    Ok(false) => report.skip(),
                    Err(e) => report.fail(RecordRef::Replica(replica.id), e),
                }
            }
        }
        if page > 0 {
            info!(
                namespaces = page,
                replicas_destroyed = report.processed,
                remaining = total - page,
                "surplus replicas removed"
            );
        }
        Ok(Outcome::done(report).reschedule_if(
            self.config.rescheduling.too_many_replicas,
            total > page,
            Event::TooManyReplicas,
        ))
    }

    /// Place replicas for namespaces below their desired count.
    ///
    /// Each new replica gets one index on the node with the most unclaimed
    /// storage that does not already host the namespace and can fit the
    /// initial reservation.
    pub(crate) fn missing_replicas(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("missing_replicas");
        let default_count = self.config.replicas.default_count;
        let initial = self.config.replicas.initial_reserved_bytes;
        let grouped = self.replicas_by_namespace()?;

        let under: Vec<(EnabledNamespace, usize)> = self
            .state
            .list_enabled_namespaces()?
            .into_iter()
            .filter_map(|ns| {
                let actual = grouped.get(&ns.id).map_or(0, Vec::len);
                let desired = ns.desired_replicas(default_count) as usize;
                (actual < desired).then_some((ns, desired - actual))
            })
            .collect();
        let total = under.len();
        let page = total.min(self.config.batching.batch_size);
        if page == 0 {
            return Ok(Outcome::done(report));
        }

        let mut storages: Vec<NodeStorage> = Vec::new();
        for node in self.state.list_nodes()? {
            if let Some(storage) = self.state.node_storage(node.id)? {
                storages.push(storage);
            }
        }

        let mut emitted = Vec::new();
        for (ns, missing) in under.into_iter().take(page) {
            let mut hosting: HashSet<NodeId> = self
                .state
                .list_indices_for_namespace(ns.id)?
                .into_iter()
                .map(|i| i.node_id)
                .collect();
            for _ in 0..missing {
                let Some(target) = storages
                    .iter_mut()
                    .filter(|s| !hosting.contains(&s.node_id) && s.unclaimed_bytes() >= initial)
                    .max_by_key(|s| (s.unclaimed_bytes(), std::cmp::Reverse(s.node_id)))
                else {
                    warn!(
                        root_namespace_id = ns.root_namespace_id,
                        "no node can host another replica"
                    );
                    report.skip();
                    break;
                };
                let Some(index_id) = self.place_replica(&mut report, &ns, target.node_id, initial)
                else {
                    break;
                };
                target.reserved_bytes += initial;
                hosting.insert(target.node_id);
                emitted.push(Event::InitialIndexing { index_id });
            }
        }
        if !emitted.is_empty() {
            info!(placed = emitted.len(), "missing replicas placed");
        }
        Ok(Outcome::done(report)
            .with_emitted(emitted)
            .reschedule_if(
                self.config.rescheduling.missing_replicas,
                total > page,
                Event::MissingReplicas,
            ))
    }

    /// Create a replica and its index. The replica is rolled back when the
    /// index cannot be placed.
    fn place_replica(
        &self,
        report: &mut BatchReport,
        ns: &EnabledNamespace,
        node_id: NodeId,
        reserved: i64,
    ) -> Option<IndexId> {
        let replica = report.record(
            RecordRef::Namespace(ns.root_namespace_id),
            self.state.create_replica(ns),
        )?;
        let index = self.state.create_index(&NewIndex {
            enabled_namespace_id: ns.id,
            root_namespace_id: ns.root_namespace_id,
            replica_id: replica.id,
            node_id,
            reserved_storage_bytes: reserved,
        });
        match report.record(RecordRef::Replica(replica.id), index) {
            Some(index) => Some(index.id),
            None => {
                if let Err(e) = self.state.delete_replica(replica.id) {
                    warn!(replica_id = replica.id, error = %e, "failed to roll back replica");
                }
                None
            }
        }
    }

    /// Drop a namespace that no longer uses search. Its replicas go with it
    /// and its indices are orphaned for cleanup.
    pub(crate) fn namespace_offboarded(
        &self,
        root_namespace_id: NamespaceId,
    ) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("namespace_offboarded");
        let Some(ns) = self.state.find_enabled_namespace(root_namespace_id)? else {
            debug!(root_namespace_id, "namespace already offboarded");
            report.skip();
            return Ok(Outcome::done(report));
        };
        if let Some(Some(replicas)) = report.record(
            RecordRef::Namespace(root_namespace_id),
            self.state.delete_enabled_namespace(ns.id),
        ) {
            info!(root_namespace_id, replicas, "namespace offboarded");
        }
        Ok(Outcome::done(report))
    }
}
