//! Storage handlers: reservation sizing, watermark bookkeeping and eviction.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};
use zoekt_state::{
    Index, IndexId, NodeId, NodeStorage, ReplicaId, RepositoryId, StateError, TaskId,
    WatermarkLevel,
};

use super::Reconciler;
use crate::error::ReconcileResult;
use crate::events::Event;
use crate::report::{BatchReport, Outcome, RecordRef};
use crate::watermark::{
    appropriate_level, is_stale, needs_resize, parse_watermark, recompute_reserved_storage_bytes,
    transition_to,
};

/// Optimistic attempts for usage refreshes racing each other.
const USAGE_UPDATE_ATTEMPTS: usize = 3;

impl Reconciler {
    /// Resize reservations of indices that hold far too much or too little.
    ///
    /// Indices a recompute would leave as they are (for instance a high
    /// watermark index on a full node) are skipped before paging.
    pub(crate) fn adjust_reserved_storage(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("adjust_reserved_storage");
        let t = &self.config.watermarks;
        let mut storage: HashMap<NodeId, Option<NodeStorage>> = HashMap::new();
        let mut batch: Vec<Index> = Vec::new();

        for index in self.state.list_indices()? {
            if index.state.should_be_deleted()
                || !matches!(
                    index.watermark_level,
                    WatermarkLevel::Overprovisioned | WatermarkLevel::HighWatermarkExceeded
                )
            {
                continue;
            }
            let node = match storage.entry(index.node_id) {
                Entry::Occupied(e) => *e.get(),
                Entry::Vacant(e) => *e.insert(self.state.node_storage(index.node_id)?),
            };
            match node {
                Some(node) if needs_resize(&node, &index, t) => {
                    if batch.len() < self.config.batching.batch_size {
                        batch.push(index);
                    }
                }
                _ => report.skip(),
            }
        }

        for index in &batch {
            match recompute_reserved_storage_bytes(&self.state, t, index) {
                Ok(updated) if updated == *index => report.skip(),
                result => {
                    report.record(RecordRef::Index(index.id), result);
                }
            }
        }
        info!(
            candidates = batch.len(),
            adjusted = report.processed,
            unchanged = report.skipped,
            failed = report.failures.len(),
            "reserved storage adjusted"
        );
        Ok(Outcome::done(report))
    }

    /// Recompute indices whose stored level no longer matches their usage,
    /// or whose reservation drifted negative.
    pub(crate) fn index_watermark_changed(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("index_watermark_changed");
        let t = &self.config.watermarks;
        let batch: Vec<Index> = self
            .state
            .list_indices()?
            .into_iter()
            .filter(|i| !i.state.should_be_deleted())
            .filter(|i| is_stale(i, t) || i.reserved_storage_bytes < 0)
            .take(self.config.batching.batch_size)
            .collect();

        for index in &batch {
            report.record(
                RecordRef::Index(index.id),
                recompute_reserved_storage_bytes(&self.state, t, index),
            );
        }
        if !batch.is_empty() {
            info!(
                stale = batch.len(),
                recomputed = report.processed,
                "stale watermarks recomputed"
            );
        }
        Ok(Outcome::done(report))
    }

    /// Set the level reported by the storage monitor on each named index.
    pub(crate) fn index_over_watermark(
        &self,
        index_ids: &[IndexId],
        watermark: &str,
    ) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("index_over_watermark");
        let requested = parse_watermark(watermark)?;
        let t = &self.config.watermarks;

        for &index_id in index_ids {
            let Some(index) = self.state.get_index(index_id)? else {
                report.skip();
                continue;
            };
            let transition = transition_to(
                requested,
                index.used_storage_bytes,
                index.reserved_storage_bytes,
                t,
            );
            if !transition.agrees() {
                debug!(
                    index_id,
                    requested = %transition.requested,
                    derived = %transition.derived,
                    "monitor level differs from stored usage"
                );
            }
            if index.watermark_level == requested {
                report.skip();
                continue;
            }
            let mut updated = index;
            updated.watermark_level = requested;
            report.record(RecordRef::Index(index_id), self.state.update_index(&updated));
        }
        Ok(Outcome::done(report))
    }

    /// Pick the largest reservations on each over-committed node until the
    /// deficit is covered and ask for them to be evicted.
    pub(crate) fn node_with_negative_unclaimed_storage(
        &self,
        node_ids: &[NodeId],
    ) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("node_with_negative_unclaimed_storage");
        let mut offenders: BTreeSet<IndexId> = BTreeSet::new();

        for &node_id in node_ids {
            let Some(storage) = self.state.node_storage(node_id)? else {
                report.skip();
                continue;
            };
            let deficit = -storage.unclaimed_bytes();
            if deficit <= 0 {
                report.skip();
                continue;
            }

            let mut indices = self.state.list_indices_for_node(node_id)?;
            indices.retain(|i| i.reserved_storage_bytes > 0);
            indices.sort_by(|a, b| {
                b.reserved_storage_bytes
                    .cmp(&a.reserved_storage_bytes)
                    .then(b.id.cmp(&a.id))
            });
            let mut freed = 0;
            let mut picked = 0;
            for index in indices {
                if freed >= deficit {
                    break;
                }
                freed += index.reserved_storage_bytes;
                picked += 1;
                offenders.insert(index.id);
            }
            report.processed += 1;
            warn!(node_id, deficit, picked, "node over-committed");
        }

        let outcome = Outcome::done(report);
        if offenders.is_empty() {
            return Ok(outcome);
        }
        Ok(outcome.with_emitted(vec![Event::IndexToEvict {
            index_ids: offenders.into_iter().collect(),
        }]))
    }

    /// Delete the replicas behind the named indices and behind a page of
    /// critically full ones.
    pub(crate) fn index_to_evict(&self, index_ids: &[IndexId]) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("index_to_evict");
        let mut candidates: BTreeMap<IndexId, Index> = BTreeMap::new();

        for &index_id in index_ids {
            match self.state.get_index(index_id)? {
                Some(index) => {
                    candidates.insert(index_id, index);
                }
                None => report.skip(),
            }
        }
        let critical = self
            .state
            .list_indices()?
            .into_iter()
            .filter(|i| {
                !i.state.should_be_deleted()
                    && i.watermark_level == WatermarkLevel::CriticalWatermarkExceeded
            })
            .take(self.config.batching.batch_size);
        for index in critical {
            candidates.entry(index.id).or_insert(index);
        }

        let replicas: BTreeSet<ReplicaId> =
            candidates.values().filter_map(|i| i.replica_id).collect();
        let mut evicted = 0;
        for replica_id in replicas {
            match self.state.delete_replica(replica_id) {
                Ok(true) => evicted += 1,
                Ok(false) => report.skip(),
                Err(e) => report.fail(RecordRef::Replica(replica_id), e),
            }
        }
        report.processed += evicted;
        if evicted > 0 {
            info!(
                indices = candidates.len(),
                replicas_evicted = evicted,
                "replicas evicted"
            );
        }
        Ok(Outcome::done(report))
    }

    /// Refresh an index's usage from its repositories after a task finished.
    pub(crate) fn update_index_used_bytes(
        &self,
        repository_id: RepositoryId,
        task_id: TaskId,
    ) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("task_succeeded");
        let index_id = match self.state.get_task(task_id)? {
            Some(task) => Some(task.index_id),
            None => self
                .state
                .get_repository(repository_id)?
                .map(|r| r.index_id),
        };
        let Some(index_id) = index_id else {
            debug!(task_id, repository_id, "no index to refresh");
            report.skip();
            return Ok(Outcome::done(report));
        };

        let t = &self.config.watermarks;
        let mut result = Err(StateError::NotFound(format!("index {index_id}")));
        for _ in 0..USAGE_UPDATE_ATTEMPTS {
            let Some(index) = self.state.get_index(index_id)? else {
                report.skip();
                return Ok(Outcome::done(report));
            };
            let used: i64 = self
                .state
                .list_repositories_for_index(index_id)?
                .iter()
                .map(|r| r.size_bytes)
                .sum();
            let level = appropriate_level(used, index.reserved_storage_bytes, t);
            if used == index.used_storage_bytes && level == index.watermark_level {
                report.skip();
                return Ok(Outcome::done(report));
            }
            let mut updated = index;
            updated.used_storage_bytes = used;
            updated.watermark_level = level;
            result = self.state.update_index(&updated);
            if !matches!(&result, Err(e) if e.is_conflict()) {
                break;
            }
        }
        if let Some(index) = report.record(RecordRef::Index(index_id), result) {
            debug!(
                index_id,
                used_bytes = index.used_storage_bytes,
                watermark = %index.watermark_level,
                "index usage refreshed"
            );
        }
        Ok(Outcome::done(report))
    }
}
