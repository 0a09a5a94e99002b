//! StateStore — redb-backed state persistence for the Zoekt control plane.
//!
//! Provides typed operations over nodes, enabled namespaces, replicas,
//! indices, repositories and tasks. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Constraints the reconciliation engine relies on are enforced inside
//! write transactions and surface as [`StateError::Conflict`]:
//!
//! - one enabled namespace per root namespace
//! - one index per (enabled namespace, node)
//! - one repository per (index, project)
//! - one in-flight task of each nature per repository
//! - index updates carry the `lock_version` they were read at
//! - an index is only deleted once it owns no repositories

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{
    Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type EntityTable = TableDefinition<'static, u64, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            for def in [NODES, ENABLED_NAMESPACES, REPLICAS, INDICES, REPOSITORIES, TASKS] {
                txn.open_table(def).map_err(map_err!(Table))?;
            }
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register a new node and allocate its id.
    pub fn register_node(
        &self,
        address: &str,
        total_bytes: i64,
        schema_version: u32,
    ) -> StateResult<Node> {
        let node = self.write(|txn| {
            let node = Node {
                id: allocate_id(txn, "nodes")?,
                address: address.to_string(),
                total_bytes,
                schema_version,
                last_seen_at: epoch_secs(),
            };
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            put_row(&mut table, node.id, &node)?;
            Ok(node)
        })?;
        debug!(node_id = node.id, %address, total_bytes, "node registered");
        Ok(node)
    }

    /// Insert or update a node (heartbeats, capacity changes).
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            put_row(&mut table, node.id, node)
        })
    }

    pub fn get_node(&self, node_id: NodeId) -> StateResult<Option<Node>> {
        self.read_one(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.read_all(NODES)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: NodeId) -> StateResult<bool> {
        self.remove(NODES, node_id)
    }

    /// Aggregate reserved/used bytes for a node. `None` if the node is gone.
    pub fn node_storage(&self, node_id: NodeId) -> StateResult<Option<NodeStorage>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
        let Some(node) = get_row::<Node, _>(&nodes, node_id)? else {
            return Ok(None);
        };
        let indices = txn.open_table(INDICES).map_err(map_err!(Table))?;
        let mut storage = NodeStorage {
            node_id,
            total_bytes: node.total_bytes,
            reserved_bytes: 0,
            used_bytes: 0,
        };
        for index in scan::<Index, _>(&indices)? {
            if index.node_id == node_id {
                storage.reserved_bytes += index.reserved_storage_bytes;
                storage.used_bytes += index.used_storage_bytes;
            }
        }
        Ok(Some(storage))
    }

    // ── Enabled namespaces ─────────────────────────────────────────

    /// Opt a root namespace into indexing.
    ///
    /// Fails with `Conflict` if the namespace is already enabled.
    pub fn enable_namespace(
        &self,
        root_namespace_id: NamespaceId,
        number_of_replicas_override: Option<u32>,
    ) -> StateResult<EnabledNamespace> {
        let ns = self.write(|txn| {
            let mut table = txn.open_table(ENABLED_NAMESPACES).map_err(map_err!(Table))?;
            let existing = scan::<EnabledNamespace, _>(&table)?;
            if existing
                .iter()
                .any(|ns| ns.root_namespace_id == root_namespace_id)
            {
                return Err(StateError::Conflict(format!(
                    "namespace {root_namespace_id} already enabled"
                )));
            }
            let ns = EnabledNamespace {
                id: allocate_id(txn, "enabled_namespaces")?,
                root_namespace_id,
                number_of_replicas_override,
                created_at: epoch_secs(),
            };
            put_row(&mut table, ns.id, &ns)?;
            Ok(ns)
        })?;
        debug!(enabled_namespace_id = ns.id, root_namespace_id, "namespace enabled");
        Ok(ns)
    }

    pub fn put_enabled_namespace(&self, ns: &EnabledNamespace) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(ENABLED_NAMESPACES).map_err(map_err!(Table))?;
            put_row(&mut table, ns.id, ns)
        })
    }

    pub fn get_enabled_namespace(
        &self,
        id: EnabledNamespaceId,
    ) -> StateResult<Option<EnabledNamespace>> {
        self.read_one(ENABLED_NAMESPACES, id)
    }

    pub fn find_enabled_namespace(
        &self,
        root_namespace_id: NamespaceId,
    ) -> StateResult<Option<EnabledNamespace>> {
        Ok(self
            .list_enabled_namespaces()?
            .into_iter()
            .find(|ns| ns.root_namespace_id == root_namespace_id))
    }

    pub fn list_enabled_namespaces(&self) -> StateResult<Vec<EnabledNamespace>> {
        self.read_all(ENABLED_NAMESPACES)
    }

    /// Remove an enabled namespace together with its replicas. Its indices
    /// are orphaned, not deleted. Returns the number of replicas removed,
    /// or `None` if the namespace did not exist.
    pub fn delete_enabled_namespace(&self, id: EnabledNamespaceId) -> StateResult<Option<u32>> {
        let removed = self.write(|txn| {
            let mut namespaces = txn.open_table(ENABLED_NAMESPACES).map_err(map_err!(Table))?;
            if namespaces.remove(id).map_err(map_err!(Write))?.is_none() {
                return Ok(None);
            }
            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let doomed: Vec<ReplicaId> = scan::<Replica, _>(&replicas)?
                .into_iter()
                .filter(|r| r.enabled_namespace_id == id)
                .map(|r| r.id)
                .collect();
            for replica_id in &doomed {
                replicas.remove(*replica_id).map_err(map_err!(Write))?;
            }
            let mut indices = txn.open_table(INDICES).map_err(map_err!(Table))?;
            orphan_indices(&mut indices, |index| index.enabled_namespace_id == id)?;
            Ok(Some(doomed.len() as u32))
        })?;
        debug!(enabled_namespace_id = id, ?removed, "enabled namespace deleted");
        Ok(removed)
    }

    // ── Replicas ───────────────────────────────────────────────────

    pub fn create_replica(&self, ns: &EnabledNamespace) -> StateResult<Replica> {
        self.write(|txn| {
            let now = epoch_secs();
            let replica = Replica {
                id: allocate_id(txn, "replicas")?,
                enabled_namespace_id: ns.id,
                root_namespace_id: ns.root_namespace_id,
                state: ReplicaState::Pending,
                created_at: now,
                updated_at: now,
            };
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            put_row(&mut table, replica.id, &replica)?;
            Ok(replica)
        })
    }

    pub fn get_replica(&self, id: ReplicaId) -> StateResult<Option<Replica>> {
        self.read_one(REPLICAS, id)
    }

    pub fn list_replicas(&self) -> StateResult<Vec<Replica>> {
        self.read_all(REPLICAS)
    }

    pub fn list_replicas_for_namespace(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
    ) -> StateResult<Vec<Replica>> {
        Ok(self
            .list_replicas()?
            .into_iter()
            .filter(|r| r.enabled_namespace_id == enabled_namespace_id)
            .collect())
    }

    /// Set a replica's state. Returns false if the replica is gone.
    pub fn set_replica_state(&self, id: ReplicaId, state: ReplicaState) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let Some(mut replica) = get_row::<Replica, _>(&table, id)? else {
                return Ok(false);
            };
            replica.state = state;
            replica.updated_at = epoch_secs();
            put_row(&mut table, id, &replica)?;
            Ok(true)
        })
    }

    /// Delete a replica and orphan its indices. Returns true if it existed.
    pub fn delete_replica(&self, id: ReplicaId) -> StateResult<bool> {
        let existed = self.write(|txn| {
            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            if replicas.remove(id).map_err(map_err!(Write))?.is_none() {
                return Ok(false);
            }
            let mut indices = txn.open_table(INDICES).map_err(map_err!(Table))?;
            orphan_indices(&mut indices, |index| index.replica_id == Some(id))?;
            Ok(true)
        })?;
        debug!(replica_id = id, existed, "replica deleted");
        Ok(existed)
    }

    // ── Indices ────────────────────────────────────────────────────

    /// Place a new index in `pending` state.
    ///
    /// Fails with `Conflict` if the namespace already has an index on the node.
    pub fn create_index(&self, new: &NewIndex) -> StateResult<Index> {
        let index = self.write(|txn| {
            let mut table = txn.open_table(INDICES).map_err(map_err!(Table))?;
            let clash = scan::<Index, _>(&table)?.into_iter().any(|i| {
                i.enabled_namespace_id == new.enabled_namespace_id && i.node_id == new.node_id
            });
            if clash {
                return Err(StateError::Conflict(format!(
                    "enabled namespace {} already has an index on node {}",
                    new.enabled_namespace_id, new.node_id
                )));
            }
            let now = epoch_secs();
            let index = Index {
                id: allocate_id(txn, "indices")?,
                enabled_namespace_id: new.enabled_namespace_id,
                root_namespace_id: new.root_namespace_id,
                replica_id: Some(new.replica_id),
                node_id: new.node_id,
                state: IndexState::Pending,
                watermark_level: WatermarkLevel::Healthy,
                reserved_storage_bytes: new.reserved_storage_bytes,
                used_storage_bytes: 0,
                lock_version: 0,
                created_at: now,
                updated_at: now,
            };
            put_row(&mut table, index.id, &index)?;
            Ok(index)
        })?;
        debug!(index_id = index.id, node_id = index.node_id, "index created");
        Ok(index)
    }

    pub fn get_index(&self, id: IndexId) -> StateResult<Option<Index>> {
        self.read_one(INDICES, id)
    }

    pub fn list_indices(&self) -> StateResult<Vec<Index>> {
        self.read_all(INDICES)
    }

    pub fn list_indices_for_node(&self, node_id: NodeId) -> StateResult<Vec<Index>> {
        Ok(self
            .list_indices()?
            .into_iter()
            .filter(|i| i.node_id == node_id)
            .collect())
    }

    pub fn list_indices_for_replica(&self, replica_id: ReplicaId) -> StateResult<Vec<Index>> {
        Ok(self
            .list_indices()?
            .into_iter()
            .filter(|i| i.replica_id == Some(replica_id))
            .collect())
    }

    pub fn list_indices_for_namespace(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
    ) -> StateResult<Vec<Index>> {
        Ok(self
            .list_indices()?
            .into_iter()
            .filter(|i| i.enabled_namespace_id == enabled_namespace_id)
            .collect())
    }

    /// Persist an index read earlier, provided nobody else wrote it since.
    ///
    /// Returns the stored record with its bumped `lock_version`.
    pub fn update_index(&self, index: &Index) -> StateResult<Index> {
        self.write(|txn| {
            let mut table = txn.open_table(INDICES).map_err(map_err!(Table))?;
            let stored = get_row::<Index, _>(&table, index.id)?
                .ok_or_else(|| StateError::NotFound(format!("index {}", index.id)))?;
            if stored.lock_version != index.lock_version {
                return Err(StateError::Conflict(format!(
                    "index {} is stale (lock_version {} != {})",
                    index.id, index.lock_version, stored.lock_version
                )));
            }
            let mut updated = index.clone();
            updated.lock_version += 1;
            updated.updated_at = epoch_secs();
            put_row(&mut table, updated.id, &updated)?;
            Ok(updated)
        })
    }

    /// Destroy an index. Refuses with `Conflict` while repositories remain.
    pub fn delete_index(&self, id: IndexId) -> StateResult<bool> {
        let existed = self.write(|txn| {
            let repos = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            let owned = scan::<Repository, _>(&repos)?
                .iter()
                .filter(|r| r.index_id == id)
                .count();
            if owned > 0 {
                return Err(StateError::Conflict(format!(
                    "index {id} still owns {owned} repositories"
                )));
            }
            let mut table = txn.open_table(INDICES).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })?;
        debug!(index_id = id, existed, "index deleted");
        Ok(existed)
    }

    // ── Repositories ───────────────────────────────────────────────

    /// Create a `pending` repository for a project inside an index.
    pub fn create_repository(
        &self,
        index_id: IndexId,
        project_id: ProjectId,
    ) -> StateResult<Repository> {
        self.write(|txn| {
            let indices = txn.open_table(INDICES).map_err(map_err!(Table))?;
            if get_row::<Index, _>(&indices, index_id)?.is_none() {
                return Err(StateError::NotFound(format!("index {index_id}")));
            }
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            let clash = scan::<Repository, _>(&table)?
                .into_iter()
                .any(|r| r.index_id == index_id && r.project_id == project_id);
            if clash {
                return Err(StateError::Conflict(format!(
                    "project {project_id} already has a repository in index {index_id}"
                )));
            }
            let now = epoch_secs();
            let repo = Repository {
                id: allocate_id(txn, "repositories")?,
                index_id,
                project_id,
                state: RepositoryState::Pending,
                size_bytes: 0,
                schema_version: 0,
                created_at: now,
                updated_at: now,
            };
            put_row(&mut table, repo.id, &repo)?;
            Ok(repo)
        })
    }

    pub fn get_repository(&self, id: RepositoryId) -> StateResult<Option<Repository>> {
        self.read_one(REPOSITORIES, id)
    }

    pub fn find_repository(
        &self,
        index_id: IndexId,
        project_id: ProjectId,
    ) -> StateResult<Option<Repository>> {
        Ok(self
            .list_repositories()?
            .into_iter()
            .find(|r| r.index_id == index_id && r.project_id == project_id))
    }

    pub fn list_repositories(&self) -> StateResult<Vec<Repository>> {
        self.read_all(REPOSITORIES)
    }

    pub fn list_repositories_for_index(&self, index_id: IndexId) -> StateResult<Vec<Repository>> {
        Ok(self
            .list_repositories()?
            .into_iter()
            .filter(|r| r.index_id == index_id)
            .collect())
    }

    pub fn put_repository(&self, repo: &Repository) -> StateResult<()> {
        let mut repo = repo.clone();
        repo.updated_at = epoch_secs();
        self.write(|txn| {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            put_row(&mut table, repo.id, &repo)
        })
    }

    /// Move the given repositories to `state` in one transaction. Missing
    /// ids are skipped. Returns the number of repositories changed.
    pub fn set_repositories_state(
        &self,
        ids: &[RepositoryId],
        state: RepositoryState,
    ) -> StateResult<usize> {
        self.write(|txn| {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            let now = epoch_secs();
            let mut changed = 0;
            for id in ids {
                let Some(mut repo) = get_row::<Repository, _>(&table, *id)? else {
                    continue;
                };
                if repo.state == state {
                    continue;
                }
                repo.state = state;
                repo.updated_at = now;
                put_row(&mut table, repo.id, &repo)?;
                changed += 1;
            }
            Ok(changed)
        })
    }

    pub fn delete_repository(&self, id: RepositoryId) -> StateResult<bool> {
        self.remove(REPOSITORIES, id)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Enqueue a task in `pending` state.
    ///
    /// Returns `None` without writing when the repository already has a
    /// pending or processing task of the same nature.
    pub fn create_task(&self, new: &NewTask) -> StateResult<Option<Task>> {
        let created = self.write(|txn| {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let busy = scan::<Task, _>(&table)?.into_iter().any(|t| {
                t.repository_id == new.repository_id
                    && t.state.is_in_flight()
                    && t.task_type.same_nature(new.task_type)
            });
            if busy {
                return Ok(None);
            }
            let now = epoch_secs();
            let task = Task {
                id: allocate_id(txn, "tasks")?,
                node_id: new.node_id,
                index_id: new.index_id,
                repository_id: new.repository_id,
                project_id: new.project_id,
                task_type: new.task_type,
                state: TaskState::Pending,
                retries_left: new.retries,
                error: None,
                created_at: now,
                updated_at: now,
            };
            put_row(&mut table, task.id, &task)?;
            Ok(Some(task))
        })?;
        match &created {
            Some(task) => debug!(
                task_id = task.id,
                repository_id = task.repository_id,
                task_type = ?task.task_type,
                "task enqueued"
            ),
            None => debug!(
                repository_id = new.repository_id,
                task_type = ?new.task_type,
                "task already in flight"
            ),
        }
        Ok(created)
    }

    pub fn get_task(&self, id: TaskId) -> StateResult<Option<Task>> {
        self.read_one(TASKS, id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        self.read_all(TASKS)
    }

    /// Pending and processing tasks.
    pub fn list_in_flight_tasks(&self) -> StateResult<Vec<Task>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.state.is_in_flight())
            .collect())
    }

    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        let mut task = task.clone();
        task.updated_at = epoch_secs();
        self.write(|txn| {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            put_row(&mut table, task.id, &task)
        })
    }

    /// Hand up to `limit` pending tasks of a node to the dispatcher, oldest
    /// first, moving them to `processing`.
    pub fn claim_tasks(&self, node_id: NodeId, limit: usize) -> StateResult<Vec<Task>> {
        self.write(|txn| {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            // Rows iterate in key order, so ids come out ascending.
            let mut claimed: Vec<Task> = scan::<Task, _>(&table)?
                .into_iter()
                .filter(|t| t.node_id == node_id && t.state == TaskState::Pending)
                .take(limit)
                .collect();
            let now = epoch_secs();
            for task in &mut claimed {
                task.state = TaskState::Processing;
                task.updated_at = now;
                put_row(&mut table, task.id, &*task)?;
            }
            Ok(claimed)
        })
    }

    /// In-flight task types per repository, for bulk exclusion checks.
    pub fn in_flight_by_repository(&self) -> StateResult<HashMap<RepositoryId, Vec<TaskType>>> {
        let mut map: HashMap<RepositoryId, Vec<TaskType>> = HashMap::new();
        for task in self.list_in_flight_tasks()? {
            map.entry(task.repository_id).or_default().push(task.task_type);
        }
        Ok(map)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(result) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(result)
            }
            Err(e) => {
                // Nothing from a failed closure may become visible.
                let _ = txn.abort();
                Err(e)
            }
        }
    }

    fn read_one<T: DeserializeOwned>(&self, def: EntityTable, id: u64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        get_row(&table, id)
    }

    fn read_all<T: DeserializeOwned>(&self, def: EntityTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan(&table)
    }

    fn remove(&self, def: EntityTable, id: u64) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })
    }
}

fn allocate_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let next = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn get_row<T, R>(table: &R, id: u64) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        )),
        None => Ok(None),
    }
}

fn scan<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<u64, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

fn put_row<T: Serialize>(
    table: &mut Table<'_, u64, &'static [u8]>,
    id: u64,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(id, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Detach matching indices from their replica and mark them orphaned.
fn orphan_indices(
    table: &mut Table<'_, u64, &'static [u8]>,
    matches: impl Fn(&Index) -> bool,
) -> StateResult<usize> {
    let now = epoch_secs();
    let affected: Vec<Index> = scan::<Index, _>(&*table)?
        .into_iter()
        .filter(|index| matches(index))
        .collect();
    for mut index in affected.iter().cloned() {
        index.replica_id = None;
        if !index.state.should_be_deleted() {
            index.state = IndexState::Orphaned;
        }
        index.lock_version += 1;
        index.updated_at = now;
        put_row(table, index.id, &index)?;
    }
    Ok(affected.len())
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    /// Node + enabled namespace + replica + index, the usual starting point.
    fn seeded(store: &StateStore, reserved: i64) -> (Node, EnabledNamespace, Replica, Index) {
        let node = store.register_node("10.0.0.1:6070", 1000, 1).unwrap();
        let ns = store.enable_namespace(42, None).unwrap();
        let replica = store.create_replica(&ns).unwrap();
        let index = store
            .create_index(&NewIndex {
                enabled_namespace_id: ns.id,
                root_namespace_id: ns.root_namespace_id,
                replica_id: replica.id,
                node_id: node.id,
                reserved_storage_bytes: reserved,
            })
            .unwrap();
        (node, ns, replica, index)
    }

    fn index_task(index: &Index, repo: &Repository, task_type: TaskType) -> NewTask {
        NewTask {
            node_id: index.node_id,
            index_id: index.id,
            repository_id: repo.id,
            project_id: repo.project_id,
            task_type,
            retries: 3,
        }
    }

    // ── Nodes ──────────────────────────────────────────────────────

    #[test]
    fn node_register_get_and_list() {
        let store = store();
        let a = store.register_node("a:6070", 100, 1).unwrap();
        let b = store.register_node("b:6070", 200, 1).unwrap();
        assert!(b.id > a.id);

        assert_eq!(store.get_node(a.id).unwrap(), Some(a));
        assert_eq!(store.list_nodes().unwrap().len(), 2);
    }

    #[test]
    fn node_delete() {
        let store = store();
        let node = store.register_node("a:6070", 100, 1).unwrap();
        assert!(store.delete_node(node.id).unwrap());
        assert!(!store.delete_node(node.id).unwrap());
        assert!(store.get_node(node.id).unwrap().is_none());
    }

    #[test]
    fn node_storage_aggregates_indices() {
        let store = store();
        let (node, _, _, mut index) = seeded(&store, 300);
        index.used_storage_bytes = 120;
        store.update_index(&index).unwrap();

        // A second namespace on the same node.
        let other = store.enable_namespace(43, None).unwrap();
        let other_replica = store.create_replica(&other).unwrap();
        store
            .create_index(&NewIndex {
                enabled_namespace_id: other.id,
                root_namespace_id: 43,
                replica_id: other_replica.id,
                node_id: node.id,
                reserved_storage_bytes: 900,
            })
            .unwrap();

        let storage = store.node_storage(node.id).unwrap().unwrap();
        assert_eq!(storage.reserved_bytes, 1200);
        assert_eq!(storage.used_bytes, 120);
        assert_eq!(storage.unclaimed_bytes(), -200);
    }

    #[test]
    fn node_storage_missing_node() {
        assert!(store().node_storage(99).unwrap().is_none());
    }

    // ── Enabled namespaces ─────────────────────────────────────────

    #[test]
    fn enable_namespace_is_unique_per_root() {
        let store = store();
        store.enable_namespace(7, Some(2)).unwrap();
        let err = store.enable_namespace(7, None).unwrap_err();
        assert!(err.is_conflict());

        let found = store.find_enabled_namespace(7).unwrap().unwrap();
        assert_eq!(found.number_of_replicas_override, Some(2));
    }

    #[test]
    fn delete_enabled_namespace_orphans_indices() {
        let store = store();
        let (_, ns, replica, index) = seeded(&store, 100);

        assert_eq!(store.delete_enabled_namespace(ns.id).unwrap(), Some(1));
        assert!(store.get_replica(replica.id).unwrap().is_none());

        let index = store.get_index(index.id).unwrap().unwrap();
        assert_eq!(index.state, IndexState::Orphaned);
        assert_eq!(index.replica_id, None);

        assert_eq!(store.delete_enabled_namespace(ns.id).unwrap(), None);
    }

    // ── Replicas ───────────────────────────────────────────────────

    #[test]
    fn replica_state_and_listing() {
        let store = store();
        let ns = store.enable_namespace(1, None).unwrap();
        let r1 = store.create_replica(&ns).unwrap();
        let r2 = store.create_replica(&ns).unwrap();
        assert!(store.set_replica_state(r1.id, ReplicaState::Ready).unwrap());
        assert!(!store.set_replica_state(999, ReplicaState::Ready).unwrap());

        let replicas = store.list_replicas_for_namespace(ns.id).unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].state, ReplicaState::Ready);
        assert_eq!(replicas[1].id, r2.id);
    }

    #[test]
    fn delete_replica_orphans_its_indices() {
        let store = store();
        let (_, _, replica, index) = seeded(&store, 100);

        assert!(store.delete_replica(replica.id).unwrap());
        let orphan = store.get_index(index.id).unwrap().unwrap();
        assert_eq!(orphan.state, IndexState::Orphaned);
        assert_eq!(orphan.replica_id, None);
        assert!(orphan.lock_version > index.lock_version);

        assert!(!store.delete_replica(replica.id).unwrap());
    }

    // ── Indices ────────────────────────────────────────────────────

    #[test]
    fn index_unique_per_namespace_and_node() {
        let store = store();
        let (node, ns, replica, _) = seeded(&store, 100);
        let err = store
            .create_index(&NewIndex {
                enabled_namespace_id: ns.id,
                root_namespace_id: ns.root_namespace_id,
                replica_id: replica.id,
                node_id: node.id,
                reserved_storage_bytes: 10,
            })
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn update_index_rejects_stale_writes() {
        let store = store();
        let (_, _, _, index) = seeded(&store, 100);

        let mut first = index.clone();
        first.used_storage_bytes = 10;
        let saved = store.update_index(&first).unwrap();
        assert_eq!(saved.lock_version, 1);

        // A writer still holding the original version loses.
        let mut second = index;
        second.used_storage_bytes = 20;
        assert!(store.update_index(&second).unwrap_err().is_conflict());

        let stored = store.get_index(saved.id).unwrap().unwrap();
        assert_eq!(stored.used_storage_bytes, 10);
    }

    #[test]
    fn update_missing_index_is_not_found() {
        let store = store();
        let (_, _, _, index) = seeded(&store, 100);
        store.delete_index(index.id).unwrap();
        assert!(matches!(
            store.update_index(&index),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn delete_index_requires_no_repositories() {
        let store = store();
        let (_, _, _, index) = seeded(&store, 100);
        let repo = store.create_repository(index.id, 5).unwrap();

        assert!(store.delete_index(index.id).unwrap_err().is_conflict());
        assert!(store.get_index(index.id).unwrap().is_some());

        store.delete_repository(repo.id).unwrap();
        assert!(store.delete_index(index.id).unwrap());
    }

    // ── Repositories ───────────────────────────────────────────────

    #[test]
    fn repository_unique_per_index_and_project() {
        let store = store();
        let (_, _, _, index) = seeded(&store, 100);
        let repo = store.create_repository(index.id, 5).unwrap();
        assert_eq!(repo.state, RepositoryState::Pending);
        assert!(store.create_repository(index.id, 5).unwrap_err().is_conflict());
        assert_eq!(store.find_repository(index.id, 5).unwrap(), Some(repo));
    }

    #[test]
    fn repository_requires_index() {
        let store = store();
        assert!(matches!(
            store.create_repository(77, 1),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn set_repositories_state_counts_changes() {
        let store = store();
        let (_, _, _, index) = seeded(&store, 100);
        let a = store.create_repository(index.id, 1).unwrap();
        let b = store.create_repository(index.id, 2).unwrap();

        let changed = store
            .set_repositories_state(&[a.id, b.id, 999], RepositoryState::PendingDeletion)
            .unwrap();
        assert_eq!(changed, 2);
        let again = store
            .set_repositories_state(&[a.id, b.id], RepositoryState::PendingDeletion)
            .unwrap();
        assert_eq!(again, 0);
    }

    // ── Tasks ──────────────────────────────────────────────────────

    #[test]
    fn create_task_skips_in_flight_duplicates() {
        let store = store();
        let (_, _, _, index) = seeded(&store, 100);
        let repo = store.create_repository(index.id, 1).unwrap();

        let first = store
            .create_task(&index_task(&index, &repo, TaskType::IndexRepo))
            .unwrap();
        assert!(first.is_some());
        // Force-index shares the indexing slot.
        assert!(store
            .create_task(&index_task(&index, &repo, TaskType::ForceIndexRepo))
            .unwrap()
            .is_none());
        // Delete has its own slot.
        assert!(store
            .create_task(&index_task(&index, &repo, TaskType::DeleteRepo))
            .unwrap()
            .is_some());

        // Once the first finishes, a new indexing task may be queued.
        let mut done = first.unwrap();
        done.state = TaskState::Completed;
        store.put_task(&done).unwrap();
        assert!(store
            .create_task(&index_task(&index, &repo, TaskType::IndexRepo))
            .unwrap()
            .is_some());
    }

    #[test]
    fn claim_tasks_oldest_first_and_marks_processing() {
        let store = store();
        let (node, _, _, index) = seeded(&store, 100);
        let mut ids = Vec::new();
        for project in 1..=3 {
            let repo = store.create_repository(index.id, project).unwrap();
            let task = store
                .create_task(&index_task(&index, &repo, TaskType::IndexRepo))
                .unwrap()
                .unwrap();
            ids.push(task.id);
        }

        let claimed = store.claim_tasks(node.id, 2).unwrap();
        assert_eq!(claimed.iter().map(|t| t.id).collect::<Vec<_>>(), &ids[..2]);
        assert!(claimed.iter().all(|t| t.state == TaskState::Processing));

        let rest = store.claim_tasks(node.id, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.claim_tasks(node.id, 10).unwrap().is_empty());
        assert_eq!(store.list_in_flight_tasks().unwrap().len(), 3);
    }

    #[test]
    fn in_flight_by_repository_groups_types() {
        let store = store();
        let (_, _, _, index) = seeded(&store, 100);
        let repo = store.create_repository(index.id, 1).unwrap();
        store
            .create_task(&index_task(&index, &repo, TaskType::IndexRepo))
            .unwrap();
        store
            .create_task(&index_task(&index, &repo, TaskType::DeleteRepo))
            .unwrap();

        let map = store.in_flight_by_repository().unwrap();
        assert_eq!(map[&repo.id].len(), 2);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("zoekt.redb");

        let node_id = {
            let store = StateStore::open(&db_path).unwrap();
            store.register_node("a:6070", 100, 3).unwrap().id
        };

        let store = StateStore::open(&db_path).unwrap();
        let node = store.get_node(node_id).unwrap().unwrap();
        assert_eq!(node.schema_version, 3);
        // Sequences persist too: the next id does not collide.
        let next = store.register_node("b:6070", 100, 3).unwrap();
        assert!(next.id > node_id);
    }

    #[test]
    fn empty_store_operations() {
        let store = store();
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_enabled_namespaces().unwrap().is_empty());
        assert!(store.list_indices().unwrap().is_empty());
        assert!(store.list_repositories().unwrap().is_empty());
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(!store.delete_replica(1).unwrap());
        assert!(!store.delete_index(1).unwrap());
        assert!(!store.delete_repository(1).unwrap());
    }
}
