//! Node task queue: enqueueing, dispatch and result reporting.
//!
//! Tasks are created by the indexing and deletion handlers, claimed per node
//! by the [`TaskDispatcher`], and finished through [`report_task_result`].
//! A successful task publishes [`Event::TaskSucceeded`] so the owning index
//! can refresh its usage.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, warn};
use zoekt_state::{
    Index, NewTask, Node, NodeId, Repository, RepositoryState, StateResult, StateStore, Task,
    TaskId, TaskState, TaskType,
};

use crate::error::ReconcileResult;
use crate::events::Event;

/// What a node reported back for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded { size_bytes: i64 },
    Failed { error: String },
}

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<TaskOutcome>> + Send>>;

/// Executes a claimed task against its node.
pub type RunTask = Arc<dyn Fn(Node, Task) -> TaskFuture + Send + Sync>;

/// Enqueue a task for a repository on its index's node. `None` when a task
/// of the same nature is already in flight.
pub(crate) fn enqueue(
    state: &StateStore,
    retries: u32,
    index: &Index,
    repo: &Repository,
    task_type: TaskType,
) -> StateResult<Option<Task>> {
    state.create_task(&NewTask {
        node_id: index.node_id,
        index_id: index.id,
        repository_id: repo.id,
        project_id: repo.project_id,
        task_type,
        retries,
    })
}

/// Apply a node's report for a task.
///
/// Returns the follow-up event on success. Reports for unknown or already
/// finished tasks are ignored.
pub fn report_task_result(
    state: &StateStore,
    task_id: TaskId,
    outcome: TaskOutcome,
) -> ReconcileResult<Option<Event>> {
    let Some(mut task) = state.get_task(task_id)? else {
        debug!(task_id, "report for unknown task");
        return Ok(None);
    };
    if !task.state.is_in_flight() {
        debug!(task_id, state = ?task.state, "report for finished task");
        return Ok(None);
    }

    match outcome {
        TaskOutcome::Succeeded { size_bytes } => {
            task.state = TaskState::Completed;
            task.error = None;
            state.put_task(&task)?;
            apply_success(state, &task, size_bytes)?;
            debug!(
                task_id,
                repository_id = task.repository_id,
                task_type = ?task.task_type,
                size_bytes,
                "task succeeded"
            );
            Ok(Some(Event::TaskSucceeded {
                repository_id: task.repository_id,
                task_id,
            }))
        }
        TaskOutcome::Failed { error } => {
            task.retries_left = task.retries_left.saturating_sub(1);
            task.state = if task.retries_left > 0 {
                TaskState::Pending
            } else {
                TaskState::Failed
            };
            warn!(
                task_id,
                repository_id = task.repository_id,
                retries_left = task.retries_left,
                %error,
                "task failed"
            );
            task.error = Some(error);
            state.put_task(&task)?;
            if task.state == TaskState::Failed && task.task_type.is_indexing() {
                mark_repository_failed(state, &task)?;
            }
            Ok(None)
        }
    }
}

fn apply_success(state: &StateStore, task: &Task, size_bytes: i64) -> StateResult<()> {
    if task.task_type == TaskType::DeleteRepo {
        state.delete_repository(task.repository_id)?;
        return Ok(());
    }
    let Some(mut repo) = state.get_repository(task.repository_id)? else {
        return Ok(());
    };
    if let Some(node) = state.get_node(task.node_id)? {
        repo.schema_version = node.schema_version;
    }
    repo.size_bytes = size_bytes;
    if !repo.state.should_be_deleted() {
        repo.state = RepositoryState::Ready;
    }
    state.put_repository(&repo)
}

fn mark_repository_failed(state: &StateStore, task: &Task) -> StateResult<()> {
    match state.get_repository(task.repository_id)? {
        Some(mut repo) if !repo.state.should_be_deleted() => {
            repo.state = RepositoryState::Failed;
            state.put_repository(&repo)
        }
        _ => Ok(()),
    }
}

/// Hands pending tasks to nodes and records what they report.
#[derive(Clone)]
pub struct TaskDispatcher {
    state: StateStore,
    claim_limit: usize,
    run_task: RunTask,
}

impl TaskDispatcher {
    pub fn new(state: StateStore, claim_limit: usize, run_task: RunTask) -> Self {
        Self {
            state,
            claim_limit,
            run_task,
        }
    }

    /// Claim and run one round of tasks for a node.
    ///
    /// A task whose execution errors counts as a failed attempt. Returns the
    /// events produced by successful tasks.
    pub async fn dispatch_node(&self, node_id: NodeId) -> ReconcileResult<Vec<Event>> {
        let Some(node) = self.state.get_node(node_id)? else {
            return Ok(Vec::new());
        };
        let claimed = self.state.claim_tasks(node_id, self.claim_limit)?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let total = claimed.len();
        for task in claimed {
            let task_id = task.id;
            let outcome = match (self.run_task)(node.clone(), task).await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::Failed {
                    error: e.to_string(),
                },
            };
            if let Some(event) = report_task_result(&self.state, task_id, outcome)? {
                events.push(event);
            }
        }
        info!(
            node_id,
            claimed = total,
            succeeded = events.len(),
            "dispatched tasks"
        );
        Ok(events)
    }

    /// Run one dispatch round on every registered node.
    pub async fn dispatch_all(&self) -> ReconcileResult<Vec<Event>> {
        let mut events = Vec::new();
        for node in self.state.list_nodes()? {
            events.extend(self.dispatch_node(node.id).await?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zoekt_state::NewIndex;

    fn seed(state: &StateStore) -> (Index, Repository) {
        let node = state.register_node("10.0.0.1:6070", 1_000, 3).unwrap();
        let ns = state.enable_namespace(9, None).unwrap();
        let replica = state.create_replica(&ns).unwrap();
        let index = state
            .create_index(&NewIndex {
                enabled_namespace_id: ns.id,
                root_namespace_id: 9,
                replica_id: replica.id,
                node_id: node.id,
                reserved_storage_bytes: 100,
            })
            .unwrap();
        let repo = state.create_repository(index.id, 77).unwrap();
        (index, repo)
    }

    #[test]
    fn success_marks_repository_ready_with_node_schema() {
        let state = StateStore::open_in_memory().unwrap();
        let (index, repo) = seed(&state);
        let task = enqueue(&state, 2, &index, &repo, TaskType::IndexRepo)
            .unwrap()
            .unwrap();

        let event = report_task_result(&state, task.id, TaskOutcome::Succeeded { size_bytes: 42 })
            .unwrap();
        assert_eq!(
            event,
            Some(Event::TaskSucceeded {
                repository_id: repo.id,
                task_id: task.id
            })
        );
        let repo = state.get_repository(repo.id).unwrap().unwrap();
        assert_eq!(repo.state, RepositoryState::Ready);
        assert_eq!(repo.size_bytes, 42);
        assert_eq!(repo.schema_version, 3);
        assert_eq!(
            state.get_task(task.id).unwrap().unwrap().state,
            TaskState::Completed
        );
    }

    #[test]
    fn failures_retry_then_fail_the_repository() {
        let state = StateStore::open_in_memory().unwrap();
        let (index, repo) = seed(&state);
        let task = enqueue(&state, 2, &index, &repo, TaskType::IndexRepo)
            .unwrap()
            .unwrap();
        let failed = || TaskOutcome::Failed {
            error: "disk full".into(),
        };

        assert_eq!(report_task_result(&state, task.id, failed()).unwrap(), None);
        let retried = state.get_task(task.id).unwrap().unwrap();
        assert_eq!(retried.state, TaskState::Pending);
        assert_eq!(retried.retries_left, 1);

        report_task_result(&state, task.id, failed()).unwrap();
        let dead = state.get_task(task.id).unwrap().unwrap();
        assert_eq!(dead.state, TaskState::Failed);
        assert_eq!(dead.error.as_deref(), Some("disk full"));
        assert_eq!(
            state.get_repository(repo.id).unwrap().unwrap().state,
            RepositoryState::Failed
        );

        // Late duplicate reports are ignored.
        assert_eq!(
            report_task_result(&state, task.id, TaskOutcome::Succeeded { size_bytes: 1 }).unwrap(),
            None
        );
    }

    #[test]
    fn delete_success_removes_repository() {
        let state = StateStore::open_in_memory().unwrap();
        let (index, repo) = seed(&state);
        let task = enqueue(&state, 1, &index, &repo, TaskType::DeleteRepo)
            .unwrap()
            .unwrap();
        report_task_result(&state, task.id, TaskOutcome::Succeeded { size_bytes: 0 }).unwrap();
        assert!(state.get_repository(repo.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn dispatcher_runs_claimed_tasks() {
        let state = StateStore::open_in_memory().unwrap();
        let (index, repo) = seed(&state);
        let other = state.create_repository(index.id, 78).unwrap();
        enqueue(&state, 1, &index, &repo, TaskType::IndexRepo).unwrap();
        enqueue(&state, 1, &index, &other, TaskType::IndexRepo).unwrap();

        let run_task: RunTask = Arc::new(|_node: Node, task: Task| {
            Box::pin(async move {
                if task.project_id == 78 {
                    anyhow::bail!("connection refused");
                }
                Ok(TaskOutcome::Succeeded { size_bytes: 5 })
            }) as TaskFuture
        });
        let dispatcher = TaskDispatcher::new(state.clone(), 10, run_task);
        let events = dispatcher.dispatch_all().await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(
            state.get_repository(other.id).unwrap().unwrap().state,
            RepositoryState::Failed
        );
        assert!(state.list_in_flight_tasks().unwrap().is_empty());
    }
}
