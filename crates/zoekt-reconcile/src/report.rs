//! Per-invocation bookkeeping for batch handlers.

use std::fmt;

use tracing::warn;
use zoekt_state::{
    IndexId, NamespaceId, NodeId, ProjectId, ReplicaId, RepositoryId, StateError, StateResult,
    TaskId,
};

use crate::events::Event;

/// The record a handler was working on when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRef {
    Node(NodeId),
    Namespace(NamespaceId),
    Replica(ReplicaId),
    Index(IndexId),
    Repository(RepositoryId),
    Project(ProjectId),
    Task(TaskId),
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRef::Node(id) => write!(f, "node/{id}"),
            RecordRef::Namespace(id) => write!(f, "namespace/{id}"),
            RecordRef::Replica(id) => write!(f, "replica/{id}"),
            RecordRef::Index(id) => write!(f, "index/{id}"),
            RecordRef::Repository(id) => write!(f, "repository/{id}"),
            RecordRef::Project(id) => write!(f, "project/{id}"),
            RecordRef::Task(id) => write!(f, "task/{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub record: RecordRef,
    pub error: String,
}

/// What one handler invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub handler: &'static str,
    /// Records successfully written.
    pub processed: usize,
    /// Records looked at and left alone.
    pub skipped: usize,
    pub failures: Vec<RecordFailure>,
}

impl BatchReport {
    pub fn new(handler: &'static str) -> Self {
        Self {
            handler,
            processed: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    /// Account for one record-level write. Failures are logged and kept;
    /// the caller carries on with the next record.
    pub fn record<T>(&mut self, record: RecordRef, result: StateResult<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.processed += 1;
                Some(value)
            }
            Err(e) => {
                self.fail(record, e);
                None
            }
        }
    }

    pub fn fail(&mut self, record: RecordRef, error: StateError) {
        warn!(
            handler = self.handler,
            record = %record,
            conflict = error.is_conflict(),
            error = %error,
            "record skipped"
        );
        self.failures.push(RecordFailure {
            record,
            error: error.to_string(),
        });
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Whether a paging handler wants another run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    Done,
    Reschedule(Event),
}

/// Result of a handler: its report, follow-up events, and whether it should
/// run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub report: BatchReport,
    pub emitted: Vec<Event>,
    pub continuation: Continuation,
}

impl Outcome {
    pub fn done(report: BatchReport) -> Self {
        Self {
            report,
            emitted: Vec::new(),
            continuation: Continuation::Done,
        }
    }

    pub fn with_emitted(mut self, events: Vec<Event>) -> Self {
        self.emitted = events;
        self
    }

    /// Reschedule `event` when the switch is on, this run made progress
    /// and more work is left than it could take.
    pub fn reschedule_if(mut self, enabled: bool, remaining: bool, event: Event) -> Self {
        if enabled && remaining && self.report.processed > 0 {
            self.continuation = Continuation::Reschedule(event);
        }
        self
    }

    pub fn is_rescheduled(&self) -> bool {
        matches!(self.continuation, Continuation::Reschedule(_))
    }
}
