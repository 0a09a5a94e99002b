//! zoekt-reconcile — the reconciliation engine of the Zoekt control plane.
//!
//! Keeps the fleet of search nodes converged: replica counts per enabled
//! namespace, storage reservations and watermarks per index, the lifecycle
//! of indices and repositories, and the node task queue.
//!
//! Work arrives as [`Event`]s on an [`EventBus`]. The [`Worker`] hands each
//! one to the [`Reconciler`], which runs a small bounded batch against the
//! [`StateStore`](zoekt_state::StateStore) and reports what it did.

pub mod bus;
pub mod directory;
pub mod error;
pub mod events;
mod handlers;
pub mod report;
pub mod tasks;
pub mod watermark;
pub mod worker;

pub use bus::{EventBus, InMemoryEventBus};
pub use directory::{NamespaceDirectory, StaticDirectory, Subscription, TenantRecord};
pub use error::{ReconcileError, ReconcileResult};
pub use events::{Delivery, Event};
pub use handlers::Reconciler;
pub use report::{BatchReport, Continuation, Outcome, RecordFailure, RecordRef};
pub use tasks::{report_task_result, RunTask, TaskDispatcher, TaskFuture, TaskOutcome};
pub use worker::Worker;
