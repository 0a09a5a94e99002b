//! Error types for the reconciliation engine.

use thiserror::Error;
use zoekt_state::StateError;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Failures that abort a whole handler invocation.
///
/// Record-level problems never surface here; handlers collect them into a
/// [`BatchReport`](crate::report::BatchReport) and move on.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unknown watermark level: {0}")]
    UnknownWatermark(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("namespace directory error: {0}")]
    Directory(#[from] anyhow::Error),
}
