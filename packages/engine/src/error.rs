//! Structured error types for the workflow engine.
//!
//! `EngineError` provides pattern-matchable errors instead of generic
//! `anyhow::Error` for the conditions callers branch on: lost leases,
//! unavailable advisory locks, wait timeouts, and installer conflicts.
//! Everything else flows through `anyhow` and is recorded as an opaque
//! `{message, type}` document on the failed run.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The worker no longer owns the run (another worker reclaimed it or the
    /// lease expired). Any further writes for this run must be abandoned.
    #[error("worker {worker_id} lost lease/ownership of run {run_id}")]
    LostLease { run_id: Uuid, worker_id: String },

    /// Non-blocking advisory lock acquisition failed.
    #[error("advisory lock unavailable: {key}")]
    LockUnavailable { key: String },

    /// `wait_runs` exceeded its timeout.
    #[error("timeout waiting for child runs (policy={policy}, timeout={timeout_secs}s)")]
    WaitTimeout { policy: String, timeout_secs: f64 },

    /// One or more child runs reached FAILED/CANCELLED under a policy that
    /// cannot be satisfied anymore.
    #[error("{} child run(s) failed (policy={policy}): {failed:?}", .failed.len())]
    ChildRunsFailed { policy: String, failed: Vec<Uuid> },

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("blueprint not found: {0}")]
    BlueprintNotFound(String),

    /// A pre-finalization check failed (missing required field).
    #[error("invariant violation on {field}: {message}")]
    InvariantViolation { field: String, message: String },

    #[error("pack not found: {0}")]
    PackNotFound(String),

    #[error("pack '{pack_ref}' is already installed in environment '{env_id}'")]
    PackAlreadyInstalled { pack_ref: String, env_id: String },

    #[error("pack '{pack_ref}' installation is already in progress in environment '{env_id}'")]
    PackInstallInProgress { pack_ref: String, env_id: String },

    #[error("pack '{pack_ref}' installation previously failed in environment '{env_id}', retry or cleanup required")]
    PackInstallPreviouslyFailed { pack_ref: String, env_id: String },

    /// The installation record is claimed by a different run.
    #[error("installation is owned by run {actual:?}, not {expected}")]
    PackInstallConflict { expected: Uuid, actual: Option<Uuid> },
}

impl EngineError {
    /// Short machine-readable kind, recorded as `error.type` on failed runs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::LostLease { .. } => "LostLease",
            EngineError::LockUnavailable { .. } => "LockUnavailable",
            EngineError::WaitTimeout { .. } => "Timeout",
            EngineError::ChildRunsFailed { .. } => "ChildRunsFailed",
            EngineError::RunNotFound(_) => "RunNotFound",
            EngineError::BlueprintNotFound(_) => "BlueprintNotFound",
            EngineError::InvariantViolation { .. } => "InvariantViolation",
            EngineError::PackNotFound(_) => "PackNotFound",
            EngineError::PackAlreadyInstalled { .. } => "PackAlreadyInstalled",
            EngineError::PackInstallInProgress { .. } => "PackInstallInProgress",
            EngineError::PackInstallPreviouslyFailed { .. } => "PackInstallPreviouslyFailed",
            EngineError::PackInstallConflict { .. } => "PackInstallConflict",
        }
    }
}

/// Whether an error chain contains a lost-lease condition.
///
/// Used where the executor must distinguish "we were demoted, stop quietly"
/// from a genuine blueprint failure.
pub fn is_lost_lease(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<EngineError>(),
        Some(EngineError::LostLease { .. })
    )
}

/// Build the `{message, type}` error document stored on terminal FAILED rows.
pub fn error_document(error: &anyhow::Error) -> serde_json::Value {
    let kind = error
        .downcast_ref::<EngineError>()
        .map(|e| e.kind())
        .unwrap_or("Error");
    serde_json::json!({
        "message": error.to_string(),
        "type": kind,
    })
}
