//! Engine-level error taxonomy.
//!
//! TLE / MLE はエラーではなく終端ステータスとして扱うので、ここには現れません。

use thiserror::Error;

use super::ids::InstanceId;
use super::settings::SettingsError;
use super::status::TaskStatus;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Sharing quota exhausted for a new user.
    #[error("resource unavailable: template {template} is shared by {holders}/{limit} users")]
    AdmissionDenied {
        template: String,
        holders: usize,
        limit: u32,
    },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Transient orchestrator failure that outlived the retry budget.
    #[error("orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] TransitionError),

    #[error("engine is not ready")]
    NotReady,

    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    #[error("settings name already exists: {0}")]
    DuplicateName(String),

    /// Template is still referenced by task instances.
    #[error("cannot delete task settings associated with {0} task(s)")]
    Protected(usize),
}

impl EngineError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}

/// Rejected compare-and-set on a registry row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// Row moved on since the caller last observed it.
    #[error("instance {id}: expected {expected}, found {actual}")]
    Conflict {
        id: InstanceId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("instance {id}: {from} -> {to} is not a valid transition")]
    Invalid {
        id: InstanceId,
        from: TaskStatus,
        to: TaskStatus,
    },
}
