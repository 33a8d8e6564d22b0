//! Error taxonomy (`spec.md` §7). One `thiserror` enum per failure kind;
//! layers above compose these rather than inventing new categories.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// `{path, message}` entry for a failed validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Malformed request, unknown module id, unresolvable `$ref`, circular
/// reference, path traversal, schema mismatch. Never mutates run state.
#[derive(Debug, Error)]
#[error("validation failed: {} issue(s)", .issues.len())]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue::new(path, message)],
        }
    }
}

/// Execution-boundary, module-execution, interaction, concurrency, and
/// resume-time errors raised while driving a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such step/module: {step_id}/{module_name}")]
    NoSuchModule { step_id: String, module_name: String },

    #[error("module '{0}' is not registered")]
    ModuleNotRegistered(String),

    #[error("module type mismatch for '{module_name}': expected {expected}, found {found}")]
    ModuleTypeMismatch {
        module_name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("module '{module_name}' raised an error: {message}")]
    ModuleExecution {
        module_name: String,
        error_type: String,
        message: String,
        details: serde_json::Value,
    },

    #[error("run {0} has no pending interaction to respond to")]
    NoPendingInteraction(Uuid),

    #[error("interactive module '{0}' emitted no interaction_requested event before suspending")]
    MissingInteractionRequest(String),

    #[error("workflow busy: run {0} already has a call in progress")]
    WorkflowBusy(Uuid),

    #[error("branch lineage for run {0} is corrupted: {1}")]
    CorruptLineage(Uuid, String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Authentication, rate limiting, credits, timeouts, generation/download
/// failures surfaced by the task queue to a module.
#[derive(Debug, Error, Clone, Serialize)]
#[error("{error_type}: {message}")]
pub struct QueueError {
    pub error_type: String,
    pub message: String,
    pub details: serde_json::Value,
    pub retry_after_ms: Option<u64>,
}

/// Storage unavailable, corrupted lineage (self-referential/missing root).
/// No automatic recovery; the caller's call aborts and the error is logged.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
