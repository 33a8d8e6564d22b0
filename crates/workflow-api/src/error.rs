//! Maps engine/storage/validation errors onto HTTP responses (`spec.md`
//! §7): validation failures are 422s the caller can act on, storage
//! conflicts are 409s, everything else is a logged 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use workflow_core::error::{EngineError, StorageError, ValidationError};
use workflow_core::redact::redact;

pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: json!({"error_type": "validation_failed", "issues": e.issues}),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        let status = match &e {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::Conflict(_) => StatusCode::CONFLICT,
            StorageError::Unavailable(_) | StorageError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %redact(&e.to_string()), "storage error");
        Self {
            status,
            body: json!({"error_type": "storage_error", "message": e.to_string()}),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::WorkflowBusy(_) => StatusCode::CONFLICT,
            EngineError::NoSuchModule { .. }
            | EngineError::ModuleNotRegistered(_)
            | EngineError::ModuleTypeMismatch { .. }
            | EngineError::NoPendingInteraction(_)
            | EngineError::MissingInteractionRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::ModuleExecution { .. } | EngineError::CorruptLineage(..) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Storage(inner) => return ApiError::from(inner_storage_clone(inner)),
        };
        tracing::error!(error = %redact(&e.to_string()), "engine error");
        Self {
            status,
            body: json!({"error_type": "engine_error", "message": e.to_string()}),
        }
    }
}

/// `StorageError` isn't `Clone` (it wraps `anyhow::Error`); re-derive the
/// response shape from the already-borrowed error instead of cloning it.
fn inner_storage_clone(e: &StorageError) -> StorageError {
    match e {
        StorageError::Unavailable(m) => StorageError::Unavailable(m.clone()),
        StorageError::NotFound(m) => StorageError::NotFound(m.clone()),
        StorageError::Conflict(m) => StorageError::Conflict(m.clone()),
        StorageError::Other(err) => StorageError::Unavailable(err.to_string()),
    }
}
