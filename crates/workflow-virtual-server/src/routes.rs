//! HTTP routes for the virtual execution sandbox (`spec.md` §4.6):
//! `VirtualStart` and `VirtualRespond`. Every call gets a fresh
//! `MemoryStorage` namespace decoded from the caller's `virtual_db` blob (or
//! an empty one on first call) and hands back the updated blob alongside
//! the usual engine response — the caller, not this process, owns state.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use workflow_contracts::{ErrorPayload, VirtualRespond, VirtualResponse, VirtualStart, WorkflowResponse};
use workflow_core::models::{CapabilityRequirement, SourceType, VersionType};
use workflow_core::redact::redact;
use workflow_core::storage::Storage;
use workflow_core::value::Value;
use workflow_engine::engine::{EngineOutcome, ExecutionTarget};
use workflow_engine::version_store::VersionStore;
use workflow_sandbox::MemoryStorage;

use crate::blob_codec::{decode, encode, VirtualDbError};
use crate::engine_setup::build_engine;

pub fn routes() -> Router {
    Router::new()
        .route("/v1/virtual/start", post(virtual_start))
        .route("/v1/virtual/respond", post(virtual_respond))
}

struct ApiError(StatusCode, serde_json::Value);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

impl From<VirtualDbError> for ApiError {
    fn from(e: VirtualDbError) -> Self {
        ApiError(StatusCode::BAD_REQUEST, json!({"error_type": "invalid_virtual_db", "message": e.to_string()}))
    }
}

impl From<workflow_core::error::ValidationError> for ApiError {
    fn from(e: workflow_core::error::ValidationError) -> Self {
        ApiError(StatusCode::UNPROCESSABLE_ENTITY, json!({"error_type": "validation_failed", "issues": e.issues}))
    }
}

impl From<workflow_core::error::StorageError> for ApiError {
    fn from(e: workflow_core::error::StorageError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, json!({"error_type": "storage_error", "message": e.to_string()}))
    }
}

impl From<workflow_core::error::EngineError> for ApiError {
    fn from(e: workflow_core::error::EngineError) -> Self {
        tracing::error!(error = %redact(&e.to_string()), "virtual engine error");
        ApiError(StatusCode::BAD_REQUEST, json!({"error_type": "engine_error", "message": e.to_string()}))
    }
}

/// A fixed synthetic owner for every virtual run: the sandbox namespace is
/// single-tenant by construction (`spec.md` §4.6), so there is no real user.
const VIRTUAL_USER_ID: Uuid = Uuid::nil();

async fn virtual_start(Json(req): Json<VirtualStart>) -> Result<Json<VirtualResponse>, ApiError> {
    let storage = Arc::new(MemoryStorage::new());
    let engine = build_engine(storage.clone());

    let version_store = VersionStore::new(storage.as_ref());
    let template = version_store
        .get_or_create_template(VIRTUAL_USER_ID, req.project_name.as_deref().unwrap_or("virtual"))
        .await?;
    let (version, _) = version_store
        .get_or_create_version(
            template.template_id,
            SourceType::Json,
            VersionType::Raw,
            None,
            Vec::<CapabilityRequirement>::new(),
            BTreeMap::new(),
            req.workflow,
        )
        .await?;

    let target = Some(ExecutionTarget {
        step_id: req.target_step,
        module_name: req.target_module,
    });
    let outcome = engine
        .start_run(VIRTUAL_USER_ID, template.template_id, version.version_id, target, req.mock)
        .await?;

    let virtual_db = encode(&storage).await?;
    Ok(Json(VirtualResponse {
        response: outcome_to_response(outcome),
        virtual_db,
    }))
}

async fn virtual_respond(Json(req): Json<VirtualRespond>) -> Result<Json<VirtualResponse>, ApiError> {
    let storage = Arc::new(decode(&req.virtual_db).await?);
    let engine = build_engine(storage.clone());

    let target = Some(ExecutionTarget {
        step_id: req.target_step,
        module_name: req.target_module,
    });
    let outcome = engine
        .respond(req.run_id, req.interaction_id, req.response, req.workflow, target, req.mock)
        .await?;

    let virtual_db = encode(&storage).await?;
    Ok(Json(VirtualResponse {
        response: outcome_to_response(outcome),
        virtual_db,
    }))
}

fn outcome_to_response(outcome: EngineOutcome) -> WorkflowResponse {
    WorkflowResponse {
        workflow_run_id: outcome.workflow_run_id,
        status: outcome.status,
        message: outcome.message,
        progress: Some(workflow_contracts::Progress {
            current_step: outcome.progress.current_step,
            current_module: outcome.progress.current_module,
            completed_steps: outcome.progress.completed_steps,
            total_steps: outcome.progress.total_steps,
            step_index: outcome.progress.step_index,
        }),
        interaction_request: outcome.interaction_request,
        result: outcome.result.map(|modules| {
            modules
                .into_iter()
                .map(|(name, outputs)| (name, module_outputs_to_json(&outputs)))
                .collect()
        }),
        error: None::<ErrorPayload>,
        validation_errors: Vec::new(),
        validation_warnings: Vec::new(),
    }
}

fn module_outputs_to_json(outputs: &BTreeMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(outputs.iter().map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone()))).collect())
}
