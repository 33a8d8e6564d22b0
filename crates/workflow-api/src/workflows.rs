//! HTTP routes for the engine-facing external interfaces (`spec.md` §6):
//! upload, `StartWorkflowByVersion`, `Respond`, `Retry`, `SubAction`,
//! `GetState`, `GetInteractionHistory`.

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use serde_json::Value as Json2;
use uuid::Uuid;

use workflow_contracts::{
    ErrorPayload, GetInteractionHistory, GetState, InteractionHistory, InteractionHistoryEntry, Respond, Retry,
    StartWorkflowByVersion, SubAction, UploadResponse, UploadWorkflow, UploadedVersion, WorkflowResponse,
};
use workflow_core::module::SubActionEvent;
use workflow_core::storage::Storage;
use workflow_core::value::Value;
use workflow_engine::engine::{EngineOutcome, ExecutionTarget};
use workflow_engine::refs::{self, VirtualFs};
use workflow_engine::version_store::VersionStore;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/workflows/upload", post(upload_workflow))
        .route("/v1/workflows/start", post(start_workflow))
        .route("/v1/workflows/respond", post(respond))
        .route("/v1/workflows/retry", post(retry))
        .route("/v1/workflows/sub_action", post(sub_action))
        .route("/v1/workflows/:workflow_run_id/state", get(get_state))
        .route("/v1/workflows/:workflow_run_id/interactions", get(interaction_history))
        .with_state(state)
}

/// `GET /healthz` (`spec.md` §6 ambient routes, teacher convention): a
/// liveness probe with no state lookup, distinct from the worker's
/// `/health` which also reports pool status.
async fn healthz() -> Json<Json2> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Serves `$ref` targets from the uploaded bundle's `files` map (`spec.md`
/// §4.2); the root document itself is never referenced this way.
struct BundleFs<'a> {
    files: &'a BTreeMap<String, String>,
}

impl VirtualFs for BundleFs<'_> {
    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).map(|s| s.as_bytes().to_vec())
    }
}

async fn upload_workflow(
    State(state): State<AppState>,
    Json(req): Json<UploadWorkflow>,
) -> Result<Json<UploadResponse>, ApiError> {
    let fs = BundleFs { files: &req.files };
    let resolved = refs::resolve(&req.entry, &fs).map_err(ApiError::from)?;

    let version_store = VersionStore::new(state.storage.as_ref());
    let template = version_store.get_or_create_template(req.user_id, &req.template_name).await?;
    let versions = version_store
        .register_upload(template.template_id, req.source_type, resolved)
        .await
        .map_err(|e| match e {
            workflow_engine::version_store::EngineValidationOrStorage::Validation(v) => ApiError::from(v),
            workflow_engine::version_store::EngineValidationOrStorage::Storage(s) => ApiError::from(s),
        })?;

    Ok(Json(UploadResponse {
        template_id: template.template_id,
        versions: versions
            .into_iter()
            .map(|v| UploadedVersion {
                version_id: v.version_id,
                version_type: v.version_type,
                content_hash: v.content_hash,
                selected_paths: v.selected_paths,
            })
            .collect(),
    }))
}

async fn start_workflow(
    State(state): State<AppState>,
    Json(req): Json<StartWorkflowByVersion>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let version = state
        .storage
        .get_version(req.version_id)
        .await?
        .ok_or_else(|| ApiError::from(workflow_core::error::ValidationError::single("version_id", "no such workflow version")))?;
    let template = state
        .storage
        .get_template(version.template_id)
        .await?
        .ok_or_else(|| ApiError::from(workflow_core::error::ValidationError::single("version_id", "template for version vanished")))?;

    let target = req.target.map(|t| ExecutionTarget {
        step_id: t.step_id,
        module_name: t.module_name,
    });
    let outcome = state
        .engine
        .start_run(template.user_id, template.template_id, req.version_id, target, req.mock)
        .await?;
    Ok(Json(outcome_to_response(outcome)))
}

async fn respond(State(state): State<AppState>, Json(req): Json<Respond>) -> Result<Json<WorkflowResponse>, ApiError> {
    let target = req.target.map(|t| ExecutionTarget {
        step_id: t.step_id,
        module_name: t.module_name,
    });
    let outcome = state
        .engine
        .respond(req.workflow_run_id, req.interaction_id, req.response, req.workflow, target, false)
        .await?;
    Ok(Json(outcome_to_response(outcome)))
}

async fn retry(State(state): State<AppState>, Json(req): Json<Retry>) -> Result<Json<WorkflowResponse>, ApiError> {
    let outcome = state.engine.retry(req.workflow_run_id, req.groups, req.feedback).await?;
    Ok(Json(outcome_to_response(outcome)))
}

async fn get_state(
    State(state): State<AppState>,
    Path(workflow_run_id): Path<Uuid>,
) -> Result<Json<BTreeMap<String, BTreeMap<String, Json2>>>, ApiError> {
    let outputs = state.engine.get_state(workflow_run_id).await?;
    Ok(Json(
        outputs
            .into_iter()
            .map(|(module, values)| (module, values.into_iter().map(|(k, v)| (k, Json2::from(v))).collect()))
            .collect(),
    ))
}

async fn interaction_history(
    State(state): State<AppState>,
    Path(workflow_run_id): Path<Uuid>,
) -> Result<Json<InteractionHistory>, ApiError> {
    let entries = state.engine.get_interaction_history(workflow_run_id).await?;
    let mut completed = Vec::new();
    let mut pending = None;
    for (request, response, requested_at, responded_at) in entries {
        match response {
            Some(response) => completed.push(InteractionHistoryEntry {
                request,
                response: Some(response),
                requested_at,
                responded_at,
            }),
            None => pending = Some(request),
        }
    }
    Ok(Json(InteractionHistory { completed, pending }))
}

/// `SubAction`: streams the sub-action's event generator as SSE (`spec.md`
/// §6 wire format: `event: <type>\ndata: <json>\n\n`), one `Event` per item
/// the engine's stream yields — the client sees `started`/`progress` as
/// they happen rather than only once the sub-action finishes.
async fn sub_action(
    State(state): State<AppState>,
    Json(req): Json<SubAction>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let events = state
        .engine
        .sub_action(req.workflow_run_id, req.interaction_id, &req.action_id, req.params)
        .await?;

    let sse_stream = events.map(|result| {
        Ok(match result {
            Ok(event) => sub_action_event_to_sse(&event),
            Err(e) => SseEvent::default()
                .event("error")
                .data(serde_json::json!({"message": e.to_string()}).to_string()),
        })
    });
    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

fn sub_action_event_to_sse(event: &SubActionEvent) -> SseEvent {
    let (name, data) = match event {
        SubActionEvent::Started => ("started", serde_json::json!({})),
        SubActionEvent::Progress { message, elapsed_ms } => {
            ("progress", serde_json::json!({"message": message, "elapsed_ms": elapsed_ms}))
        }
        SubActionEvent::Interaction { request } => ("interaction", serde_json::json!({"request": request})),
        SubActionEvent::Complete { result } => ("complete", result.clone()),
        SubActionEvent::Error { message } => ("error", serde_json::json!({"message": message})),
        SubActionEvent::Cancelled => ("cancelled", serde_json::json!({})),
        SubActionEvent::ValidationFailed { issues } => ("validation_failed", serde_json::json!({"issues": issues})),
        SubActionEvent::StateSnapshot { state } => ("state_snapshot", serde_json::json!({"state": state})),
        SubActionEvent::StateUpdate { state } => ("state_update", serde_json::json!({"state": state})),
    };
    SseEvent::default().event(name).data(data.to_string())
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

fn module_outputs_to_json(outputs: &BTreeMap<String, Value>) -> Json2 {
    Json2::Object(outputs.iter().map(|(k, v)| (k.clone(), Json2::from(v.clone()))).collect())
}
