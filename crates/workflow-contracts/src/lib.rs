//! Wire-shaped request/response DTOs for the external interfaces in
//! `spec.md` §6. These are transport-agnostic: `workflow-api` serializes
//! them over HTTP/SSE, but nothing here depends on axum.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use uuid::Uuid;
use workflow_core::module::{InteractionRequest, InteractionResponse};

/// Upload a workflow bundle (`spec.md` §4.2): `entry` is the root JSON
/// document; `files` carries any additional bundle entries `$ref`s may point
/// at, keyed by absolute virtual-filesystem path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadWorkflow {
    pub user_id: Uuid,
    pub template_name: String,
    pub source_type: workflow_core::models::SourceType,
    pub entry: Json,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedVersion {
    pub version_id: Uuid,
    pub version_type: workflow_core::models::VersionType,
    pub content_hash: String,
    #[serde(default)]
    pub selected_paths: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub template_id: Uuid,
    pub versions: Vec<UploadedVersion>,
}

/// `StartWorkflowByVersion { version_id, project_name?, ai_config?, target? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowByVersion {
    pub version_id: Uuid,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub ai_config: Option<Json>,
    #[serde(default)]
    pub target: Option<ExecutionTargetDto>,
    #[serde(default)]
    pub mock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTargetDto {
    pub step_id: String,
    pub module_name: String,
}

/// `Respond { workflow_run_id, interaction_id, response }`. `workflow` is an
/// optional updated workflow JSON that triggers a mid-run version update
/// (`spec.md` §4.3 "Mid-run version update").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Respond {
    pub workflow_run_id: Uuid,
    pub interaction_id: Uuid,
    pub response: InteractionResponse,
    #[serde(default)]
    pub workflow: Option<Json>,
    #[serde(default)]
    pub target: Option<ExecutionTargetDto>,
}

/// `Retry { workflow_run_id, groups?, feedback? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retry {
    pub workflow_run_id: Uuid,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetState {
    pub workflow_run_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInteractionHistory {
    pub workflow_run_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionHistoryEntry {
    pub request: InteractionRequest,
    pub response: Option<InteractionResponse>,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub responded_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionHistory {
    pub completed: Vec<InteractionHistoryEntry>,
    pub pending: Option<InteractionRequest>,
}

/// `SubAction { workflow_run_id, interaction_id, action_id, params }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAction {
    pub workflow_run_id: Uuid,
    pub interaction_id: Uuid,
    pub action_id: String,
    #[serde(default)]
    pub params: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Progress {
    pub current_step: Option<String>,
    pub current_module: Option<String>,
    pub completed_steps: i64,
    pub total_steps: i64,
    pub step_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_type: String,
    pub message: String,
    pub details: Json,
}

/// The canonical response shape every engine-facing call returns
/// (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub workflow_run_id: Uuid,
    pub status: workflow_core::models::RunStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub interaction_request: Option<InteractionRequest>,
    #[serde(default)]
    pub result: Option<BTreeMap<String, Json>>,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub validation_errors: Vec<workflow_core::error::ValidationIssue>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,
}

impl WorkflowResponse {
    pub fn processing(workflow_run_id: Uuid) -> Self {
        Self {
            workflow_run_id,
            status: workflow_core::models::RunStatus::Processing,
            message: None,
            progress: None,
            interaction_request: None,
            result: None,
            error: None,
            validation_errors: Vec::new(),
            validation_warnings: Vec::new(),
        }
    }
}

/// `VirtualStart { workflow, virtual_db?, target_step, target_module, mock? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualStart {
    pub workflow: Json,
    #[serde(default)]
    pub virtual_db: Option<String>,
    pub target_step: String,
    pub target_module: String,
    #[serde(default)]
    pub mock: bool,
    #[serde(default)]
    pub project_name: Option<String>,
}

/// `VirtualRespond { workflow, virtual_db, run_id, target, interaction_id, response, mock? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualRespond {
    #[serde(default)]
    pub workflow: Option<Json>,
    pub virtual_db: String,
    pub run_id: Uuid,
    pub target_step: String,
    pub target_module: String,
    pub interaction_id: Uuid,
    pub response: InteractionResponse,
    #[serde(default)]
    pub mock: bool,
}

/// The engine response plus the opaque, gzip+base64 round-trip blob
/// (`spec.md` §4.6, §7: "the virtual-sandbox blob ... so the caller never
/// loses state on failure").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualResponse {
    #[serde(flatten)]
    pub response: WorkflowResponse,
    pub virtual_db: String,
}
