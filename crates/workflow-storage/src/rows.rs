//! sqlx row types and their mapping to the canonical domain model
//! (`workflow_core::models`). Kept distinct from the domain types so the
//! wire-shaped storage columns (flattened progress/error fields, JSONB
//! blobs) don't leak past this crate's boundary.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::FromRow;
use uuid::Uuid;
use workflow_core::error::StorageError;
use workflow_core::models::*;

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub credentials: Json,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        User {
            user_id: r.user_id,
            credentials: r.credentials,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TemplateRow {
    pub template_id: Uuid,
    pub user_id: Uuid,
    pub template_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<TemplateRow> for WorkflowTemplate {
    fn from(r: TemplateRow) -> Self {
        WorkflowTemplate {
            template_id: r.template_id,
            user_id: r.user_id,
            template_name: r.template_name,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct VersionRow {
    pub version_id: Uuid,
    pub template_id: Uuid,
    pub content_hash: String,
    pub source_type: String,
    pub version_type: String,
    pub parent_workflow_version_id: Option<Uuid>,
    pub requires: Json,
    pub resolved_workflow: Json,
    pub selected_paths: Json,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for WorkflowVersion {
    type Error = StorageError;

    fn try_from(r: VersionRow) -> Result<Self, Self::Error> {
        let requires: Vec<CapabilityRequirement> = serde_json::from_value(r.requires)
            .map_err(|e| StorageError::Other(e.into()))?;
        let selected_paths: std::collections::BTreeMap<String, String> =
            serde_json::from_value(r.selected_paths).map_err(|e| StorageError::Other(e.into()))?;
        Ok(WorkflowVersion {
            version_id: r.version_id,
            template_id: r.template_id,
            content_hash: r.content_hash,
            source_type: SourceType::parse_str(&r.source_type).map_err(StorageError::Unavailable)?,
            version_type: VersionType::parse_str(&r.version_type)
                .map_err(StorageError::Unavailable)?,
            parent_workflow_version_id: r.parent_workflow_version_id,
            requires,
            resolved_workflow: r.resolved_workflow,
            selected_paths,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub workflow_run_id: Uuid,
    pub template_id: Uuid,
    pub user_id: Uuid,
    pub current_workflow_version_id: Uuid,
    pub current_branch_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = StorageError;

    fn try_from(r: RunRow) -> Result<Self, Self::Error> {
        Ok(WorkflowRun {
            workflow_run_id: r.workflow_run_id,
            template_id: r.template_id,
            user_id: r.user_id,
            current_workflow_version_id: r.current_workflow_version_id,
            current_branch_id: r.current_branch_id,
            status: RunStatus::parse_str(&r.status).map_err(StorageError::Unavailable)?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BranchRow {
    pub branch_id: Uuid,
    pub workflow_run_id: Uuid,
    pub lineage: Json,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<BranchRow> for Branch {
    type Error = StorageError;

    fn try_from(r: BranchRow) -> Result<Self, Self::Error> {
        let lineage: Vec<LineageEntry> =
            serde_json::from_value(r.lineage).map_err(|e| StorageError::Other(e.into()))?;
        Ok(Branch {
            branch_id: r.branch_id,
            workflow_run_id: r.workflow_run_id,
            lineage,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub event_id: Uuid,
    pub workflow_run_id: Uuid,
    pub branch_id: Uuid,
    pub workflow_version_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<String>,
    pub module_name: Option<String>,
    pub data: Json,
}

impl TryFrom<EventRow> for Event {
    type Error = StorageError;

    fn try_from(r: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            event_id: r.event_id,
            workflow_run_id: r.workflow_run_id,
            branch_id: r.branch_id,
            workflow_version_id: r.workflow_version_id,
            event_type: EventType::parse_str(&r.event_type).map_err(StorageError::Unavailable)?,
            timestamp: r.timestamp,
            step_id: r.step_id,
            module_name: r.module_name,
            data: r.data,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: Uuid,
    pub workflow_run_id: Uuid,
    pub branch_id: Uuid,
    pub category: String,
    pub group_id: Option<String>,
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

impl TryFrom<FileRow> for WorkflowFile {
    type Error = StorageError;

    fn try_from(r: FileRow) -> Result<Self, Self::Error> {
        Ok(WorkflowFile {
            file_id: r.file_id,
            workflow_run_id: r.workflow_run_id,
            branch_id: r.branch_id,
            category: FileCategory::parse_str(&r.category).map_err(StorageError::Unavailable)?,
            group_id: r.group_id,
            filename: r.filename,
            content_type: ContentType::parse_str(&r.content_type)
                .map_err(StorageError::Unavailable)?,
            content: r.content,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueTaskRow {
    pub task_id: Uuid,
    pub actor: String,
    pub payload: Json,
    pub status: String,
    pub concurrency_group: String,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub progress_elapsed_ms: Option<i64>,
    pub progress_message: Option<String>,
    pub progress_updated_at: Option<DateTime<Utc>>,
    pub result: Option<Json>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<Json>,
    pub error_stack: Option<String>,
}

impl TryFrom<QueueTaskRow> for QueueTask {
    type Error = StorageError;

    fn try_from(r: QueueTaskRow) -> Result<Self, Self::Error> {
        let progress = match (r.progress_elapsed_ms, r.progress_message, r.progress_updated_at) {
            (Some(elapsed_ms), Some(message), Some(updated_at)) => Some(TaskProgress {
                elapsed_ms,
                message,
                updated_at,
            }),
            _ => None,
        };
        let error = match (r.error_type, r.error_message) {
            (Some(error_type), Some(message)) => Some(TaskError {
                error_type,
                message,
                details: r.error_details.unwrap_or(Json::Null),
                stack: r.error_stack,
            }),
            _ => None,
        };
        Ok(QueueTask {
            task_id: r.task_id,
            actor: r.actor,
            payload: r.payload,
            status: TaskStatus::parse_str(&r.status).map_err(StorageError::Unavailable)?,
            concurrency_group: r.concurrency_group,
            worker_id: r.worker_id,
            created_at: r.created_at,
            claimed_at: r.claimed_at,
            heartbeat_at: r.heartbeat_at,
            progress,
            result: r.result,
            error,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GenerationRow {
    pub generation_id: Uuid,
    pub workflow_run_id: Uuid,
    pub branch_id: Uuid,
    pub task_id: Uuid,
    pub provider: String,
    pub model: String,
    pub prompt: Json,
    pub params: Json,
}

impl From<GenerationRow> for GenerationMetadata {
    fn from(r: GenerationRow) -> Self {
        GenerationMetadata {
            generation_id: r.generation_id,
            workflow_run_id: r.workflow_run_id,
            branch_id: r.branch_id,
            task_id: r.task_id,
            provider: r.provider,
            model: r.model,
            prompt: r.prompt,
            params: r.params,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ContentItemRow {
    pub content_id: Uuid,
    pub generation_id: Uuid,
    pub kind: String,
    pub uri_or_ref: String,
    pub content_type: String,
    pub metadata: Json,
}

impl From<ContentItemRow> for ContentItem {
    fn from(r: ContentItemRow) -> Self {
        ContentItem {
            content_id: r.content_id,
            generation_id: r.generation_id,
            kind: r.kind,
            uri_or_ref: r.uri_or_ref,
            content_type: r.content_type,
            metadata: r.metadata,
        }
    }
}
