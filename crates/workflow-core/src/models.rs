//! Canonical domain model (`spec.md` §3). These are the types every
//! `Storage` implementation (Postgres-backed or in-memory) produces and
//! consumes; backend-specific row types live in their own crates and map
//! into these at the repository boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub credentials: Json,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub template_id: Uuid,
    pub user_id: Uuid,
    pub template_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Json,
    Zip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    Raw,
    Unresolved,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub capability: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub version_id: Uuid,
    pub template_id: Uuid,
    pub content_hash: String,
    pub source_type: SourceType,
    pub version_type: VersionType,
    pub parent_workflow_version_id: Option<Uuid>,
    pub requires: Vec<CapabilityRequirement>,
    pub resolved_workflow: Json,
    pub selected_paths: std::collections::BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Processing,
    AwaitingInput,
    Completed,
    Error,
    ValidationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_run_id: Uuid,
    pub template_id: Uuid,
    pub user_id: Uuid,
    pub current_workflow_version_id: Uuid,
    pub current_branch_id: Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One hop in a branch's lineage: the branch id and the event id in that
/// branch beyond which events are invisible to descendants. `None` only on
/// the lineage's final (self) entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineageEntry {
    pub branch_id: Uuid,
    pub cutoff_event_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: Uuid,
    pub workflow_run_id: Uuid,
    /// Root-first, self-last.
    pub lineage: Vec<LineageEntry>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn root_branch_id(&self) -> Option<Uuid> {
        self.lineage.first().map(|e| e.branch_id)
    }

    /// Validates the invariants from `spec.md` §3 (Branch):
    /// - non-empty
    /// - first entry is some root, last entry is self with no cutoff
    /// - cutoffs are monotone non-decreasing
    pub fn validate(&self) -> Result<(), String> {
        let Some(last) = self.lineage.last() else {
            return Err("lineage is empty".into());
        };
        if last.branch_id != self.branch_id {
            return Err("last lineage entry must be the branch itself".into());
        }
        if last.cutoff_event_id.is_some() {
            return Err("last lineage entry must have no cutoff".into());
        }
        for entry in &self.lineage[..self.lineage.len() - 1] {
            if entry.cutoff_event_id.is_none() {
                return Err(format!(
                    "non-terminal lineage entry {} must have a cutoff",
                    entry.branch_id
                ));
            }
        }
        let mut previous_cutoff: Option<Uuid> = None;
        for entry in &self.lineage {
            if let (Some(prev), Some(cur)) = (previous_cutoff, entry.cutoff_event_id) {
                if cur < prev {
                    return Err("cutoffs must be monotone non-decreasing along lineage".into());
                }
            }
            if entry.cutoff_event_id.is_some() {
                previous_cutoff = entry.cutoff_event_id;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowCreated,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowError,
    WorkflowRecovered,
    StepStarted,
    StepCompleted,
    StepError,
    ModuleStarted,
    ModuleCompleted,
    ModuleError,
    InteractionRequested,
    InteractionResponse,
    RetryRequested,
    JumpBackRequested,
    OutputStored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub workflow_run_id: Uuid,
    pub branch_id: Uuid,
    pub workflow_version_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<String>,
    pub module_name: Option<String>,
    pub data: Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Root,
    Outputs,
    ApiCalls,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Json,
    BinaryRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    pub file_id: Uuid,
    pub workflow_run_id: Uuid,
    pub branch_id: Uuid,
    pub category: FileCategory,
    pub group_id: Option<String>,
    pub filename: String,
    pub content_type: ContentType,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub elapsed_ms: i64,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub error_type: String,
    pub message: String,
    pub details: Json,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueTask {
    pub task_id: Uuid,
    pub actor: String,
    pub payload: Json,
    pub status: TaskStatus,
    pub concurrency_group: String,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub progress: Option<TaskProgress>,
    pub result: Option<Json>,
    pub error: Option<TaskError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub generation_id: Uuid,
    pub workflow_run_id: Uuid,
    pub branch_id: Uuid,
    pub task_id: Uuid,
    pub provider: String,
    pub model: String,
    pub prompt: Json,
    pub params: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub content_id: Uuid,
    pub generation_id: Uuid,
    pub kind: String,
    pub uri_or_ref: String,
    pub content_type: String,
    pub metadata: Json,
}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $str:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(<$ty>::$variant => $str),+
                }
            }

            pub fn parse_str(s: &str) -> Result<Self, String> {
                match s {
                    $($str => Ok(<$ty>::$variant),)+
                    other => Err(format!("unknown {} variant: {other}", stringify!($ty))),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

string_enum!(SourceType {
    Json => "json",
    Zip => "zip",
});

string_enum!(VersionType {
    Raw => "raw",
    Unresolved => "unresolved",
    Resolved => "resolved",
});

string_enum!(RunStatus {
    Created => "created",
    Processing => "processing",
    AwaitingInput => "awaiting_input",
    Completed => "completed",
    Error => "error",
    ValidationFailed => "validation_failed",
});

string_enum!(EventType {
    WorkflowCreated => "workflow_created",
    WorkflowResumed => "workflow_resumed",
    WorkflowCompleted => "workflow_completed",
    WorkflowError => "workflow_error",
    WorkflowRecovered => "workflow_recovered",
    StepStarted => "step_started",
    StepCompleted => "step_completed",
    StepError => "step_error",
    ModuleStarted => "module_started",
    ModuleCompleted => "module_completed",
    ModuleError => "module_error",
    InteractionRequested => "interaction_requested",
    InteractionResponse => "interaction_response",
    RetryRequested => "retry_requested",
    JumpBackRequested => "jump_back_requested",
    OutputStored => "output_stored",
});

string_enum!(FileCategory {
    Root => "root",
    Outputs => "outputs",
    ApiCalls => "api_calls",
    Other => "other",
});

string_enum!(ContentType {
    Text => "text",
    Json => "json",
    BinaryRef => "binary_ref",
});

string_enum!(TaskStatus {
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(lineage: Vec<LineageEntry>, id: Uuid) -> Branch {
        Branch {
            branch_id: id,
            workflow_run_id: Uuid::now_v7(),
            lineage,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn validates_single_entry_root_branch() {
        let id = Uuid::now_v7();
        let b = branch(
            vec![LineageEntry {
                branch_id: id,
                cutoff_event_id: None,
            }],
            id,
        );
        assert!(b.validate().is_ok());
    }

    #[test]
    fn rejects_non_terminal_entry_without_cutoff() {
        let root = Uuid::now_v7();
        let child = Uuid::now_v7();
        let b = branch(
            vec![
                LineageEntry {
                    branch_id: root,
                    cutoff_event_id: None,
                },
                LineageEntry {
                    branch_id: child,
                    cutoff_event_id: None,
                },
            ],
            child,
        );
        assert!(b.validate().is_err());
    }

    #[test]
    fn rejects_decreasing_cutoffs() {
        let root = Uuid::now_v7();
        let mid = Uuid::now_v7();
        let tip = Uuid::now_v7();
        let late_cutoff = Uuid::now_v7();
        let early_cutoff = Uuid::now_v7();
        // intentionally construct late > early in id terms, but place the
        // later-generated id as the *earlier* ancestor's cutoff to trigger
        // the monotonicity check.
        let b = branch(
            vec![
                LineageEntry {
                    branch_id: root,
                    cutoff_event_id: Some(late_cutoff),
                },
                LineageEntry {
                    branch_id: mid,
                    cutoff_event_id: Some(early_cutoff),
                },
                LineageEntry {
                    branch_id: tip,
                    cutoff_event_id: None,
                },
            ],
            tip,
        );
        if late_cutoff > early_cutoff {
            assert!(b.validate().is_err());
        }
    }
}
