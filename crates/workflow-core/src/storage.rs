//! The `Storage` trait: the single seam between the engine/queue/sandbox and
//! a concrete backend. `workflow-storage::PgStorage` and
//! `workflow-sandbox::MemoryStorage` both implement it, so
//! `workflow_engine::Engine<S: Storage>` runs unmodified against either.

use crate::error::StorageResult;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub module_name: Option<String>,
    pub step_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // -- Users --------------------------------------------------------
    async fn create_user(&self, credentials: Json) -> StorageResult<User>;
    async fn get_user(&self, user_id: Uuid) -> StorageResult<Option<User>>;

    // -- Templates ------------------------------------------------------
    async fn get_or_create_template(
        &self,
        user_id: Uuid,
        template_name: &str,
    ) -> StorageResult<WorkflowTemplate>;
    async fn get_template(&self, template_id: Uuid) -> StorageResult<Option<WorkflowTemplate>>;

    // -- Versions ---------------------------------------------------------
    async fn get_version_by_hash(
        &self,
        template_id: Uuid,
        content_hash: &str,
    ) -> StorageResult<Option<WorkflowVersion>>;
    async fn insert_version(&self, version: WorkflowVersion) -> StorageResult<WorkflowVersion>;
    async fn get_version(&self, version_id: Uuid) -> StorageResult<Option<WorkflowVersion>>;

    // -- Runs ---------------------------------------------------------
    async fn create_run(&self, run: WorkflowRun) -> StorageResult<WorkflowRun>;
    async fn get_run(&self, workflow_run_id: Uuid) -> StorageResult<Option<WorkflowRun>>;
    /// Optimistic-concurrency update: succeeds only if the stored run's
    /// `updated_at` still equals `expected_updated_at`. `spec.md` §4.3:
    /// "at most one successful response" for concurrent resume calls.
    async fn update_run(
        &self,
        workflow_run_id: Uuid,
        expected_updated_at: DateTime<Utc>,
        status: RunStatus,
        current_workflow_version_id: Option<Uuid>,
        current_branch_id: Option<Uuid>,
    ) -> StorageResult<WorkflowRun>;

    // -- Branches ---------------------------------------------------------
    async fn create_branch(&self, branch: Branch) -> StorageResult<Branch>;
    async fn get_branch(&self, branch_id: Uuid) -> StorageResult<Option<Branch>>;

    // -- Events -------------------------------------------------------
    async fn append_event(&self, event: Event) -> StorageResult<Event>;
    async fn get_events(
        &self,
        workflow_run_id: Uuid,
        filter: EventFilter,
    ) -> StorageResult<Vec<Event>>;
    async fn get_events_for_branch(
        &self,
        workflow_run_id: Uuid,
        branch_id: Uuid,
        up_to: Option<Uuid>,
        event_type: Option<EventType>,
    ) -> StorageResult<Vec<Event>>;
    async fn delete_run_events(&self, workflow_run_id: Uuid) -> StorageResult<u64>;

    // -- Files -------------------------------------------------------
    async fn put_file(&self, file: WorkflowFile) -> StorageResult<WorkflowFile>;
    async fn get_file(
        &self,
        workflow_run_id: Uuid,
        branch_id: Uuid,
        category: FileCategory,
        group_id: Option<&str>,
        filename: &str,
    ) -> StorageResult<Option<WorkflowFile>>;

    // -- Task queue -------------------------------------------------------
    async fn enqueue_task(&self, task: QueueTask) -> StorageResult<QueueTask>;
    async fn get_task(&self, task_id: Uuid) -> StorageResult<Option<QueueTask>>;
    async fn get_queued_tasks_by_group(
        &self,
        group: &str,
        limit: i64,
    ) -> StorageResult<Vec<QueueTask>>;
    async fn count_processing(&self, group: &str) -> StorageResult<i64>;
    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        group: &str,
        max_concurrent: i64,
    ) -> StorageResult<Option<QueueTask>>;
    async fn update_heartbeat(&self, task_id: Uuid) -> StorageResult<()>;
    async fn update_progress(
        &self,
        task_id: Uuid,
        elapsed_ms: i64,
        message: &str,
    ) -> StorageResult<()>;
    async fn complete_task(&self, task_id: Uuid, result: Json) -> StorageResult<QueueTask>;
    async fn fail_task(&self, task_id: Uuid, error: TaskError) -> StorageResult<QueueTask>;
    async fn recover_stale_tasks(&self, threshold: DateTime<Utc>) -> StorageResult<u64>;

    // -- Generated content --------------------------------------------
    async fn put_generation(&self, meta: GenerationMetadata) -> StorageResult<GenerationMetadata>;
    async fn put_content_item(&self, item: ContentItem) -> StorageResult<ContentItem>;

    // -- Option-usage / weighted-keyword counters (scoped by template only) --
    async fn increment_option_usage(
        &self,
        template_id: Uuid,
        key: &str,
        by: i64,
    ) -> StorageResult<i64>;
    async fn get_option_usage(&self, template_id: Uuid, key: &str) -> StorageResult<i64>;
}
