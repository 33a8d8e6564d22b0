//! Postgres-backed `Storage` implementation.
//!
//! Query style follows `everruns-storage::repositories::Database`: plain
//! `sqlx::query_as::<_, Row>` with a raw SQL string per method, rather than
//! the compile-time `query!` macro (which would require a live database at
//! build time).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;
use workflow_core::error::{StorageError, StorageResult};
use workflow_core::models::*;
use workflow_core::storage::{EventFilter, Storage};

use crate::rows::*;

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn other(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound("row not found".into()),
        other => StorageError::Other(other.into()),
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_user(&self, credentials: Json) -> StorageResult<User> {
        let user_id = workflow_core::ids::new_id();
        let row = sqlx::query_as::<_, UserRow>(
            r#"INSERT INTO users (user_id, credentials) VALUES ($1, $2)
               RETURNING user_id, credentials, created_at"#,
        )
        .bind(user_id)
        .bind(&credentials)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        Ok(row.into())
    }

    async fn get_user(&self, user_id: Uuid) -> StorageResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT user_id, credentials, created_at FROM users WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        Ok(row.map(Into::into))
    }

    async fn get_or_create_template(
        &self,
        user_id: Uuid,
        template_name: &str,
    ) -> StorageResult<WorkflowTemplate> {
        if let Some(existing) = sqlx::query_as::<_, TemplateRow>(
            r#"SELECT template_id, user_id, template_name, created_at
               FROM workflow_templates WHERE user_id = $1 AND template_name = $2"#,
        )
        .bind(user_id)
        .bind(template_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?
        {
            return Ok(existing.into());
        }

        let template_id = workflow_core::ids::new_id();
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"INSERT INTO workflow_templates (template_id, user_id, template_name)
               VALUES ($1, $2, $3)
               ON CONFLICT (user_id, template_name) DO UPDATE SET template_name = EXCLUDED.template_name
               RETURNING template_id, user_id, template_name, created_at"#,
        )
        .bind(template_id)
        .bind(user_id)
        .bind(template_name)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        Ok(row.into())
    }

    async fn get_template(&self, template_id: Uuid) -> StorageResult<Option<WorkflowTemplate>> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"SELECT template_id, user_id, template_name, created_at
               FROM workflow_templates WHERE template_id = $1"#,
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        Ok(row.map(Into::into))
    }

    async fn get_version_by_hash(
        &self,
        template_id: Uuid,
        content_hash: &str,
    ) -> StorageResult<Option<WorkflowVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"SELECT version_id, template_id, content_hash, source_type, version_type,
                      parent_workflow_version_id, requires, resolved_workflow, selected_paths, created_at
               FROM workflow_versions WHERE template_id = $1 AND content_hash = $2"#,
        )
        .bind(template_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn insert_version(&self, version: WorkflowVersion) -> StorageResult<WorkflowVersion> {
        let requires = serde_json::to_value(&version.requires).map_err(|e| StorageError::Other(e.into()))?;
        let selected_paths =
            serde_json::to_value(&version.selected_paths).map_err(|e| StorageError::Other(e.into()))?;
        let row = sqlx::query_as::<_, VersionRow>(
            r#"INSERT INTO workflow_versions
                 (version_id, template_id, content_hash, source_type, version_type,
                  parent_workflow_version_id, requires, resolved_workflow, selected_paths)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (template_id, content_hash) DO UPDATE SET content_hash = EXCLUDED.content_hash
               RETURNING version_id, template_id, content_hash, source_type, version_type,
                         parent_workflow_version_id, requires, resolved_workflow, selected_paths, created_at"#,
        )
        .bind(version.version_id)
        .bind(version.template_id)
        .bind(&version.content_hash)
        .bind(version.source_type.as_str())
        .bind(version.version_type.as_str())
        .bind(version.parent_workflow_version_id)
        .bind(requires)
        .bind(&version.resolved_workflow)
        .bind(selected_paths)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn get_version(&self, version_id: Uuid) -> StorageResult<Option<WorkflowVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"SELECT version_id, template_id, content_hash, source_type, version_type,
                      parent_workflow_version_id, requires, resolved_workflow, selected_paths, created_at
               FROM workflow_versions WHERE version_id = $1"#,
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn create_run(&self, run: WorkflowRun) -> StorageResult<WorkflowRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"INSERT INTO workflow_runs
                 (workflow_run_id, template_id, user_id, current_workflow_version_id, current_branch_id, status)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING workflow_run_id, template_id, user_id, current_workflow_version_id,
                         current_branch_id, status, created_at, updated_at"#,
        )
        .bind(run.workflow_run_id)
        .bind(run.template_id)
        .bind(run.user_id)
        .bind(run.current_workflow_version_id)
        .bind(run.current_branch_id)
        .bind(run.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn get_run(&self, workflow_run_id: Uuid) -> StorageResult<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"SELECT workflow_run_id, template_id, user_id, current_workflow_version_id,
                      current_branch_id, status, created_at, updated_at
               FROM workflow_runs WHERE workflow_run_id = $1"#,
        )
        .bind(workflow_run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_run(
        &self,
        workflow_run_id: Uuid,
        expected_updated_at: DateTime<Utc>,
        status: RunStatus,
        current_workflow_version_id: Option<Uuid>,
        current_branch_id: Option<Uuid>,
    ) -> StorageResult<WorkflowRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"UPDATE workflow_runs
               SET status = $3,
                   current_workflow_version_id = COALESCE($4, current_workflow_version_id),
                   current_branch_id = COALESCE($5, current_branch_id),
                   updated_at = now()
               WHERE workflow_run_id = $1 AND updated_at = $2
               RETURNING workflow_run_id, template_id, user_id, current_workflow_version_id,
                         current_branch_id, status, created_at, updated_at"#,
        )
        .bind(workflow_run_id)
        .bind(expected_updated_at)
        .bind(status.as_str())
        .bind(current_workflow_version_id)
        .bind(current_branch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;

        match row {
            Some(r) => r.try_into(),
            None => Err(StorageError::Conflict(format!(
                "run {workflow_run_id} was concurrently modified (stale updated_at)"
            ))),
        }
    }

    async fn create_branch(&self, branch: Branch) -> StorageResult<Branch> {
        let lineage = serde_json::to_value(&branch.lineage).map_err(|e| StorageError::Other(e.into()))?;
        let row = sqlx::query_as::<_, BranchRow>(
            r#"INSERT INTO branches (branch_id, workflow_run_id, lineage)
               VALUES ($1, $2, $3)
               RETURNING branch_id, workflow_run_id, lineage, created_at"#,
        )
        .bind(branch.branch_id)
        .bind(branch.workflow_run_id)
        .bind(lineage)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn get_branch(&self, branch_id: Uuid) -> StorageResult<Option<Branch>> {
        let row = sqlx::query_as::<_, BranchRow>(
            r#"SELECT branch_id, workflow_run_id, lineage, created_at
               FROM branches WHERE branch_id = $1"#,
        )
        .bind(branch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn append_event(&self, event: Event) -> StorageResult<Event> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"INSERT INTO events
                 (event_id, workflow_run_id, branch_id, workflow_version_id, event_type,
                  "timestamp", step_id, module_name, data)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING event_id, workflow_run_id, branch_id, workflow_version_id, event_type,
                         "timestamp", step_id, module_name, data"#,
        )
        .bind(event.event_id)
        .bind(event.workflow_run_id)
        .bind(event.branch_id)
        .bind(event.workflow_version_id)
        .bind(event.event_type.as_str())
        .bind(event.timestamp)
        .bind(&event.step_id)
        .bind(&event.module_name)
        .bind(&event.data)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn get_events(
        &self,
        workflow_run_id: Uuid,
        filter: EventFilter,
    ) -> StorageResult<Vec<Event>> {
        // Raw access: no branch semantics. All filters are optional and
        // expressed as "$n IS NULL OR ..." so the placeholder count stays
        // fixed regardless of which filters the caller set.
        let event_types: Option<Vec<String>> = filter
            .event_types
            .as_ref()
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());

        let rows = sqlx::query_as::<_, EventRow>(
            r#"SELECT event_id, workflow_run_id, branch_id, workflow_version_id, event_type,
                      "timestamp", step_id, module_name, data
               FROM events
               WHERE workflow_run_id = $1
                 AND ($2::text[] IS NULL OR event_type = ANY($2::text[]))
                 AND ($3::text IS NULL OR module_name = $3)
                 AND ($4::text IS NULL OR step_id = $4)
                 AND ($5::timestamptz IS NULL OR "timestamp" >= $5)
               ORDER BY event_id ASC
               LIMIT $6"#,
        )
        .bind(workflow_run_id)
        .bind(event_types)
        .bind(filter.module_name)
        .bind(filter.step_id)
        .bind(filter.since)
        .bind(filter.limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_events_for_branch(
        &self,
        workflow_run_id: Uuid,
        branch_id: Uuid,
        up_to: Option<Uuid>,
        event_type: Option<EventType>,
    ) -> StorageResult<Vec<Event>> {
        let mut query = String::from(
            r#"SELECT event_id, workflow_run_id, branch_id, workflow_version_id, event_type,
                      "timestamp", step_id, module_name, data
               FROM events WHERE workflow_run_id = $1 AND branch_id = $2"#,
        );
        if up_to.is_some() {
            query.push_str(" AND event_id <= $3");
        }
        if event_type.is_some() {
            query.push_str(" AND event_type = $4");
        }
        query.push_str(" ORDER BY event_id ASC");

        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(workflow_run_id)
            .bind(branch_id)
            .bind(up_to.unwrap_or_else(Uuid::max))
            .bind(event_type.map(|t| t.as_str().to_string()).unwrap_or_default())
            .fetch_all(&self.pool)
            .await
            .map_err(other)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_run_events(&self, workflow_run_id: Uuid) -> StorageResult<u64> {
        let result = sqlx::query(r#"DELETE FROM events WHERE workflow_run_id = $1"#)
            .bind(workflow_run_id)
            .execute(&self.pool)
            .await
            .map_err(other)?;
        Ok(result.rows_affected())
    }

    async fn put_file(&self, file: WorkflowFile) -> StorageResult<WorkflowFile> {
        let row = sqlx::query_as::<_, FileRow>(
            r#"INSERT INTO workflow_files
                 (file_id, workflow_run_id, branch_id, category, group_id, filename, content_type, content)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (workflow_run_id, branch_id, category, group_id, filename)
               DO UPDATE SET content = EXCLUDED.content, content_type = EXCLUDED.content_type
               RETURNING file_id, workflow_run_id, branch_id, category, group_id, filename, content_type, content"#,
        )
        .bind(file.file_id)
        .bind(file.workflow_run_id)
        .bind(file.branch_id)
        .bind(file.category.as_str())
        .bind(&file.group_id)
        .bind(&file.filename)
        .bind(file.content_type.as_str())
        .bind(&file.content)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn get_file(
        &self,
        workflow_run_id: Uuid,
        branch_id: Uuid,
        category: FileCategory,
        group_id: Option<&str>,
        filename: &str,
    ) -> StorageResult<Option<WorkflowFile>> {
        let row = sqlx::query_as::<_, FileRow>(
            r#"SELECT file_id, workflow_run_id, branch_id, category, group_id, filename, content_type, content
               FROM workflow_files
               WHERE workflow_run_id = $1 AND branch_id = $2 AND category = $3
                 AND group_id IS NOT DISTINCT FROM $4 AND filename = $5"#,
        )
        .bind(workflow_run_id)
        .bind(branch_id)
        .bind(category.as_str())
        .bind(group_id)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn enqueue_task(&self, task: QueueTask) -> StorageResult<QueueTask> {
        let row = sqlx::query_as::<_, QueueTaskRow>(
            r#"INSERT INTO queue_tasks (task_id, actor, payload, status, concurrency_group)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING task_id, actor, payload, status, concurrency_group, worker_id, created_at,
                         claimed_at, heartbeat_at, progress_elapsed_ms, progress_message,
                         progress_updated_at, result, error_type, error_message, error_details, error_stack"#,
        )
        .bind(task.task_id)
        .bind(&task.actor)
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(&task.concurrency_group)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn get_task(&self, task_id: Uuid) -> StorageResult<Option<QueueTask>> {
        let row = sqlx::query_as::<_, QueueTaskRow>(
            r#"SELECT task_id, actor, payload, status, concurrency_group, worker_id, created_at,
                      claimed_at, heartbeat_at, progress_elapsed_ms, progress_message,
                      progress_updated_at, result, error_type, error_message, error_details, error_stack
               FROM queue_tasks WHERE task_id = $1"#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_queued_tasks_by_group(
        &self,
        group: &str,
        limit: i64,
    ) -> StorageResult<Vec<QueueTask>> {
        let rows = sqlx::query_as::<_, QueueTaskRow>(
            r#"SELECT task_id, actor, payload, status, concurrency_group, worker_id, created_at,
                      claimed_at, heartbeat_at, progress_elapsed_ms, progress_message,
                      progress_updated_at, result, error_type, error_message, error_details, error_stack
               FROM queue_tasks
               WHERE concurrency_group = $1 AND status = 'queued'
               ORDER BY created_at ASC
               LIMIT $2"#,
        )
        .bind(group)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_processing(&self, group: &str) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM queue_tasks WHERE concurrency_group = $1 AND status = 'processing'"#,
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        Ok(count)
    }

    /// Atomic claim: the `WHERE` clause re-checks the processing count in
    /// the same statement, so two concurrent claims cannot both succeed
    /// past `max_concurrent` (`spec.md` §4.5).
    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        group: &str,
        max_concurrent: i64,
    ) -> StorageResult<Option<QueueTask>> {
        let row = sqlx::query_as::<_, QueueTaskRow>(
            r#"UPDATE queue_tasks
               SET status = 'processing', worker_id = $2, claimed_at = now(), heartbeat_at = now()
               WHERE task_id = $1 AND status = 'queued'
                 AND (SELECT COUNT(*) FROM queue_tasks WHERE concurrency_group = $3 AND status = 'processing') < $4
               RETURNING task_id, actor, payload, status, concurrency_group, worker_id, created_at,
                         claimed_at, heartbeat_at, progress_elapsed_ms, progress_message,
                         progress_updated_at, result, error_type, error_message, error_details, error_stack"#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(group)
        .bind(max_concurrent)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_heartbeat(&self, task_id: Uuid) -> StorageResult<()> {
        sqlx::query(r#"UPDATE queue_tasks SET heartbeat_at = now() WHERE task_id = $1"#)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(other)?;
        Ok(())
    }

    async fn update_progress(
        &self,
        task_id: Uuid,
        elapsed_ms: i64,
        message: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"UPDATE queue_tasks
               SET progress_elapsed_ms = $2, progress_message = $3, progress_updated_at = now()
               WHERE task_id = $1"#,
        )
        .bind(task_id)
        .bind(elapsed_ms)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(other)?;
        Ok(())
    }

    async fn complete_task(&self, task_id: Uuid, result: Json) -> StorageResult<QueueTask> {
        let row = sqlx::query_as::<_, QueueTaskRow>(
            r#"UPDATE queue_tasks SET status = 'completed', result = $2 WHERE task_id = $1
               RETURNING task_id, actor, payload, status, concurrency_group, worker_id, created_at,
                         claimed_at, heartbeat_at, progress_elapsed_ms, progress_message,
                         progress_updated_at, result, error_type, error_message, error_details, error_stack"#,
        )
        .bind(task_id)
        .bind(result)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn fail_task(&self, task_id: Uuid, error: TaskError) -> StorageResult<QueueTask> {
        let row = sqlx::query_as::<_, QueueTaskRow>(
            r#"UPDATE queue_tasks
               SET status = 'failed', error_type = $2, error_message = $3, error_details = $4, error_stack = $5
               WHERE task_id = $1
               RETURNING task_id, actor, payload, status, concurrency_group, worker_id, created_at,
                         claimed_at, heartbeat_at, progress_elapsed_ms, progress_message,
                         progress_updated_at, result, error_type, error_message, error_details, error_stack"#,
        )
        .bind(task_id)
        .bind(&error.error_type)
        .bind(&error.message)
        .bind(&error.details)
        .bind(&error.stack)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        row.try_into()
    }

    async fn recover_stale_tasks(&self, threshold: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"UPDATE queue_tasks
               SET status = 'queued', worker_id = NULL, claimed_at = NULL
               WHERE status = 'processing' AND heartbeat_at < $1"#,
        )
        .bind(threshold)
        .execute(&self.pool)
        .await
        .map_err(other)?;
        Ok(result.rows_affected())
    }

    async fn put_generation(&self, meta: GenerationMetadata) -> StorageResult<GenerationMetadata> {
        let row = sqlx::query_as::<_, GenerationRow>(
            r#"INSERT INTO generation_metadata
                 (generation_id, workflow_run_id, branch_id, task_id, provider, model, prompt, params)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING generation_id, workflow_run_id, branch_id, task_id, provider, model, prompt, params"#,
        )
        .bind(meta.generation_id)
        .bind(meta.workflow_run_id)
        .bind(meta.branch_id)
        .bind(meta.task_id)
        .bind(&meta.provider)
        .bind(&meta.model)
        .bind(&meta.prompt)
        .bind(&meta.params)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        Ok(row.into())
    }

    async fn put_content_item(&self, item: ContentItem) -> StorageResult<ContentItem> {
        let row = sqlx::query_as::<_, ContentItemRow>(
            r#"INSERT INTO content_items (content_id, generation_id, kind, uri_or_ref, content_type, metadata)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING content_id, generation_id, kind, uri_or_ref, content_type, metadata"#,
        )
        .bind(item.content_id)
        .bind(item.generation_id)
        .bind(&item.kind)
        .bind(&item.uri_or_ref)
        .bind(&item.content_type)
        .bind(&item.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        Ok(row.into())
    }

    async fn increment_option_usage(
        &self,
        template_id: Uuid,
        key: &str,
        by: i64,
    ) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"INSERT INTO option_usage_counters (template_id, key, count)
               VALUES ($1, $2, $3)
               ON CONFLICT (template_id, key) DO UPDATE SET count = option_usage_counters.count + $3
               RETURNING count"#,
        )
        .bind(template_id)
        .bind(key)
        .bind(by)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;
        Ok(count)
    }

    async fn get_option_usage(&self, template_id: Uuid, key: &str) -> StorageResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT count FROM option_usage_counters WHERE template_id = $1 AND key = $2"#,
        )
        .bind(template_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;
        Ok(row.map(|(c,)| c).unwrap_or(0))
    }
}
