//! In-memory `Storage` implementation backing the virtual execution sandbox
//! (`spec.md` §4.6). Collections are plain `HashMap`/`Vec` behind a single
//! `tokio::sync::RwLock`, so the whole namespace snapshots/restores as one
//! unit for the blob codec — no sandbox-only execution logic, just a second
//! `Storage` impl the same `workflow_engine::Engine<S>` runs against.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use workflow_core::error::{StorageError, StorageResult};
use workflow_core::models::*;
use workflow_core::storage::{EventFilter, Storage};

/// The complete, serializable state of one sandbox namespace. Indices on
/// non-primary keys (template name, content hash, ...) are rebuilt by linear
/// scan rather than persisted, since a sandbox namespace is small and
/// short-lived by construction (`spec.md` §4.6 isolation invariants).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespace {
    pub users: HashMap<Uuid, User>,
    pub templates: HashMap<Uuid, WorkflowTemplate>,
    pub versions: HashMap<Uuid, WorkflowVersion>,
    pub runs: HashMap<Uuid, WorkflowRun>,
    pub branches: HashMap<Uuid, Branch>,
    pub events: Vec<Event>,
    pub files: Vec<WorkflowFile>,
    pub queue_tasks: HashMap<Uuid, QueueTask>,
    pub generations: HashMap<Uuid, GenerationMetadata>,
    pub content_items: HashMap<Uuid, ContentItem>,
    pub option_usage: HashMap<String, i64>,
}

fn usage_key(template_id: Uuid, key: &str) -> String {
    format!("{template_id}:{key}")
}

pub struct MemoryStorage {
    namespace: RwLock<Namespace>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            namespace: RwLock::new(Namespace::default()),
        }
    }

    /// Import an existing namespace, e.g. decoded from a client-supplied
    /// blob (`spec.md` §4.6 `startVirtual`'s `virtual_db` import).
    pub fn from_namespace(namespace: Namespace) -> Self {
        Self {
            namespace: RwLock::new(namespace),
        }
    }

    /// Clone out the current namespace for blob export.
    pub async fn snapshot(&self) -> Namespace {
        self.namespace.read().await.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_user(&self, credentials: Json) -> StorageResult<User> {
        let user = User {
            user_id: workflow_core::ids::new_id(),
            credentials,
            created_at: Utc::now(),
        };
        self.namespace.write().await.users.insert(user.user_id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: Uuid) -> StorageResult<Option<User>> {
        Ok(self.namespace.read().await.users.get(&user_id).cloned())
    }

    async fn get_or_create_template(
        &self,
        user_id: Uuid,
        template_name: &str,
    ) -> StorageResult<WorkflowTemplate> {
        let mut ns = self.namespace.write().await;
        if let Some(existing) = ns
            .templates
            .values()
            .find(|t| t.user_id == user_id && t.template_name == template_name)
        {
            return Ok(existing.clone());
        }
        let template = WorkflowTemplate {
            template_id: workflow_core::ids::new_id(),
            user_id,
            template_name: template_name.to_string(),
            created_at: Utc::now(),
        };
        ns.templates.insert(template.template_id, template.clone());
        Ok(template)
    }

    async fn get_template(&self, template_id: Uuid) -> StorageResult<Option<WorkflowTemplate>> {
        Ok(self.namespace.read().await.templates.get(&template_id).cloned())
    }

    async fn get_version_by_hash(
        &self,
        template_id: Uuid,
        content_hash: &str,
    ) -> StorageResult<Option<WorkflowVersion>> {
        Ok(self
            .namespace
            .read()
            .await
            .versions
            .values()
            .find(|v| v.template_id == template_id && v.content_hash == content_hash)
            .cloned())
    }

    async fn insert_version(&self, version: WorkflowVersion) -> StorageResult<WorkflowVersion> {
        let mut ns = self.namespace.write().await;
        if let Some(existing) = ns
            .versions
            .values()
            .find(|v| v.template_id == version.template_id && v.content_hash == version.content_hash)
        {
            return Ok(existing.clone());
        }
        ns.versions.insert(version.version_id, version.clone());
        Ok(version)
    }

    async fn get_version(&self, version_id: Uuid) -> StorageResult<Option<WorkflowVersion>> {
        Ok(self.namespace.read().await.versions.get(&version_id).cloned())
    }

    async fn create_run(&self, run: WorkflowRun) -> StorageResult<WorkflowRun> {
        let mut ns = self.namespace.write().await;
        ns.runs.insert(run.workflow_run_id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, workflow_run_id: Uuid) -> StorageResult<Option<WorkflowRun>> {
        Ok(self.namespace.read().await.runs.get(&workflow_run_id).cloned())
    }

    async fn update_run(
        &self,
        workflow_run_id: Uuid,
        expected_updated_at: DateTime<Utc>,
        status: RunStatus,
        current_workflow_version_id: Option<Uuid>,
        current_branch_id: Option<Uuid>,
    ) -> StorageResult<WorkflowRun> {
        let mut ns = self.namespace.write().await;
        let run = ns
            .runs
            .get_mut(&workflow_run_id)
            .ok_or_else(|| StorageError::NotFound(format!("run {workflow_run_id}")))?;
        if run.updated_at != expected_updated_at {
            return Err(StorageError::Conflict(format!(
                "run {workflow_run_id} was concurrently modified (stale updated_at)"
            )));
        }
        run.status = status;
        if let Some(v) = current_workflow_version_id {
            run.current_workflow_version_id = v;
        }
        if let Some(b) = current_branch_id {
            run.current_branch_id = b;
        }
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn create_branch(&self, branch: Branch) -> StorageResult<Branch> {
        let mut ns = self.namespace.write().await;
        ns.branches.insert(branch.branch_id, branch.clone());
        Ok(branch)
    }

    async fn get_branch(&self, branch_id: Uuid) -> StorageResult<Option<Branch>> {
        Ok(self.namespace.read().await.branches.get(&branch_id).cloned())
    }

    async fn append_event(&self, event: Event) -> StorageResult<Event> {
        let mut ns = self.namespace.write().await;
        ns.events.push(event.clone());
        Ok(event)
    }

    async fn get_events(
        &self,
        workflow_run_id: Uuid,
        filter: EventFilter,
    ) -> StorageResult<Vec<Event>> {
        let ns = self.namespace.read().await;
        let mut out: Vec<Event> = ns
            .events
            .iter()
            .filter(|e| e.workflow_run_id == workflow_run_id)
            .filter(|e| {
                filter
                    .event_types
                    .as_ref()
                    .map(|types| types.contains(&e.event_type))
                    .unwrap_or(true)
            })
            .filter(|e| {
                filter
                    .module_name
                    .as_ref()
                    .map(|m| e.module_name.as_deref() == Some(m.as_str()))
                    .unwrap_or(true)
            })
            .filter(|e| {
                filter
                    .step_id
                    .as_ref()
                    .map(|s| e.step_id.as_deref() == Some(s.as_str()))
                    .unwrap_or(true)
            })
            .filter(|e| filter.since.map(|since| e.timestamp >= since).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.event_id);
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn get_events_for_branch(
        &self,
        workflow_run_id: Uuid,
        branch_id: Uuid,
        up_to: Option<Uuid>,
        event_type: Option<EventType>,
    ) -> StorageResult<Vec<Event>> {
        let ns = self.namespace.read().await;
        let mut out: Vec<Event> = ns
            .events
            .iter()
            .filter(|e| e.workflow_run_id == workflow_run_id && e.branch_id == branch_id)
            .filter(|e| up_to.map(|cutoff| e.event_id <= cutoff).unwrap_or(true))
            .filter(|e| event_type.map(|t| e.event_type == t).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.event_id);
        Ok(out)
    }

    async fn delete_run_events(&self, workflow_run_id: Uuid) -> StorageResult<u64> {
        let mut ns = self.namespace.write().await;
        let before = ns.events.len();
        ns.events.retain(|e| e.workflow_run_id != workflow_run_id);
        Ok((before - ns.events.len()) as u64)
    }

    async fn put_file(&self, file: WorkflowFile) -> StorageResult<WorkflowFile> {
        let mut ns = self.namespace.write().await;
        if let Some(existing) = ns.files.iter_mut().find(|f| {
            f.workflow_run_id == file.workflow_run_id
                && f.branch_id == file.branch_id
                && f.category == file.category
                && f.group_id == file.group_id
                && f.filename == file.filename
        }) {
            existing.content = file.content.clone();
            existing.content_type = file.content_type;
            return Ok(existing.clone());
        }
        ns.files.push(file.clone());
        Ok(file)
    }

    async fn get_file(
        &self,
        workflow_run_id: Uuid,
        branch_id: Uuid,
        category: FileCategory,
        group_id: Option<&str>,
        filename: &str,
    ) -> StorageResult<Option<WorkflowFile>> {
        let ns = self.namespace.read().await;
        Ok(ns
            .files
            .iter()
            .find(|f| {
                f.workflow_run_id == workflow_run_id
                    && f.branch_id == branch_id
                    && f.category == category
                    && f.group_id.as_deref() == group_id
                    && f.filename == filename
            })
            .cloned())
    }

    async fn enqueue_task(&self, task: QueueTask) -> StorageResult<QueueTask> {
        let mut ns = self.namespace.write().await;
        ns.queue_tasks.insert(task.task_id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> StorageResult<Option<QueueTask>> {
        Ok(self.namespace.read().await.queue_tasks.get(&task_id).cloned())
    }

    async fn get_queued_tasks_by_group(
        &self,
        group: &str,
        limit: i64,
    ) -> StorageResult<Vec<QueueTask>> {
        let ns = self.namespace.read().await;
        let mut tasks: Vec<QueueTask> = ns
            .queue_tasks
            .values()
            .filter(|t| t.concurrency_group == group && t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }

    async fn count_processing(&self, group: &str) -> StorageResult<i64> {
        let ns = self.namespace.read().await;
        Ok(ns
            .queue_tasks
            .values()
            .filter(|t| t.concurrency_group == group && t.status == TaskStatus::Processing)
            .count() as i64)
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        group: &str,
        max_concurrent: i64,
    ) -> StorageResult<Option<QueueTask>> {
        let mut ns = self.namespace.write().await;
        let processing = ns
            .queue_tasks
            .values()
            .filter(|t| t.concurrency_group == group && t.status == TaskStatus::Processing)
            .count() as i64;
        if processing >= max_concurrent {
            return Ok(None);
        }
        let Some(task) = ns.queue_tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Queued {
            return Ok(None);
        }
        task.status = TaskStatus::Processing;
        task.worker_id = Some(worker_id.to_string());
        task.claimed_at = Some(Utc::now());
        task.heartbeat_at = Some(Utc::now());
        Ok(Some(task.clone()))
    }

    async fn update_heartbeat(&self, task_id: Uuid) -> StorageResult<()> {
        let mut ns = self.namespace.write().await;
        if let Some(task) = ns.queue_tasks.get_mut(&task_id) {
            task.heartbeat_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        task_id: Uuid,
        elapsed_ms: i64,
        message: &str,
    ) -> StorageResult<()> {
        let mut ns = self.namespace.write().await;
        if let Some(task) = ns.queue_tasks.get_mut(&task_id) {
            task.progress = Some(TaskProgress {
                elapsed_ms,
                message: message.to_string(),
                updated_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: Uuid, result: Json) -> StorageResult<QueueTask> {
        let mut ns = self.namespace.write().await;
        let task = ns
            .queue_tasks
            .get_mut(&task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        Ok(task.clone())
    }

    async fn fail_task(&self, task_id: Uuid, error: TaskError) -> StorageResult<QueueTask> {
        let mut ns = self.namespace.write().await;
        let task = ns
            .queue_tasks
            .get_mut(&task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        task.status = TaskStatus::Failed;
        task.error = Some(error);
        Ok(task.clone())
    }

    async fn recover_stale_tasks(&self, threshold: DateTime<Utc>) -> StorageResult<u64> {
        let mut ns = self.namespace.write().await;
        let mut count = 0u64;
        for task in ns.queue_tasks.values_mut() {
            if task.status == TaskStatus::Processing
                && task.heartbeat_at.map(|h| h < threshold).unwrap_or(false)
            {
                task.status = TaskStatus::Queued;
                task.worker_id = None;
                task.claimed_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn put_generation(&self, meta: GenerationMetadata) -> StorageResult<GenerationMetadata> {
        let mut ns = self.namespace.write().await;
        ns.generations.insert(meta.generation_id, meta.clone());
        Ok(meta)
    }

    async fn put_content_item(&self, item: ContentItem) -> StorageResult<ContentItem> {
        let mut ns = self.namespace.write().await;
        ns.content_items.insert(item.content_id, item.clone());
        Ok(item)
    }

    async fn increment_option_usage(
        &self,
        template_id: Uuid,
        key: &str,
        by: i64,
    ) -> StorageResult<i64> {
        let mut ns = self.namespace.write().await;
        let entry = ns.option_usage.entry(usage_key(template_id, key)).or_insert(0);
        *entry += by;
        Ok(*entry)
    }

    async fn get_option_usage(&self, template_id: Uuid, key: &str) -> StorageResult<i64> {
        let ns = self.namespace.read().await;
        Ok(ns.option_usage.get(&usage_key(template_id, key)).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_task_respects_concurrency_cap() {
        let storage = MemoryStorage::new();
        for _ in 0..3 {
            storage
                .enqueue_task(QueueTask {
                    task_id: Uuid::now_v7(),
                    actor: "media".into(),
                    payload: Json::Null,
                    status: TaskStatus::Queued,
                    concurrency_group: "p".into(),
                    worker_id: None,
                    created_at: Utc::now(),
                    claimed_at: None,
                    heartbeat_at: None,
                    progress: None,
                    result: None,
                    error: None,
                })
                .await
                .unwrap();
        }
        let queued = storage.get_queued_tasks_by_group("p", 10).await.unwrap();
        let mut claimed = 0;
        for task in &queued {
            if storage
                .claim_task(task.task_id, "w1", "p", 2)
                .await
                .unwrap()
                .is_some()
            {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 2);
        assert_eq!(storage.count_processing("p").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_run_rejects_stale_expected_timestamp() {
        let storage = MemoryStorage::new();
        let run = storage
            .create_run(WorkflowRun {
                workflow_run_id: Uuid::now_v7(),
                template_id: Uuid::now_v7(),
                user_id: Uuid::now_v7(),
                current_workflow_version_id: Uuid::now_v7(),
                current_branch_id: Uuid::now_v7(),
                status: RunStatus::Created,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let stale = run.updated_at - chrono::Duration::seconds(1);
        let err = storage
            .update_run(run.workflow_run_id, stale, RunStatus::Processing, None, None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_from_namespace() {
        let storage = MemoryStorage::new();
        storage.create_user(Json::Null).await.unwrap();
        let snap = storage.snapshot().await;
        let restored = MemoryStorage::from_namespace(snap);
        assert_eq!(restored.snapshot().await.users.len(), 1);
    }
}
