//! Progress streaming (`spec.md` §4.5): interactive modules poll a queued
//! task between suspensions and only emit an event when the
//! `(status, elapsed_ms, message)` triple actually changes.

use sha2::{Digest, Sha256};
use std::time::Duration;
use workflow_core::error::StorageError;
use workflow_core::models::{QueueTask, TaskStatus};
use workflow_core::storage::Storage;

fn triple_hash(task: &QueueTask) -> String {
    let elapsed = task.progress.as_ref().map(|p| p.elapsed_ms).unwrap_or(0);
    let message = task.progress.as_ref().map(|p| p.message.as_str()).unwrap_or("");
    let mut hasher = Sha256::new();
    hasher.update(task.status.as_str().as_bytes());
    hasher.update(elapsed.to_le_bytes());
    hasher.update(message.as_bytes());
    hex::encode(hasher.finalize())
}

/// A step of the progress stream as observed by a single poller.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress { elapsed_ms: i64, message: String },
    Result(serde_json::Value),
    Failed(workflow_core::models::TaskError),
}

/// Polls `task_id` at `poll_interval`, yielding a `ProgressEvent` only when
/// the comparison hash changes, terminating after `Result`/`Failed`.
pub struct ProgressStream<'s, S: Storage> {
    storage: &'s S,
    task_id: uuid::Uuid,
    poll_interval: Duration,
    last_hash: Option<String>,
    done: bool,
}

impl<'s, S: Storage> ProgressStream<'s, S> {
    pub fn new(storage: &'s S, task_id: uuid::Uuid, poll_interval: Duration) -> Self {
        Self {
            storage,
            task_id,
            poll_interval,
            last_hash: None,
            done: false,
        }
    }

    /// Blocks until the next distinct event, or `None` once the task has
    /// reached a terminal state and that event has already been yielded.
    pub async fn next(&mut self) -> Result<Option<ProgressEvent>, StorageError> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(task) = self.storage.get_task(self.task_id).await? else {
                return Err(StorageError::NotFound(format!("task {}", self.task_id)));
            };

            match task.status {
                TaskStatus::Completed => {
                    self.done = true;
                    return Ok(Some(ProgressEvent::Result(task.result.unwrap_or(serde_json::Value::Null))));
                }
                TaskStatus::Failed => {
                    self.done = true;
                    return Ok(Some(ProgressEvent::Failed(task.error.unwrap_or(workflow_core::models::TaskError {
                        error_type: "unknown".into(),
                        message: "task failed with no recorded error".into(),
                        details: serde_json::Value::Null,
                        stack: None,
                    }))));
                }
                TaskStatus::Queued | TaskStatus::Processing => {
                    let hash = triple_hash(&task);
                    if self.last_hash.as_deref() != Some(hash.as_str()) {
                        self.last_hash = Some(hash);
                        let progress = task.progress.unwrap_or(workflow_core::models::TaskProgress {
                            elapsed_ms: 0,
                            message: String::new(),
                            updated_at: chrono::Utc::now(),
                        });
                        return Ok(Some(ProgressEvent::Progress {
                            elapsed_ms: progress.elapsed_ms,
                            message: progress.message,
                        }));
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_core::models::TaskProgress;

    fn task(status: TaskStatus, elapsed: i64, message: &str) -> QueueTask {
        QueueTask {
            task_id: uuid::Uuid::now_v7(),
            actor: "media".into(),
            payload: serde_json::json!({}),
            status,
            concurrency_group: "provider".into(),
            worker_id: None,
            created_at: chrono::Utc::now(),
            claimed_at: None,
            heartbeat_at: None,
            progress: Some(TaskProgress {
                elapsed_ms: elapsed,
                message: message.into(),
                updated_at: chrono::Utc::now(),
            }),
            result: None,
            error: None,
        }
    }

    #[test]
    fn hash_changes_when_triple_changes() {
        let a = triple_hash(&task(TaskStatus::Processing, 100, "downloading"));
        let b = triple_hash(&task(TaskStatus::Processing, 200, "downloading"));
        let c = triple_hash(&task(TaskStatus::Processing, 100, "downloading"));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
