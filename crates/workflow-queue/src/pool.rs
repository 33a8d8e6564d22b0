//! Worker pool for task execution (`spec.md` §4.5 "Worker loop"), grounded
//! in the teacher's `durable::worker::pool::WorkerPool` (poll loop +
//! per-task background execution + heartbeat ticker + graceful shutdown),
//! generalized from one heartbeat-per-worker to one heartbeat-per-claimed-task
//! since our `QueueTask` carries its own `heartbeat_at` column rather than a
//! separate worker-registry table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::{watch, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use workflow_core::error::{QueueError, StorageError};
use workflow_core::models::{QueueTask, TaskError};
use workflow_core::storage::Storage;

/// An actor is a worker-side handler category keyed by `QueueTask::actor`
/// (`spec.md` §9 Glossary: "a worker-side handler category that receives
/// tasks of a given kind, e.g. 'media'").
#[async_trait]
pub trait Actor: Send + Sync {
    async fn execute(&self, task: &QueueTask) -> Result<Json, QueueError>;
}

/// Static per-provider concurrency cap (`spec.md` §4.5 "per-provider
/// concurrency caps").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group: String,
    pub max_concurrent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub groups: Vec<GroupConfig>,
    pub max_in_flight: usize,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            groups: Vec::new(),
            max_in_flight: 10,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(groups: Vec<GroupConfig>) -> Self {
        Self {
            groups,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    #[error("no actor registered for: {0}")]
    ActorNotFound(String),
}

pub struct WorkerPool<S: Storage> {
    storage: Arc<S>,
    config: WorkerPoolConfig,
    actors: RwLock<HashMap<String, Arc<dyn Actor>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    in_flight: Arc<Semaphore>,
    poll_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: Storage> WorkerPool<S> {
    pub fn new(storage: Arc<S>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            storage,
            actors: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handle: tokio::sync::Mutex::new(None),
            reclaim_handle: tokio::sync::Mutex::new(None),
            config,
        }
    }

    pub async fn register_actor(&self, actor_name: impl Into<String>, actor: Arc<dyn Actor>) {
        self.actors.write().await.insert(actor_name.into(), actor);
    }

    pub async fn status(&self) -> WorkerPoolStatus {
        *self.status.read().await
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().await;
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        let threshold = chrono::Utc::now() - chrono_duration(self.config.stale_threshold);
        let recovered = self.storage.recover_stale_tasks(threshold).await?;
        if recovered > 0 {
            info!(worker_id = %self.config.worker_id, count = recovered, "recovered stale tasks on startup");
        }

        *self.status.write().await = WorkerPoolStatus::Running;
        self.spawn_poll_loop().await;
        self.spawn_reclaim_loop().await;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().await;
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.in_flight.available_permits() == self.config.max_in_flight {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(worker_id = %self.config.worker_id, "shutdown timeout reached with tasks still in flight");
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write().await = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    async fn spawn_poll_loop(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.poll_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("poll loop: shutdown requested");
                        break;
                    }
                }
            }
        });
        *self.poll_handle.lock().await = Some(handle);
    }

    async fn spawn_reclaim_loop(self: &Arc<Self>) {
        let storage = Arc::clone(&self.storage);
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let worker_id = self.config.worker_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = chrono::Utc::now() - chrono_duration(threshold);
                        match storage.recover_stale_tasks(cutoff).await {
                            Ok(n) if n > 0 => info!(worker_id = %worker_id, count = n, "reclaimed stale tasks"),
                            Ok(_) => {}
                            Err(e) => error!(worker_id = %worker_id, error = %e, "stale task reclamation failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
        });
        *self.reclaim_handle.lock().await = Some(handle);
    }

    async fn poll_once(self: &Arc<Self>) {
        for group in &self.config.groups {
            let processing = match self.storage.count_processing(&group.group).await {
                Ok(n) => n,
                Err(e) => {
                    error!(group = %group.group, error = %e, "count_processing failed");
                    continue;
                }
            };
            let avail = group.max_concurrent - processing;
            if avail <= 0 {
                continue;
            }
            let queued = match self.storage.get_queued_tasks_by_group(&group.group, avail).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(group = %group.group, error = %e, "get_queued_tasks_by_group failed");
                    continue;
                }
            };
            for task in queued {
                let permit = match Arc::clone(&self.in_flight).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let claimed = match self
                    .storage
                    .claim_task(task.task_id, &self.config.worker_id, &group.group, group.max_concurrent)
                    .await
                {
                    Ok(Some(t)) => t,
                    Ok(None) => {
                        drop(permit);
                        continue;
                    }
                    Err(e) => {
                        error!(task_id = %task.task_id, error = %e, "claim_task failed");
                        drop(permit);
                        continue;
                    }
                };

                let actors = self.actors.read().await;
                let Some(actor) = actors.get(&claimed.actor).cloned() else {
                    warn!(actor = %claimed.actor, "no actor registered, leaving task claimed for manual recovery");
                    drop(permit);
                    continue;
                };
                drop(actors);

                let storage = Arc::clone(&self.storage);
                let heartbeat_interval = self.config.heartbeat_interval;
                tokio::spawn(run_claimed_task(storage, actor, claimed, heartbeat_interval, permit));
            }
        }
    }
}

async fn run_claimed_task<S: Storage>(
    storage: Arc<S>,
    actor: Arc<dyn Actor>,
    task: QueueTask,
    heartbeat_interval: Duration,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let task_id = task.task_id;
    let stop = Arc::new(Notify::new());
    let hb_storage = Arc::clone(&storage);
    let hb_stop = Arc::clone(&stop);
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = hb_storage.update_heartbeat(task_id).await {
                        error!(%task_id, error = %e, "heartbeat update failed");
                    }
                }
                _ = hb_stop.notified() => break,
            }
        }
    });

    let result = actor.execute(&task).await;
    stop.notify_one();
    let _ = heartbeat.await;

    match result {
        Ok(output) => {
            if let Err(e) = storage.complete_task(task_id, output).await {
                error!(%task_id, error = %e, "failed to mark task complete");
            }
        }
        Err(err) => {
            let task_error = TaskError {
                error_type: err.error_type,
                message: err.message,
                details: err.details,
                stack: None,
            };
            if let Err(e) = storage.fail_task(task_id, task_error).await {
                error!(%task_id, error = %e, "failed to mark task failed");
            }
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_limits() {
        let config = WorkerPoolConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.max_in_flight, 10);
        assert!(config.heartbeat_interval < config.stale_threshold);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = WorkerPoolConfig::new(vec![GroupConfig {
            group: "media".into(),
            max_concurrent: 2,
        }])
        .with_worker_id("w-1")
        .with_max_in_flight(4);
        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.groups[0].group, "media");
    }

    #[test]
    fn status_variants_are_distinct() {
        assert_ne!(WorkerPoolStatus::Running, WorkerPoolStatus::Stopped);
        assert_ne!(WorkerPoolStatus::Draining, WorkerPoolStatus::Running);
    }
}
