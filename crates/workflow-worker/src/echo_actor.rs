//! Demo `media` actor. Concrete module/task implementations (media
//! generation, file downloads, ...) are explicitly out of scope (`spec.md`
//! §1); this exists only to exercise the `Actor` contract end to end.

use async_trait::async_trait;
use workflow_core::error::QueueError;
use workflow_core::models::QueueTask;
use workflow_queue::Actor;

pub struct EchoActor;

#[async_trait]
impl Actor for EchoActor {
    async fn execute(&self, task: &QueueTask) -> Result<serde_json::Value, QueueError> {
        Ok(serde_json::json!({"echoed": task.payload.clone()}))
    }
}
