//! End-to-end scenarios against `MemoryStorage` (`spec.md` §8: "Concrete
//! end-to-end scenarios"), following the teacher's integration-test style
//! of driving the real component against an in-memory double rather than
//! mocking it (`everruns-api/tests/integration_test.rs`,
//! `control-plane/tests/integration_test.rs`).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use workflow_core::addon::Addon;
use workflow_core::error::EngineResult;
use workflow_core::models::{EventType, RunStatus, SourceType, VersionType};
use workflow_core::module::{
    ExecutionContext, ExecutableModule, InteractionRequest, InteractionResponse, InteractiveModule, ModuleCapability,
    ModuleOutputs, ModuleRegistry,
};
use workflow_core::resolver::TemplateResolver;
use workflow_core::storage::{EventFilter, Storage};
use workflow_core::value::Value;
use workflow_engine::resolver::SchemaResolver;
use workflow_engine::{Engine, ExecutionTarget};
use workflow_sandbox::MemoryStorage;

/// Stores `{value: 1}` unconditionally, matching scenario 1's `m_exec`.
struct StoresOne;

#[async_trait]
impl ExecutableModule for StoresOne {
    async fn execute(&mut self, _inputs: &BTreeMap<String, Value>, _ctx: &ExecutionContext) -> EngineResult<ModuleOutputs> {
        let mut out = BTreeMap::new();
        out.insert("value".to_string(), Value::Number(1.0));
        Ok(out)
    }
}

/// Asks for a string once, then echoes it back as `text` (scenario 2/3's
/// `s1` interactive module).
#[derive(Default)]
struct TextInput;

#[async_trait]
impl InteractiveModule for TextInput {
    async fn get_interaction_request(
        &mut self,
        _inputs: &BTreeMap<String, Value>,
        _ctx: &ExecutionContext,
    ) -> EngineResult<Option<InteractionRequest>> {
        Ok(Some(InteractionRequest {
            interaction_id: Uuid::now_v7(),
            interaction_type: "text_input".to_string(),
            title: "Enter a value".to_string(),
            fields: json!({}),
            resolver_schema: None,
        }))
    }

    async fn execute_with_response(
        &mut self,
        _inputs: &BTreeMap<String, Value>,
        _ctx: &ExecutionContext,
        response: &InteractionResponse,
    ) -> EngineResult<ModuleOutputs> {
        let mut out = BTreeMap::new();
        out.insert(
            "text".to_string(),
            Value::String(response.value.as_str().unwrap_or_default().to_string()),
        );
        Ok(out)
    }
}

fn registry() -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry.register("test.stores_one", || ModuleCapability::Executable(Box::new(StoresOne)));
    registry.register("test.text_input", || ModuleCapability::Interactive(Box::new(TextInput)));
    Arc::new(registry)
}

async fn build_engine() -> (Engine<MemoryStorage>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let resolver: Arc<dyn TemplateResolver> = Arc::new(SchemaResolver);
    let addons: Arc<BTreeMap<String, Box<dyn Addon>>> = Arc::new(BTreeMap::new());
    let engine = Engine::new(storage.clone(), registry(), resolver, addons);
    (engine, storage)
}

async fn register_version(storage: &MemoryStorage, workflow: serde_json::Value) -> (Uuid, Uuid) {
    let template = storage.get_or_create_template(Uuid::now_v7(), "lifecycle-test").await.unwrap();
    let content_hash = workflow_core::hash::content_hash(&workflow);
    let version = storage
        .insert_version(workflow_core::models::WorkflowVersion {
            version_id: Uuid::now_v7(),
            template_id: template.template_id,
            content_hash,
            source_type: SourceType::Json,
            version_type: VersionType::Raw,
            parent_workflow_version_id: None,
            requires: Vec::new(),
            resolved_workflow: workflow,
            selected_paths: BTreeMap::new(),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    (template.template_id, version.version_id)
}

/// Scenario 1: linear run, two executable modules, both store `{value: 1}`.
#[tokio::test]
async fn linear_run_completes_with_two_output_stored_events() {
    let (engine, storage) = build_engine().await;
    let workflow = json!({
        "steps": [
            {"step_id": "s1", "modules": [{"module_id": "test.stores_one", "name": "m_exec", "inputs": {}}]},
            {"step_id": "s2", "modules": [{"module_id": "test.stores_one", "name": "m_exec", "inputs": {}}]}
        ]
    });
    let (template_id, version_id) = register_version(&storage, workflow).await;
    let template = storage.get_template(template_id).await.unwrap().unwrap();

    let outcome = engine
        .start_run(template.user_id, template_id, version_id, None, false)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);

    let state = engine.get_state(outcome.workflow_run_id).await.unwrap();
    assert_eq!(state["m_exec"]["value"], Value::Number(1.0));

    let run = storage.get_run(outcome.workflow_run_id).await.unwrap().unwrap();
    let events = storage
        .get_events(
            outcome.workflow_run_id,
            EventFilter {
                event_types: Some(vec![EventType::OutputStored]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(run.status, RunStatus::Completed);
}

/// Scenario 2: interactive suspension then resume completes the run.
#[tokio::test]
async fn interactive_suspend_then_respond_completes() {
    let (engine, storage) = build_engine().await;
    let workflow = json!({
        "steps": [{"step_id": "s1", "modules": [{"module_id": "test.text_input", "name": "text_input", "inputs": {}}]}]
    });
    let (template_id, version_id) = register_version(&storage, workflow).await;
    let template = storage.get_template(template_id).await.unwrap().unwrap();

    let started = engine
        .start_run(template.user_id, template_id, version_id, None, false)
        .await
        .unwrap();
    assert_eq!(started.status, RunStatus::AwaitingInput);
    let interaction = started.interaction_request.expect("expected a pending interaction");

    let completed = engine
        .respond(
            started.workflow_run_id,
            interaction.interaction_id,
            InteractionResponse {
                value: json!("x"),
                cancelled: false,
                retry_requested: false,
                retry_feedback: None,
                retry_groups: Vec::new(),
                jump_back_requested: false,
                jump_back_target: None,
            },
            None,
            None,
            false,
        )
        .await
        .unwrap();

    assert_eq!(completed.status, RunStatus::Completed);
    let state = engine.get_state(started.workflow_run_id).await.unwrap();
    assert_eq!(state["text_input"]["text"], Value::String("x".to_string()));
}

/// Scenario 3: a retry response forks a new branch whose replay hides the
/// response, landing back in `awaiting_input` with a fresh interaction id.
#[tokio::test]
async fn retry_response_forks_branch_and_reopens_interaction() {
    let (engine, storage) = build_engine().await;
    let workflow = json!({
        "steps": [{"step_id": "s1", "modules": [{"module_id": "test.text_input", "name": "text_input", "inputs": {}}]}]
    });
    let (template_id, version_id) = register_version(&storage, workflow).await;
    let template = storage.get_template(template_id).await.unwrap().unwrap();

    let started = engine
        .start_run(template.user_id, template_id, version_id, None, false)
        .await
        .unwrap();
    let first_interaction = started.interaction_request.clone().unwrap();
    let original_branch = storage.get_run(started.workflow_run_id).await.unwrap().unwrap().current_branch_id;

    let retried = engine
        .respond(
            started.workflow_run_id,
            first_interaction.interaction_id,
            InteractionResponse {
                value: json!(null),
                cancelled: false,
                retry_requested: true,
                retry_feedback: Some("try again".to_string()),
                retry_groups: vec!["s1".to_string()],
                jump_back_requested: false,
                jump_back_target: None,
            },
            None,
            None,
            false,
        )
        .await
        .unwrap();

    assert_eq!(retried.status, RunStatus::AwaitingInput);
    let second_interaction = retried.interaction_request.expect("retry should reopen an interaction");
    assert_ne!(second_interaction.interaction_id, first_interaction.interaction_id);

    let run_after = storage.get_run(started.workflow_run_id).await.unwrap().unwrap();
    assert_ne!(run_after.current_branch_id, original_branch);

    let new_branch = storage.get_branch(run_after.current_branch_id).await.unwrap().unwrap();
    assert_eq!(new_branch.lineage.last().unwrap().branch_id, new_branch.branch_id);
    assert!(new_branch.lineage.last().unwrap().cutoff_event_id.is_none());
    assert!(new_branch.lineage[..new_branch.lineage.len() - 1]
        .iter()
        .all(|entry| entry.cutoff_event_id.is_some()));
}
