//! The module contract (`spec.md` §4.3, §9). A module is polymorphic over a
//! capability set; the registry stores factories so every dispatch gets a
//! fresh instance (no state leakage across calls), per `spec.md` §9's
//! "Global module registry" design note.

use crate::error::{EngineResult, ValidationIssue};
use crate::value::Value;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Context available to a module call: accumulated `state`, per-module
/// `outputs`, the current `step` config, and static `config`. Mirrors the
/// resolver context shape in `spec.md` §4.4.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub state: BTreeMap<String, Value>,
    pub module_outputs: BTreeMap<String, BTreeMap<String, Value>>,
    pub step: BTreeMap<String, Value>,
    pub config: BTreeMap<String, Value>,
    pub workflow_run_id: Uuid,
    pub branch_id: Uuid,
    pub template_id: Uuid,
}

/// A request for user input, tagged by interaction type (`spec.md` §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InteractionRequest {
    pub interaction_id: Uuid,
    pub interaction_type: String,
    pub title: String,
    pub fields: Json,
    pub resolver_schema: Option<Json>,
}

/// The user's answer to an `InteractionRequest` (`spec.md` §6). Kept as a
/// permissive JSON bag at the contract boundary; modules interpret the
/// fields relevant to their own interaction type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InteractionResponse {
    pub value: Json,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub retry_requested: bool,
    #[serde(default)]
    pub retry_feedback: Option<String>,
    #[serde(default)]
    pub retry_groups: Vec<String>,
    #[serde(default)]
    pub jump_back_requested: bool,
    #[serde(default)]
    pub jump_back_target: Option<String>,
}

/// Outputs a module produces, keyed by output name.
pub type ModuleOutputs = BTreeMap<String, Value>;

#[async_trait]
pub trait ExecutableModule: Send + Sync {
    async fn execute(
        &mut self,
        inputs: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> EngineResult<ModuleOutputs>;

    /// Declared output schema, used by mock mode to synthesize placeholder
    /// outputs without running `execute` (`spec.md` §4.3 point 6).
    fn output_schema(&self) -> Json {
        Json::Object(Default::default())
    }
}

#[async_trait]
pub trait InteractiveModule: Send + Sync {
    async fn get_interaction_request(
        &mut self,
        inputs: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> EngineResult<Option<InteractionRequest>>;

    async fn execute_with_response(
        &mut self,
        inputs: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
        response: &InteractionResponse,
    ) -> EngineResult<ModuleOutputs>;
}

#[async_trait]
pub trait SubActionHostModule: Send + Sync {
    /// Seeds the generator with its resolved inputs and context before the
    /// first `next_sub_action_event` call. Mirrors `ExecutableModule::execute`
    /// and `InteractiveModule::get_interaction_request` taking inputs/ctx on
    /// their first call.
    async fn start(&mut self, inputs: &BTreeMap<String, Value>, ctx: &ExecutionContext) -> EngineResult<()>;

    /// A single step of a streaming side effect. Returns `Some(event)` while
    /// the sub-action is in flight and `None` once exhausted.
    async fn next_sub_action_event(&mut self) -> EngineResult<Option<SubActionEvent>>;
}

/// The nine event kinds a sub-action generator may emit (`spec.md` §6: a
/// sub-action streams `{started, progress, interaction, complete, error,
/// cancelled, validation_failed, state_snapshot, state_update}` over SSE).
/// `Interaction`/`ValidationFailed`/`StateSnapshot`/`StateUpdate` exist for
/// sub-actions that need to pause for input or narrate their own state
/// changes mid-stream, mirroring the main run's own event vocabulary.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubActionEvent {
    Started,
    Progress { message: String, elapsed_ms: i64 },
    Interaction { request: InteractionRequest },
    Complete { result: Json },
    Error { message: String },
    Cancelled,
    ValidationFailed { issues: Vec<ValidationIssue> },
    StateSnapshot { state: Json },
    StateUpdate { state: Json },
}

/// Sum type over the three module shapes (`spec.md` §9).
pub enum ModuleCapability {
    Executable(Box<dyn ExecutableModule>),
    Interactive(Box<dyn InteractiveModule>),
    SubActionHost(Box<dyn SubActionHostModule>),
}

impl ModuleCapability {
    pub fn kind(&self) -> &'static str {
        match self {
            ModuleCapability::Executable(_) => "executable",
            ModuleCapability::Interactive(_) => "interactive",
            ModuleCapability::SubActionHost(_) => "sub_action_host",
        }
    }
}

/// Factory for a module, invoked fresh per call.
pub type ModuleFactory = Box<dyn Fn() -> ModuleCapability + Send + Sync>;

/// Immutable-after-construction registry of module factories, keyed by
/// `module_id`. Constructed once at process start (`spec.md` §5, §9).
pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        module_id: impl Into<String>,
        factory: impl Fn() -> ModuleCapability + Send + Sync + 'static,
    ) {
        self.factories.insert(module_id.into(), Box::new(factory));
    }

    pub fn create(&self, module_id: &str) -> Option<ModuleCapability> {
        self.factories.get(module_id).map(|f| f())
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.factories.contains_key(module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ExecutableModule for Echo {
        async fn execute(
            &mut self,
            inputs: &BTreeMap<String, Value>,
            _ctx: &ExecutionContext,
        ) -> EngineResult<ModuleOutputs> {
            Ok(inputs.clone())
        }
    }

    #[test]
    fn registry_creates_fresh_instances() {
        let mut registry = ModuleRegistry::new();
        registry.register("test.echo", || ModuleCapability::Executable(Box::new(Echo)));
        assert!(registry.contains("test.echo"));
        assert!(registry.create("test.echo").is_some());
        assert!(registry.create("test.missing").is_none());
    }
}
