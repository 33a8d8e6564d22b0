//! The workflow execution engine (`spec.md` §4.3): the resumable state
//! machine that walks steps/modules, resolves templated inputs, suspends on
//! interaction, and persists outputs via event sourcing.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::stream::{self, Stream};
use serde_json::Value as Json;
use uuid::Uuid;

use workflow_core::addon::{merge_decorators, Addon, AddonResult};
use workflow_core::error::{EngineError, EngineResult, ValidationError};
use workflow_core::ids::new_id;
use workflow_core::models::{
    Branch, Event, EventType, LineageEntry, RunStatus, WorkflowRun,
};
use workflow_core::module::{
    ExecutionContext, InteractionRequest, InteractionResponse, ModuleCapability, ModuleRegistry,
    SubActionEvent,
};
use workflow_core::resolver::TemplateResolver;
use workflow_core::storage::Storage;
use workflow_core::value::Value;

use crate::lineage::{fork_lineage, get_lineage_events, latest_by_step_module_type};

/// `(step_id, module_name)` boundary the engine halts *before* executing
/// (`spec.md` §4.3 point 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTarget {
    pub step_id: String,
    pub module_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub current_step: Option<String>,
    pub current_module: Option<String>,
    pub completed_steps: i64,
    pub total_steps: i64,
    pub step_index: i64,
}

/// What the engine hands back to its caller after a call. Transport-shaped
/// mapping to `WorkflowResponse` (`spec.md` §6) happens in `workflow-api`.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub workflow_run_id: Uuid,
    pub status: RunStatus,
    pub message: Option<String>,
    pub progress: Progress,
    pub interaction_request: Option<InteractionRequest>,
    pub result: Option<BTreeMap<String, BTreeMap<String, Value>>>,
}

/// Process-wide advisory gate: at most one engine call per run proceeds at
/// a time (`spec.md` §5). No in-process blocking — a second concurrent call
/// fails immediately with `WorkflowBusy`.
#[derive(Default)]
pub struct RunLocks {
    inflight: Mutex<HashSet<Uuid>>,
}

pub struct RunGuard<'a> {
    locks: &'a RunLocks,
    run_id: Uuid,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.locks.inflight.lock().unwrap().remove(&self.run_id);
    }
}

impl RunLocks {
    pub fn acquire(&self, run_id: Uuid) -> EngineResult<RunGuard<'_>> {
        let mut set = self.inflight.lock().unwrap();
        if !set.insert(run_id) {
            return Err(EngineError::WorkflowBusy(run_id));
        }
        Ok(RunGuard { locks: self, run_id })
    }
}

struct ModuleDef {
    module_id: String,
    name: String,
    inputs: Json,
    outputs_to_state: BTreeMap<String, String>,
    addons: Vec<AddonConfig>,
    sub_actions: Vec<SubActionConfig>,
    #[allow(dead_code)]
    retryable: bool,
}

struct AddonConfig {
    addon_id: String,
    priority: i32,
    inputs: Json,
}

/// One entry of a module's `sub_actions` list (`spec.md` §6): a
/// sub-interaction-scoped side effect the client can invoke by `action_id`
/// while the host module is suspended awaiting its main interaction.
struct SubActionConfig {
    action_id: String,
    module_id: String,
    inputs: Json,
}

struct StepDef {
    step_id: String,
    modules: Vec<ModuleDef>,
}

fn parse_steps(workflow: &Json) -> EngineResult<Vec<StepDef>> {
    let steps = workflow
        .get("steps")
        .and_then(Json::as_array)
        .ok_or_else(|| ValidationError::single("steps", "workflow JSON has no 'steps' array"))?;
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        let step_id = step
            .get("step_id")
            .and_then(Json::as_str)
            .ok_or_else(|| ValidationError::single("steps[].step_id", "missing step_id"))?
            .to_string();
        let modules_json = step
            .get("modules")
            .and_then(Json::as_array)
            .ok_or_else(|| ValidationError::single(&step_id, "step has no 'modules' array"))?;
        let mut modules = Vec::with_capacity(modules_json.len());
        for m in modules_json {
            let module_id = m
                .get("module_id")
                .and_then(Json::as_str)
                .ok_or_else(|| ValidationError::single(&step_id, "module missing module_id"))?
                .to_string();
            let name = m
                .get("name")
                .and_then(Json::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| module_id.clone());
            let inputs = m.get("inputs").cloned().unwrap_or(Json::Object(Default::default()));
            let outputs_to_state = m
                .get("outputs_to_state")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            let addons = m
                .get("addons")
                .and_then(Json::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|a| {
                            Some(AddonConfig {
                                addon_id: a.get("addon_id")?.as_str()?.to_string(),
                                priority: a.get("priority").and_then(Json::as_i64).unwrap_or(0) as i32,
                                inputs: a.get("inputs").cloned().unwrap_or(Json::Null),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let retryable = m.get("retryable").and_then(Json::as_bool).unwrap_or(true);
            let sub_actions = m
                .get("sub_actions")
                .and_then(Json::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|a| {
                            Some(SubActionConfig {
                                action_id: a.get("action_id")?.as_str()?.to_string(),
                                module_id: a.get("module_id")?.as_str()?.to_string(),
                                inputs: a.get("inputs").cloned().unwrap_or(Json::Object(Default::default())),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            modules.push(ModuleDef {
                module_id,
                name,
                inputs,
                outputs_to_state,
                addons,
                sub_actions,
                retryable,
            });
        }
        out.push(StepDef { step_id, modules });
    }
    Ok(out)
}

pub struct Engine<S: Storage> {
    pub storage: Arc<S>,
    pub registry: Arc<ModuleRegistry>,
    pub resolver: Arc<dyn TemplateResolver>,
    pub addons: Arc<BTreeMap<String, Box<dyn Addon>>>,
    pub locks: Arc<RunLocks>,
}

impl<S: Storage> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            addons: self.addons.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S: Storage> Engine<S> {
    pub fn new(
        storage: Arc<S>,
        registry: Arc<ModuleRegistry>,
        resolver: Arc<dyn TemplateResolver>,
        addons: Arc<BTreeMap<String, Box<dyn Addon>>>,
    ) -> Self {
        Self {
            storage,
            registry,
            resolver,
            addons,
            locks: Arc::new(RunLocks::default()),
        }
    }

    /// Starts a new run from a resolved workflow version and drives it to
    /// suspension/completion (`StartWorkflowByVersion`, `spec.md` §6).
    pub async fn start_run(
        &self,
        user_id: Uuid,
        template_id: Uuid,
        version_id: Uuid,
        target: Option<ExecutionTarget>,
        mock: bool,
    ) -> EngineResult<EngineOutcome> {
        let version = self
            .storage
            .get_version(version_id)
            .await?
            .ok_or_else(|| ValidationError::single("version_id", "no such workflow version"))?;

        let workflow_run_id = new_id();
        let branch_id = new_id();
        let branch = Branch {
            branch_id,
            workflow_run_id,
            lineage: vec![LineageEntry {
                branch_id,
                cutoff_event_id: None,
            }],
            created_at: chrono::Utc::now(),
        };
        self.storage.create_branch(branch).await?;

        let run = WorkflowRun {
            workflow_run_id,
            template_id,
            user_id,
            current_workflow_version_id: version_id,
            current_branch_id: branch_id,
            status: RunStatus::Created,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let run = self.storage.create_run(run).await?;

        let guard = self.locks.acquire(workflow_run_id)?;
        self.append_event(
            &run,
            branch_id,
            EventType::WorkflowCreated,
            Json::Null,
            None,
            None,
        )
        .await?;

        let outcome = self
            .advance(&run, branch_id, &version.resolved_workflow, target, mock)
            .await?;
        drop(guard);
        Ok(outcome)
    }

    /// Responds to the pending interaction and resumes the run (`Respond`,
    /// `spec.md` §6, §4.3 "Resume semantics").
    pub async fn respond(
        &self,
        workflow_run_id: Uuid,
        interaction_id: Uuid,
        response: InteractionResponse,
        new_workflow: Option<Json>,
        target: Option<ExecutionTarget>,
        mock: bool,
    ) -> EngineResult<EngineOutcome> {
        let guard = self.locks.acquire(workflow_run_id)?;
        let mut run = self
            .storage
            .get_run(workflow_run_id)
            .await?
            .ok_or_else(|| ValidationError::single("workflow_run_id", "no such run"))?;

        if let Some(new_workflow) = new_workflow {
            // Mid-run version update (`spec.md` §4.3): store if unseen, link
            // the run to it, and continue from the current position.
            let version_id = new_id();
            let content_hash = workflow_core::hash::content_hash(&new_workflow);
            let existing = self
                .storage
                .get_version_by_hash(run.template_id, &content_hash)
                .await?;
            let version = match existing {
                Some(v) => v,
                None => {
                    self.storage
                        .insert_version(workflow_core::models::WorkflowVersion {
                            version_id,
                            template_id: run.template_id,
                            content_hash,
                            source_type: workflow_core::models::SourceType::Json,
                            version_type: workflow_core::models::VersionType::Raw,
                            parent_workflow_version_id: None,
                            requires: Vec::new(),
                            resolved_workflow: new_workflow,
                            selected_paths: BTreeMap::new(),
                            created_at: chrono::Utc::now(),
                        })
                        .await?
                }
            };
            run = self
                .storage
                .update_run(
                    workflow_run_id,
                    run.updated_at,
                    run.status,
                    Some(version.version_id),
                    None,
                )
                .await?;
            self.append_event(
                &run,
                run.current_branch_id,
                EventType::WorkflowResumed,
                serde_json::json!({"new_version_id": version.version_id}),
                None,
                None,
            )
            .await?;
        }

        let version = self
            .storage
            .get_version(run.current_workflow_version_id)
            .await?
            .ok_or_else(|| ValidationError::single("version", "run's current version vanished"))?;

        let lineage_events = get_lineage_events(
            self.storage.as_ref(),
            workflow_run_id,
            &self.branch_lineage(run.current_branch_id).await?,
            None,
        )
        .await?;
        let pending = find_pending_interaction(&lineage_events)
            .ok_or(EngineError::NoPendingInteraction(workflow_run_id))?;
        if pending.request.interaction_id != interaction_id {
            return Err(EngineError::NoPendingInteraction(workflow_run_id));
        }

        let response_event = self
            .append_event(
                &run,
                run.current_branch_id,
                EventType::InteractionResponse,
                serde_json::to_value(&response).unwrap_or(Json::Null),
                Some(pending.step_id.clone()),
                Some(pending.module_name.clone()),
            )
            .await?;

        if response.cancelled {
            drop(guard);
            return Ok(EngineOutcome {
                workflow_run_id,
                status: RunStatus::AwaitingInput,
                message: Some("interaction cancelled".to_string()),
                progress: Progress::default(),
                interaction_request: Some(pending.request.clone()),
                result: None,
            });
        }

        if response.retry_requested || response.jump_back_requested {
            let current_branch = self
                .storage
                .get_branch(run.current_branch_id)
                .await?
                .ok_or_else(|| EngineError::CorruptLineage(workflow_run_id, "current branch missing".into()))?;
            // The branching protocol (`spec.md` §4.1) forks at the event
            // that was "just decided" to be the fork point — here, the
            // `interaction_response` event recorded a moment ago, not some
            // historical response on this branch.
            let cutoff = response_event.event_id;
            let new_branch_id = new_id();
            let new_lineage = fork_lineage(&current_branch, new_branch_id, cutoff);
            self.storage
                .create_branch(Branch {
                    branch_id: new_branch_id,
                    workflow_run_id,
                    lineage: new_lineage,
                    created_at: chrono::Utc::now(),
                })
                .await?;
            run = self
                .storage
                .update_run(
                    workflow_run_id,
                    run.updated_at,
                    RunStatus::Processing,
                    None,
                    Some(new_branch_id),
                )
                .await?;
            self.append_event(
                &run,
                new_branch_id,
                if response.retry_requested {
                    EventType::RetryRequested
                } else {
                    EventType::JumpBackRequested
                },
                serde_json::json!({"feedback": response.retry_feedback, "target": response.jump_back_target}),
                Some(pending.step_id.clone()),
                Some(pending.module_name.clone()),
            )
            .await?;
            let outcome = self.advance(&run, new_branch_id, &version.resolved_workflow, target, mock).await?;
            drop(guard);
            return Ok(outcome);
        }

        let outcome = self
            .resume_module(&run, &version.resolved_workflow, &pending, &response, target, mock)
            .await?;
        drop(guard);
        Ok(outcome)
    }

    /// `SubAction { workflow_run_id, interaction_id, action_id, params }`
    /// (`spec.md` §6): drives the named sub-action's event generator one
    /// step at a time and hands the caller back a stream, so each event
    /// reaches the transport as soon as `next_sub_action_event` yields it
    /// instead of after the whole sub-action finishes. The sub-action is
    /// scoped to the interaction currently pending on `workflow_run_id` and
    /// never touches the run's event log — it is a side channel, not a step.
    pub async fn sub_action(
        &self,
        workflow_run_id: Uuid,
        interaction_id: Uuid,
        action_id: &str,
        params: Json,
    ) -> EngineResult<impl Stream<Item = EngineResult<SubActionEvent>>> {
        let run = self
            .storage
            .get_run(workflow_run_id)
            .await?
            .ok_or_else(|| ValidationError::single("workflow_run_id", "no such run"))?;
        let version = self
            .storage
            .get_version(run.current_workflow_version_id)
            .await?
            .ok_or_else(|| ValidationError::single("version", "run's current version vanished"))?;
        let steps = parse_steps(&version.resolved_workflow)?;

        let lineage = self.branch_lineage(run.current_branch_id).await?;
        let events = get_lineage_events(self.storage.as_ref(), workflow_run_id, &lineage, None).await?;
        let pending = find_pending_interaction(&events).ok_or(EngineError::NoPendingInteraction(workflow_run_id))?;
        if pending.request.interaction_id != interaction_id {
            return Err(EngineError::NoPendingInteraction(workflow_run_id));
        }

        let module_def = steps
            .iter()
            .find(|s| s.step_id == pending.step_id)
            .and_then(|s| s.modules.iter().find(|m| m.name == pending.module_name))
            .ok_or_else(|| EngineError::NoSuchModule {
                step_id: pending.step_id.clone(),
                module_name: pending.module_name.clone(),
            })?;
        let sub_action = module_def
            .sub_actions
            .iter()
            .find(|a| a.action_id == action_id)
            .ok_or_else(|| ValidationError::single("action_id", format!("'{action_id}' is not declared on this module")))?;

        let ctx = self.build_context(&run, &events, &steps).await;
        let mut merged_inputs = sub_action.inputs.clone();
        if let (Json::Object(base), Json::Object(overrides)) = (&mut merged_inputs, &params) {
            for (k, v) in overrides {
                base.insert(k.clone(), v.clone());
            }
        }
        let resolved_inputs = self.resolver.resolve_with_schema(&Value::from(merged_inputs), &ctx_map(&ctx));
        let inputs_map = resolved_inputs.as_map().cloned().unwrap_or_default();

        let Some(ModuleCapability::SubActionHost(mut host)) = self.registry.create(&sub_action.module_id) else {
            return Err(EngineError::ModuleTypeMismatch {
                module_name: sub_action.module_id.clone(),
                expected: "sub_action_host",
                found: "other",
            });
        };
        let module_id = sub_action.module_id.clone();
        host.start(&inputs_map, &ctx).await.map_err(|e| EngineError::ModuleExecution {
            module_name: module_id.clone(),
            error_type: "sub_action_error".into(),
            message: e.to_string(),
            details: Json::Null,
        })?;

        // One `next_sub_action_event` call per stream item, so the caller's
        // SSE response emits each event as it arrives rather than buffering
        // the whole generator first. `None` unfold state means "exhausted".
        let stream = stream::unfold(Some(host), move |state| {
            let module_id = module_id.clone();
            async move {
                let mut host = state?;
                match host.next_sub_action_event().await {
                    Ok(Some(event)) => {
                        let is_terminal = matches!(
                            event,
                            SubActionEvent::Complete { .. } | SubActionEvent::Error { .. } | SubActionEvent::Cancelled
                        );
                        let next_state = if is_terminal { None } else { Some(host) };
                        Some((Ok(event), next_state))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        let err = EngineError::ModuleExecution {
                            module_name: module_id,
                            error_type: "sub_action_error".into(),
                            message: e.to_string(),
                            details: Json::Null,
                        };
                        Some((Err(err), None))
                    }
                }
            }
        });
        Ok(stream)
    }

    /// Standalone `Retry { workflow_run_id, groups?, feedback? }` (`spec.md`
    /// §6): forks a new branch cut off immediately before the first event
    /// belonging to any step in `groups` (or at the branch tip if `groups`
    /// is empty), then re-drives execution from there.
    pub async fn retry(
        &self,
        workflow_run_id: Uuid,
        groups: Vec<String>,
        feedback: Option<String>,
    ) -> EngineResult<EngineOutcome> {
        let guard = self.locks.acquire(workflow_run_id)?;
        let run = self
            .storage
            .get_run(workflow_run_id)
            .await?
            .ok_or_else(|| ValidationError::single("workflow_run_id", "no such run"))?;
        let version = self
            .storage
            .get_version(run.current_workflow_version_id)
            .await?
            .ok_or_else(|| ValidationError::single("version", "run's current version vanished"))?;

        let lineage = self.branch_lineage(run.current_branch_id).await?;
        let events = get_lineage_events(self.storage.as_ref(), workflow_run_id, &lineage, None).await?;

        let cutoff = if groups.is_empty() {
            events.last().map(|e| e.event_id)
        } else {
            let first_in_groups = events
                .iter()
                .find(|e| e.step_id.as_deref().map(|s| groups.iter().any(|g| g == s)).unwrap_or(false));
            match first_in_groups {
                Some(target_event) => events
                    .iter()
                    .filter(|e| e.event_id < target_event.event_id)
                    .map(|e| e.event_id)
                    .max(),
                None => events.last().map(|e| e.event_id),
            }
        }
        .ok_or_else(|| EngineError::CorruptLineage(workflow_run_id, "no events to retry from".into()))?;

        let current_branch = self
            .storage
            .get_branch(run.current_branch_id)
            .await?
            .ok_or_else(|| EngineError::CorruptLineage(workflow_run_id, "current branch missing".into()))?;
        let new_branch_id = new_id();
        let new_lineage = fork_lineage(&current_branch, new_branch_id, cutoff);
        self.storage
            .create_branch(Branch {
                branch_id: new_branch_id,
                workflow_run_id,
                lineage: new_lineage,
                created_at: chrono::Utc::now(),
            })
            .await?;
        let run = self
            .storage
            .update_run(workflow_run_id, run.updated_at, RunStatus::Processing, None, Some(new_branch_id))
            .await?;
        self.append_event(
            &run,
            new_branch_id,
            EventType::RetryRequested,
            serde_json::json!({"groups": groups, "feedback": feedback}),
            None,
            None,
        )
        .await?;

        let outcome = self.advance(&run, new_branch_id, &version.resolved_workflow, None, false).await?;
        drop(guard);
        Ok(outcome)
    }

    /// `GetState { workflow_run_id } -> module-outputs snapshot`.
    pub async fn get_state(&self, workflow_run_id: Uuid) -> EngineResult<BTreeMap<String, BTreeMap<String, Value>>> {
        let run = self
            .storage
            .get_run(workflow_run_id)
            .await?
            .ok_or_else(|| ValidationError::single("workflow_run_id", "no such run"))?;
        let lineage = self.branch_lineage(run.current_branch_id).await?;
        let events = get_lineage_events(self.storage.as_ref(), workflow_run_id, &lineage, None).await?;
        Ok(module_outputs_from_events(&events))
    }

    /// `GetInteractionHistory { workflow_run_id } -> completed (request,
    /// response) pairs + optional pending request`.
    pub async fn get_interaction_history(
        &self,
        workflow_run_id: Uuid,
    ) -> EngineResult<Vec<(InteractionRequest, Option<InteractionResponse>, chrono::DateTime<chrono::Utc>, Option<chrono::DateTime<chrono::Utc>>)>> {
        let run = self
            .storage
            .get_run(workflow_run_id)
            .await?
            .ok_or_else(|| ValidationError::single("workflow_run_id", "no such run"))?;
        let lineage = self.branch_lineage(run.current_branch_id).await?;
        let events = get_lineage_events(self.storage.as_ref(), workflow_run_id, &lineage, None).await?;

        let mut out = Vec::new();
        let mut pending_request: Option<(InteractionRequest, chrono::DateTime<chrono::Utc>)> = None;
        for event in &events {
            match event.event_type {
                EventType::InteractionRequested => {
                    if let Ok(req) = serde_json::from_value::<InteractionRequest>(event.data.clone()) {
                        pending_request = Some((req, event.timestamp));
                    }
                }
                EventType::InteractionResponse => {
                    if let Some((req, requested_at)) = pending_request.take() {
                        let response = serde_json::from_value::<InteractionResponse>(event.data.clone()).ok();
                        out.push((req, response, requested_at, Some(event.timestamp)));
                    }
                }
                _ => {}
            }
        }
        if let Some((req, requested_at)) = pending_request {
            out.push((req, None, requested_at, None));
        }
        Ok(out)
    }

    async fn branch_lineage(&self, branch_id: Uuid) -> EngineResult<Vec<LineageEntry>> {
        let branch = self
            .storage
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| EngineError::CorruptLineage(branch_id, "branch not found".into()))?;
        Ok(branch.lineage)
    }

    async fn append_event(
        &self,
        run: &WorkflowRun,
        branch_id: Uuid,
        event_type: EventType,
        data: Json,
        step_id: Option<String>,
        module_name: Option<String>,
    ) -> EngineResult<Event> {
        let event = Event {
            event_id: new_id(),
            workflow_run_id: run.workflow_run_id,
            branch_id,
            workflow_version_id: run.current_workflow_version_id,
            event_type,
            timestamp: chrono::Utc::now(),
            step_id,
            module_name,
            data,
        };
        Ok(self.storage.append_event(event).await?)
    }

    /// Resolve → classify → dispatch loop over the resolved workflow's
    /// steps/modules (`spec.md` §4.3 "Per-module protocol").
    async fn advance(
        &self,
        run: &WorkflowRun,
        branch_id: Uuid,
        workflow: &Json,
        target: Option<ExecutionTarget>,
        mock: bool,
    ) -> EngineResult<EngineOutcome> {
        let steps = parse_steps(workflow)?;
        let lineage = self.branch_lineage(branch_id).await?;
        let events = get_lineage_events(self.storage.as_ref(), run.workflow_run_id, &lineage, None).await?;
        let deduped = latest_by_step_module_type(&events);
        let completed: HashSet<(String, String)> = deduped
            .iter()
            .filter(|e| e.event_type == EventType::OutputStored)
            .filter_map(|e| Some((e.step_id.clone()?, e.module_name.clone()?)))
            .collect();

        let total_steps = steps.len() as i64;

        for (step_index, step) in steps.iter().enumerate() {
            for module in &step.modules {
                let key = (step.step_id.clone(), module.name.clone());
                if completed.contains(&key) {
                    continue;
                }

                if let Some(t) = &target {
                    if t.step_id == step.step_id && t.module_name == module.name {
                        self.storage
                            .update_run(
                                run.workflow_run_id,
                                run.updated_at,
                                RunStatus::Processing,
                                None,
                                None,
                            )
                            .await
                            .ok();
                        return Ok(EngineOutcome {
                            workflow_run_id: run.workflow_run_id,
                            status: RunStatus::Processing,
                            message: Some("execution target reached".to_string()),
                            progress: Progress {
                                current_step: Some(step.step_id.clone()),
                                current_module: Some(module.name.clone()),
                                completed_steps: step_index as i64,
                                total_steps,
                                step_index: step_index as i64,
                            },
                            interaction_request: None,
                            result: None,
                        });
                    }
                }

                let ctx = self.build_context(run, &events, &steps).await;
                let resolved_inputs = self.resolver.resolve_with_schema(&Value::from(module.inputs.clone()), &ctx_map(&ctx));

                let Some(capability) = self.registry.create(&module.module_id) else {
                    return Err(EngineError::ModuleNotRegistered(module.module_id.clone()));
                };

                match capability {
                    ModuleCapability::Executable(mut exec) => {
                        let outputs = if mock {
                            synth_mock_outputs(&exec.output_schema())
                        } else {
                            let inputs_map = resolved_inputs.as_map().cloned().unwrap_or_default();
                            exec.execute(&inputs_map, &ctx).await.map_err(|e| {
                                EngineError::ModuleExecution {
                                    module_name: module.name.clone(),
                                    error_type: "execution_error".into(),
                                    message: e.to_string(),
                                    details: Json::Null,
                                }
                            })?
                        };
                        self.append_event(
                            run,
                            branch_id,
                            EventType::OutputStored,
                            outputs_to_json(&outputs),
                            Some(step.step_id.clone()),
                            Some(module.name.clone()),
                        )
                        .await?;
                    }
                    ModuleCapability::Interactive(mut int) => {
                        let inputs_map = resolved_inputs.as_map().cloned().unwrap_or_default();
                        let request = int
                            .get_interaction_request(&inputs_map, &ctx)
                            .await
                            .map_err(|e| EngineError::ModuleExecution {
                                module_name: module.name.clone(),
                                error_type: "interaction_error".into(),
                                message: e.to_string(),
                                details: Json::Null,
                            })?;
                        match request {
                            Some(mut req) => {
                                self.decorate_with_addons(&mut req, module);
                                self.append_event(
                                    run,
                                    branch_id,
                                    EventType::InteractionRequested,
                                    serde_json::to_value(&req).unwrap_or(Json::Null),
                                    Some(step.step_id.clone()),
                                    Some(module.name.clone()),
                                )
                                .await?;
                                self.storage
                                    .update_run(
                                        run.workflow_run_id,
                                        run.updated_at,
                                        RunStatus::AwaitingInput,
                                        None,
                                        Some(branch_id),
                                    )
                                    .await
                                    .ok();
                                return Ok(EngineOutcome {
                                    workflow_run_id: run.workflow_run_id,
                                    status: RunStatus::AwaitingInput,
                                    message: None,
                                    progress: Progress {
                                        current_step: Some(step.step_id.clone()),
                                        current_module: Some(module.name.clone()),
                                        completed_steps: step_index as i64,
                                        total_steps,
                                        step_index: step_index as i64,
                                    },
                                    interaction_request: Some(req),
                                    result: None,
                                });
                            }
                            None => {
                                // No interaction needed for this call: the
                                // module is satisfied without a round-trip.
                                let synthetic = InteractionResponse {
                                    value: Json::Null,
                                    cancelled: false,
                                    retry_requested: false,
                                    retry_feedback: None,
                                    retry_groups: Vec::new(),
                                    jump_back_requested: false,
                                    jump_back_target: None,
                                };
                                let outputs = int
                                    .execute_with_response(&inputs_map, &ctx, &synthetic)
                                    .await
                                    .map_err(|e| EngineError::ModuleExecution {
                                        module_name: module.name.clone(),
                                        error_type: "execution_error".into(),
                                        message: e.to_string(),
                                        details: Json::Null,
                                    })?;
                                self.append_event(
                                    run,
                                    branch_id,
                                    EventType::OutputStored,
                                    outputs_to_json(&outputs),
                                    Some(step.step_id.clone()),
                                    Some(module.name.clone()),
                                )
                                .await?;
                            }
                        }
                    }
                    ModuleCapability::SubActionHost(_) => {
                        return Err(EngineError::ModuleTypeMismatch {
                            module_name: module.name.clone(),
                            expected: "executable or interactive",
                            found: "sub_action_host",
                        });
                    }
                }
            }
        }

        self.storage
            .update_run(run.workflow_run_id, run.updated_at, RunStatus::Completed, None, None)
            .await
            .ok();
        self.append_event(run, branch_id, EventType::WorkflowCompleted, Json::Null, None, None)
            .await?;

        let lineage = self.branch_lineage(branch_id).await?;
        let final_events = get_lineage_events(self.storage.as_ref(), run.workflow_run_id, &lineage, None).await?;
        Ok(EngineOutcome {
            workflow_run_id: run.workflow_run_id,
            status: RunStatus::Completed,
            message: None,
            progress: Progress {
                current_step: None,
                current_module: None,
                completed_steps: total_steps,
                total_steps,
                step_index: total_steps,
            },
            interaction_request: None,
            result: Some(module_outputs_from_events(&final_events)),
        })
    }

    /// Continues a run that just received a response for `pending`'s
    /// interactive module, then re-enters `advance` for the remainder.
    async fn resume_module(
        &self,
        run: &WorkflowRun,
        workflow: &Json,
        pending: &PendingInteraction,
        response: &InteractionResponse,
        target: Option<ExecutionTarget>,
        mock: bool,
    ) -> EngineResult<EngineOutcome> {
        let steps = parse_steps(workflow)?;
        let module_def = steps
            .iter()
            .find(|s| s.step_id == pending.step_id)
            .and_then(|s| s.modules.iter().find(|m| m.name == pending.module_name))
            .ok_or_else(|| EngineError::NoSuchModule {
                step_id: pending.step_id.clone(),
                module_name: pending.module_name.clone(),
            })?;

        let branch_id = run.current_branch_id;
        let lineage = self.branch_lineage(branch_id).await?;
        let events = get_lineage_events(self.storage.as_ref(), run.workflow_run_id, &lineage, None).await?;
        let ctx = self.build_context(run, &events, &steps).await;
        let resolved_inputs = self
            .resolver
            .resolve_with_schema(&Value::from(module_def.inputs.clone()), &ctx_map(&ctx));
        let inputs_map = resolved_inputs.as_map().cloned().unwrap_or_default();

        let Some(ModuleCapability::Interactive(mut int)) = self.registry.create(&module_def.module_id) else {
            return Err(EngineError::ModuleTypeMismatch {
                module_name: module_def.name.clone(),
                expected: "interactive",
                found: "other",
            });
        };

        if !module_def.addons.is_empty() {
            let selected: Vec<usize> = response
                .value
                .get("selected_indices")
                .and_then(Json::as_array)
                .map(|a| a.iter().filter_map(Json::as_u64).map(|n| n as usize).collect())
                .unwrap_or_default();
            for cfg in &module_def.addons {
                if let Some(addon) = self.addons.get(&cfg.addon_id) {
                    addon.on_selection(&selected, &cfg.inputs);
                }
            }
        }

        let outputs = if mock {
            BTreeMap::new()
        } else {
            int.execute_with_response(&inputs_map, &ctx, response)
                .await
                .map_err(|e| EngineError::ModuleExecution {
                    module_name: module_def.name.clone(),
                    error_type: "execution_error".into(),
                    message: e.to_string(),
                    details: Json::Null,
                })?
        };
        self.append_event(
            run,
            branch_id,
            EventType::OutputStored,
            outputs_to_json(&outputs),
            Some(pending.step_id.clone()),
            Some(pending.module_name.clone()),
        )
        .await?;

        self.advance(run, branch_id, workflow, target, mock).await
    }

    async fn build_context(&self, run: &WorkflowRun, events: &[Event], steps: &[StepDef]) -> ExecutionContext {
        let deduped = latest_by_step_module_type(events);
        let module_outputs_raw = module_outputs_from_events(&deduped);

        let mut state = BTreeMap::new();
        for step in steps {
            for module in &step.modules {
                if let Some(outputs) = module_outputs_raw.get(&module.name) {
                    for (output_name, state_key) in &module.outputs_to_state {
                        if let Some(v) = outputs.get(output_name) {
                            state.insert(state_key.clone(), v.clone());
                        }
                    }
                }
            }
        }

        ExecutionContext {
            state,
            module_outputs: module_outputs_raw,
            step: BTreeMap::new(),
            config: BTreeMap::new(),
            workflow_run_id: run.workflow_run_id,
            branch_id: run.current_branch_id,
            template_id: run.template_id,
        }
    }

    fn decorate_with_addons(&self, request: &mut InteractionRequest, module: &ModuleDef) {
        if module.addons.is_empty() {
            return;
        }
        let Some(options) = request.fields.get("options").and_then(Json::as_array).cloned() else {
            return;
        };
        let mut sorted_addons = module.addons.iter().collect::<Vec<_>>();
        sorted_addons.sort_by_key(|a| a.priority);

        let mut per_addon_results: Vec<BTreeMap<usize, AddonResult>> = Vec::new();
        for cfg in &sorted_addons {
            if let Some(addon) = self.addons.get(&cfg.addon_id) {
                per_addon_results.push(addon.process(&options, &cfg.inputs, &Json::Null));
            }
        }
        let merged = merge_decorators(&per_addon_results);
        if let Some(Json::Array(items)) = request.fields.get_mut("options") {
            for (idx, item) in items.iter_mut().enumerate() {
                if let Some(metadata) = merged.get(&idx) {
                    if let Some(obj) = item.as_object_mut() {
                        obj.insert("_metadata".to_string(), metadata.clone());
                    }
                }
            }
        }
    }
}

struct PendingInteraction {
    request: InteractionRequest,
    step_id: String,
    module_name: String,
}

/// Resume semantics (`spec.md` §4.3): the last `interaction_requested` not
/// followed by a matching `interaction_response` on the same lineage.
fn find_pending_interaction(events: &[Event]) -> Option<PendingInteraction> {
    let mut last_request: Option<&Event> = None;
    let mut responded: HashSet<(Option<String>, Option<String>)> = HashSet::new();
    for e in events {
        match e.event_type {
            EventType::InteractionResponse => {
                responded.insert((e.step_id.clone(), e.module_name.clone()));
            }
            EventType::InteractionRequested => {
                last_request = Some(e);
                responded.remove(&(e.step_id.clone(), e.module_name.clone()));
            }
            _ => {}
        }
    }
    let event = last_request?;
    if responded.contains(&(event.step_id.clone(), event.module_name.clone())) {
        return None;
    }
    let request: InteractionRequest = serde_json::from_value(event.data.clone()).ok()?;
    Some(PendingInteraction {
        request,
        step_id: event.step_id.clone().unwrap_or_default(),
        module_name: event.module_name.clone().unwrap_or_default(),
    })
}

fn module_outputs_from_events(events: &[Event]) -> BTreeMap<String, BTreeMap<String, Value>> {
    let mut out: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for e in events {
        if e.event_type != EventType::OutputStored {
            continue;
        }
        let Some(module_name) = &e.module_name else { continue };
        let Json::Object(map) = &e.data else { continue };
        let entry = out.entry(module_name.clone()).or_default();
        for (k, v) in map {
            entry.insert(k.clone(), Value::from(v.clone()));
        }
    }
    out
}

fn outputs_to_json(outputs: &BTreeMap<String, Value>) -> Json {
    Json::Object(
        outputs
            .iter()
            .map(|(k, v)| (k.clone(), Json::from(v.clone())))
            .collect(),
    )
}

fn ctx_map(ctx: &ExecutionContext) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    map.insert("state".to_string(), Value::Map(ctx.state.clone().into_iter().collect()));
    map.insert(
        "module".to_string(),
        Value::Map(
            ctx.module_outputs
                .iter()
                .map(|(k, v)| (k.clone(), Value::Map(v.clone().into_iter().collect())))
                .collect(),
        ),
    );
    map.insert("step".to_string(), Value::Map(ctx.step.clone().into_iter().collect()));
    map.insert("config".to_string(), Value::Map(ctx.config.clone().into_iter().collect()));
    map
}

/// Mock mode (`spec.md` §4.3 point 6): synthesize deterministic placeholder
/// outputs from a module's declared output schema instead of executing it.
fn synth_mock_outputs(schema: &Json) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    let Some(properties) = schema.get("properties").and_then(Json::as_object) else {
        return out;
    };
    for (key, prop) in properties {
        let value = match prop.get("type").and_then(Json::as_str) {
            Some("string") => Value::String(format!("mock_{key}")),
            Some("number") | Some("integer") => Value::Number(0.0),
            Some("boolean") => Value::Bool(false),
            Some("array") => Value::List(Vec::new()),
            Some("object") => Value::Map(BTreeMap::new()),
            _ => Value::Null,
        };
        out.insert(key.clone(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_locks_reject_concurrent_acquire() {
        let locks = RunLocks::default();
        let run_id = Uuid::now_v7();
        let guard = locks.acquire(run_id).unwrap();
        let second = locks.acquire(run_id);
        assert!(second.is_err());
        drop(guard);
        assert!(locks.acquire(run_id).is_ok());
    }

    #[test]
    fn find_pending_interaction_returns_none_once_responded() {
        let run_id = Uuid::now_v7();
        let branch_id = Uuid::now_v7();
        let version_id = Uuid::now_v7();
        let req = InteractionRequest {
            interaction_id: Uuid::now_v7(),
            interaction_type: "text_input".into(),
            title: "t".into(),
            fields: Json::Null,
            resolver_schema: None,
        };
        let requested = Event {
            event_id: Uuid::now_v7(),
            workflow_run_id: run_id,
            branch_id,
            workflow_version_id: version_id,
            event_type: EventType::InteractionRequested,
            timestamp: chrono::Utc::now(),
            step_id: Some("s1".into()),
            module_name: Some("m1".into()),
            data: serde_json::to_value(&req).unwrap(),
        };
        let responded = Event {
            event_id: Uuid::now_v7(),
            ..requested.clone()
        };
        let mut responded = responded;
        responded.event_type = EventType::InteractionResponse;

        assert!(find_pending_interaction(&[requested.clone()]).is_some());
        assert!(find_pending_interaction(&[requested, responded]).is_none());
    }

    #[test]
    fn parse_steps_reads_sub_actions() {
        let workflow = serde_json::json!({
            "steps": [{
                "step_id": "s1",
                "modules": [{
                    "module_id": "ui.form",
                    "inputs": {},
                    "sub_actions": [
                        {"action_id": "search", "module_id": "search.live", "inputs": {"scope": "docs"}}
                    ]
                }]
            }]
        });
        let steps = parse_steps(&workflow).unwrap();
        let module = &steps[0].modules[0];
        assert_eq!(module.sub_actions.len(), 1);
        assert_eq!(module.sub_actions[0].action_id, "search");
        assert_eq!(module.sub_actions[0].module_id, "search.live");
    }

    #[test]
    fn mock_outputs_cover_declared_schema_properties() {
        let schema = serde_json::json!({"properties": {"text": {"type": "string"}, "count": {"type": "number"}}});
        let outputs = synth_mock_outputs(&schema);
        assert_eq!(outputs.len(), 2);
        assert!(matches!(outputs.get("text"), Some(Value::String(_))));
        assert!(matches!(outputs.get("count"), Some(Value::Number(_))));
    }
}
