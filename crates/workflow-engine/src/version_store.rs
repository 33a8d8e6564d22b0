//! Version store & execution-group expansion (`spec.md` §4.2).

use serde_json::{Map as JsonMap, Value as Json};
use std::collections::BTreeMap;
use uuid::Uuid;
use workflow_core::error::{StorageResult, ValidationError, ValidationIssue};
use workflow_core::hash;
use workflow_core::ids::new_id;
use workflow_core::models::{CapabilityRequirement, SourceType, VersionType, WorkflowTemplate, WorkflowVersion};
use workflow_core::storage::Storage;

const EXECUTION_GROUPS_MODULE_ID: &str = "execution-groups";
const VALIDATOR_MODULE_ID: &str = "io.validate";

#[derive(Debug, Clone)]
pub struct ExpansionVariant {
    pub flattened_workflow: Json,
    pub requires: Vec<CapabilityRequirement>,
    pub selected_paths: BTreeMap<String, String>,
}

struct MetaNodeLocation {
    step_index: usize,
    module_index: usize,
    group_name: String,
    paths: Vec<Json>,
    output_schema: Option<Json>,
}

fn find_meta_nodes(workflow: &Json) -> Vec<MetaNodeLocation> {
    let mut out = Vec::new();
    let Some(steps) = workflow.get("steps").and_then(Json::as_array) else {
        return out;
    };
    for (step_index, step) in steps.iter().enumerate() {
        let Some(modules) = step.get("modules").and_then(Json::as_array) else {
            continue;
        };
        for (module_index, module) in modules.iter().enumerate() {
            if module.get("module_id").and_then(Json::as_str) == Some(EXECUTION_GROUPS_MODULE_ID) {
                let group_name = module
                    .get("name")
                    .and_then(Json::as_str)
                    .unwrap_or_default()
                    .to_string();
                let paths = module
                    .get("groups")
                    .and_then(Json::as_array)
                    .cloned()
                    .unwrap_or_default();
                let output_schema = module.get("output_schema").cloned();
                out.push(MetaNodeLocation {
                    step_index,
                    module_index,
                    group_name,
                    paths,
                    output_schema,
                });
            }
        }
    }
    out
}

fn path_requires(path: &Json) -> Vec<CapabilityRequirement> {
    path.get("requires")
        .and_then(|v| serde_json::from_value::<Vec<CapabilityRequirement>>(v.clone()).ok())
        .unwrap_or_default()
}

fn sorted_property_keys(schema: &Json) -> Vec<String> {
    let mut keys: Vec<String> = schema
        .get("properties")
        .and_then(Json::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}

/// Deterministic pure function (`spec.md` §4.2). Returns one variant per
/// element of the cartesian product of path names across every
/// execution-groups meta-node; an empty node list yields a single
/// pass-through variant.
pub fn expand_execution_groups(workflow: &Json) -> Result<Vec<ExpansionVariant>, ValidationError> {
    let nodes = find_meta_nodes(workflow);
    if nodes.is_empty() {
        return Ok(vec![ExpansionVariant {
            flattened_workflow: workflow.clone(),
            requires: Vec::new(),
            selected_paths: BTreeMap::new(),
        }]);
    }

    let mut issues = Vec::new();
    for node in &nodes {
        if node.group_name.is_empty() {
            issues.push(ValidationIssue::new(
                "execution-groups.name",
                "execution-groups meta-node is missing a name",
            ));
        }
        if node.paths.is_empty() {
            issues.push(ValidationIssue::new(
                format!("execution-groups.{}", node.group_name),
                "execution-groups meta-node declares no paths",
            ));
        }
    }
    if !issues.is_empty() {
        return Err(ValidationError { issues });
    }

    // Cartesian product of path indices, one axis per meta-node.
    let axis_sizes: Vec<usize> = nodes.iter().map(|n| n.paths.len()).collect();
    let total: usize = axis_sizes.iter().product();
    let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
    for &size in &axis_sizes {
        let mut next = Vec::with_capacity(combos.len() * size);
        for combo in &combos {
            for i in 0..size {
                let mut c = combo.clone();
                c.push(i);
                next.push(c);
            }
        }
        combos = next;
    }
    debug_assert_eq!(combos.len(), total.max(1));

    let mut variants = Vec::with_capacity(combos.len());
    for combo in combos {
        let mut selected_paths = BTreeMap::new();
        let mut requires: Vec<CapabilityRequirement> = Vec::new();
        let mut flattened = workflow.clone();

        let steps = flattened
            .get_mut("steps")
            .and_then(Json::as_array_mut)
            .expect("steps array present: checked by find_meta_nodes");

        // Group meta-node locations by step so a step with multiple
        // meta-nodes gets all of them replaced in one pass.
        let mut by_step: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (node_idx, node) in nodes.iter().enumerate() {
            by_step.entry(node.step_index).or_default().push((node.module_index, node_idx));
        }

        for (step_index, mut locations) in by_step {
            locations.sort();
            let step = &mut steps[step_index];
            let modules = step
                .get_mut("modules")
                .and_then(Json::as_array_mut)
                .expect("modules array present: checked by find_meta_nodes");

            let mut rebuilt: Vec<Json> = Vec::new();
            let mut loc_iter = locations.into_iter().peekable();
            for (module_index, module) in modules.iter().enumerate() {
                if let Some(&(next_module_index, node_idx)) = loc_iter.peek() {
                    if next_module_index == module_index {
                        loc_iter.next();
                        let node = &nodes[node_idx];
                        let path_index = combo[node_idx];
                        let path = &node.paths[path_index];
                        let path_name = path
                            .get("name")
                            .and_then(Json::as_str)
                            .unwrap_or_default()
                            .to_string();
                        selected_paths.insert(node.group_name.clone(), path_name.clone());
                        requires.extend(path_requires(path));

                        let inlined = path.get("modules").and_then(Json::as_array).cloned().unwrap_or_default();
                        for (i, inlined_module) in inlined.into_iter().enumerate() {
                            rebuilt.push(annotate_expanded(
                                inlined_module,
                                &node.group_name,
                                i as i64,
                                &path_name,
                                false,
                            ));
                        }
                        if let Some(schema) = &node.output_schema {
                            rebuilt.push(synthetic_validator(schema, &node.group_name, &path_name));
                        }
                        continue;
                    }
                }
                rebuilt.push(module.clone());
            }
            *modules = rebuilt;
        }

        variants.push(ExpansionVariant {
            flattened_workflow: flattened,
            requires,
            selected_paths,
        });
    }

    Ok(variants)
}

fn annotate_expanded(mut module: Json, group_name: &str, index: i64, path_name: &str, is_group_exit: bool) -> Json {
    if let Some(obj) = module.as_object_mut() {
        let metadata = obj.entry("_metadata").or_insert_with(|| Json::Object(JsonMap::new()));
        if let Some(meta_obj) = metadata.as_object_mut() {
            meta_obj.insert("expanded_from".into(), Json::String(group_name.to_string()));
            meta_obj.insert("expanded_index".into(), Json::from(index));
            meta_obj.insert("path_name".into(), Json::String(path_name.to_string()));
            if is_group_exit {
                meta_obj.insert(
                    "group_origin".into(),
                    serde_json::json!({
                        "group_name": group_name,
                        "path_name": path_name,
                        "is_group_exit": true,
                        "auto_generated": true,
                    }),
                );
            }
        }
    }
    module
}

fn synthetic_validator(schema: &Json, group_name: &str, path_name: &str) -> Json {
    let state_keys = sorted_property_keys(schema);
    let module = serde_json::json!({
        "module_id": VALIDATOR_MODULE_ID,
        "inputs": {
            "schema": schema,
            "state_keys": state_keys,
        },
    });
    annotate_expanded(module, group_name, -1, path_name, true)
}

/// `getOrCreateTemplate` / `getOrCreateVersion` (`spec.md` §4.2).
pub struct VersionStore<'s, S: Storage> {
    storage: &'s S,
}

impl<'s, S: Storage> VersionStore<'s, S> {
    pub fn new(storage: &'s S) -> Self {
        Self { storage }
    }

    pub async fn get_or_create_template(
        &self,
        user_id: Uuid,
        template_name: &str,
    ) -> StorageResult<WorkflowTemplate> {
        self.storage.get_or_create_template(user_id, template_name).await
    }

    /// `getOrCreateVersion(template_id, content_hash, source_type,
    /// resolved_workflow) -> (version_id, is_new)`.
    pub async fn get_or_create_version(
        &self,
        template_id: Uuid,
        source_type: SourceType,
        version_type: VersionType,
        parent_workflow_version_id: Option<Uuid>,
        requires: Vec<CapabilityRequirement>,
        selected_paths: BTreeMap<String, String>,
        resolved_workflow: Json,
    ) -> StorageResult<(WorkflowVersion, bool)> {
        let content_hash = hash::content_hash(&resolved_workflow);
        if let Some(existing) = self.storage.get_version_by_hash(template_id, &content_hash).await? {
            return Ok((existing, false));
        }
        let version = WorkflowVersion {
            version_id: new_id(),
            template_id,
            content_hash,
            source_type,
            version_type,
            parent_workflow_version_id,
            requires,
            resolved_workflow,
            selected_paths,
            created_at: chrono::Utc::now(),
        };
        let inserted = self.storage.insert_version(version).await?;
        Ok((inserted, true))
    }

    /// Registers an upload end-to-end: if the workflow contains no
    /// execution-groups meta-nodes it is stored as a single `raw` version;
    /// otherwise the unresolved parent plus every resolved variant are
    /// persisted (`spec.md` §4.2 Persistence).
    pub async fn register_upload(
        &self,
        template_id: Uuid,
        source_type: SourceType,
        resolved_workflow: Json,
    ) -> Result<Vec<WorkflowVersion>, EngineValidationOrStorage> {
        let has_groups = !find_meta_nodes(&resolved_workflow).is_empty();
        if !has_groups {
            let (version, _) = self
                .get_or_create_version(
                    template_id,
                    source_type,
                    VersionType::Raw,
                    None,
                    Vec::new(),
                    BTreeMap::new(),
                    resolved_workflow,
                )
                .await
                .map_err(EngineValidationOrStorage::Storage)?;
            return Ok(vec![version]);
        }

        let (parent, _) = self
            .get_or_create_version(
                template_id,
                source_type,
                VersionType::Unresolved,
                None,
                Vec::new(),
                BTreeMap::new(),
                resolved_workflow.clone(),
            )
            .await
            .map_err(EngineValidationOrStorage::Storage)?;

        let variants =
            expand_execution_groups(&resolved_workflow).map_err(EngineValidationOrStorage::Validation)?;

        let mut out = Vec::with_capacity(variants.len());
        for variant in variants {
            let (version, _) = self
                .get_or_create_version(
                    template_id,
                    source_type,
                    VersionType::Resolved,
                    Some(parent.version_id),
                    variant.requires,
                    variant.selected_paths,
                    variant.flattened_workflow,
                )
                .await
                .map_err(EngineValidationOrStorage::Storage)?;
            out.push(version);
        }
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineValidationOrStorage {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] workflow_core::error::StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow_with_one_group(paths: usize) -> Json {
        let groups: Vec<Json> = (0..paths)
            .map(|i| {
                json!({
                    "name": format!("path_{i}"),
                    "requires": [{"capability": format!("cap_{i}"), "priority": 10}],
                    "modules": [{"module_id": "noop", "inputs": {}}],
                })
            })
            .collect();
        json!({
            "workflow_id": "wf",
            "config": {},
            "steps": [{
                "step_id": "s1",
                "modules": [{
                    "module_id": "execution-groups",
                    "name": "format",
                    "groups": groups,
                }],
            }],
        })
    }

    #[test]
    fn no_meta_nodes_returns_single_unchanged_variant() {
        let wf = json!({"workflow_id": "wf", "config": {}, "steps": []});
        let variants = expand_execution_groups(&wf).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].flattened_workflow, wf);
        assert!(variants[0].selected_paths.is_empty());
    }

    #[test]
    fn single_group_produces_n_variants() {
        let wf = workflow_with_one_group(3);
        let variants = expand_execution_groups(&wf).unwrap();
        assert_eq!(variants.len(), 3);
        for (i, v) in variants.iter().enumerate() {
            assert_eq!(v.selected_paths.get("format"), Some(&format!("path_{i}")));
            assert_eq!(v.requires[0].capability, format!("cap_{i}"));
        }
    }

    #[test]
    fn two_groups_produce_cartesian_product() {
        let mut wf = workflow_with_one_group(2);
        let second_group = json!({
            "module_id": "execution-groups",
            "name": "tone",
            "groups": [
                {"name": "formal", "requires": [], "modules": [{"module_id": "noop", "inputs": {}}]},
                {"name": "casual", "requires": [], "modules": [{"module_id": "noop", "inputs": {}}]},
            ],
        });
        wf["steps"][0]["modules"]
            .as_array_mut()
            .unwrap()
            .push(second_group.take());
        let variants = expand_execution_groups(&wf).unwrap();
        assert_eq!(variants.len(), 4);
    }

    #[test]
    fn output_schema_appends_synthetic_validator() {
        let mut wf = workflow_with_one_group(1);
        wf["steps"][0]["modules"][0]["output_schema"] =
            json!({"properties": {"b": {}, "a": {}}});
        let variants = expand_execution_groups(&wf).unwrap();
        let modules = variants[0].flattened_workflow["steps"][0]["modules"].as_array().unwrap();
        assert_eq!(modules.len(), 2);
        let validator = &modules[1];
        assert_eq!(validator["module_id"], "io.validate");
        assert_eq!(validator["inputs"]["state_keys"], json!(["a", "b"]));
        assert_eq!(validator["_metadata"]["expanded_index"], -1);
    }

    #[test]
    fn missing_group_name_is_a_validation_error() {
        let mut wf = workflow_with_one_group(1);
        wf["steps"][0]["modules"][0]["name"] = Json::Null;
        let err = expand_execution_groups(&wf).unwrap_err();
        assert!(!err.issues.is_empty());
    }
}
