//! The one module id the engine itself can emit into a workflow:
//! `io.validate`, the synthetic validator `version_store::synthetic_validator`
//! appends after an execution-groups meta-node with an `output_schema`
//! (`spec.md` §4.2 point 5). Every other module id is host-registered.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as Json;

use workflow_core::error::EngineResult;
use workflow_core::module::{ExecutionContext, ExecutableModule, ModuleOutputs};
use workflow_core::value::Value;

pub const VALIDATE_MODULE_ID: &str = "io.validate";

/// Checks that `inputs.state_keys` are all present in `ctx.state` and, where
/// the schema names a primitive type for that key, that the stored value's
/// shape agrees with it.
pub struct ValidateModule;

#[async_trait]
impl ExecutableModule for ValidateModule {
    async fn execute(
        &mut self,
        inputs: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> EngineResult<ModuleOutputs> {
        let schema = inputs.get("schema").map(|v| Json::from(v.clone())).unwrap_or(Json::Null);
        let state_keys: Vec<String> = inputs
            .get("state_keys")
            .and_then(|v| match v {
                Value::List(items) => Some(
                    items
                        .iter()
                        .filter_map(|i| match i {
                            Value::String(s) => Some(s.clone()),
                            _ => None,
                        })
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default();

        let properties = schema.get("properties").and_then(Json::as_object);
        let mut errors = Vec::new();
        for key in &state_keys {
            let Some(value) = ctx.state.get(key) else {
                errors.push(format!("missing state key '{key}'"));
                continue;
            };
            if let Some(expected_type) = properties.and_then(|p| p.get(key)).and_then(|p| p.get("type")).and_then(Json::as_str) {
                if !type_matches(value, expected_type) {
                    errors.push(format!("state key '{key}' does not match declared type '{expected_type}'"));
                }
            }
        }

        let mut out = ModuleOutputs::new();
        out.insert("valid".to_string(), Value::Bool(errors.is_empty()));
        out.insert(
            "errors".to_string(),
            Value::List(errors.into_iter().map(Value::String).collect()),
        );
        Ok(out)
    }

    fn output_schema(&self) -> Json {
        serde_json::json!({"properties": {"valid": {"type": "boolean"}, "errors": {"type": "array"}}})
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => matches!(value, Value::String(_)),
        "number" | "integer" => matches!(value, Value::Number(_)),
        "boolean" => matches!(value, Value::Bool(_)),
        "array" => matches!(value, Value::List(_)),
        "object" => matches!(value, Value::Map(_)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx_with_state(state: BTreeMap<String, Value>) -> ExecutionContext {
        ExecutionContext {
            state,
            module_outputs: BTreeMap::new(),
            step: BTreeMap::new(),
            config: BTreeMap::new(),
            workflow_run_id: Uuid::now_v7(),
            branch_id: Uuid::now_v7(),
            template_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn reports_missing_keys() {
        let mut inputs = BTreeMap::new();
        inputs.insert("schema".to_string(), Value::Map(BTreeMap::new()));
        inputs.insert("state_keys".to_string(), Value::List(vec![Value::String("a".into())]));
        let mut module = ValidateModule;
        let out = module.execute(&inputs, &ctx_with_state(BTreeMap::new())).await.unwrap();
        assert_eq!(out.get("valid"), Some(&Value::Bool(false)));
    }

    #[tokio::test]
    async fn passes_when_keys_present_and_typed() {
        let mut state = BTreeMap::new();
        state.insert("a".to_string(), Value::String("x".into()));
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "schema".to_string(),
            Value::from(serde_json::json!({"properties": {"a": {"type": "string"}}})),
        );
        inputs.insert("state_keys".to_string(), Value::List(vec![Value::String("a".into())]));
        let mut module = ValidateModule;
        let out = module.execute(&inputs, &ctx_with_state(state)).await.unwrap();
        assert_eq!(out.get("valid"), Some(&Value::Bool(true)));
    }
}
