//! Pure-function template resolver (`spec.md` §4.4). The actual
//! templating/expression language is out of scope (`spec.md` §1); this
//! implementation treats `{{ ... }}`-delimited single-expression strings as
//! dotted-path lookups against the context, sufficient to satisfy the
//! resolver contract's testable properties.

use std::collections::BTreeMap;
use workflow_core::resolver::TemplateResolver;
use workflow_core::value::Value;

/// Reserved key marking a map's resolution mode (`"client"` or `"server"`),
/// inherited by children absent an explicit override, stripped from the
/// resolved output (`spec.md` §4.4).
const SCHEMA_KEY: &str = "resolver_schema";
const MODE_CLIENT: &str = "client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Server,
    Client,
}

impl Mode {
    fn from_value(v: &Value) -> Option<Mode> {
        match v {
            Value::String(s) if s == MODE_CLIENT => Some(Mode::Client),
            Value::String(_) => Some(Mode::Server),
            _ => None,
        }
    }
}

/// Find non-nested `{{ ... }}` spans in `s`.
fn find_expressions(s: &str) -> Vec<(usize, usize, &str)> {
    let mut spans = Vec::new();
    let mut rest = s;
    let mut offset = 0;
    while let Some(start) = rest.find("{{") {
        let Some(end_rel) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + end_rel + 2;
        let expr = rest[start + 2..start + 2 + end_rel].trim();
        spans.push((offset + start, offset + end, expr));
        offset += end;
        rest = &rest[end..];
    }
    spans
}

fn eval_path(expr: &str, ctx: &BTreeMap<String, Value>) -> Value {
    let root = Value::Map(ctx.clone().into_iter().collect());
    root.get_path(expr)
}

/// Render `s` against `ctx`. A string that is *exactly* one `{{ expr }}`
/// (no surrounding text) returns the underlying typed value; anything else
/// (mixed literal/template text, or no template at all) returns a string.
fn render_string(s: &str, ctx: &BTreeMap<String, Value>) -> Value {
    let spans = find_expressions(s);
    if spans.is_empty() {
        return Value::String(s.to_string());
    }
    if spans.len() == 1 {
        let (start, end, expr) = spans[0];
        if start == 0 && end == s.len() {
            return eval_path(expr, ctx);
        }
    }
    let mut out = String::with_capacity(s.len());
    let mut cursor = 0;
    for (start, end, expr) in spans {
        out.push_str(&s[cursor..start]);
        out.push_str(&eval_path(expr, ctx).to_string());
        cursor = end;
    }
    out.push_str(&s[cursor..]);
    Value::String(out)
}

fn resolve_value_rec(value: &Value, ctx: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => render_string(s, ctx),
        Value::List(items) => Value::List(items.iter().map(|v| resolve_value_rec(v, ctx)).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value_rec(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_with_mode(value: &Value, ctx: &BTreeMap<String, Value>, inherited: Mode) -> Value {
    match value {
        Value::Map(map) => {
            let own_mode = map.get(SCHEMA_KEY).and_then(Mode::from_value).unwrap_or(inherited);
            if own_mode == Mode::Client {
                // Pass through untouched save for stripping the schema key
                // at this level and recursing to strip (not resolve) nested
                // schema keys.
                return Value::Map(
                    map.iter()
                        .filter(|(k, _)| k.as_str() != SCHEMA_KEY)
                        .map(|(k, v)| (k.clone(), strip_schema_keys(v)))
                        .collect(),
                );
            }
            Value::Map(
                map.iter()
                    .filter(|(k, _)| k.as_str() != SCHEMA_KEY)
                    .map(|(k, v)| (k.clone(), resolve_with_mode(v, ctx, own_mode)))
                    .collect(),
            )
        }
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|v| resolve_with_mode(v, ctx, inherited))
                .collect(),
        ),
        Value::String(s) if inherited == Mode::Server => render_string(s, ctx),
        other => other.clone(),
    }
}

fn strip_schema_keys(value: &Value) -> Value {
    match value {
        Value::Map(map) => Value::Map(
            map.iter()
                .filter(|(k, _)| k.as_str() != SCHEMA_KEY)
                .map(|(k, v)| (k.clone(), strip_schema_keys(v)))
                .collect(),
        ),
        Value::List(items) => Value::List(items.iter().map(strip_schema_keys).collect()),
        other => other.clone(),
    }
}

/// The pure-function implementation shipped with the engine
/// (`workflow_engine::resolver::SchemaResolver`).
#[derive(Debug, Default)]
pub struct SchemaResolver;

impl TemplateResolver for SchemaResolver {
    fn resolve_with_schema(&self, inputs: &Value, ctx: &BTreeMap<String, Value>) -> Value {
        resolve_with_mode(inputs, ctx, Mode::Server)
    }

    fn resolve_value(&self, value: &Value, ctx: &BTreeMap<String, Value>) -> Value {
        resolve_value_rec(value, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> BTreeMap<String, Value> {
        let mut ctx = BTreeMap::new();
        ctx.insert("state".into(), Value::from(json!({"x": 1, "name": "alice"})));
        ctx.insert(
            "module".into(),
            Value::from(json!({"s1": {"text": "hello"}})),
        );
        ctx
    }

    #[test]
    fn pure_single_expression_returns_typed_value() {
        let resolver = SchemaResolver;
        let value = Value::String("{{ state.x }}".into());
        let resolved = resolver.resolve_value(&value, &ctx());
        assert_eq!(resolved, Value::Number(1.0));
    }

    #[test]
    fn mixed_template_returns_string() {
        let resolver = SchemaResolver;
        let value = Value::String("hi {{ state.name }}!".into());
        let resolved = resolver.resolve_value(&value, &ctx());
        assert_eq!(resolved, Value::String("hi alice!".into()));
    }

    #[test]
    fn missing_reference_resolves_to_absent_and_stringifies_empty() {
        let resolver = SchemaResolver;
        let value = Value::String("value: [{{ state.missing }}]".into());
        let resolved = resolver.resolve_value(&value, &ctx());
        assert_eq!(resolved, Value::String("value: []".into()));
    }

    #[test]
    fn client_marked_fields_pass_through_untouched() {
        let resolver = SchemaResolver;
        let inputs = Value::from(json!({
            "resolver_schema": "client",
            "prompt": "{{ state.name }}"
        }));
        let resolved = resolver.resolve_with_schema(&inputs, &ctx());
        let map = resolved.as_map().unwrap();
        assert_eq!(map.get("prompt"), Some(&Value::String("{{ state.name }}".into())));
        assert!(!map.contains_key("resolver_schema"));
    }

    #[test]
    fn server_fields_are_materialized_and_nested_fields_inherit() {
        let resolver = SchemaResolver;
        let inputs = Value::from(json!({
            "resolver_schema": "server",
            "greeting": "hi {{ state.name }}",
            "nested": {"value": "{{ state.x }}"}
        }));
        let resolved = resolver.resolve_with_schema(&inputs, &ctx());
        let map = resolved.as_map().unwrap();
        assert_eq!(map.get("greeting"), Some(&Value::String("hi alice".into())));
        let nested = map.get("nested").unwrap().as_map().unwrap();
        assert_eq!(nested.get("value"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn idempotent_on_resolved_result() {
        let resolver = SchemaResolver;
        let inputs = Value::from(json!({"resolver_schema": "server", "greeting": "hi {{ state.name }}"}));
        let once = resolver.resolve_with_schema(&inputs, &ctx());
        let twice = resolver.resolve_with_schema(&once, &ctx());
        assert_eq!(once, twice);
    }
}
