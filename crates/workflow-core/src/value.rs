//! The heterogeneous value type the resolver context and module inputs are
//! built from (`spec.md` §9: "dynamic typing / duck typing in inputs").
//!
//! `Value::Absent` is the sentinel returned for missing context lookups: it
//! stringifies empty and evaluates false, per `spec.md` §4.4, without the
//! resolver needing to raise.

use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Absent,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Absent | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Dotted-path lookup, e.g. `get_path("module.s1.text")`.
    pub fn get_path(&self, path: &str) -> Value {
        let mut current = self.clone();
        for segment in path.split('.') {
            current = match current {
                Value::Map(map) => map.get(segment).cloned().unwrap_or(Value::Absent),
                Value::List(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Absent),
                _ => Value::Absent,
            };
        }
        current
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Absent => write!(f, ""),
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::List(_) | Value::Map(_) => {
                write!(f, "{}", Json::from(self.clone()))
            }
        }
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        match value {
            Value::Absent | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(b),
            Value::Number(n) => serde_json::Number::from_f64(n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s),
            Value::List(items) => Json::Array(items.into_iter().map(Json::from).collect()),
            Value::Map(map) => {
                Json::Object(map.into_iter().map(|(k, v)| (k, Json::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_is_falsy_and_empty_string() {
        assert!(!Value::Absent.is_truthy());
        assert_eq!(Value::Absent.to_string(), "");
    }

    #[test]
    fn dotted_path_lookup_across_maps() {
        let v: Value = json!({"state": {"value": 1}}).into();
        assert_eq!(v.get_path("state.value"), Value::Number(1.0));
        assert_eq!(v.get_path("state.missing"), Value::Absent);
        assert_eq!(v.get_path("missing.value"), Value::Absent);
    }

    #[test]
    fn roundtrips_through_json() {
        let original = json!({"a": [1, "two", true, null]});
        let value: Value = original.clone().into();
        let back: Json = value.into();
        assert_eq!(original, back);
    }
}
