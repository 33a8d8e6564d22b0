//! Canonical JSON hashing for content-addressed workflow versions.
//!
//! `spec.md` §9 flags key-order canonicalization as an open question; we
//! resolve it here by recursively sorting object keys and re-serializing
//! before hashing, so logically identical workflows always hash identically
//! regardless of upload key order.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Sort all object keys recursively, depth-first.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// sha256 of the canonical JSON encoding, hex-encoded.
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonical json never fails to serialize");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn different_content_hashes_differ() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn nested_key_order_does_not_affect_hash() {
        let a = json!({"steps": [{"y": 1, "x": 2}]});
        let b = json!({"steps": [{"x": 2, "y": 1}]});
        assert_eq!(content_hash(&a), content_hash(&b));
    }
}
