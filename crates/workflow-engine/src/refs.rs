//! `$ref` resolution for uploaded workflow JSON (`spec.md` §6 external
//! format, grounded in `original_source/backend/server/engine/
//! workflow_resolver.py` per `SPEC_FULL.md` §4.2).
//!
//! A `$ref` node is `{$ref: string, type: "text"|"json"|"jinja2"|"raw"|
//! "template"}`. `type = json` inlines the parsed JSON recursively,
//! resolving nested `$ref`s relative to the referenced file's own
//! directory; the other types inline the raw file bytes as a string.

use serde_json::Value as Json;
use std::collections::HashSet;
use workflow_core::error::{ValidationError, ValidationIssue};

/// Abstraction over the uploaded bundle's files (a zip's entries, or a
/// single-file upload with only the root resolvable). Concrete file I/O is
/// out of scope (`spec.md` §1); the engine only needs byte lookup by path.
pub trait VirtualFs: Send + Sync {
    fn read(&self, path: &str) -> Option<Vec<u8>>;
}

/// Resolve every `$ref` reachable from `entry` (the uploaded workflow's
/// parsed JSON root), starting at the virtual filesystem root `/`.
pub fn resolve(entry: &Json, fs: &dyn VirtualFs) -> Result<Json, ValidationError> {
    let mut visiting = HashSet::new();
    resolve_node(entry, "/", 0, fs, &mut visiting)
}

fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Normalize `base/relative` into an absolute path, tracking the running
/// traversal depth. Returns `None` if the path would climb above the root
/// (`spec.md` §6: "Paths may not escape the virtual filesystem root").
fn join(base: &str, relative: &str, base_depth: i32) -> Option<(String, i32)> {
    let (start, mut depth): (Vec<&str>, i32) = if relative.starts_with('/') {
        (Vec::new(), 0)
    } else {
        (
            base.trim_start_matches('/')
                .split('/')
                .filter(|s| !s.is_empty())
                .collect(),
            base_depth,
        )
    };
    let mut stack = start;
    for segment in relative.trim_start_matches('/').split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
                stack.pop();
            }
            other => {
                depth += 1;
                stack.push(other);
            }
        }
    }
    Some((format!("/{}", stack.join("/")), depth))
}

fn resolve_node(
    node: &Json,
    current_dir: &str,
    current_depth: i32,
    fs: &dyn VirtualFs,
    visiting: &mut HashSet<String>,
) -> Result<Json, ValidationError> {
    match node {
        Json::Object(map) if map.contains_key("$ref") => {
            let ref_path = map
                .get("$ref")
                .and_then(Json::as_str)
                .ok_or_else(|| ValidationError::single("$ref", "$ref must be a string"))?;
            let ref_type = map
                .get("type")
                .and_then(Json::as_str)
                .ok_or_else(|| ValidationError::single("$ref.type", "$ref requires a type"))?;

            let (target, target_depth) = join(current_dir, ref_path, current_depth)
                .ok_or_else(|| ValidationError::single(ref_path, "path-traversal attempt"))?;

            if visiting.contains(&target) {
                return Err(ValidationError::single(ref_path, "circular reference"));
            }

            let bytes = fs
                .read(&target)
                .ok_or_else(|| ValidationError::single(ref_path, "unresolvable $ref"))?;

            visiting.insert(target.clone());
            let resolved = match ref_type {
                "json" => {
                    let parsed: Json = serde_json::from_slice(&bytes)
                        .map_err(|e| ValidationError::single(ref_path, format!("invalid json: {e}")))?;
                    let nested_dir = dirname(&target).to_string();
                    resolve_node(&parsed, &nested_dir, target_depth, fs, visiting)?
                }
                "text" | "jinja2" | "raw" | "template" => {
                    let text = String::from_utf8(bytes)
                        .map_err(|e| ValidationError::single(ref_path, format!("invalid utf8: {e}")))?;
                    Json::String(text)
                }
                other => {
                    return Err(ValidationError::single(
                        ref_path,
                        format!("unknown $ref type: {other}"),
                    ))
                }
            };
            visiting.remove(&target);
            Ok(resolved)
        }
        Json::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_node(v, current_dir, current_depth, fs, visiting)?);
            }
            Ok(Json::Object(out))
        }
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_node(item, current_dir, current_depth, fs, visiting)?);
            }
            Ok(Json::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Collects every issue rather than failing fast, for the
/// `validation_failed` response shape (`spec.md` §7).
pub fn resolve_collecting_issues(entry: &Json, fs: &dyn VirtualFs) -> Result<Json, Vec<ValidationIssue>> {
    resolve(entry, fs).map_err(|e| e.issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapFs(HashMap<String, Vec<u8>>);

    impl VirtualFs for MapFs {
        fn read(&self, path: &str) -> Option<Vec<u8>> {
            self.0.get(path).cloned()
        }
    }

    #[test]
    fn inlines_json_ref_recursively() {
        let mut files = HashMap::new();
        files.insert(
            "/steps/s1.json".to_string(),
            br#"{"module_id": "echo", "inputs": {}}"#.to_vec(),
        );
        let fs = MapFs(files);
        let entry = json!({"$ref": "steps/s1.json", "type": "json"});
        let resolved = resolve(&entry, &fs).unwrap();
        assert_eq!(resolved["module_id"], "echo");
    }

    #[test]
    fn inlines_text_ref_as_raw_string() {
        let mut files = HashMap::new();
        files.insert("/prompts/p1.txt".to_string(), b"hello {{ state.x }}".to_vec());
        let fs = MapFs(files);
        let entry = json!({"$ref": "prompts/p1.txt", "type": "text"});
        let resolved = resolve(&entry, &fs).unwrap();
        assert_eq!(resolved, Json::String("hello {{ state.x }}".into()));
    }

    #[test]
    fn rejects_traversal_above_root() {
        let fs = MapFs(HashMap::new());
        let entry = json!({"$ref": "../../etc/passwd", "type": "text"});
        let err = resolve(&entry, &fs).unwrap_err();
        assert!(err.issues[0].message.contains("path-traversal"));
    }

    #[test]
    fn detects_circular_reference() {
        let mut files = HashMap::new();
        files.insert(
            "/a.json".to_string(),
            br#"{"$ref": "b.json", "type": "json"}"#.to_vec(),
        );
        files.insert(
            "/b.json".to_string(),
            br#"{"$ref": "a.json", "type": "json"}"#.to_vec(),
        );
        let fs = MapFs(files);
        let entry = json!({"$ref": "a.json", "type": "json"});
        let err = resolve(&entry, &fs).unwrap_err();
        assert!(err.issues[0].message.contains("circular"));
    }

    #[test]
    fn unresolvable_ref_is_a_validation_error() {
        let fs = MapFs(HashMap::new());
        let entry = json!({"$ref": "missing.json", "type": "json"});
        let err = resolve(&entry, &fs).unwrap_err();
        assert!(err.issues[0].message.contains("unresolvable"));
    }
}
