//! Addon pipeline contract (`spec.md` §4.3), grounded in
//! `original_source/backend/server/modules/addons/base.py`: addons decorate
//! selection options with metadata without changing the selection outcome.

use serde_json::Value as Json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct Decorator {
    pub kind: String,
    pub priority: i32,
    pub source: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, Default)]
pub struct AddonResult {
    pub data: Json,
    pub decorators: Vec<Decorator>,
}

pub trait Addon: Send + Sync {
    fn addon_id(&self) -> &str;

    /// Priority order among configured addons; lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Decorate each item (indexed by position in the option list).
    fn process(
        &self,
        items: &[Json],
        inputs: &Json,
        context: &Json,
    ) -> BTreeMap<usize, AddonResult>;

    /// Observe the user's selection. Addons never change the outcome.
    fn on_selection(&self, _selected_indices: &[usize], _context: &Json) {}
}

/// Merge decorators from multiple addons into each item's `_metadata` block.
/// Earlier decorators are preserved; later ones overwrite same-key fields
/// within a decorator of the same `kind` (`spec.md` §4.3).
pub fn merge_decorators(addon_outputs: &[BTreeMap<usize, AddonResult>]) -> BTreeMap<usize, Json> {
    let mut merged: BTreeMap<usize, BTreeMap<String, Decorator>> = BTreeMap::new();
    let mut data_by_item: BTreeMap<usize, Vec<Json>> = BTreeMap::new();

    for output in addon_outputs {
        for (&idx, result) in output {
            data_by_item.entry(idx).or_default().push(result.data.clone());
            let entry = merged.entry(idx).or_default();
            for decorator in &result.decorators {
                entry
                    .entry(decorator.kind.clone())
                    .and_modify(|existing| {
                        if decorator.priority >= existing.priority {
                            *existing = decorator.clone();
                        }
                    })
                    .or_insert_with(|| decorator.clone());
            }
        }
    }

    merged
        .into_iter()
        .map(|(idx, by_kind)| {
            let decorators: Vec<Decorator> = by_kind.into_values().collect();
            let metadata = serde_json::json!({
                "decorators": decorators,
                "addon_data": data_by_item.remove(&idx).unwrap_or_default(),
            });
            (idx, metadata)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_decorator_wins_for_same_kind() {
        let mut a = BTreeMap::new();
        a.insert(
            0,
            AddonResult {
                data: Json::Null,
                decorators: vec![Decorator {
                    kind: "border".into(),
                    priority: 1,
                    source: "a".into(),
                    fields: BTreeMap::new(),
                }],
            },
        );
        let mut b = BTreeMap::new();
        b.insert(
            0,
            AddonResult {
                data: Json::Null,
                decorators: vec![Decorator {
                    kind: "border".into(),
                    priority: 5,
                    source: "b".into(),
                    fields: BTreeMap::new(),
                }],
            },
        );
        let merged = merge_decorators(&[a, b]);
        let meta = &merged[&0];
        let decorators = meta["decorators"].as_array().unwrap();
        assert_eq!(decorators.len(), 1);
        assert_eq!(decorators[0]["source"], "b");
    }
}
