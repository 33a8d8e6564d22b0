//! Event store & branch lineage (`spec.md` §4.1).
//!
//! `Storage::append_event`/`get_events`/`get_events_for_branch` give us the
//! raw per-branch access; this module assembles the canonical replay query
//! (`getLineageEvents`) and the branching protocol (retry / jump-back) on
//! top of it.

use std::collections::BTreeMap;
use uuid::Uuid;
use workflow_core::error::StorageResult;
use workflow_core::models::{Branch, Event, EventType, LineageEntry};
use workflow_core::storage::Storage;

/// `getLineageEvents(run, lineage, type?)`: union of events visible from
/// `lineage`, sorted by event_id globally. For each `(b_i, c_i)` the result
/// includes `branch_id = b_i AND event_id <= c_i` (no cutoff on the final
/// entry means all of its events qualify).
pub async fn get_lineage_events<S: Storage>(
    storage: &S,
    workflow_run_id: Uuid,
    lineage: &[LineageEntry],
    event_type: Option<EventType>,
) -> StorageResult<Vec<Event>> {
    let mut all = Vec::new();
    for entry in lineage {
        let events = storage
            .get_events_for_branch(
                workflow_run_id,
                entry.branch_id,
                entry.cutoff_event_id,
                event_type,
            )
            .await?;
        all.extend(events);
    }
    all.sort_by_key(|e| e.event_id);
    Ok(all)
}

/// De-duplicate by `(step_id, module_name, event_type)`, keeping the latest
/// (highest event_id) of each key. `spec.md` §4.1 failure semantics: "the
/// engine de-duplicates at read time ... picking the latest."
pub fn latest_by_step_module_type(events: &[Event]) -> Vec<Event> {
    let mut latest: BTreeMap<(Option<String>, Option<String>, EventType), &Event> = BTreeMap::new();
    for e in events {
        let key = (e.step_id.clone(), e.module_name.clone(), e.event_type);
        latest
            .entry(key)
            .and_modify(|existing| {
                if e.event_id > existing.event_id {
                    *existing = e;
                }
            })
            .or_insert(e);
    }
    let mut out: Vec<Event> = latest.into_values().cloned().collect();
    out.sort_by_key(|e| e.event_id);
    out
}

/// The branching protocol (`spec.md` §4.1): fork a new branch off `current`
/// at event `cutoff`. The new branch's lineage is
/// `parent_lineage[:-1] + [(current, cutoff)] + [(new, None)]`.
pub fn fork_lineage(current: &Branch, new_branch_id: Uuid, cutoff_event_id: Uuid) -> Vec<LineageEntry> {
    let mut lineage = current.lineage.clone();
    if let Some(last) = lineage.last_mut() {
        last.cutoff_event_id = Some(cutoff_event_id);
    }
    lineage.push(LineageEntry {
        branch_id: new_branch_id,
        cutoff_event_id: None,
    });
    lineage
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use workflow_core::ids::new_id;

    fn event(id: Uuid, branch: Uuid, kind: EventType) -> Event {
        Event {
            event_id: id,
            workflow_run_id: new_id(),
            branch_id: branch,
            workflow_version_id: new_id(),
            event_type: kind,
            timestamp: Utc::now(),
            step_id: Some("s1".into()),
            module_name: Some("m1".into()),
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn dedup_keeps_latest_output_stored() {
        let branch = new_id();
        let e1 = event(new_id(), branch, EventType::OutputStored);
        let e2 = event(new_id(), branch, EventType::OutputStored);
        let deduped = latest_by_step_module_type(&[e1.clone(), e2.clone()]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].event_id, e2.event_id.max(e1.event_id));
    }

    #[test]
    fn fork_lineage_sets_cutoff_on_parent_and_appends_self() {
        let root = new_id();
        let branch = Branch {
            branch_id: root,
            workflow_run_id: new_id(),
            lineage: vec![LineageEntry {
                branch_id: root,
                cutoff_event_id: None,
            }],
            created_at: Utc::now(),
        };
        let cutoff = new_id();
        let child = new_id();
        let lineage = fork_lineage(&branch, child, cutoff);
        assert_eq!(lineage[0].cutoff_event_id, Some(cutoff));
        assert_eq!(lineage[1].branch_id, child);
        assert_eq!(lineage[1].cutoff_event_id, None);
    }
}
