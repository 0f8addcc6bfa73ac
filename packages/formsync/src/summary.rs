//! Derived checklist of the form: the `FormSummary` slice.
//!
//! The summary collapses grouped fields into one row per group, ordered by
//! sort index, with completion and fill-progress counts alongside. It is a
//! pure projection of the `FieldList` slice; the projector recomputes it on
//! every field-list change and publishes it with a replace, so stale rows
//! can never linger.

use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::EventBus;
use crate::events::{Operation, Topic, ViewerEvent};
use crate::model::{FieldListState, MarkId, StateKey};
use crate::store::StateStore;

/// One row of the checklist: a standalone field or a whole group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEntry {
    pub label: String,
    pub sort_index: f64,
    pub required: bool,
    pub complete: bool,
    /// Member marks; one id for a standalone field.
    pub mark_ids: Vec<MarkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_role_id: Option<String>,
}

/// How much of the form is filled in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillProgress {
    pub required_total: usize,
    pub required_complete: usize,
    pub optional_total: usize,
    pub optional_complete: usize,
}

impl FillProgress {
    pub fn required_done(&self) -> bool {
        self.required_complete == self.required_total
    }
}

/// The whole `FormSummary` slice.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormSummary {
    pub entries: Vec<SummaryEntry>,
    pub progress: FillProgress,
}

/// Collapse the field list into checklist rows, ordered by sort index.
pub fn build_summary(state: &FieldListState) -> Vec<SummaryEntry> {
    let mut entries: Vec<SummaryEntry> = Vec::new();
    let mut seen_groups: Vec<String> = Vec::new();

    for mark_id in state.ordered() {
        let record = &state.fields[&mark_id];
        match record.group_id.as_deref() {
            Some(gid) if state.groups.contains_key(gid) => {
                if seen_groups.iter().any(|g| g == gid) {
                    continue;
                }
                seen_groups.push(gid.to_string());
                let group = &state.groups[gid];
                let members: Vec<&_> = state
                    .fields
                    .values()
                    .filter(|r| r.group_id.as_deref() == Some(gid))
                    .collect();
                // A single-select group is satisfied by any member; a
                // multi-select group needs every member.
                let complete = if group.multiple {
                    members.iter().all(|r| r.is_complete)
                } else {
                    members.iter().any(|r| r.is_complete)
                };
                let required = group
                    .required
                    .unwrap_or_else(|| members.iter().any(|r| r.required));
                // The group surfaces at its earliest member's slot.
                let sort_index = members
                    .iter()
                    .map(|r| r.sort_index)
                    .fold(f64::INFINITY, f64::min);
                let mut mark_ids: Vec<MarkId> = members.iter().map(|r| r.mark_id).collect();
                mark_ids.sort();
                entries.push(SummaryEntry {
                    label: group.display_name.clone(),
                    sort_index,
                    required,
                    complete,
                    mark_ids,
                    group_id: Some(gid.to_string()),
                    form_role_id: group.form_role_id.clone(),
                });
            }
            _ => entries.push(SummaryEntry {
                label: record.display_name.clone(),
                sort_index: record.sort_index,
                required: state.effective_required(record),
                complete: record.is_complete,
                mark_ids: vec![record.mark_id],
                group_id: None,
                form_role_id: state.effective_form_role(record).map(str::to_string),
            }),
        }
    }

    entries.sort_by(|a, b| {
        a.sort_index
            .partial_cmp(&b.sort_index)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    entries
}

/// Progress counts over summary rows (groups count once).
pub fn fill_progress(entries: &[SummaryEntry]) -> FillProgress {
    let mut progress = FillProgress::default();
    for entry in entries {
        if entry.required {
            progress.required_total += 1;
            if entry.complete {
                progress.required_complete += 1;
            }
        } else {
            progress.optional_total += 1;
            if entry.complete {
                progress.optional_complete += 1;
            }
        }
    }
    progress
}

/// Keeps the `FormSummary` slice in step with the `FieldList` slice.
pub struct SummaryProjector {
    store: Rc<StateStore>,
}

impl SummaryProjector {
    pub fn attach(bus: &EventBus, store: Rc<StateStore>) -> Rc<Self> {
        let projector = Rc::new(SummaryProjector { store });
        let weak: Weak<SummaryProjector> = Rc::downgrade(&projector);
        bus.subscribe(Topic::StateModified, move |bus, event| {
            let Some(projector) = weak.upgrade() else { return };
            if let ViewerEvent::StateModified {
                key: StateKey::FieldList,
                ..
            } = event
            {
                projector.project(bus);
            }
        });
        projector
    }

    fn project(&self, bus: &EventBus) {
        let state = self
            .store
            .get_as::<FieldListState>(StateKey::FieldList)
            .unwrap_or_default();
        let entries = build_summary(&state);
        let progress = fill_progress(&entries);
        let summary = FormSummary { entries, progress };
        match serde_json::to_value(&summary) {
            Ok(value) => bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FormSummary,
                value,
                operation: Operation::Replace,
            }),
            Err(error) => debug!(%error, "summary failed to serialize"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldRecord, FieldTemplate, Group, Rectangle};

    fn record(mark_id: u32, name: &str, sort_index: f64) -> FieldRecord {
        FieldRecord {
            mark_id: MarkId(mark_id),
            field_id: name.to_lowercase(),
            display_name: name.to_string(),
            template: FieldTemplate::Text,
            rectangle: Rectangle::new(0.0, 0.0, 10.0, 10.0),
            page_number: 1,
            page_size_at_capture: None,
            sort_index,
            required: true,
            group_id: None,
            form_role_id: None,
            target_id: None,
            is_complete: false,
            is_invalid: false,
            character_limit: None,
            multiline: false,
            font_name: None,
            font_color: None,
            font_size: None,
        }
    }

    fn checkbox_group_state(multiple: bool) -> FieldListState {
        let mut state = FieldListState::default();
        for (id, index) in [(1, 2.0), (2, 3.0)] {
            let mut r = record(id, &format!("Check {}", id), index);
            r.template = FieldTemplate::Checkbox;
            r.group_id = Some("g1".into());
            r.required = false;
            state.fields.insert(r.mark_id, r);
        }
        let mut title = record(3, "Title", 1.0);
        title.is_complete = true;
        state.fields.insert(MarkId(3), title);
        state.groups.insert(
            "g1".into(),
            Group {
                group_id: "g1".into(),
                display_name: "Payment method".into(),
                template: FieldTemplate::Checkbox,
                multiple,
                required: Some(true),
                form_role_id: None,
            },
        );
        state
    }

    #[test]
    fn groups_collapse_into_one_row() {
        let state = checkbox_group_state(false);
        let entries = build_summary(&state);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label, "Title");
        assert_eq!(entries[1].label, "Payment method");
        assert_eq!(entries[1].mark_ids, vec![MarkId(1), MarkId(2)]);
        // Group required comes from the group override.
        assert!(entries[1].required);
    }

    #[test]
    fn group_sorts_at_its_earliest_member() {
        let mut state = checkbox_group_state(false);
        state.fields.get_mut(&MarkId(1)).unwrap().sort_index = 0.5;
        let entries = build_summary(&state);
        assert_eq!(entries[0].label, "Payment method");
        assert_eq!(entries[0].sort_index, 0.5);
    }

    #[test]
    fn single_select_group_completes_on_any_member() {
        let mut state = checkbox_group_state(false);
        state.fields.get_mut(&MarkId(2)).unwrap().is_complete = true;
        let entries = build_summary(&state);
        assert!(entries.iter().find(|e| e.group_id.is_some()).unwrap().complete);
    }

    #[test]
    fn multi_select_group_needs_every_member() {
        let mut state = checkbox_group_state(true);
        state.fields.get_mut(&MarkId(2)).unwrap().is_complete = true;
        let entries = build_summary(&state);
        assert!(!entries.iter().find(|e| e.group_id.is_some()).unwrap().complete);

        state.fields.get_mut(&MarkId(1)).unwrap().is_complete = true;
        let entries = build_summary(&state);
        assert!(entries.iter().find(|e| e.group_id.is_some()).unwrap().complete);
    }

    #[test]
    fn progress_counts_groups_once() {
        let state = checkbox_group_state(false);
        let entries = build_summary(&state);
        let progress = fill_progress(&entries);

        assert_eq!(progress.required_total, 2);
        assert_eq!(progress.required_complete, 1); // the completed title
        assert_eq!(progress.optional_total, 0);
        assert!(!progress.required_done());
    }

    #[test]
    fn projector_publishes_summary_on_field_list_change() {
        use crate::events::Operation;

        let bus = EventBus::new();
        let store = StateStore::attach(&bus);
        let _projector = SummaryProjector::attach(&bus, Rc::clone(&store));

        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: serde_json::to_value(checkbox_group_state(false)).unwrap(),
            operation: Operation::Replace,
        });

        let summary: FormSummary = store.get_as(StateKey::FormSummary).unwrap();
        assert_eq!(summary.entries.len(), 2);
        assert_eq!(summary.progress.required_total, 2);
    }
}
