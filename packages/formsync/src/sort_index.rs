//! Fractional ordering for fields.
//!
//! Fields carry an `f64` sort index. Moving a field between two neighbors
//! assigns the midpoint of their indices, so a reorder touches exactly one
//! record. Repeated splitting eventually produces indices whose decimal
//! form gets unwieldy; when a candidate's printed form reaches
//! [`SORT_INDEX_REBASE_LEN`] characters, the whole list is renumbered with
//! consecutive integers instead, preserving the visual order.
//!
//! Ties are possible (batch duplication assigns one index to every clone)
//! and are broken by ascending mark id, which is creation order.

use std::rc::{Rc, Weak};

use tracing::debug;

use crate::bus::EventBus;
use crate::events::{Operation, Topic, ViewerEvent};
use crate::model::{fields_patch, FieldListState, MarkId, StateKey};
use crate::store::StateStore;

/// Printed-decimal length at which midpoint indices trigger a renumber.
pub const SORT_INDEX_REBASE_LEN: usize = 18;

// =============================================================================
// Pure ordering functions
// =============================================================================

/// Index for a slot between two neighbors. `None` on a side means the list
/// head or tail.
pub fn between(previous: Option<f64>, next: Option<f64>) -> f64 {
    match (previous, next) {
        (Some(p), Some(n)) => (p + n) / 2.0,
        (None, Some(n)) => n / 2.0,
        (Some(p), None) => p + 2.0,
        (None, None) => 1.0,
    }
}

/// Whether an index is too finely split to keep using midpoints.
pub fn needs_rebase(index: f64) -> bool {
    format!("{}", index).len() >= SORT_INDEX_REBASE_LEN
}

/// Renumber every field with consecutive integers starting at 1, keeping
/// the current visual order (ties keep creation order).
pub fn rebase(state: &mut FieldListState) {
    let ordered = state.ordered();
    for (position, mark_id) in ordered.into_iter().enumerate() {
        if let Some(record) = state.fields.get_mut(&mark_id) {
            record.sort_index = (position + 1) as f64;
        }
    }
}

// =============================================================================
// Reorder component
// =============================================================================

/// Applies `ReorderField` events to the `FieldList` slice.
pub struct SortIndexManager {
    store: Rc<StateStore>,
}

impl SortIndexManager {
    pub fn attach(bus: &EventBus, store: Rc<StateStore>) -> Rc<Self> {
        let manager = Rc::new(SortIndexManager { store });
        let weak: Weak<SortIndexManager> = Rc::downgrade(&manager);
        bus.subscribe(Topic::ReorderField, move |bus, event| {
            let Some(manager) = weak.upgrade() else { return };
            if let ViewerEvent::ReorderField {
                mark_id,
                previous,
                next,
            } = event
            {
                manager.reorder(bus, *mark_id, *previous, *next);
            }
        });
        manager
    }

    fn reorder(
        &self,
        bus: &EventBus,
        mark_id: MarkId,
        previous: Option<MarkId>,
        next: Option<MarkId>,
    ) {
        let Some(mut state) = self.store.get_as::<FieldListState>(StateKey::FieldList) else {
            return;
        };
        if !state.fields.contains_key(&mark_id) {
            debug!(%mark_id, "reorder for unknown field ignored");
            return;
        }
        let index_of = |id: Option<MarkId>| {
            id.and_then(|id| state.fields.get(&id)).map(|r| r.sort_index)
        };
        let candidate = between(index_of(previous), index_of(next));

        if needs_rebase(candidate) {
            // Renumber everything; the moved field takes the midpoint first
            // so the renumber sees it in its new slot.
            if let Some(record) = state.fields.get_mut(&mark_id) {
                record.sort_index = candidate;
            }
            rebase(&mut state);
            match serde_json::to_value(&state) {
                Ok(value) => bus.publish(&ViewerEvent::ModifyState {
                    key: StateKey::FieldList,
                    value,
                    operation: Operation::Replace,
                }),
                Err(error) => debug!(%error, "field list failed to serialize for renumber"),
            }
        } else {
            bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value: fields_patch([(mark_id, serde_json::json!({ "sortIndex": candidate }))]),
                operation: Operation::Extend,
            });
        }
    }
}
