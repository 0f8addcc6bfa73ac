//! Field lifecycle: focus, activation, and applying filled-in values.
//!
//! A field moves through a small machine:
//!
//! ```text
//! Idle ──focus──► Focused ──activate──► Activating
//!                    ▲                      │ modal / toggle resolves
//!                    └──────────────────────┼──► Completed
//!                                           ├──► Invalid
//!                                           └──► Idle (cancelled / cleared)
//! ```
//!
//! Focus is visual (border styling plus the `FocusField` slice); activation
//! is the template-specific fill interaction. Text fields edit inline,
//! checkboxes toggle immediately, signatures and dates round-trip through a
//! modal correlated by an [`OpToken`]. A completion for a token that is no
//! longer pending is ignored, so a dismissed modal can never clobber a
//! later interaction.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::events::{
    KeyCombo, ModalOutcome, ModalPayload, Operation, SignatureCategory, SignatureData, Topic,
    ViewerEvent,
};
use crate::marks::{
    border_scale, page_size_or_fallback, resolve_font, AnnotationEngine, MarkKind, MetaKey,
    ResolvedFont, SharedEngine, CHECKMARK_IMAGE, DEFAULT_BORDER_COLOR, DEFAULT_BORDER_THICKNESS,
    EMPTY_PATH, ERROR_BORDER_COLOR, FOCUS_BORDER_COLOR, FOCUS_BORDER_THICKNESS,
};
use crate::model::{
    fields_patch, FieldListState, FieldRecord, FieldTemplate, GlobalSettings, MarkId, StateKey,
};
use crate::pending::{OpToken, PendingOps, TokenAllocator};
use crate::store::StateStore;

/// Where a field currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldPhase {
    Idle,
    Focused,
    Activating,
    Completed,
    Invalid,
}

/// The mark currently holding focus, per the `FocusField` slice.
pub fn focused_mark(store: &StateStore) -> Option<MarkId> {
    let slice = store.get(StateKey::FocusField)?;
    serde_json::from_value(slice.get("markId")?.clone()).ok()
}

struct PendingActivation {
    mark_id: MarkId,
}

/// Drives focus and fill interactions for every field on the form.
pub struct FieldLifecycleController {
    store: Rc<StateStore>,
    engine: SharedEngine,
    pending: RefCell<PendingOps<PendingActivation>>,
}

impl FieldLifecycleController {
    pub fn attach(
        bus: &EventBus,
        store: Rc<StateStore>,
        engine: SharedEngine,
        allocator: Box<dyn TokenAllocator>,
    ) -> Rc<Self> {
        let controller = Rc::new(FieldLifecycleController {
            store,
            engine,
            pending: RefCell::new(PendingOps::with_allocator(allocator)),
        });

        let weak = Rc::downgrade(&controller);
        bus.subscribe(Topic::PointerActivated, move |bus, event| {
            let Some(controller) = weak.upgrade() else { return };
            if let ViewerEvent::PointerActivated { mark_id } = event {
                controller.on_pointer(bus, *mark_id);
            }
        });

        let weak = Rc::downgrade(&controller);
        bus.subscribe(Topic::FocusChecklistItem, move |bus, event| {
            let Some(controller) = weak.upgrade() else { return };
            if let ViewerEvent::FocusChecklistItem { mark_id } = event {
                controller.on_checklist(bus, *mark_id);
            }
        });

        let weak = Rc::downgrade(&controller);
        bus.subscribe(Topic::KeyCombination, move |bus, event| {
            let Some(controller) = weak.upgrade() else { return };
            if let ViewerEvent::KeyCombination { combo } = event {
                controller.on_key(bus, *combo);
            }
        });

        let weak = Rc::downgrade(&controller);
        bus.subscribe(Topic::ModalCompleted, move |bus, event| {
            let Some(controller) = weak.upgrade() else { return };
            if let ViewerEvent::ModalCompleted { token, outcome } = event {
                controller.on_modal(bus, *token, outcome);
            }
        });

        controller
    }

    /// Lifecycle position of a field, for embedder surfaces.
    pub fn phase(&self, mark_id: MarkId) -> FieldPhase {
        let activating = self
            .pending
            .borrow()
            .values()
            .any(|op| op.mark_id == mark_id);
        if activating {
            return FieldPhase::Activating;
        }
        if focused_mark(&self.store) == Some(mark_id) {
            return FieldPhase::Focused;
        }
        match self.record(mark_id) {
            Some(record) if record.is_invalid => FieldPhase::Invalid,
            Some(record) if record.is_complete => FieldPhase::Completed,
            _ => FieldPhase::Idle,
        }
    }

    // =========================================================================
    // Focus
    // =========================================================================

    fn on_pointer(&self, bus: &EventBus, mark_id: Option<MarkId>) {
        match mark_id.and_then(|id| self.resolve_field(id)) {
            Some(field_mark) => {
                self.focus(bus, field_mark, false);
                self.activate(bus, field_mark);
            }
            None => self.blur(bus),
        }
    }

    fn on_checklist(&self, bus: &EventBus, mark_id: MarkId) {
        if self.record(mark_id).is_none() {
            debug!(%mark_id, "checklist focus for unknown field ignored");
            return;
        }
        self.focus(bus, mark_id, true);
        self.activate_if_text_like(bus, mark_id);
    }

    /// Map any clicked mark back to the field it belongs to: the field mark
    /// itself, its target, or its required indicator.
    fn resolve_field(&self, mark_id: MarkId) -> Option<MarkId> {
        let state = self.field_list();
        if state.fields.contains_key(&mark_id) {
            return Some(mark_id);
        }
        if let Some(record) = state.field_for_target(mark_id) {
            return Some(record.mark_id);
        }
        let owner = self
            .engine
            .borrow()
            .metadata(mark_id, MetaKey::RequiredFor)
            .and_then(|value| value.parse().ok().map(MarkId));
        owner.filter(|id| state.fields.contains_key(id))
    }

    fn focus(&self, bus: &EventBus, mark_id: MarkId, scroll: bool) {
        let previous = focused_mark(&self.store);
        {
            let mut engine = self.engine.borrow_mut();
            if let Some(previous) = previous.filter(|p| *p != mark_id) {
                self.restore_border(&mut *engine, previous);
            }
            let page = engine.page_number(mark_id).unwrap_or(1);
            let scale = border_scale(page_size_or_fallback(&*engine, page));
            engine_op(
                "focus border",
                engine.set_border(mark_id, FOCUS_BORDER_COLOR, FOCUS_BORDER_THICKNESS * scale),
            );
            if scroll {
                engine_op("scroll", engine.scroll_to(mark_id));
            }
        }
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FocusField,
            value: serde_json::json!({ "markId": mark_id }),
            operation: Operation::Replace,
        });
    }

    fn blur(&self, bus: &EventBus) {
        let Some(previous) = focused_mark(&self.store) else { return };
        {
            let mut engine = self.engine.borrow_mut();
            self.restore_border(&mut *engine, previous);
        }
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FocusField,
            value: serde_json::Value::Null,
            operation: Operation::Replace,
        });
    }

    fn restore_border(&self, engine: &mut dyn AnnotationEngine, mark_id: MarkId) {
        let color = match self.record(mark_id) {
            Some(record) if record.is_invalid => ERROR_BORDER_COLOR,
            _ => DEFAULT_BORDER_COLOR,
        };
        let page = engine.page_number(mark_id).unwrap_or(1);
        let scale = border_scale(page_size_or_fallback(engine, page));
        engine_op(
            "restore border",
            engine.set_border(mark_id, color, DEFAULT_BORDER_THICKNESS * scale),
        );
    }

    // =========================================================================
    // Keyboard
    // =========================================================================

    fn on_key(&self, bus: &EventBus, combo: KeyCombo) {
        match combo {
            // Return walks the form like Tab; only Space activates in place.
            KeyCombo::Tab | KeyCombo::Return => self.step(bus, 1),
            KeyCombo::ShiftTab => self.step(bus, -1),
            KeyCombo::Space => {
                if let Some(mark_id) = focused_mark(&self.store) {
                    self.activate(bus, mark_id);
                }
            }
        }
    }

    /// Move focus through the visual order. Clamped: stepping past either
    /// end keeps the current focus rather than wrapping.
    fn step(&self, bus: &EventBus, delta: i64) {
        let order = self.field_list().ordered();
        if order.is_empty() {
            return;
        }
        let next = match focused_mark(&self.store).and_then(|id| {
            order.iter().position(|candidate| *candidate == id)
        }) {
            None => {
                if delta > 0 {
                    order[0]
                } else {
                    order[order.len() - 1]
                }
            }
            Some(position) => {
                let target = position as i64 + delta;
                if target < 0 || target as usize >= order.len() {
                    return;
                }
                order[target as usize]
            }
        };
        self.focus(bus, next, true);
        self.activate_if_text_like(bus, next);
    }

    /// Text and date fields go straight into entry when focus arrives from
    /// the keyboard or the checklist, matching the pointer path.
    fn activate_if_text_like(&self, bus: &EventBus, mark_id: MarkId) {
        let text_like = self
            .record(mark_id)
            .map_or(false, |record| record.template.is_text_like());
        if text_like {
            self.activate(bus, mark_id);
        }
    }

    // =========================================================================
    // Activation
    // =========================================================================

    fn activate(&self, bus: &EventBus, mark_id: MarkId) {
        let Some(record) = self.record(mark_id) else { return };
        match record.template {
            FieldTemplate::Text => self.activate_text(bus, &record),
            FieldTemplate::Date => self.request_date(bus, &record),
            FieldTemplate::Signature => {
                self.request_signature(bus, &record, SignatureCategory::Signature)
            }
            FieldTemplate::Initials => {
                self.request_signature(bus, &record, SignatureCategory::Initials)
            }
            FieldTemplate::Checkbox => self.toggle_checkbox(bus, &record),
        }
    }

    fn activate_text(&self, bus: &EventBus, record: &FieldRecord) {
        let existing = record.target_id.filter(|t| self.engine.borrow().mark_exists(*t));
        if let Some(target) = existing {
            engine_op(
                "text edit",
                self.engine.borrow_mut().begin_text_edit(target),
            );
            return;
        }
        let font = self.font_for(record);
        let target = {
            let mut engine = self.engine.borrow_mut();
            match self.make_target(&mut *engine, record, MarkKind::Text, Some(&font)) {
                Some(target) => {
                    engine_op("text edit", engine.begin_text_edit(target));
                    target
                }
                None => return,
            }
        };
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch([(
                record.mark_id,
                serde_json::json!({ "targetId": target }),
            )]),
            operation: Operation::Extend,
        });
    }

    fn request_date(&self, bus: &EventBus, record: &FieldRecord) {
        let current = record
            .target_id
            .and_then(|target| self.engine.borrow().text(target))
            .filter(|text| !text.trim().is_empty());
        let token = self.begin_pending(record.mark_id);
        bus.publish(&ViewerEvent::DateRequested { token, current });
    }

    fn request_signature(
        &self,
        bus: &EventBus,
        record: &FieldRecord,
        category: SignatureCategory,
    ) {
        let current = self.current_signature(record);
        let token = self.begin_pending(record.mark_id);
        bus.publish(&ViewerEvent::SignatureRequested {
            token,
            category,
            current,
        });
    }

    fn current_signature(&self, record: &FieldRecord) -> Option<SignatureData> {
        let target = record.target_id?;
        let engine = self.engine.borrow();
        if !engine.mark_exists(target) {
            return None;
        }
        Some(SignatureData {
            image: engine.image(target),
            path: engine.path(target),
            text: engine.text(target),
        })
    }

    fn toggle_checkbox(&self, bus: &EventBus, record: &FieldRecord) {
        let state = self.field_list();

        if let Some(target) = record.target_id {
            // Checked: uncheck.
            engine_op("uncheck", self.engine.borrow_mut().delete_marks(&[target]));
            bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value: fields_patch([(
                    record.mark_id,
                    serde_json::json!({ "targetId": null, "isComplete": false }),
                )]),
                operation: Operation::Extend,
            });
            return;
        }

        let mut patches: Vec<(MarkId, serde_json::Value)> = Vec::new();
        let single_select = record
            .group_id
            .as_deref()
            .and_then(|gid| state.groups.get(gid))
            .map_or(false, |group| !group.multiple);

        let target = {
            let mut engine = self.engine.borrow_mut();
            if single_select {
                // Only one box in the group may be checked.
                for sibling in state.group_siblings(record) {
                    if let Some(sibling_target) = state.fields[&sibling].target_id {
                        engine_op(
                            "clear sibling",
                            engine.delete_marks(&[sibling_target]),
                        );
                        patches.push((
                            sibling,
                            serde_json::json!({ "targetId": null, "isComplete": false }),
                        ));
                    }
                }
            }
            match self.make_target(&mut *engine, record, MarkKind::Stamp, None) {
                Some(target) => {
                    engine_op("checkmark", engine.set_image(target, CHECKMARK_IMAGE));
                    target
                }
                None => return,
            }
        };
        patches.push((
            record.mark_id,
            serde_json::json!({ "targetId": target, "isComplete": true, "isInvalid": false }),
        ));
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch(patches),
            operation: Operation::Extend,
        });
    }

    // =========================================================================
    // Modal completions
    // =========================================================================

    fn on_modal(&self, bus: &EventBus, token: OpToken, outcome: &ModalOutcome) {
        let Some(activation) = self.pending.borrow_mut().take(token) else {
            return;
        };
        let Some(record) = self.record(activation.mark_id) else { return };
        match outcome {
            ModalOutcome::Cancelled => {}
            ModalOutcome::Cleared => self.clear_target(bus, &record),
            ModalOutcome::Applied(ModalPayload::Signature(data))
                if matches!(
                    record.template,
                    FieldTemplate::Signature | FieldTemplate::Initials
                ) =>
            {
                self.apply_signature(bus, &record, data);
            }
            ModalOutcome::Applied(ModalPayload::Date(text))
                if record.template == FieldTemplate::Date =>
            {
                self.apply_date(bus, &record, text);
            }
            ModalOutcome::Applied(_) => {
                debug!(mark_id = %record.mark_id, "modal payload does not fit the field; ignored");
            }
        }
    }

    fn apply_signature(&self, bus: &EventBus, record: &FieldRecord, data: &SignatureData) {
        if !signature_applied(data) {
            // Nothing usable in the payload: treat it as a clear.
            self.clear_target(bus, record);
            return;
        }
        let kind = if data.path.is_some() {
            MarkKind::Ink
        } else if data.image.is_some() {
            MarkKind::Stamp
        } else {
            MarkKind::Text
        };
        let font = self.font_for(record);
        let target = {
            let mut engine = self.engine.borrow_mut();
            let Some(target) = self.ensure_target(&mut *engine, record, kind, Some(&font)) else {
                return;
            };
            if let Some(path) = data.path.as_deref() {
                engine_op("signature path", engine.set_path(target, path));
            }
            if let Some(image) = data.image.as_deref() {
                engine_op("signature image", engine.set_image(target, image));
            }
            if let Some(text) = data.text.as_deref() {
                engine_op("signature text", engine.set_text(target, text));
            }
            target
        };
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch([(
                record.mark_id,
                serde_json::json!({
                    "targetId": target,
                    "isComplete": true,
                    "isInvalid": false,
                }),
            )]),
            operation: Operation::Extend,
        });
    }

    fn apply_date(&self, bus: &EventBus, record: &FieldRecord, text: &str) {
        if text.trim().is_empty() {
            self.clear_target(bus, record);
            return;
        }
        let font = self.font_for(record);
        let target = {
            let mut engine = self.engine.borrow_mut();
            let Some(target) =
                self.ensure_target(&mut *engine, record, MarkKind::Text, Some(&font))
            else {
                return;
            };
            engine_op("date text", engine.set_text(target, text));
            target
        };
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch([(
                record.mark_id,
                serde_json::json!({
                    "targetId": target,
                    "isComplete": true,
                    "isInvalid": false,
                }),
            )]),
            operation: Operation::Extend,
        });
    }

    fn clear_target(&self, bus: &EventBus, record: &FieldRecord) {
        if let Some(target) = record.target_id {
            engine_op("clear target", self.engine.borrow_mut().delete_marks(&[target]));
        }
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch([(
                record.mark_id,
                serde_json::json!({ "targetId": null, "isComplete": false, "isInvalid": false }),
            )]),
            operation: Operation::Extend,
        });
    }

    // =========================================================================
    // Target plumbing
    // =========================================================================

    /// The field's existing target if it matches `kind`; otherwise replace
    /// it with a fresh mark of the right kind.
    fn ensure_target(
        &self,
        engine: &mut dyn AnnotationEngine,
        record: &FieldRecord,
        kind: MarkKind,
        font: Option<&ResolvedFont>,
    ) -> Option<MarkId> {
        if let Some(target) = record.target_id {
            if engine.kind(target) == Some(kind) {
                return Some(target);
            }
            if engine.mark_exists(target) {
                engine_op("replace target", engine.delete_marks(&[target]));
            }
        }
        self.make_target(engine, record, kind, font)
    }

    fn make_target(
        &self,
        engine: &mut dyn AnnotationEngine,
        record: &FieldRecord,
        kind: MarkKind,
        font: Option<&ResolvedFont>,
    ) -> Option<MarkId> {
        let target = match engine.create_mark(record.page_number, kind, record.rectangle) {
            Ok(target) => target,
            Err(error) => {
                warn!(%error, mark_id = %record.mark_id, "target mark creation failed");
                return None;
            }
        };
        engine_op(
            "target tag",
            engine.set_metadata(target, MetaKey::TargetFor, &record.mark_id.to_string()),
        );
        if let Some(font) = font {
            engine_op(
                "target font",
                engine.set_font(target, &font.name, &font.color, font.size),
            );
        }
        Some(target)
    }

    fn font_for(&self, record: &FieldRecord) -> ResolvedFont {
        let globals: GlobalSettings = self
            .store
            .get_as(StateKey::GlobalSettings)
            .unwrap_or_default();
        resolve_font(record, &globals)
    }

    fn begin_pending(&self, mark_id: MarkId) -> OpToken {
        self.pending
            .borrow_mut()
            .register(PendingActivation { mark_id })
    }

    fn field_list(&self) -> FieldListState {
        self.store
            .get_as(StateKey::FieldList)
            .unwrap_or_default()
    }

    fn record(&self, mark_id: MarkId) -> Option<FieldRecord> {
        let mut state = self.field_list();
        state.fields.remove(&mark_id)
    }
}

/// Whether signature content actually carries a mark the signer made.
fn signature_applied(data: &SignatureData) -> bool {
    data.image.is_some()
        || data
            .path
            .as_deref()
            .map_or(false, |path| !path.is_empty() && path != EMPTY_PATH)
        || data
            .text
            .as_deref()
            .map_or(false, |text| !text.trim().is_empty())
}

fn engine_op(context: &'static str, result: anyhow::Result<()>) {
    if let Err(error) = result {
        warn!(%error, context, "annotation operation failed");
    }
}
