//! Correlation between annotation marks and field records.
//!
//! Marks are the only durable thing on the document; field records are the
//! engine's view of them. This component keeps the two in agreement in both
//! directions:
//!
//! - mark events (created, changed, removed) update the `FieldList` slice;
//! - `FieldList` changes flow back onto the marks as styling, required
//!   indicators, and geometry.
//!
//! Correlation survives reloads through metadata tags on the marks: field
//! marks carry `template`, value marks carry `target-for`, and indicator
//! stars carry `required-for`. Indicator marks are deliberately kept out of
//! the field list; a side table maps each field mark to its star.
//!
//! Geometry changes debounce: drags produce a burst of `MarkChanged`
//! events, and the records absorb them only after a quiet period, flushed
//! by the session clock.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::{Labels, SessionOptions};
use crate::controller::focused_mark;
use crate::events::{MarkChange, NotifyLevel, Operation, Topic, ViewerEvent};
use crate::marks::{
    border_scale, page_size_or_fallback, resolve_font, AnnotationEngine, MarkKind, MetaKey,
    SharedEngine, BLANK_INDICATOR_IMAGE, DEFAULT_BORDER_COLOR, DEFAULT_BORDER_THICKNESS,
    DEFAULT_FILL_COLOR, DEFAULT_FILL_OPACITY, EMPTY_PATH, ERROR_BORDER_COLOR,
    FALLBACK_PAGE_SIZE, REQUIRED_INDICATOR_IMAGE,
};
use crate::model::{
    fields_patch, FieldListState, FieldRecord, FieldTemplate, GlobalSettings, MarkId, PageSize,
    Rectangle, StateKey,
};
use crate::store::StateStore;

/// Indicator size: a fraction of the page's smallest side, never more than
/// two thirds of the field rectangle's smallest side.
const INDICATOR_PAGE_FRACTION: f64 = 0.02;
const INDICATOR_RECT_FRACTION: f64 = 2.0 / 3.0;

/// Offset applied to duplicated fields, clamped inside the page.
const DUPLICATE_OFFSET: f64 = 20.0;

struct GeometryDebounce {
    dirty: BTreeSet<MarkId>,
    deadline: Option<DateTime<Utc>>,
}

/// Fonts of removed field records, so a mark recreated under the same id
/// (undo) keeps its font choices.
type FontMemory = HashMap<MarkId, (Option<String>, Option<String>, Option<f64>)>;

/// Keeps marks and field records describing each other.
pub struct AnnotationCorrelator {
    store: Rc<StateStore>,
    engine: SharedEngine,
    options: SessionOptions,
    labels: Labels,
    indicators: RefCell<HashMap<MarkId, MarkId>>,
    removed_fonts: RefCell<FontMemory>,
    geometry: RefCell<GeometryDebounce>,
}

impl AnnotationCorrelator {
    pub fn attach(
        bus: &EventBus,
        store: Rc<StateStore>,
        engine: SharedEngine,
        options: SessionOptions,
        labels: Labels,
    ) -> Rc<Self> {
        let correlator = Rc::new(AnnotationCorrelator {
            store,
            engine,
            options,
            labels,
            indicators: RefCell::new(HashMap::new()),
            removed_fonts: RefCell::new(HashMap::new()),
            geometry: RefCell::new(GeometryDebounce {
                dirty: BTreeSet::new(),
                deadline: None,
            }),
        });

        let subscriptions: [(Topic, fn(&Self, &EventBus, &ViewerEvent)); 8] = [
            (Topic::MarkCreated, Self::on_mark_created),
            (Topic::MarkChanged, Self::on_mark_changed),
            (Topic::MarkRemoved, Self::on_mark_removed),
            (Topic::StateModified, Self::on_state_modified),
            (Topic::PageDisplayed, Self::on_page_displayed),
            (Topic::DisplayForm, Self::on_display_form),
            (Topic::DeleteFields, Self::on_delete_fields),
            (Topic::DuplicateFields, Self::on_duplicate_fields),
        ];
        for (topic, handler) in subscriptions {
            let weak: Weak<AnnotationCorrelator> = Rc::downgrade(&correlator);
            bus.subscribe(topic, move |bus, event| {
                if let Some(correlator) = weak.upgrade() {
                    handler(&correlator, bus, event);
                }
            });
        }

        correlator
    }

    /// Flush the geometry debounce when its quiet period has elapsed.
    pub fn tick(&self, bus: &EventBus, now: DateTime<Utc>) {
        let dirty: Vec<MarkId> = {
            let mut geometry = self.geometry.borrow_mut();
            match geometry.deadline {
                Some(deadline) if now >= deadline => {
                    geometry.deadline = None;
                    std::mem::take(&mut geometry.dirty).into_iter().collect()
                }
                _ => return,
            }
        };

        let state = self.field_list();
        let mut patches: Vec<(MarkId, serde_json::Value)> = Vec::new();
        {
            let engine = self.engine.borrow();
            for mark_id in dirty {
                let Some(record) = state.fields.get(&mark_id) else { continue };
                let Some(rectangle) = engine.rectangle(mark_id) else { continue };
                let page_size = page_size_or_fallback(&*engine, record.page_number);
                patches.push((
                    mark_id,
                    serde_json::json!({
                        "rectangle": rectangle,
                        "pageSizeAtCapture": page_size,
                    }),
                ));
            }
        }
        if !patches.is_empty() {
            bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value: fields_patch(patches),
                operation: Operation::Extend,
            });
        }
    }

    // =========================================================================
    // Mark events
    // =========================================================================

    /// A user-created mark with a `template` tag becomes a field record.
    fn on_mark_created(&self, bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::MarkCreated { mark_id } = event else { return };
        let mark_id = *mark_id;

        let template = {
            let engine = self.engine.borrow();
            engine
                .metadata(mark_id, MetaKey::Template)
                .and_then(|tag| FieldTemplate::parse(&tag))
        };
        let Some(template) = template else { return };

        let state = self.field_list();
        if state.fields.contains_key(&mark_id) {
            return;
        }

        let field_id = state.next_field_id(template);
        let suffix = field_id[template.noun().len()..].to_string();
        let display_name = format!("{} {}", self.labels.template_label(template), suffix);
        let (font_name, font_color, font_size) = self
            .removed_fonts
            .borrow_mut()
            .remove(&mark_id)
            .unwrap_or((None, None, None));

        let record = {
            let mut engine = self.engine.borrow_mut();
            let Some(rectangle) = engine.rectangle(mark_id) else {
                debug!(%mark_id, "created mark vanished before correlation");
                return;
            };
            let page_number = engine.page_number(mark_id).unwrap_or(1);
            let page_size = engine.page_size(page_number);
            let scale = border_scale(page_size.unwrap_or(FALLBACK_PAGE_SIZE));
            engine_op(
                "field fill",
                engine.set_fill(mark_id, DEFAULT_FILL_COLOR, DEFAULT_FILL_OPACITY),
            );
            engine_op(
                "field border",
                engine.set_border(mark_id, DEFAULT_BORDER_COLOR, DEFAULT_BORDER_THICKNESS * scale),
            );
            FieldRecord {
                mark_id,
                field_id,
                display_name,
                template,
                rectangle,
                page_number,
                page_size_at_capture: page_size,
                sort_index: state.next_sort_index(),
                required: true,
                group_id: None,
                form_role_id: None,
                target_id: None,
                is_complete: false,
                is_invalid: false,
                character_limit: None,
                multiline: false,
                font_name,
                font_color,
                font_size,
            }
        };

        match serde_json::to_value(&record) {
            Ok(value) => bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value: fields_patch([(mark_id, value)]),
                operation: Operation::Extend,
            }),
            Err(error) => warn!(%error, "field record failed to serialize"),
        }
    }

    fn on_mark_changed(&self, bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::MarkChanged { mark_id, change } = event else { return };
        match change {
            MarkChange::Rectangle => self.note_geometry(*mark_id),
            MarkChange::Content => self.recheck_content(bus, *mark_id),
        }
    }

    fn note_geometry(&self, mark_id: MarkId) {
        let state = self.field_list();
        if !state.fields.contains_key(&mark_id) {
            return;
        }
        let mut geometry = self.geometry.borrow_mut();
        geometry.dirty.insert(mark_id);
        // Trailing edge: every change pushes the deadline out again.
        geometry.deadline =
            Some(Utc::now() + Duration::milliseconds(self.options.debounce_window_ms));
    }

    /// Typed or drawn content changed on a target mark; refresh its field's
    /// completion and validity.
    fn recheck_content(&self, bus: &EventBus, mark_id: MarkId) {
        let state = self.field_list();
        let Some(record) = state.field_for_target(mark_id).cloned() else { return };

        let (complete, over_limit) = {
            let engine = self.engine.borrow();
            let complete = completion(&record, &*engine);
            // A limit of zero means unlimited.
            let over_limit = match (record.template, record.character_limit) {
                (FieldTemplate::Text, Some(limit)) if limit > 0 => engine
                    .text(mark_id)
                    .map_or(false, |text| text.chars().count() > limit as usize),
                _ => false,
            };
            (complete, over_limit)
        };

        if complete == record.is_complete && over_limit == record.is_invalid {
            return;
        }
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch([(
                record.mark_id,
                serde_json::json!({
                    "isComplete": complete && !over_limit,
                    "isInvalid": over_limit,
                }),
            )]),
            operation: Operation::Extend,
        });
        if over_limit && !record.is_invalid {
            if let Some(limit) = record.character_limit {
                bus.publish(&ViewerEvent::Notify {
                    level: NotifyLevel::Error,
                    message: self.labels.over_limit_message(limit),
                });
            }
        }
    }

    fn on_mark_removed(&self, bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::MarkRemoved { mark_id } = event else { return };
        let mark_id = *mark_id;
        let state = self.field_list();

        if let Some(record) = state.fields.get(&mark_id) {
            // The field mark itself is gone: remember fonts for a possible
            // recreation, drop its satellites, then the record.
            self.removed_fonts.borrow_mut().insert(
                mark_id,
                (
                    record.font_name.clone(),
                    record.font_color.clone(),
                    record.font_size,
                ),
            );
            let mut doomed: Vec<MarkId> = Vec::new();
            if let Some(target) = record.target_id {
                doomed.push(target);
            }
            if let Some(indicator) = self.indicators.borrow_mut().remove(&mark_id) {
                doomed.push(indicator);
            }
            if !doomed.is_empty() {
                engine_op(
                    "orphaned satellites",
                    self.engine.borrow_mut().delete_marks(&doomed),
                );
            }
            bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value: fields_patch([(mark_id, serde_json::Value::Null)]),
                operation: Operation::Extend,
            });
            return;
        }

        if let Some(owner) = state.field_for_target(mark_id) {
            // A filled-in value disappeared; the field reverts to empty.
            bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value: fields_patch([(
                    owner.mark_id,
                    serde_json::json!({ "targetId": null, "isComplete": false }),
                )]),
                operation: Operation::Extend,
            });
            return;
        }

        self.indicators
            .borrow_mut()
            .retain(|_, indicator| *indicator != mark_id);
    }

    // =========================================================================
    // State reconciliation
    // =========================================================================

    fn on_state_modified(&self, _bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::StateModified { key, .. } = event else { return };
        if matches!(key, StateKey::FieldList | StateKey::FocusField) {
            self.reconcile();
        }
    }

    /// Re-derive every mark attribute that is a function of the field list:
    /// fill tint, border, and required indicators. Idempotent on purpose.
    fn reconcile(&self) {
        let state = self.field_list();
        let focused = focused_mark(&self.store);
        let mut engine = self.engine.borrow_mut();

        for record in state.fields.values() {
            if !engine.mark_exists(record.mark_id) {
                continue;
            }
            let page_size = page_size_or_fallback(&*engine, record.page_number);
            let scale = border_scale(page_size);

            let fill = state
                .effective_form_role(record)
                .and_then(|role| state.form_roles.get(role))
                .and_then(|role| role.fill_color.as_deref())
                .unwrap_or(DEFAULT_FILL_COLOR);
            engine_op(
                "fill",
                engine.set_fill(record.mark_id, fill, DEFAULT_FILL_OPACITY),
            );

            if focused != Some(record.mark_id) {
                let color = if record.is_invalid {
                    ERROR_BORDER_COLOR
                } else {
                    DEFAULT_BORDER_COLOR
                };
                engine_op(
                    "border",
                    engine.set_border(record.mark_id, color, DEFAULT_BORDER_THICKNESS * scale),
                );
            }

            let show_star = state.effective_required(record)
                && !record.is_complete
                && focused != Some(record.mark_id);
            self.ensure_indicator(&mut *engine, record, page_size, show_star);
        }

        // Indicators whose field records are gone.
        let stale: Vec<MarkId> = {
            let mut indicators = self.indicators.borrow_mut();
            let stale: Vec<(MarkId, MarkId)> = indicators
                .iter()
                .filter(|(field, _)| !state.fields.contains_key(field))
                .map(|(field, indicator)| (*field, *indicator))
                .collect();
            for (field, _) in &stale {
                indicators.remove(field);
            }
            stale.into_iter().map(|(_, indicator)| indicator).collect()
        };
        if !stale.is_empty() {
            engine_op("stale indicators", engine.delete_marks(&stale));
        }
    }

    /// Keep exactly one star per required field, blanked rather than
    /// deleted while the field is complete or focused, so it never loses
    /// its place on the page.
    fn ensure_indicator(
        &self,
        engine: &mut dyn AnnotationEngine,
        record: &FieldRecord,
        page_size: PageSize,
        show_star: bool,
    ) {
        let existing = self
            .indicators
            .borrow()
            .get(&record.mark_id)
            .copied()
            .filter(|indicator| engine.mark_exists(*indicator));

        let image = if show_star {
            REQUIRED_INDICATOR_IMAGE
        } else {
            BLANK_INDICATOR_IMAGE
        };
        let rect = indicator_rectangle(record.rectangle, page_size);

        match existing {
            Some(indicator) => {
                engine_op("indicator image", engine.set_image(indicator, image));
                engine_op("indicator rect", engine.set_rectangle(indicator, rect));
            }
            None if show_star => {
                let created = engine.create_mark(record.page_number, MarkKind::Stamp, rect);
                match created {
                    Ok(indicator) => {
                        engine_op("indicator image", engine.set_image(indicator, image));
                        engine_op(
                            "indicator tag",
                            engine.set_metadata(
                                indicator,
                                MetaKey::RequiredFor,
                                &record.mark_id.to_string(),
                            ),
                        );
                        engine_op("indicator lock", engine.set_locked(indicator, true));
                        self.indicators
                            .borrow_mut()
                            .insert(record.mark_id, indicator);
                    }
                    Err(error) => warn!(%error, "indicator mark creation failed"),
                }
            }
            None => {}
        }
    }

    // =========================================================================
    // Pages
    // =========================================================================

    fn on_page_displayed(&self, bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::PageDisplayed { page_number, size } = event else { return };
        let (page_number, size) = (*page_number, *size);

        let mut page_patch = serde_json::Map::new();
        match serde_json::to_value(size) {
            Ok(value) => {
                page_patch.insert(page_number.to_string(), value);
            }
            Err(error) => warn!(%error, "page size failed to serialize"),
        }
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::PageData,
            value: serde_json::Value::Object(page_patch),
            operation: Operation::Extend,
        });

        // Rescale every field captured at a different page size.
        let state = self.field_list();
        let mut patches: Vec<(MarkId, serde_json::Value)> = Vec::new();
        {
            let mut engine = self.engine.borrow_mut();
            for record in state.fields.values() {
                if record.page_number != page_number {
                    continue;
                }
                let captured = record.page_size_at_capture.unwrap_or(FALLBACK_PAGE_SIZE);
                if captured == size {
                    continue;
                }
                let rectangle = scale_rectangle(record.rectangle, captured, size);
                engine_op("rescale field", engine.set_rectangle(record.mark_id, rectangle));
                if let Some(target) = record.target_id.filter(|t| engine.mark_exists(*t)) {
                    if let Some(target_rect) = engine.rectangle(target) {
                        engine_op(
                            "rescale target",
                            engine.set_rectangle(
                                target,
                                scale_rectangle(target_rect, captured, size),
                            ),
                        );
                    }
                }
                patches.push((
                    record.mark_id,
                    serde_json::json!({
                        "rectangle": rectangle,
                        "pageSizeAtCapture": size,
                    }),
                ));
            }
        }
        if !patches.is_empty() {
            bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value: fields_patch(patches),
                operation: Operation::Extend,
            });
        }
    }

    // =========================================================================
    // Form display
    // =========================================================================

    /// Build marks and records for a saved definition, replacing whatever
    /// form is currently displayed.
    fn on_display_form(&self, bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::DisplayForm { definition } = event else { return };

        self.clear_current_form();

        let globals: GlobalSettings = self
            .store
            .get_as(StateKey::GlobalSettings)
            .unwrap_or_default();
        let mut state = FieldListState {
            form_definition_id: definition.form_definition_id.clone(),
            form_name: definition.form_name.clone(),
            ..Default::default()
        };
        for group in &definition.groups {
            state.groups.insert(group.group_id.clone(), group.clone());
        }
        for role in &definition.form_roles {
            state.form_roles.insert(role.form_role_id.clone(), role.clone());
        }

        {
            let mut engine = self.engine.borrow_mut();
            for saved in &definition.fields {
                if !self.role_matches(saved.group_id.as_deref(), saved.form_role_id.as_deref(), &state) {
                    continue;
                }
                let page_size = page_size_or_fallback(&*engine, saved.page_number);
                let captured = saved.page_size_at_capture.unwrap_or(FALLBACK_PAGE_SIZE);
                let rectangle = if captured == page_size {
                    saved.rectangle
                } else {
                    scale_rectangle(saved.rectangle, captured, page_size)
                };

                let mark_id =
                    match engine.create_mark(saved.page_number, MarkKind::Box, rectangle) {
                        Ok(mark_id) => mark_id,
                        Err(error) => {
                            warn!(%error, field = %saved.field_id, "field mark creation failed");
                            continue;
                        }
                    };
                engine_op(
                    "field tag",
                    engine.set_metadata(mark_id, MetaKey::Template, saved.template.noun()),
                );

                let mut record = FieldRecord {
                    mark_id,
                    field_id: saved.field_id.clone(),
                    display_name: saved.display_name.clone(),
                    template: saved.template,
                    rectangle,
                    page_number: saved.page_number,
                    page_size_at_capture: Some(page_size),
                    sort_index: saved.sort_index,
                    required: saved.required,
                    group_id: saved.group_id.clone(),
                    form_role_id: saved.form_role_id.clone(),
                    target_id: None,
                    is_complete: false,
                    is_invalid: false,
                    character_limit: saved.character_limit,
                    multiline: saved.multiline,
                    font_name: saved.font_name.clone(),
                    font_color: saved.font_color.clone(),
                    font_size: saved.font_size,
                };
                // Resolve use-global sentinels once, at display time.
                let font = resolve_font(&record, &globals);
                record.font_name = Some(font.name);
                record.font_color = Some(font.color);
                record.font_size = Some(font.size);

                state.fields.insert(mark_id, record);
            }
        }

        match serde_json::to_value(&state) {
            Ok(value) => bus.publish(&ViewerEvent::ModifyState {
                key: StateKey::FieldList,
                value,
                operation: Operation::Replace,
            }),
            Err(error) => warn!(%error, "field list failed to serialize for display"),
        }
        bus.publish(&ViewerEvent::FormLoaded);
    }

    /// A field belongs to the session's role when no filter is set, when it
    /// carries no role, or when its effective role matches the filter.
    fn role_matches(
        &self,
        group_id: Option<&str>,
        form_role_id: Option<&str>,
        state: &FieldListState,
    ) -> bool {
        let Some(filter) = self.options.form_role_id.as_deref() else {
            return true;
        };
        let group_role = group_id
            .and_then(|gid| state.groups.get(gid))
            .and_then(|group| group.form_role_id.as_deref());
        match group_role.or(form_role_id) {
            Some(role) => role == filter,
            None => true,
        }
    }

    fn clear_current_form(&self) {
        let state = self.field_list();
        let mut doomed: Vec<MarkId> = Vec::new();
        for record in state.fields.values() {
            doomed.push(record.mark_id);
            if let Some(target) = record.target_id {
                doomed.push(target);
            }
        }
        doomed.extend(self.indicators.borrow_mut().drain().map(|(_, ind)| ind));
        if !doomed.is_empty() {
            engine_op("clear form", self.engine.borrow_mut().delete_marks(&doomed));
        }
    }

    // =========================================================================
    // Designer batch operations
    // =========================================================================

    fn on_delete_fields(&self, bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::DeleteFields { mark_ids } = event else { return };
        let state = self.field_list();

        let mut doomed: Vec<MarkId> = Vec::new();
        let mut patches: Vec<(MarkId, serde_json::Value)> = Vec::new();
        for mark_id in mark_ids {
            let Some(record) = state.fields.get(mark_id) else { continue };
            doomed.push(record.mark_id);
            if let Some(target) = record.target_id {
                doomed.push(target);
            }
            if let Some(indicator) = self.indicators.borrow_mut().remove(mark_id) {
                doomed.push(indicator);
            }
            patches.push((*mark_id, serde_json::Value::Null));
        }
        if doomed.is_empty() {
            return;
        }
        engine_op("delete fields", self.engine.borrow_mut().delete_marks(&doomed));
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch(patches),
            operation: Operation::Extend,
        });
    }

    fn on_duplicate_fields(&self, bus: &EventBus, event: &ViewerEvent) {
        let ViewerEvent::DuplicateFields { mark_ids } = event else { return };
        let state = self.field_list();

        // Every clone in the batch shares one sort index; display order
        // among them falls back to creation order.
        let batch_sort_index = state.next_sort_index();
        let mut scratch = state.clone();
        let mut taken_names: Vec<String> =
            state.fields.values().map(|r| r.display_name.clone()).collect();

        let mut patches: Vec<(MarkId, serde_json::Value)> = Vec::new();
        let mut clones: Vec<MarkId> = Vec::new();
        {
            let mut engine = self.engine.borrow_mut();
            for mark_id in mark_ids {
                let Some(original) = state.fields.get(mark_id) else { continue };
                let page_size = page_size_or_fallback(&*engine, original.page_number);
                let rectangle = offset_within_page(original.rectangle, page_size);

                let clone_id =
                    match engine.create_mark(original.page_number, MarkKind::Box, rectangle) {
                        Ok(clone_id) => clone_id,
                        Err(error) => {
                            warn!(%error, "duplicate mark creation failed");
                            continue;
                        }
                    };
                engine_op(
                    "field tag",
                    engine.set_metadata(clone_id, MetaKey::Template, original.template.noun()),
                );

                let field_id = scratch.next_field_id(original.template);
                let display_name =
                    self.unique_copy_name(&original.display_name, &mut taken_names);
                let record = FieldRecord {
                    mark_id: clone_id,
                    field_id,
                    display_name,
                    rectangle,
                    page_size_at_capture: Some(page_size),
                    sort_index: batch_sort_index,
                    target_id: None,
                    is_complete: false,
                    is_invalid: false,
                    ..original.clone()
                };
                scratch.fields.insert(clone_id, record.clone());
                clones.push(clone_id);
                match serde_json::to_value(&record) {
                    Ok(value) => patches.push((clone_id, value)),
                    Err(error) => warn!(%error, "duplicate record failed to serialize"),
                }
            }
            if !clones.is_empty() {
                engine_op("select clones", engine.select(&clones));
            }
        }
        if patches.is_empty() {
            return;
        }
        bus.publish(&ViewerEvent::ModifyState {
            key: StateKey::FieldList,
            value: fields_patch(patches),
            operation: Operation::Extend,
        });
    }

    /// `"Rent"` duplicates as `"Rent copy"`, then `"Rent copy 2"`, and so
    /// on; duplicating a copy strips the suffix first instead of stacking.
    fn unique_copy_name(&self, original: &str, taken: &mut Vec<String>) -> String {
        let base = strip_copy_suffix(original, &self.labels.copy_suffix);
        let mut copy_number = 1;
        loop {
            let candidate = self.labels.copy_name(base, copy_number);
            if !taken.iter().any(|name| name == &candidate) {
                taken.push(candidate.clone());
                return candidate;
            }
            copy_number += 1;
        }
    }

    fn field_list(&self) -> FieldListState {
        self.store
            .get_as(StateKey::FieldList)
            .unwrap_or_default()
    }
}

// =============================================================================
// Completion rules
// =============================================================================

/// Whether a field's target mark satisfies its template.
pub fn completion(record: &FieldRecord, engine: &dyn AnnotationEngine) -> bool {
    let Some(target) = record.target_id.filter(|t| engine.mark_exists(*t)) else {
        return false;
    };
    match record.template {
        FieldTemplate::Signature | FieldTemplate::Initials => match engine.kind(target) {
            Some(MarkKind::Ink) => engine
                .path(target)
                .map_or(false, |path| !path.is_empty() && path != EMPTY_PATH),
            Some(MarkKind::Stamp) => engine.image(target).is_some(),
            Some(MarkKind::Text) => engine
                .text(target)
                .map_or(false, |text| !text.trim().is_empty()),
            _ => false,
        },
        template if template.is_text_like() => engine
            .text(target)
            .map_or(false, |text| !text.trim().is_empty()),
        FieldTemplate::Checkbox => true,
        _ => false,
    }
}

// =============================================================================
// Geometry helpers
// =============================================================================

fn indicator_rectangle(field: Rectangle, page: PageSize) -> Rectangle {
    let dim = (page.min_side() * INDICATOR_PAGE_FRACTION)
        .min(field.width.min(field.height) * INDICATOR_RECT_FRACTION);
    let pad = 2.0 * border_scale(page);
    Rectangle::new(field.x + field.width - dim - pad, field.y + pad, dim, dim)
}

fn scale_rectangle(rect: Rectangle, from: PageSize, to: PageSize) -> Rectangle {
    let sx = to.width / from.width;
    let sy = to.height / from.height;
    Rectangle::new(rect.x * sx, rect.y * sy, rect.width * sx, rect.height * sy)
}

/// Shift a duplicate down-right, clamped so it stays on the page.
fn offset_within_page(rect: Rectangle, page: PageSize) -> Rectangle {
    let x = (rect.x + DUPLICATE_OFFSET)
        .min(page.width - rect.width)
        .max(0.0);
    let y = (rect.y + DUPLICATE_OFFSET)
        .min(page.height - rect.height)
        .max(0.0);
    Rectangle::new(x, y, rect.width, rect.height)
}

fn strip_copy_suffix<'a>(name: &'a str, suffix: &str) -> &'a str {
    let marker = format!(" {}", suffix);
    if let Some(stem) = name.strip_suffix(&marker) {
        return stem;
    }
    // " copy N"
    if let Some(position) = name.rfind(&marker) {
        let tail = &name[position + marker.len()..];
        if tail.trim().chars().all(|c| c.is_ascii_digit()) && !tail.trim().is_empty() {
            return &name[..position];
        }
    }
    name
}

fn engine_op(context: &'static str, result: anyhow::Result<()>) {
    if let Err(error) = result {
        warn!(%error, context, "annotation operation failed");
    }
}
