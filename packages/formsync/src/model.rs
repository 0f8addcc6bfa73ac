//! Domain types for the field list and its persisted form.
//!
//! The shared `FieldList` slice is a JSON value on the wire; the typed view
//! here round-trips through serde with camelCase names so components can work
//! with structs while patches stay plain JSON.
//!
//! A [`FieldRecord`] carries two kinds of data: durable attributes that
//! survive a save ([`SavedField`]) and transient correlation state
//! (`mark_id`, `target_id`, `is_complete`, `is_invalid`) that is rebuilt
//! every time a form is displayed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Identity and geometry
// =============================================================================

/// Identity of one annotation mark on the document.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MarkId(pub u32);

impl std::fmt::Display for MarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named slice of shared session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Field records, groups, and roles. The engine's primary slice.
    FieldList,
    /// Page number to displayed page size.
    PageData,
    /// The currently focused field mark, if any.
    FocusField,
    /// Derived checklist of fields and groups with progress counts.
    FormSummary,
    /// Session-wide font settings.
    GlobalSettings,
    /// Mark ids the designer currently has selected.
    FieldSelection,
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StateKey::FieldList => "fieldList",
            StateKey::PageData => "pageData",
            StateKey::FocusField => "focusField",
            StateKey::FormSummary => "formSummary",
            StateKey::GlobalSettings => "globalSettings",
            StateKey::FieldSelection => "fieldSelection",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rectangle {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rectangle {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn min_side(&self) -> f64 {
        self.width.min(self.height)
    }
}

// =============================================================================
// Field templates
// =============================================================================

/// The kinds of fillable field a form can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldTemplate {
    Signature,
    Initials,
    Text,
    Date,
    Checkbox,
}

impl FieldTemplate {
    /// Stable name used in metadata tags and generated field ids.
    pub fn noun(&self) -> &'static str {
        match self {
            FieldTemplate::Signature => "signature",
            FieldTemplate::Initials => "initials",
            FieldTemplate::Text => "text",
            FieldTemplate::Date => "date",
            FieldTemplate::Checkbox => "checkbox",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "signature" => Some(FieldTemplate::Signature),
            "initials" => Some(FieldTemplate::Initials),
            "text" => Some(FieldTemplate::Text),
            "date" => Some(FieldTemplate::Date),
            "checkbox" => Some(FieldTemplate::Checkbox),
            _ => None,
        }
    }

    /// Whether completion comes from typed content rather than a one-shot
    /// target (signatures, checks).
    pub fn is_text_like(&self) -> bool {
        matches!(self, FieldTemplate::Text | FieldTemplate::Date)
    }
}

// =============================================================================
// Font settings
// =============================================================================

/// Sentinel font values a saved field may carry instead of a concrete
/// setting. Resolved against the `GlobalSettings` slice at display time.
pub const USE_GLOBAL_FONT_NAME: &str = "UseGlobalFontNameSetting";
pub const USE_GLOBAL_FONT_COLOR: &str = "UseGlobalFontColorSetting";
pub const USE_GLOBAL_FONT_SIZE: f64 = -1.0;

/// Session-wide font defaults, stored in the `GlobalSettings` slice.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
}

// =============================================================================
// Field records
// =============================================================================

/// One field and everything the engine knows about it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRecord {
    pub mark_id: MarkId,
    pub field_id: String,
    pub display_name: String,
    pub template: FieldTemplate,
    pub rectangle: Rectangle,
    pub page_number: u32,
    /// Page size when the rectangle was captured; rescaled when the page
    /// displays at a different size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size_at_capture: Option<PageSize>,
    pub sort_index: f64,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_role_id: Option<String>,
    /// The mark holding the filled-in value, once one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<MarkId>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_limit: Option<u32>,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
}

/// A named set of fields that act as one unit (e.g. a checkbox group).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: String,
    pub display_name: String,
    pub template: FieldTemplate,
    /// For checkbox groups: whether more than one member may be checked.
    #[serde(default)]
    pub multiple: bool,
    /// Overrides member `required` flags when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Overrides member roles when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_role_id: Option<String>,
}

/// A signer role fields can be assigned to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormRole {
    pub form_role_id: String,
    pub display_name: String,
    /// Tint for field marks assigned to this role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
}

/// Typed view of the `FieldList` state slice.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldListState {
    pub fields: BTreeMap<MarkId, FieldRecord>,
    pub groups: BTreeMap<String, Group>,
    pub form_roles: BTreeMap<String, FormRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_definition_id: Option<String>,
    pub form_name: String,
}

impl FieldListState {
    /// Mark ids in visual order: ascending sort index, ties by ascending
    /// mark id (stable sort over creation order).
    pub fn ordered(&self) -> Vec<MarkId> {
        let mut ids: Vec<MarkId> = self.fields.keys().copied().collect();
        ids.sort_by(|a, b| {
            let left = self.fields[a].sort_index;
            let right = self.fields[b].sort_index;
            left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal)
        });
        ids
    }

    /// The record whose target mark is `mark_id`, if any.
    pub fn field_for_target(&self, mark_id: MarkId) -> Option<&FieldRecord> {
        self.fields.values().find(|r| r.target_id == Some(mark_id))
    }

    /// Required flag with the group override applied.
    pub fn effective_required(&self, record: &FieldRecord) -> bool {
        record
            .group_id
            .as_deref()
            .and_then(|gid| self.groups.get(gid))
            .and_then(|group| group.required)
            .unwrap_or(record.required)
    }

    /// Role with the group override applied.
    pub fn effective_form_role<'a>(&'a self, record: &'a FieldRecord) -> Option<&'a str> {
        let group_role = record
            .group_id
            .as_deref()
            .and_then(|gid| self.groups.get(gid))
            .and_then(|group| group.form_role_id.as_deref());
        group_role.or(record.form_role_id.as_deref())
    }

    /// Generate a field id from the template noun and the smallest unused
    /// positive suffix; falls back to `count + 1` when 1..=count are taken.
    /// Comparison is case-insensitive, matching id validation.
    pub fn next_field_id(&self, template: FieldTemplate) -> String {
        let taken: Vec<String> = self
            .fields
            .values()
            .map(|r| r.field_id.to_lowercase())
            .collect();
        let noun = template.noun();
        let count = self.fields.len();
        for suffix in 1..=count {
            let candidate = format!("{}{}", noun, suffix);
            if !taken.contains(&candidate) {
                return candidate;
            }
        }
        format!("{}{}", noun, count + 1)
    }

    /// Sort index for a newly created field: one past the current maximum.
    pub fn next_sort_index(&self) -> f64 {
        self.fields
            .values()
            .map(|r| r.sort_index)
            .fold(0.0, f64::max)
            + 1.0
    }

    /// Fellow members of a record's group, excluding the record itself.
    pub fn group_siblings(&self, record: &FieldRecord) -> Vec<MarkId> {
        let Some(gid) = record.group_id.as_deref() else {
            return Vec::new();
        };
        self.fields
            .values()
            .filter(|r| r.group_id.as_deref() == Some(gid) && r.mark_id != record.mark_id)
            .map(|r| r.mark_id)
            .collect()
    }

    /// Flatten into the durable save shape. Transient correlation state does
    /// not survive; fields are emitted in visual order.
    pub fn to_definition(&self, page_data: BTreeMap<u32, PageSize>) -> FormDefinition {
        let fields = self
            .ordered()
            .into_iter()
            .map(|id| SavedField::from(&self.fields[&id]))
            .collect();
        FormDefinition {
            form_definition_id: self.form_definition_id.clone(),
            form_name: self.form_name.clone(),
            fields,
            groups: self.groups.values().cloned().collect(),
            form_roles: self.form_roles.values().cloned().collect(),
            page_data,
        }
    }
}

/// Build a `FieldList` extend patch touching the given records. Keys in the
/// patch are mark ids; pair a record patch with `Value::Null` to delete it.
pub fn fields_patch<I>(entries: I) -> serde_json::Value
where
    I: IntoIterator<Item = (MarkId, serde_json::Value)>,
{
    let mut fields = serde_json::Map::new();
    for (id, patch) in entries {
        fields.insert(id.to_string(), patch);
    }
    let mut root = serde_json::Map::new();
    root.insert("fields".to_string(), serde_json::Value::Object(fields));
    serde_json::Value::Object(root)
}

// =============================================================================
// Persisted shape
// =============================================================================

/// A field as it is written to the document store. No mark ids, no fill
/// state; those belong to a live session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedField {
    pub field_id: String,
    pub display_name: String,
    pub template: FieldTemplate,
    pub rectangle: Rectangle,
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size_at_capture: Option<PageSize>,
    pub sort_index: f64,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_role_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_limit: Option<u32>,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
}

impl From<&FieldRecord> for SavedField {
    fn from(record: &FieldRecord) -> Self {
        SavedField {
            field_id: record.field_id.clone(),
            display_name: record.display_name.clone(),
            template: record.template,
            rectangle: record.rectangle,
            page_number: record.page_number,
            page_size_at_capture: record.page_size_at_capture,
            sort_index: record.sort_index,
            required: record.required,
            group_id: record.group_id.clone(),
            form_role_id: record.form_role_id.clone(),
            character_limit: record.character_limit,
            multiline: record.multiline,
            font_name: record.font_name.clone(),
            font_color: record.font_color.clone(),
            font_size: record.font_size,
        }
    }
}

/// The durable form: what the document store reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_definition_id: Option<String>,
    pub form_name: String,
    pub fields: Vec<SavedField>,
    pub groups: Vec<Group>,
    pub form_roles: Vec<FormRole>,
    pub page_data: BTreeMap<u32, PageSize>,
}

// =============================================================================
// Validation
// =============================================================================

/// Rejections from the field editor. These surface synchronously to the
/// editing surface; they never travel over the bus.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("field id must not be empty")]
    EmptyFieldId,
    #[error("field id `{0}` is already in use")]
    DuplicateFieldId(String),
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("character limit must be a whole number of zero or more")]
    InvalidCharacterLimit,
    #[error("group name must not be empty")]
    EmptyGroupName,
    #[error("group name `{0}` is already in use")]
    DuplicateGroupName(String),
}

/// A field id must be non-empty and unique case-insensitively across the
/// list, ignoring the field being edited.
pub fn validate_field_id(
    candidate: &str,
    state: &FieldListState,
    editing: MarkId,
) -> Result<(), ValidationError> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyFieldId);
    }
    let lowered = trimmed.to_lowercase();
    let clash = state
        .fields
        .values()
        .any(|r| r.mark_id != editing && r.field_id.to_lowercase() == lowered);
    if clash {
        return Err(ValidationError::DuplicateFieldId(trimmed.to_string()));
    }
    Ok(())
}

pub fn validate_display_name(candidate: &str) -> Result<(), ValidationError> {
    if candidate.trim().is_empty() {
        return Err(ValidationError::EmptyDisplayName);
    }
    Ok(())
}

/// The limit arrives as a number from a free-form input; it must be a whole
/// number of zero or more.
pub fn validate_character_limit(candidate: f64) -> Result<u32, ValidationError> {
    if !candidate.is_finite() || candidate < 0.0 || candidate.fract() != 0.0 {
        return Err(ValidationError::InvalidCharacterLimit);
    }
    Ok(candidate as u32)
}

pub fn validate_group_name(
    candidate: &str,
    state: &FieldListState,
    editing: Option<&str>,
) -> Result<(), ValidationError> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyGroupName);
    }
    let lowered = trimmed.to_lowercase();
    let clash = state.groups.values().any(|g| {
        Some(g.group_id.as_str()) != editing && g.display_name.to_lowercase() == lowered
    });
    if clash {
        return Err(ValidationError::DuplicateGroupName(trimmed.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(mark_id: u32, field_id: &str, sort_index: f64) -> FieldRecord {
        FieldRecord {
            mark_id: MarkId(mark_id),
            field_id: field_id.to_string(),
            display_name: field_id.to_string(),
            template: FieldTemplate::Text,
            rectangle: Rectangle::new(10.0, 10.0, 100.0, 20.0),
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

    fn state_with(records: Vec<FieldRecord>) -> FieldListState {
        let mut state = FieldListState::default();
        for r in records {
            state.fields.insert(r.mark_id, r);
        }
        state
    }

    #[test]
    fn ordered_sorts_by_index_with_stable_ties() {
        let state = state_with(vec![
            record(3, "c", 2.0),
            record(1, "a", 2.0),
            record(2, "b", 1.0),
        ]);
        // Tied fields keep ascending mark id order.
        assert_eq!(state.ordered(), vec![MarkId(2), MarkId(1), MarkId(3)]);
    }

    #[test]
    fn next_field_id_fills_smallest_gap() {
        let state = state_with(vec![
            record(1, "text1", 1.0),
            record(2, "text3", 2.0),
            record(3, "other", 3.0),
        ]);
        assert_eq!(state.next_field_id(FieldTemplate::Text), "text2");
    }

    #[test]
    fn next_field_id_falls_back_past_count() {
        let state = state_with(vec![
            record(1, "date1", 1.0),
            record(2, "date2", 2.0),
        ]);
        assert_eq!(state.next_field_id(FieldTemplate::Date), "date3");
    }

    #[test]
    fn next_field_id_ignores_case() {
        let state = state_with(vec![record(1, "Text1", 1.0)]);
        assert_eq!(state.next_field_id(FieldTemplate::Text), "text2");
    }

    #[test]
    fn next_sort_index_is_one_past_max() {
        assert_eq!(FieldListState::default().next_sort_index(), 1.0);
        let state = state_with(vec![record(1, "a", 4.5)]);
        assert_eq!(state.next_sort_index(), 5.5);
    }

    #[test]
    fn group_overrides_apply() {
        let mut state = state_with(vec![record(1, "a", 1.0)]);
        let r = state.fields.get_mut(&MarkId(1)).unwrap();
        r.required = false;
        r.group_id = Some("g1".into());
        r.form_role_id = Some("ownRole".into());
        state.groups.insert(
            "g1".into(),
            Group {
                group_id: "g1".into(),
                display_name: "Checks".into(),
                template: FieldTemplate::Checkbox,
                multiple: false,
                required: Some(true),
                form_role_id: Some("groupRole".into()),
            },
        );

        let r = &state.fields[&MarkId(1)];
        assert!(state.effective_required(r));
        assert_eq!(state.effective_form_role(r), Some("groupRole"));
    }

    #[test]
    fn record_role_applies_without_a_group() {
        let mut state = state_with(vec![record(1, "a", 1.0)]);
        state.fields.get_mut(&MarkId(1)).unwrap().form_role_id = Some("tenant".into());

        let role = {
            let r = &state.fields[&MarkId(1)];
            state.effective_form_role(r)
        };
        assert_eq!(role, Some("tenant"));
    }

    #[test]
    fn to_definition_prunes_transient_state() {
        let mut state = state_with(vec![record(7, "a", 1.0)]);
        {
            let r = state.fields.get_mut(&MarkId(7)).unwrap();
            r.target_id = Some(MarkId(99));
            r.is_complete = true;
        }
        state.form_name = "Lease".into();

        let definition = state.to_definition(BTreeMap::new());
        let json = serde_json::to_value(&definition).unwrap();
        let field = &json["fields"][0];
        assert!(field.get("markId").is_none());
        assert!(field.get("targetId").is_none());
        assert!(field.get("isComplete").is_none());
        assert_eq!(field["fieldId"], "a");
        assert_eq!(json["formName"], "Lease");
    }

    #[test]
    fn field_record_round_trips_with_defaults() {
        let json = serde_json::json!({
            "markId": 4,
            "fieldId": "signature1",
            "displayName": "Signature 1",
            "template": "signature",
            "rectangle": { "x": 1.0, "y": 2.0, "width": 3.0, "height": 4.0 },
            "pageNumber": 2,
            "sortIndex": 1.5,
            "required": true
        });
        let record: FieldRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.mark_id, MarkId(4));
        assert_eq!(record.template, FieldTemplate::Signature);
        assert_eq!(record.target_id, None);
        assert!(!record.is_complete);
    }

    #[test]
    fn validate_field_id_rejects_empty_and_duplicates() {
        let state = state_with(vec![record(1, "Text1", 1.0), record(2, "text2", 2.0)]);
        assert_eq!(
            validate_field_id("  ", &state, MarkId(2)),
            Err(ValidationError::EmptyFieldId)
        );
        assert_eq!(
            validate_field_id("TEXT1", &state, MarkId(2)),
            Err(ValidationError::DuplicateFieldId("TEXT1".into()))
        );
        // A field may keep its own id.
        assert_eq!(validate_field_id("text2", &state, MarkId(2)), Ok(()));
    }

    #[test]
    fn validate_character_limit_requires_whole_nonnegative() {
        assert_eq!(validate_character_limit(0.0), Ok(0));
        assert_eq!(validate_character_limit(42.0), Ok(42));
        assert!(validate_character_limit(-1.0).is_err());
        assert!(validate_character_limit(2.5).is_err());
        assert!(validate_character_limit(f64::NAN).is_err());
    }
}
