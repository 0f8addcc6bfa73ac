//! Session configuration and user-facing strings.
//!
//! Both structs deserialize from plain JSON with every key optional, so an
//! embedder can supply only what it wants to override. `Labels` exists so
//! the engine never hard-codes display text; a localized bundle drops in at
//! session construction.

use serde::{Deserialize, Serialize};

use crate::model::FieldTemplate;

/// Everything a session needs to know up front.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    /// Document the form is being designed or filled against.
    pub template_document_id: Option<String>,
    /// Definition to display at startup, when resuming a saved form.
    pub form_definition_id: Option<String>,
    /// When set, form display filters to fields for this role.
    pub form_role_id: Option<String>,
    /// Trailing quiet period before mark geometry changes are folded back
    /// into field records.
    pub debounce_window_ms: i64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            template_document_id: None,
            form_definition_id: None,
            form_role_id: None,
            debounce_window_ms: 300,
        }
    }
}

/// Display strings, with English defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Labels {
    pub signature: String,
    pub initials: String,
    pub text: String,
    pub date: String,
    pub checkbox: String,
    /// Shown when typed content exceeds a field's character limit.
    /// `%n` is replaced with the limit.
    pub over_character_limit: String,
    /// Appended to duplicated field names.
    pub copy_suffix: String,
    pub form_saved: String,
    pub save_failed: String,
}

impl Default for Labels {
    fn default() -> Self {
        Labels {
            signature: "Signature".to_string(),
            initials: "Initials".to_string(),
            text: "Text".to_string(),
            date: "Date".to_string(),
            checkbox: "Checkbox".to_string(),
            over_character_limit: "Entry is too long: the limit is %n characters".to_string(),
            copy_suffix: "copy".to_string(),
            form_saved: "Form saved".to_string(),
            save_failed: "The form could not be saved".to_string(),
        }
    }
}

impl Labels {
    /// Display label for a field template.
    pub fn template_label(&self, template: FieldTemplate) -> &str {
        match template {
            FieldTemplate::Signature => &self.signature,
            FieldTemplate::Initials => &self.initials,
            FieldTemplate::Text => &self.text,
            FieldTemplate::Date => &self.date,
            FieldTemplate::Checkbox => &self.checkbox,
        }
    }

    pub fn over_limit_message(&self, limit: u32) -> String {
        self.over_character_limit.replace("%n", &limit.to_string())
    }

    /// Name for the `n`th duplicate of a field: `"Name copy"`, then
    /// `"Name copy 2"`, and so on.
    pub fn copy_name(&self, base: &str, copy_number: u32) -> String {
        if copy_number <= 1 {
            format!("{} {}", base, self.copy_suffix)
        } else {
            format!("{} {} {}", base, self.copy_suffix, copy_number)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_deserialize_with_partial_overrides() {
        let options: SessionOptions =
            serde_json::from_value(serde_json::json!({ "formRoleId": "tenant" })).unwrap();
        assert_eq!(options.form_role_id.as_deref(), Some("tenant"));
        assert_eq!(options.debounce_window_ms, 300);
    }

    #[test]
    fn over_limit_message_substitutes_the_limit() {
        let labels = Labels::default();
        assert_eq!(
            labels.over_limit_message(40),
            "Entry is too long: the limit is 40 characters"
        );
    }

    #[test]
    fn copy_names_number_from_the_second_copy() {
        let labels = Labels::default();
        assert_eq!(labels.copy_name("Rent", 1), "Rent copy");
        assert_eq!(labels.copy_name("Rent", 3), "Rent copy 3");
    }
}
