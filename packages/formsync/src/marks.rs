//! The annotation collaborator seam.
//!
//! The engine never touches a rendering surface. Everything it needs from
//! the document viewer goes through [`AnnotationEngine`], a synchronous,
//! passive collaborator: calls mutate or read marks and return, and never
//! call back into the session. User-driven changes reach the session as bus
//! events published by the embedder; programmatic changes made through this
//! trait do not echo back.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;

use crate::model::{
    FieldRecord, GlobalSettings, MarkId, PageSize, Rectangle, USE_GLOBAL_FONT_COLOR,
    USE_GLOBAL_FONT_NAME, USE_GLOBAL_FONT_SIZE,
};

// =============================================================================
// Styling constants
// =============================================================================

pub const DEFAULT_FILL_COLOR: &str = "#DCEBF8";
pub const DEFAULT_FILL_OPACITY: u8 = 127;
pub const DEFAULT_BORDER_COLOR: &str = "#333333";
pub const DEFAULT_BORDER_THICKNESS: f64 = 1.0;
pub const FOCUS_BORDER_COLOR: &str = "#3B8BC4";
pub const FOCUS_BORDER_THICKNESS: f64 = 3.0;
pub const ERROR_BORDER_COLOR: &str = "#eb4d5c";

pub const DEFAULT_FONT_NAME: &str = "Fira Sans";
pub const DEFAULT_FONT_COLOR: &str = "#000000";
pub const DEFAULT_FONT_SIZE: f64 = 8.0;

/// Path content of an ink mark that has never been drawn on.
pub const EMPTY_PATH: &str = "M0,0";

/// Page size assumed when the viewer has not reported one yet.
pub const FALLBACK_PAGE_SIZE: PageSize = PageSize {
    width: 612.0,
    height: 792.0,
};

/// Image keys for the required-field indicator. The embedder maps these to
/// actual assets; swapping to the blank key hides the star without moving it.
pub const REQUIRED_INDICATOR_IMAGE: &str = "required-indicator";
pub const BLANK_INDICATOR_IMAGE: &str = "required-indicator-blank";

/// Image key for a checked checkbox target.
pub const CHECKMARK_IMAGE: &str = "checkmark";

/// Border thickness multiplier for a page, so borders stay proportionate
/// at any render size.
pub fn border_scale(page: PageSize) -> f64 {
    (page.min_side() / 600.0).min(50.0)
}

// =============================================================================
// Mark vocabulary
// =============================================================================

/// The mark shapes the engine creates or inspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkKind {
    /// Rectangle outline; every field mark is one of these.
    Box,
    /// Placed image: signature stamps, checkmarks, indicators.
    Stamp,
    /// Free text.
    Text,
    /// Drawn path.
    Ink,
}

/// Metadata keys carried on marks. These are the correlation tags that let
/// a bare mark be recognized after a reload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaKey {
    /// On field marks: the field template noun.
    Template,
    /// On target marks: the mark id of the field the value belongs to.
    TargetFor,
    /// On indicator marks: the mark id of the field the star belongs to.
    RequiredFor,
}

impl MetaKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaKey::Template => "template",
            MetaKey::TargetFor => "target-for",
            MetaKey::RequiredFor => "required-for",
        }
    }
}

// =============================================================================
// The collaborator trait
// =============================================================================

/// Shared handle the session components hold.
pub type SharedEngine = Rc<RefCell<dyn AnnotationEngine>>;

/// Synchronous facade over the document viewer's annotation layer.
///
/// Read accessors return `None` for unknown marks; mutators return an error
/// the caller surfaces as a notification rather than a panic.
pub trait AnnotationEngine {
    fn create_mark(&mut self, page_number: u32, kind: MarkKind, rectangle: Rectangle)
        -> Result<MarkId>;
    fn delete_marks(&mut self, ids: &[MarkId]) -> Result<()>;

    fn mark_exists(&self, id: MarkId) -> bool;
    fn kind(&self, id: MarkId) -> Option<MarkKind>;
    fn page_number(&self, id: MarkId) -> Option<u32>;
    fn rectangle(&self, id: MarkId) -> Option<Rectangle>;
    fn set_rectangle(&mut self, id: MarkId, rectangle: Rectangle) -> Result<()>;

    fn metadata(&self, id: MarkId, key: MetaKey) -> Option<String>;
    fn set_metadata(&mut self, id: MarkId, key: MetaKey, value: &str) -> Result<()>;

    fn text(&self, id: MarkId) -> Option<String>;
    fn set_text(&mut self, id: MarkId, text: &str) -> Result<()>;
    fn path(&self, id: MarkId) -> Option<String>;
    fn set_path(&mut self, id: MarkId, path: &str) -> Result<()>;
    fn image(&self, id: MarkId) -> Option<String>;
    fn set_image(&mut self, id: MarkId, image_key: &str) -> Result<()>;

    fn set_border(&mut self, id: MarkId, color: &str, thickness: f64) -> Result<()>;
    fn set_fill(&mut self, id: MarkId, color: &str, opacity: u8) -> Result<()>;
    fn set_font(&mut self, id: MarkId, name: &str, color: &str, size: f64) -> Result<()>;

    /// Locked marks ignore direct user manipulation (indicators, field
    /// boxes in fill mode).
    fn set_locked(&mut self, id: MarkId, locked: bool) -> Result<()>;

    /// Put the mark's text into inline edit mode.
    fn begin_text_edit(&mut self, id: MarkId) -> Result<()>;
    /// Bring the mark into view.
    fn scroll_to(&mut self, id: MarkId) -> Result<()>;
    /// Replace the current selection.
    fn select(&mut self, ids: &[MarkId]) -> Result<()>;

    /// Displayed size of a page, if the viewer has rendered it.
    fn page_size(&self, page_number: u32) -> Option<PageSize>;
}

/// Displayed size of a page with the standard letter fallback.
pub fn page_size_or_fallback(engine: &dyn AnnotationEngine, page_number: u32) -> PageSize {
    engine.page_size(page_number).unwrap_or(FALLBACK_PAGE_SIZE)
}

/// Font to render a field's content with, after resolving use-global
/// sentinels against session settings and falling back to the defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedFont {
    pub name: String,
    pub color: String,
    pub size: f64,
}

pub fn resolve_font(record: &FieldRecord, globals: &GlobalSettings) -> ResolvedFont {
    let name = match record.font_name.as_deref() {
        Some(name) if name != USE_GLOBAL_FONT_NAME => name.to_string(),
        _ => globals
            .font_name
            .clone()
            .unwrap_or_else(|| DEFAULT_FONT_NAME.to_string()),
    };
    let color = match record.font_color.as_deref() {
        Some(color) if color != USE_GLOBAL_FONT_COLOR => color.to_string(),
        _ => globals
            .font_color
            .clone()
            .unwrap_or_else(|| DEFAULT_FONT_COLOR.to_string()),
    };
    let size = match record.font_size {
        Some(size) if size != USE_GLOBAL_FONT_SIZE => size,
        _ => globals.font_size.unwrap_or(DEFAULT_FONT_SIZE),
    };
    ResolvedFont { name, color, size }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_scale_tracks_smallest_side() {
        assert_eq!(border_scale(PageSize::new(600.0, 1200.0)), 1.0);
        assert_eq!(border_scale(PageSize::new(1200.0, 300.0)), 0.5);
    }

    #[test]
    fn border_scale_is_capped() {
        let huge = PageSize::new(1_000_000.0, 1_000_000.0);
        assert_eq!(border_scale(huge), 50.0);
    }

    #[test]
    fn resolve_font_prefers_concrete_then_global_then_default() {
        use crate::model::{FieldTemplate, MarkId};

        let mut record = FieldRecord {
            mark_id: MarkId(1),
            field_id: "text1".into(),
            display_name: "Text 1".into(),
            template: FieldTemplate::Text,
            rectangle: Rectangle::new(0.0, 0.0, 10.0, 10.0),
            page_number: 1,
            page_size_at_capture: None,
            sort_index: 1.0,
            required: false,
            group_id: None,
            form_role_id: None,
            target_id: None,
            is_complete: false,
            is_invalid: false,
            character_limit: None,
            multiline: false,
            font_name: Some("Georgia".into()),
            font_color: Some(USE_GLOBAL_FONT_COLOR.into()),
            font_size: None,
        };
        let globals = GlobalSettings {
            font_name: Some("Courier".into()),
            font_color: Some("#112233".into()),
            font_size: None,
        };

        let font = resolve_font(&record, &globals);
        assert_eq!(font.name, "Georgia");
        assert_eq!(font.color, "#112233");
        assert_eq!(font.size, DEFAULT_FONT_SIZE);

        record.font_name = Some(USE_GLOBAL_FONT_NAME.into());
        let font = resolve_font(&record, &GlobalSettings::default());
        assert_eq!(font.name, DEFAULT_FONT_NAME);
        assert_eq!(font.color, DEFAULT_FONT_COLOR);
    }

    #[test]
    fn meta_keys_are_stable() {
        assert_eq!(MetaKey::Template.as_str(), "template");
        assert_eq!(MetaKey::TargetFor.as_str(), "target-for");
        assert_eq!(MetaKey::RequiredFor.as_str(), "required-for");
    }
}
