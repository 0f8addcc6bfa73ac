//! The event vocabulary shared by every component in a form session.
//!
//! Events are facts or requests, never IO. They fall into three groups:
//!
//! - **State traffic**: [`ViewerEvent::ModifyState`] is the only way any
//!   component mutates shared state; [`ViewerEvent::StateModified`] is the
//!   only way anyone learns it changed.
//! - **Annotation notifications**: `MarkCreated` / `MarkChanged` /
//!   `MarkRemoved` and the input gestures (`PointerActivated`,
//!   `KeyCombination`). These are published by the embedder for user-driven
//!   changes only; marks created programmatically by this crate do not echo
//!   back as `MarkCreated`.
//! - **Request/completion pairs**: `SignatureRequested` / `DateRequested`
//!   resolve via `ModalCompleted`, and `SaveRequested` resolves via
//!   `SaveFinished`, each correlated by an [`OpToken`].
//!
//! Every event names its [`Topic`], the routing key the bus subscribes on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{FormDefinition, MarkId, PageSize, StateKey};
use crate::pending::OpToken;

// =============================================================================
// Topics
// =============================================================================

/// Routing key for bus subscriptions. One topic per event shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    ModifyState,
    StateModified,
    Notify,
    DisplayForm,
    FormLoaded,
    MarkCreated,
    MarkChanged,
    MarkRemoved,
    PageDisplayed,
    PointerActivated,
    KeyCombination,
    FocusChecklistItem,
    ReorderField,
    DeleteFields,
    DuplicateFields,
    SignatureRequested,
    DateRequested,
    ModalCompleted,
    SaveRequested,
    SaveFinished,
    FormSaved,
}

// =============================================================================
// Event payloads
// =============================================================================

/// How a `ModifyState` patch combines with the stored slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Recursive merge. Object keys merge key-by-key, a `null` value deletes
    /// the stored key, arrays and scalars overwrite wholesale.
    Extend,
    /// The patch becomes the new slice verbatim.
    Replace,
}

/// Severity attached to user-facing notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

/// What changed about a mark, as reported by the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkChange {
    /// Position or size changed (drag, resize).
    Rectangle,
    /// Content changed (text typed, path drawn).
    Content,
}

/// Key gestures the engine responds to. Combinations outside this set are
/// never published.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyCombo {
    Tab,
    ShiftTab,
    Return,
    Space,
}

/// Which signature flavor a modal request is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignatureCategory {
    Signature,
    Initials,
}

/// Content produced by the signature modal. Exactly one of the three is
/// expected to be populated, depending on how the user signed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureData {
    /// Image key for an uploaded or stored signature image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Path data for a drawn signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Typed signature text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Value carried back from a completed modal.
#[derive(Clone, Debug, PartialEq)]
pub enum ModalPayload {
    Signature(SignatureData),
    Date(String),
}

/// Terminal state of a modal interaction.
#[derive(Clone, Debug, PartialEq)]
pub enum ModalOutcome {
    /// The user confirmed a value.
    Applied(ModalPayload),
    /// The user explicitly removed the existing value.
    Cleared,
    /// The modal was dismissed without a decision.
    Cancelled,
}

/// Terminal state of a save the document store started.
#[derive(Clone, Debug, PartialEq)]
pub enum SaveOutcome {
    /// First save of this form; the store assigned an identity.
    Created { form_definition_id: String },
    /// An existing definition was overwritten.
    Updated,
    /// The store could not persist the definition. Not retried.
    Failed { message: String },
}

// =============================================================================
// The event enum
// =============================================================================

/// Everything that can travel over a session's bus.
#[derive(Clone, Debug)]
pub enum ViewerEvent {
    /// Request to mutate a state slice. The only mutation path.
    ModifyState {
        key: StateKey,
        value: Value,
        operation: Operation,
    },
    /// A state slice actually changed (deep inequality against the previous
    /// value). Carries a copy of the new slice.
    StateModified { key: StateKey, value: Value },
    /// User-facing notification for the embedder to surface.
    Notify { level: NotifyLevel, message: String },

    /// Load a saved form definition onto the document.
    DisplayForm { definition: FormDefinition },
    /// All marks for the displayed definition exist and state is seeded.
    FormLoaded,

    /// The user created a mark (designer palette drop).
    MarkCreated { mark_id: MarkId },
    /// The user moved, resized, or edited a mark.
    MarkChanged { mark_id: MarkId, change: MarkChange },
    /// A mark disappeared from the document.
    MarkRemoved { mark_id: MarkId },
    /// A page became visible at a concrete size.
    PageDisplayed { page_number: u32, size: PageSize },

    /// Pointer landed on a mark, or on empty space (`None`).
    PointerActivated { mark_id: Option<MarkId> },
    /// One of the supported key gestures fired.
    KeyCombination { combo: KeyCombo },
    /// A summary/checklist row was chosen; focus and scroll to the field.
    FocusChecklistItem { mark_id: MarkId },

    /// Move a field between two neighbors in the visual order. `None` on
    /// either side means head or tail of the list.
    ReorderField {
        mark_id: MarkId,
        previous: Option<MarkId>,
        next: Option<MarkId>,
    },
    /// Remove fields and everything correlated to them.
    DeleteFields { mark_ids: Vec<MarkId> },
    /// Clone fields, offset onto the same page.
    DuplicateFields { mark_ids: Vec<MarkId> },

    /// Ask the embedder to run the signature modal.
    SignatureRequested {
        token: OpToken,
        category: SignatureCategory,
        current: Option<SignatureData>,
    },
    /// Ask the embedder to run the date picker.
    DateRequested {
        token: OpToken,
        current: Option<String>,
    },
    /// A modal finished; `token` matches the originating request.
    ModalCompleted {
        token: OpToken,
        outcome: ModalOutcome,
    },

    /// Persist the current form definition.
    SaveRequested,
    /// The document store finished a save started under `token`.
    SaveFinished { token: OpToken, outcome: SaveOutcome },
    /// A save landed; carries the definition's persistent identity.
    FormSaved { form_definition_id: String },
}

impl ViewerEvent {
    /// The routing key this event is delivered under.
    pub fn topic(&self) -> Topic {
        match self {
            ViewerEvent::ModifyState { .. } => Topic::ModifyState,
            ViewerEvent::StateModified { .. } => Topic::StateModified,
            ViewerEvent::Notify { .. } => Topic::Notify,
            ViewerEvent::DisplayForm { .. } => Topic::DisplayForm,
            ViewerEvent::FormLoaded => Topic::FormLoaded,
            ViewerEvent::MarkCreated { .. } => Topic::MarkCreated,
            ViewerEvent::MarkChanged { .. } => Topic::MarkChanged,
            ViewerEvent::MarkRemoved { .. } => Topic::MarkRemoved,
            ViewerEvent::PageDisplayed { .. } => Topic::PageDisplayed,
            ViewerEvent::PointerActivated { .. } => Topic::PointerActivated,
            ViewerEvent::KeyCombination { .. } => Topic::KeyCombination,
            ViewerEvent::FocusChecklistItem { .. } => Topic::FocusChecklistItem,
            ViewerEvent::ReorderField { .. } => Topic::ReorderField,
            ViewerEvent::DeleteFields { .. } => Topic::DeleteFields,
            ViewerEvent::DuplicateFields { .. } => Topic::DuplicateFields,
            ViewerEvent::SignatureRequested { .. } => Topic::SignatureRequested,
            ViewerEvent::DateRequested { .. } => Topic::DateRequested,
            ViewerEvent::ModalCompleted { .. } => Topic::ModalCompleted,
            ViewerEvent::SaveRequested => Topic::SaveRequested,
            ViewerEvent::SaveFinished { .. } => Topic::SaveFinished,
            ViewerEvent::FormSaved { .. } => Topic::FormSaved,
        }
    }
}
