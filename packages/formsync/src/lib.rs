//! # Formsync
//!
//! A synchronous form-field engine that keeps document annotations and
//! field state in lockstep over one event bus.
//!
//! ## Core Concepts
//!
//! Formsync separates **marks** from **fields**:
//! - Marks are annotations on the document, owned by the viewer.
//! - Fields are records in the `FieldList` state slice, owned by the engine.
//!
//! The key principle: **state changes only through `ModifyState`**. Every
//! component, the embedder included, mutates shared state by publishing a
//! patch and learns of changes through `StateModified`. Nothing writes a
//! slice directly.
//!
//! ## Architecture
//!
//! ```text
//! Embedder (viewer UI, modals, timer)
//!     │ MarkCreated / PointerActivated / ModalCompleted / ...
//!     ▼
//! EventBus ◄────────────────────────────────────┐
//!     │                                         │
//!     ├─► StateStore ── ModifyState ──► StateModified
//!     │                                         │
//!     ├─► AnnotationCorrelator  (marks ⇄ records, indicators, styling)
//!     │                                         │
//!     ├─► FieldLifecycleController  (focus, activation, modal results)
//!     │                                         │
//!     ├─► SortIndexManager  (checklist ordering, rebase)
//!     │                                         │
//!     ├─► SummaryProjector  (FormSummary projection)
//!     │                                         │
//!     └─► SaveCoordinator  (one in-flight save + one trailing)
//!                                               │
//!                       ModifyState / Notify / SignatureRequested ...
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One mutation path** - only `ModifyState` changes a slice; only the
//!    [`StateStore`] applies it.
//! 2. **`StateModified` means changed** - deep equality gates the event, so
//!    handlers never see no-op notifications.
//! 3. **User gestures only** - marks this crate creates do not echo back as
//!    `MarkCreated`; the embedder publishes viewer traffic for user actions
//!    alone.
//! 4. **Single-threaded** - everything runs on the embedder's thread;
//!    publishing from inside a handler is safe and delivery order is
//!    subscription order.
//! 5. **Tokens correlate** - modal and save completions carry the
//!    [`OpToken`] of the request that started them; stale tokens are
//!    dropped, never misapplied.
//!
//! ## Example
//!
//! ```ignore
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use formsync::{FormSession, Labels, SessionOptions, ViewerEvent};
//!
//! let engine = my_viewer_adapter();      // impl AnnotationEngine
//! let documents = my_document_store();   // impl FormDocumentStore
//! let session = FormSession::new(
//!     engine,
//!     documents,
//!     SessionOptions::default(),
//!     Labels::default(),
//! );
//!
//! // Forward viewer traffic onto the bus.
//! session.bus().publish(&ViewerEvent::MarkCreated { mark_id });
//!
//! // Drive debounced work from the UI timer.
//! session.tick(chrono::Utc::now());
//! ```
//!
//! ## What This Is Not
//!
//! Formsync is **not**:
//! - A PDF renderer or annotation widget
//! - A network layer; saves go through the embedder's [`FormDocumentStore`]
//! - Thread-safe; sessions live and die on one thread
//!
//! Formsync **is**:
//! > The state engine between a document viewer and a form definition,
//! > where every change is an event and every slice has one owner.

// Core modules
mod bus;
mod config;
mod controller;
mod correlator;
mod events;
mod marks;
mod model;
mod pending;
mod save;
mod session;
mod sort_index;
mod store;
mod summary;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the bus and event vocabulary
pub use crate::bus::{EventBus, HandlerId};
pub use crate::events::{
    KeyCombo, MarkChange, ModalOutcome, ModalPayload, NotifyLevel, Operation, SaveOutcome,
    SignatureCategory, SignatureData, Topic, ViewerEvent,
};

// Re-export the state model
pub use crate::model::{
    fields_patch, validate_character_limit, validate_display_name, validate_field_id,
    validate_group_name, FieldListState, FieldRecord, FieldTemplate, FormDefinition, FormRole,
    Group, MarkId, PageSize, Rectangle, SavedField, StateKey, ValidationError,
};
pub use crate::model::{GlobalSettings, USE_GLOBAL_FONT_COLOR, USE_GLOBAL_FONT_NAME, USE_GLOBAL_FONT_SIZE};

// Re-export the annotation seam
pub use crate::marks::{
    border_scale, page_size_or_fallback, resolve_font, AnnotationEngine, MarkKind, MetaKey,
    ResolvedFont, SharedEngine, DEFAULT_FONT_COLOR, DEFAULT_FONT_NAME, DEFAULT_FONT_SIZE,
    EMPTY_PATH, FALLBACK_PAGE_SIZE,
};

// Re-export components and session assembly
pub use crate::config::{Labels, SessionOptions};
pub use crate::controller::{focused_mark, FieldLifecycleController, FieldPhase};
pub use crate::correlator::{completion, AnnotationCorrelator};
pub use crate::pending::{CountingAllocator, OpToken, PendingOps, TokenAllocator, UuidAllocator};
pub use crate::save::{FormDocumentStore, SaveCoordinator};
pub use crate::session::FormSession;
pub use crate::sort_index::{between, needs_rebase, rebase, SortIndexManager, SORT_INDEX_REBASE_LEN};
pub use crate::store::StateStore;
pub use crate::summary::{
    build_summary, fill_progress, FillProgress, FormSummary, SummaryEntry, SummaryProjector,
};
