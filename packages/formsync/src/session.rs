//! Session assembly.
//!
//! A [`FormSession`] wires every component onto one [`EventBus`] and hands
//! the embedder a single object to hold. The embedder's side of the
//! contract:
//!
//! - publish viewer traffic (`MarkCreated`, `PointerActivated`,
//!   `PageDisplayed`, ...) onto [`FormSession::bus`];
//! - subscribe to `Notify`, `SignatureRequested`, and `DateRequested` to
//!   drive its own UI, answering modals with `ModalCompleted`;
//! - call [`FormSession::tick`] from its timer so debounced geometry
//!   settles;
//! - call [`FormSession::teardown`] when the viewer goes away.
//!
//! Everything else is internal event flow between the components.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::bus::EventBus;
use crate::config::{Labels, SessionOptions};
use crate::controller::FieldLifecycleController;
use crate::correlator::AnnotationCorrelator;
use crate::events::{Topic, ViewerEvent};
use crate::marks::SharedEngine;
use crate::model::StateKey;
use crate::pending::UuidAllocator;
use crate::save::{FormDocumentStore, SaveCoordinator};
use crate::sort_index::SortIndexManager;
use crate::store::StateStore;
use crate::summary::SummaryProjector;

/// One live form, designer or fill-side, against one document viewer.
pub struct FormSession {
    bus: EventBus,
    store: Rc<StateStore>,
    controller: Rc<FieldLifecycleController>,
    correlator: Rc<AnnotationCorrelator>,
    save: Rc<SaveCoordinator>,
    // Kept alive for the lifetime of the session; they only live on the bus.
    _sort_index: Rc<SortIndexManager>,
    _summary: Rc<SummaryProjector>,
    dirty: Rc<Cell<bool>>,
}

impl FormSession {
    pub fn new(
        engine: SharedEngine,
        documents: Rc<RefCell<dyn FormDocumentStore>>,
        options: SessionOptions,
        labels: Labels,
    ) -> Self {
        let bus = EventBus::new();
        let store = StateStore::attach(&bus);
        let sort_index = SortIndexManager::attach(&bus, Rc::clone(&store));
        let summary = SummaryProjector::attach(&bus, Rc::clone(&store));
        let save = SaveCoordinator::attach(
            &bus,
            Rc::clone(&store),
            documents,
            labels.clone(),
            Box::new(UuidAllocator),
        );
        let controller = FieldLifecycleController::attach(
            &bus,
            Rc::clone(&store),
            Rc::clone(&engine),
            Box::new(UuidAllocator),
        );
        let correlator = AnnotationCorrelator::attach(
            &bus,
            Rc::clone(&store),
            engine,
            options,
            labels,
        );

        let dirty = Rc::new(Cell::new(false));
        let flag = Rc::clone(&dirty);
        bus.subscribe(Topic::StateModified, move |_, event| {
            if matches!(
                event,
                ViewerEvent::StateModified {
                    key: StateKey::FieldList,
                    ..
                }
            ) {
                flag.set(true);
            }
        });
        for topic in [Topic::FormLoaded, Topic::FormSaved] {
            let flag = Rc::clone(&dirty);
            bus.subscribe(topic, move |_, _| flag.set(false));
        }

        FormSession {
            bus,
            store,
            controller,
            correlator,
            save,
            _sort_index: sort_index,
            _summary: summary,
            dirty,
        }
    }

    /// The wire between the embedder and the engine.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Read access to engine state slices.
    pub fn store(&self) -> &Rc<StateStore> {
        &self.store
    }

    /// Field lifecycle queries (focus, activation phase).
    pub fn controller(&self) -> &Rc<FieldLifecycleController> {
        &self.controller
    }

    /// Drive time-based work; call at timer granularity, any cadence.
    pub fn tick(&self, now: DateTime<Utc>) {
        self.correlator.tick(&self.bus, now);
    }

    /// Unsaved field changes since the last load or save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Whether a save is currently in flight.
    pub fn saving(&self) -> bool {
        self.save.saving()
    }

    /// Detach everything from the bus and drop all state. The session is
    /// inert afterwards; events still published to the bus go nowhere.
    pub fn teardown(&self) {
        self.store.teardown();
        self.bus.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::FieldPhase;
    use crate::events::{
        MarkChange, ModalOutcome, ModalPayload, SaveOutcome, SignatureCategory, SignatureData,
    };
    use crate::marks::{AnnotationEngine, MarkKind, MetaKey};
    use crate::model::{
        FieldListState, FieldTemplate, FormDefinition, MarkId, PageSize, Rectangle, SavedField,
    };
    use crate::summary::FormSummary;
    use crate::testing::{capture, RecordingDocumentStore, ScriptedEngine};
    use chrono::Duration;

    fn session() -> (
        FormSession,
        Rc<RefCell<ScriptedEngine>>,
        Rc<RefCell<RecordingDocumentStore>>,
    ) {
        let (shared, engine) = ScriptedEngine::new()
            .with_page(1, PageSize::new(600.0, 800.0))
            .shared();
        let documents = Rc::new(RefCell::new(RecordingDocumentStore::default()));
        let erased: Rc<RefCell<dyn FormDocumentStore>> = Rc::clone(&documents) as _;
        let session = FormSession::new(
            shared,
            erased,
            SessionOptions::default(),
            Labels::default(),
        );
        (session, engine, documents)
    }

    fn draw_field(
        session: &FormSession,
        engine: &Rc<RefCell<ScriptedEngine>>,
        template: FieldTemplate,
        rect: Rectangle,
    ) -> MarkId {
        let mark_id = {
            let mut engine = engine.borrow_mut();
            let id = engine.create_mark(1, MarkKind::Box, rect).unwrap();
            engine
                .set_metadata(id, MetaKey::Template, template.noun())
                .unwrap();
            id
        };
        session
            .bus()
            .publish(&ViewerEvent::MarkCreated { mark_id });
        mark_id
    }

    fn field_list(session: &FormSession) -> FieldListState {
        session
            .store()
            .get_as(StateKey::FieldList)
            .unwrap_or_default()
    }

    #[test]
    fn design_reorder_save_round_trip() {
        let (session, engine, documents) = session();
        let first = draw_field(
            &session,
            &engine,
            FieldTemplate::Text,
            Rectangle::new(10.0, 10.0, 100.0, 30.0),
        );
        let _second = draw_field(
            &session,
            &engine,
            FieldTemplate::Text,
            Rectangle::new(10.0, 60.0, 100.0, 30.0),
        );
        let third = draw_field(
            &session,
            &engine,
            FieldTemplate::Text,
            Rectangle::new(10.0, 110.0, 100.0, 30.0),
        );
        assert!(session.is_dirty());

        // Drag the last field to the head of the checklist.
        session.bus().publish(&ViewerEvent::ReorderField {
            mark_id: third,
            previous: None,
            next: Some(first),
        });
        assert_eq!(field_list(&session).ordered()[0], third);

        session.bus().publish(&ViewerEvent::SaveRequested);
        assert!(session.saving());
        let (token, definition) = {
            let documents = documents.borrow();
            assert_eq!(documents.saves.len(), 1);
            documents.saves[0].clone()
        };
        // Saved fields come out in checklist order, stripped of mark state.
        assert_eq!(definition.fields[0].field_id, "text3");
        assert_eq!(definition.fields.len(), 3);

        let saved = capture(session.bus(), Topic::FormSaved);
        session.bus().publish(&ViewerEvent::SaveFinished {
            token,
            outcome: SaveOutcome::Created {
                form_definition_id: "def-9".to_string(),
            },
        });

        assert!(!session.saving());
        assert!(!session.is_dirty());
        assert_eq!(
            field_list(&session).form_definition_id.as_deref(),
            Some("def-9")
        );
        assert!(matches!(
            &saved.borrow()[..],
            [ViewerEvent::FormSaved { form_definition_id }] if form_definition_id == "def-9"
        ));
    }

    #[test]
    fn fill_flow_signs_a_field_and_moves_progress() {
        let (session, engine, _documents) = session();
        let definition = FormDefinition {
            form_name: "Lease".to_string(),
            fields: vec![
                SavedField {
                    field_id: "clientSignature".to_string(),
                    display_name: "Client signature".to_string(),
                    template: FieldTemplate::Signature,
                    rectangle: Rectangle::new(50.0, 50.0, 200.0, 60.0),
                    page_number: 1,
                    page_size_at_capture: Some(PageSize::new(600.0, 800.0)),
                    sort_index: 1.0,
                    required: true,
                    group_id: None,
                    form_role_id: None,
                    character_limit: None,
                    multiline: false,
                    font_name: None,
                    font_color: None,
                    font_size: None,
                },
                SavedField {
                    field_id: "notes".to_string(),
                    display_name: "Notes".to_string(),
                    template: FieldTemplate::Text,
                    rectangle: Rectangle::new(50.0, 150.0, 200.0, 30.0),
                    page_number: 1,
                    page_size_at_capture: Some(PageSize::new(600.0, 800.0)),
                    sort_index: 2.0,
                    required: false,
                    group_id: None,
                    form_role_id: None,
                    character_limit: None,
                    multiline: true,
                    font_name: None,
                    font_color: None,
                    font_size: None,
                },
            ],
            ..FormDefinition::default()
        };
        session
            .bus()
            .publish(&ViewerEvent::DisplayForm { definition });
        assert!(!session.is_dirty());

        let summary: FormSummary = session.store().get_as(StateKey::FormSummary).unwrap();
        assert_eq!(summary.progress.required_total, 1);
        assert_eq!(summary.progress.optional_total, 1);
        assert!(!summary.progress.required_done());

        let state = field_list(&session);
        let signature_mark = *state
            .fields
            .values()
            .find(|r| r.field_id == "clientSignature")
            .map(|r| &r.mark_id)
            .unwrap();

        let requests = capture(session.bus(), Topic::SignatureRequested);
        session.bus().publish(&ViewerEvent::PointerActivated {
            mark_id: Some(signature_mark),
        });
        let token = match &requests.borrow()[..] {
            [ViewerEvent::SignatureRequested {
                token,
                category: SignatureCategory::Signature,
                current: None,
            }] => *token,
            other => panic!("unexpected requests: {:?}", other),
        };

        session.bus().publish(&ViewerEvent::ModalCompleted {
            token,
            outcome: ModalOutcome::Applied(ModalPayload::Signature(SignatureData {
                image: Some("stored-signature".to_string()),
                ..SignatureData::default()
            })),
        });

        let record = field_list(&session).fields[&signature_mark].clone();
        assert!(record.is_complete);
        assert!(record.target_id.is_some());
        assert_eq!(
            session.controller().phase(signature_mark),
            FieldPhase::Focused
        );

        let summary: FormSummary = session.store().get_as(StateKey::FormSummary).unwrap();
        assert!(summary.progress.required_done());
    }

    #[test]
    fn geometry_settles_through_the_session_clock() {
        let (session, engine, _documents) = session();
        let field = draw_field(
            &session,
            &engine,
            FieldTemplate::Text,
            Rectangle::new(10.0, 10.0, 100.0, 30.0),
        );

        engine
            .borrow_mut()
            .set_rectangle(field, Rectangle::new(70.0, 10.0, 100.0, 30.0))
            .unwrap();
        session.bus().publish(&ViewerEvent::MarkChanged {
            mark_id: field,
            change: MarkChange::Rectangle,
        });

        session.tick(Utc::now());
        assert_eq!(field_list(&session).fields[&field].rectangle.x, 10.0);

        session.tick(Utc::now() + Duration::seconds(5));
        assert_eq!(field_list(&session).fields[&field].rectangle.x, 70.0);
    }

    #[test]
    fn teardown_leaves_the_session_inert() {
        let (session, engine, _documents) = session();
        draw_field(
            &session,
            &engine,
            FieldTemplate::Text,
            Rectangle::new(10.0, 10.0, 100.0, 30.0),
        );
        assert_eq!(field_list(&session).fields.len(), 1);

        session.teardown();

        assert!(session.store().get(StateKey::FieldList).is_none());
        let orphan = engine
            .borrow_mut()
            .create_mark(1, MarkKind::Box, Rectangle::new(0.0, 0.0, 50.0, 20.0))
            .unwrap();
        session
            .bus()
            .publish(&ViewerEvent::MarkCreated { mark_id: orphan });
        assert!(session.store().get(StateKey::FieldList).is_none());
    }
}
