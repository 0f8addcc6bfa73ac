//! Save coordination: one save in flight, at most one queued.
//!
//! `SaveRequested` while idle starts a save immediately. `SaveRequested`
//! while a save is in flight sets a single queued flag, no matter how many
//! requests arrive; when the in-flight save finishes, exactly one trailing
//! save starts. Every accepted save therefore persists a definition at
//! least as new as the state that requested it.
//!
//! Failures notify and stop. There is no automatic retry; a queued request
//! is user intent, not a retry, so it still runs after a failure.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use anyhow::Result;
use tracing::warn;

use crate::bus::EventBus;
use crate::config::Labels;
use crate::events::{NotifyLevel, Operation, SaveOutcome, Topic, ViewerEvent};
use crate::model::{FieldListState, FormDefinition, PageSize, StateKey};
use crate::pending::{OpToken, PendingOps, TokenAllocator};
use crate::store::StateStore;

/// Durable home of form definitions.
///
/// `begin_save` starts the write and returns; the store reports the result
/// by publishing [`ViewerEvent::SaveFinished`] with the same token, either
/// after `begin_save` returns or synchronously from inside it.
pub trait FormDocumentStore {
    fn begin_save(&mut self, token: OpToken, definition: &FormDefinition) -> Result<()>;
}

struct CoordinatorState {
    in_flight: PendingOps<()>,
    queued: bool,
}

/// Serializes save traffic between the session and the document store.
pub struct SaveCoordinator {
    store: Rc<StateStore>,
    documents: Rc<RefCell<dyn FormDocumentStore>>,
    labels: Labels,
    state: RefCell<CoordinatorState>,
    // True while `start` holds the documents borrow; trailing saves begun
    // by a synchronous completion park in `deferred` instead of re-entering.
    starting: Cell<bool>,
    deferred: Cell<Option<OpToken>>,
}

impl SaveCoordinator {
    pub fn attach(
        bus: &EventBus,
        store: Rc<StateStore>,
        documents: Rc<RefCell<dyn FormDocumentStore>>,
        labels: Labels,
        allocator: Box<dyn TokenAllocator>,
    ) -> Rc<Self> {
        let coordinator = Rc::new(SaveCoordinator {
            store,
            documents,
            labels,
            state: RefCell::new(CoordinatorState {
                in_flight: PendingOps::with_allocator(allocator),
                queued: false,
            }),
            starting: Cell::new(false),
            deferred: Cell::new(None),
        });

        let weak: Weak<SaveCoordinator> = Rc::downgrade(&coordinator);
        bus.subscribe(Topic::SaveRequested, move |bus, _| {
            let Some(coordinator) = weak.upgrade() else { return };
            coordinator.on_requested(bus);
        });

        let weak: Weak<SaveCoordinator> = Rc::downgrade(&coordinator);
        bus.subscribe(Topic::SaveFinished, move |bus, event| {
            let Some(coordinator) = weak.upgrade() else { return };
            if let ViewerEvent::SaveFinished { token, outcome } = event {
                coordinator.on_finished(bus, *token, outcome);
            }
        });

        coordinator
    }

    /// Whether a save is currently running.
    pub fn saving(&self) -> bool {
        !self.state.borrow().in_flight.is_empty()
    }

    fn on_requested(&self, bus: &EventBus) {
        let token = {
            let mut state = self.state.borrow_mut();
            if !state.in_flight.is_empty() {
                // Collapse any number of requests into one trailing save.
                state.queued = true;
                None
            } else {
                Some(state.in_flight.register(()))
            }
        };
        if let Some(token) = token {
            self.start(bus, token);
        }
    }

    fn on_finished(&self, bus: &EventBus, token: OpToken, outcome: &SaveOutcome) {
        let recognized = self.state.borrow_mut().in_flight.take(token).is_some();
        if !recognized {
            return;
        }

        match outcome {
            SaveOutcome::Created { form_definition_id } => {
                bus.publish(&ViewerEvent::ModifyState {
                    key: StateKey::FieldList,
                    value: serde_json::json!({ "formDefinitionId": form_definition_id }),
                    operation: Operation::Extend,
                });
                self.announce(bus, form_definition_id.clone());
            }
            SaveOutcome::Updated => {
                let id = self
                    .store
                    .get_as::<FieldListState>(StateKey::FieldList)
                    .and_then(|s| s.form_definition_id)
                    .unwrap_or_default();
                self.announce(bus, id);
            }
            SaveOutcome::Failed { message } => {
                warn!(%token, %message, "form save failed");
                bus.publish(&ViewerEvent::Notify {
                    level: NotifyLevel::Error,
                    message: self.labels.save_failed.clone(),
                });
            }
        }

        let trailing = {
            let mut state = self.state.borrow_mut();
            if state.queued {
                state.queued = false;
                Some(state.in_flight.register(()))
            } else {
                None
            }
        };
        if let Some(token) = trailing {
            if self.starting.get() {
                // This completion arrived from inside `begin_save`; the
                // documents borrow is still held, so let `start` pick the
                // trailing save up after it is released.
                self.deferred.set(Some(token));
            } else {
                self.start(bus, token);
            }
        }
    }

    fn announce(&self, bus: &EventBus, form_definition_id: String) {
        bus.publish(&ViewerEvent::FormSaved { form_definition_id });
        bus.publish(&ViewerEvent::Notify {
            level: NotifyLevel::Info,
            message: self.labels.form_saved.clone(),
        });
    }

    fn start(&self, bus: &EventBus, first: OpToken) {
        self.starting.set(true);
        let mut next = Some(first);
        while let Some(token) = next {
            let field_list = self
                .store
                .get_as::<FieldListState>(StateKey::FieldList)
                .unwrap_or_default();
            let page_data: BTreeMap<u32, PageSize> =
                self.store.get_as(StateKey::PageData).unwrap_or_default();
            let definition = field_list.to_definition(page_data);

            // The documents borrow lives only for this statement. A store
            // that publishes `SaveFinished` from inside `begin_save` is
            // handled re-entrantly; any trailing save that completion
            // queues lands in `deferred` and loops here.
            let begun = self.documents.borrow_mut().begin_save(token, &definition);
            if let Err(error) = begun {
                warn!(%token, %error, "document store rejected save");
                let _ = self.state.borrow_mut().in_flight.take(token);
                bus.publish(&ViewerEvent::Notify {
                    level: NotifyLevel::Error,
                    message: self.labels.save_failed.clone(),
                });
            }
            next = self.deferred.take();
        }
        self.starting.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::CountingAllocator;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingStore {
        saves: Vec<(OpToken, FormDefinition)>,
        fail_next: bool,
    }

    impl FormDocumentStore for RecordingStore {
        fn begin_save(&mut self, token: OpToken, definition: &FormDefinition) -> Result<()> {
            if self.fail_next {
                self.fail_next = false;
                anyhow::bail!("store offline");
            }
            self.saves.push((token, definition.clone()));
            Ok(())
        }
    }

    struct Fixture {
        bus: EventBus,
        documents: Rc<RefCell<RecordingStore>>,
        _store: Rc<StateStore>,
        _coordinator: Rc<SaveCoordinator>,
        notifications: Rc<RefCell<Vec<(NotifyLevel, String)>>>,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::new();
        let store = StateStore::attach(&bus);
        let documents = Rc::new(RefCell::new(RecordingStore::default()));
        let coordinator = SaveCoordinator::attach(
            &bus,
            Rc::clone(&store),
            Rc::clone(&documents) as Rc<RefCell<dyn FormDocumentStore>>,
            Labels::default(),
            Box::new(CountingAllocator::default()),
        );
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&notifications);
        bus.subscribe(Topic::Notify, move |_, event| {
            if let ViewerEvent::Notify { level, message } = event {
                sink.borrow_mut().push((*level, message.clone()));
            }
        });
        Fixture {
            bus,
            documents,
            _store: store,
            _coordinator: coordinator,
            notifications,
        }
    }

    fn finish(fixture: &Fixture, outcome: SaveOutcome) {
        let token = fixture.documents.borrow().saves.last().unwrap().0;
        fixture
            .bus
            .publish(&ViewerEvent::SaveFinished { token, outcome });
    }

    #[test]
    fn idle_request_saves_immediately() {
        let f = fixture();
        f.bus.publish(&ViewerEvent::SaveRequested);
        assert_eq!(f.documents.borrow().saves.len(), 1);
    }

    #[test]
    fn requests_during_a_save_collapse_to_one_trailing_save() {
        let f = fixture();
        f.bus.publish(&ViewerEvent::SaveRequested);
        f.bus.publish(&ViewerEvent::SaveRequested);
        f.bus.publish(&ViewerEvent::SaveRequested);
        assert_eq!(f.documents.borrow().saves.len(), 1);

        finish(&f, SaveOutcome::Updated);
        assert_eq!(f.documents.borrow().saves.len(), 2);

        finish(&f, SaveOutcome::Updated);
        // Nothing else was queued.
        assert_eq!(f.documents.borrow().saves.len(), 2);
    }

    #[test]
    fn created_outcome_records_the_assigned_identity() {
        let f = fixture();
        f.bus.publish(&ViewerEvent::SaveRequested);
        finish(
            &f,
            SaveOutcome::Created {
                form_definition_id: "def-41".into(),
            },
        );

        let state: FieldListState = f._store.get_as(StateKey::FieldList).unwrap();
        assert_eq!(state.form_definition_id.as_deref(), Some("def-41"));
    }

    #[test]
    fn failure_notifies_and_does_not_retry() {
        let f = fixture();
        f.bus.publish(&ViewerEvent::SaveRequested);
        finish(
            &f,
            SaveOutcome::Failed {
                message: "disk full".into(),
            },
        );

        assert_eq!(f.documents.borrow().saves.len(), 1);
        let notes = f.notifications.borrow();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, NotifyLevel::Error);
    }

    #[test]
    fn queued_save_still_runs_after_a_failure() {
        let f = fixture();
        f.bus.publish(&ViewerEvent::SaveRequested);
        f.bus.publish(&ViewerEvent::SaveRequested);
        finish(
            &f,
            SaveOutcome::Failed {
                message: "timeout".into(),
            },
        );
        assert_eq!(f.documents.borrow().saves.len(), 2);
    }

    #[test]
    fn stale_completion_is_ignored() {
        let f = fixture();
        f.bus.publish(&ViewerEvent::SaveRequested);
        let real = f.documents.borrow().saves[0].0;

        let mut bogus = CountingAllocator::default();
        let stale = loop {
            let t = bogus.allocate();
            if t != real {
                break t;
            }
        };
        f.bus.publish(&ViewerEvent::SaveFinished {
            token: stale,
            outcome: SaveOutcome::Updated,
        });

        // The real save is still in flight; a new request queues.
        f.bus.publish(&ViewerEvent::SaveRequested);
        assert_eq!(f.documents.borrow().saves.len(), 1);
    }

    #[test]
    fn rejected_begin_save_notifies_and_frees_the_slot() {
        let f = fixture();
        f.documents.borrow_mut().fail_next = true;
        f.bus.publish(&ViewerEvent::SaveRequested);

        assert_eq!(f.documents.borrow().saves.len(), 0);
        assert_eq!(f.notifications.borrow().len(), 1);

        // The coordinator is idle again.
        f.bus.publish(&ViewerEvent::SaveRequested);
        assert_eq!(f.documents.borrow().saves.len(), 1);
    }

    /// A store that finishes every save before `begin_save` returns, and
    /// sneaks a second request in under the first save.
    struct EagerStore {
        bus: EventBus,
        calls: Vec<OpToken>,
    }

    impl FormDocumentStore for EagerStore {
        fn begin_save(&mut self, token: OpToken, _definition: &FormDefinition) -> Result<()> {
            self.calls.push(token);
            if self.calls.len() == 1 {
                self.bus.publish(&ViewerEvent::SaveRequested);
            }
            self.bus.publish(&ViewerEvent::SaveFinished {
                token,
                outcome: SaveOutcome::Updated,
            });
            Ok(())
        }
    }

    #[test]
    fn synchronous_completion_inside_begin_save_is_handled() {
        let bus = EventBus::new();
        let store = StateStore::attach(&bus);
        let documents = Rc::new(RefCell::new(EagerStore {
            bus: bus.clone(),
            calls: Vec::new(),
        }));
        let coordinator = SaveCoordinator::attach(
            &bus,
            Rc::clone(&store),
            Rc::clone(&documents) as Rc<RefCell<dyn FormDocumentStore>>,
            Labels::default(),
            Box::new(CountingAllocator::default()),
        );

        bus.publish(&ViewerEvent::SaveRequested);

        // The first save and the trailing save both reached the store, and
        // the coordinator came out idle.
        assert_eq!(documents.borrow().calls.len(), 2);
        assert!(!coordinator.saving());
    }
}
