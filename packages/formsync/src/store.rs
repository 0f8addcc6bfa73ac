//! Keyed state slices with event-driven mutation.
//!
//! # The Contract
//!
//! 1. **Mutation rides the bus.** The store subscribes to `ModifyState` at
//!    construction; nothing else writes a slice. Components never hold a
//!    mutable reference to shared state.
//!
//! 2. **Reads are copies.** `get` clones the slice, so a reader can never
//!    alias the stored value or observe later mutations through it.
//!
//! 3. **Change detection is deep.** `StateModified` is published only when
//!    the updated slice differs from the previous value by deep equality.
//!    Redundant patches are silent.
//!
//! 4. **Extend merges, `null` deletes.** JSON has no way to say "remove this
//!    key" other than `null`, so an extend patch carrying `null` deletes the
//!    stored key. Arrays and scalars overwrite wholesale.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::bus::{EventBus, HandlerId};
use crate::events::{Operation, Topic, ViewerEvent};
use crate::model::StateKey;

/// Session state, mutated only through `ModifyState` events.
pub struct StateStore {
    bus: EventBus,
    slices: RefCell<HashMap<StateKey, Value>>,
    subscription: Cell<Option<HandlerId>>,
}

impl StateStore {
    /// Create a store wired to the bus. Dropping the returned `Rc` without
    /// `teardown` leaves a dead subscription that no-ops via the weak
    /// upgrade.
    pub fn attach(bus: &EventBus) -> Rc<Self> {
        let store = Rc::new(StateStore {
            bus: bus.clone(),
            slices: RefCell::new(HashMap::new()),
            subscription: Cell::new(None),
        });
        let weak: Weak<StateStore> = Rc::downgrade(&store);
        let id = bus.subscribe(Topic::ModifyState, move |bus, event| {
            let Some(store) = weak.upgrade() else { return };
            if let ViewerEvent::ModifyState {
                key,
                value,
                operation,
            } = event
            {
                store.apply(bus, *key, value, *operation);
            }
        });
        store.subscription.set(Some(id));
        store
    }

    /// A deep copy of the slice, if it has ever been written.
    pub fn get(&self, key: StateKey) -> Option<Value> {
        self.slices.borrow().get(&key).cloned()
    }

    /// Typed view of a slice. `None` when the slice is absent or does not
    /// deserialize into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: StateKey) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(error) => {
                debug!(%key, %error, "state slice did not match requested shape");
                None
            }
        }
    }

    /// Detach from the bus and drop all slices. Further `ModifyState`
    /// events are ignored.
    pub fn teardown(&self) {
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        self.slices.borrow_mut().clear();
    }

    fn apply(&self, bus: &EventBus, key: StateKey, patch: &Value, operation: Operation) {
        // Mutate under a short borrow; publish after it is released so
        // handlers can read the store re-entrantly.
        let updated = {
            let mut slices = self.slices.borrow_mut();
            let previous = slices.get(&key);
            let next = match operation {
                Operation::Replace => patch.clone(),
                Operation::Extend => {
                    let mut base = previous.cloned().unwrap_or(Value::Object(Default::default()));
                    extend(&mut base, patch);
                    base
                }
            };
            if previous == Some(&next) {
                debug!(%key, "state patch produced no change");
                None
            } else {
                slices.insert(key, next.clone());
                Some(next)
            }
        };
        if let Some(value) = updated {
            bus.publish(&ViewerEvent::StateModified { key, value });
        }
    }
}

/// Recursive extend: objects merge key-by-key, `null` deletes, everything
/// else overwrites.
fn extend(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, incoming) in patch_map {
                match incoming {
                    Value::Null => {
                        base_map.remove(key);
                    }
                    Value::Object(_) => match base_map.get_mut(key) {
                        Some(existing @ Value::Object(_)) => extend(existing, incoming),
                        _ => {
                            base_map.insert(key.clone(), incoming.clone());
                        }
                    },
                    other => {
                        base_map.insert(key.clone(), other.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
