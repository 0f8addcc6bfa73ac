//! Synchronous, topic-keyed event bus.
//!
//! # Guarantees
//!
//! - **Synchronous delivery**: `publish` returns only after every handler
//!   registered for the topic has run.
//! - **Subscription order**: handlers for a topic run in the order they
//!   subscribed.
//! - **Re-entrancy**: handlers may publish while handling. Dispatch snapshots
//!   the handler list first, so a handler subscribed or removed mid-dispatch
//!   takes effect from the next publish onward.
//! - **In-memory only**: nothing is persisted, nothing is replayed.
//!
//! Handlers receive the bus itself so they can publish follow-up events
//! without capturing a second handle. A handler must drop any interior
//! borrows it holds before publishing, since the events it publishes are
//! dispatched inside the call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::events::{Topic, ViewerEvent};

/// Opaque handle for removing a single subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Rc<dyn Fn(&EventBus, &ViewerEvent)>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<Topic, Vec<(HandlerId, Handler)>>,
}

/// Topic-keyed pub/sub for a single session.
///
/// Cloning yields another handle to the same registry. The bus is
/// single-threaded by design; state mutations ride on events, so dispatch
/// order is the engine's ordering guarantee.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one topic. Returns an id for targeted removal.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&EventBus, &ViewerEvent) + 'static,
    {
        let mut registry = self.inner.borrow_mut();
        registry.next_id += 1;
        let id = HandlerId(registry.next_id);
        registry
            .handlers
            .entry(topic)
            .or_default()
            .push((id, Rc::new(handler)));
        id
    }

    /// Remove a single subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: HandlerId) {
        let mut registry = self.inner.borrow_mut();
        for handlers in registry.handlers.values_mut() {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    /// Remove every subscription for one topic.
    pub fn unsubscribe_topic(&self, topic: Topic) {
        self.inner.borrow_mut().handlers.remove(&topic);
    }

    /// Remove every subscription on the bus.
    pub fn clear(&self) {
        self.inner.borrow_mut().handlers.clear();
    }

    /// Deliver an event to every handler subscribed to its topic, in
    /// subscription order, before returning.
    pub fn publish(&self, event: &ViewerEvent) {
        // Snapshot under a short borrow so handlers can re-enter the bus.
        let snapshot: Vec<Handler> = {
            let registry = self.inner.borrow();
            registry
                .handlers
                .get(&event.topic())
                .map(|handlers| handlers.iter().map(|(_, h)| Rc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            handler(self, event);
        }
    }

    /// Number of handlers currently registered for a topic.
    pub fn handler_count(&self, topic: Topic) -> usize {
        self.inner
            .borrow()
            .handlers
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.borrow();
        let total: usize = registry.handlers.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("topics", &registry.handlers.len())
            .field("handlers", &total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NotifyLevel;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn notify(message: &str) -> ViewerEvent {
        ViewerEvent::Notify {
            level: NotifyLevel::Info,
            message: message.to_string(),
        }
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Rc::clone(&seen);
            bus.subscribe(Topic::Notify, move |_, _| {
                seen.borrow_mut().push(tag);
            });
        }

        bus.publish(&notify("x"));
        assert_eq!(*seen.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn only_matching_topic_fires() {
        let bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));

        let counter = Rc::clone(&count);
        bus.subscribe(Topic::SaveRequested, move |_, _| {
            *counter.borrow_mut() += 1;
        });

        bus.publish(&notify("ignored"));
        assert_eq!(*count.borrow(), 0);

        bus.publish(&ViewerEvent::SaveRequested);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn handlers_can_publish_while_handling() {
        let bus = EventBus::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        bus.subscribe(Topic::SaveRequested, move |bus, _| {
            log.borrow_mut().push("save");
            bus.publish(&notify("nested"));
            log.borrow_mut().push("save-done");
        });

        let log = Rc::clone(&order);
        bus.subscribe(Topic::Notify, move |_, _| {
            log.borrow_mut().push("notify");
        });

        bus.publish(&ViewerEvent::SaveRequested);
        // Nested publish completes before the outer handler resumes.
        assert_eq!(*order.borrow(), vec!["save", "notify", "save-done"]);
    }

    #[test]
    fn subscription_during_dispatch_misses_current_event() {
        let bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));

        let outer_bus = bus.clone();
        let counter = Rc::clone(&count);
        bus.subscribe(Topic::Notify, move |_, _| {
            let counter = Rc::clone(&counter);
            outer_bus.subscribe(Topic::Notify, move |_, _| {
                *counter.borrow_mut() += 1;
            });
        });

        bus.publish(&notify("a"));
        assert_eq!(*count.borrow(), 0);

        bus.publish(&notify("b"));
        // The handler added during "a" fires, and "b"'s dispatch adds another.
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn unsubscribe_removes_one_handler() {
        let bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));

        let counter = Rc::clone(&count);
        let id = bus.subscribe(Topic::Notify, move |_, _| {
            *counter.borrow_mut() += 1;
        });
        let counter = Rc::clone(&count);
        bus.subscribe(Topic::Notify, move |_, _| {
            *counter.borrow_mut() += 10;
        });

        bus.unsubscribe(id);
        bus.publish(&notify("x"));
        assert_eq!(*count.borrow(), 10);
        assert_eq!(bus.handler_count(Topic::Notify), 1);
    }

    #[test]
    fn unsubscribe_topic_and_clear() {
        let bus = EventBus::new();
        bus.subscribe(Topic::Notify, |_, _| {});
        bus.subscribe(Topic::Notify, |_, _| {});
        bus.subscribe(Topic::SaveRequested, |_, _| {});

        bus.unsubscribe_topic(Topic::Notify);
        assert_eq!(bus.handler_count(Topic::Notify), 0);
        assert_eq!(bus.handler_count(Topic::SaveRequested), 1);

        bus.clear();
        assert_eq!(bus.handler_count(Topic::SaveRequested), 0);
    }

    #[test]
    fn clones_share_the_registry() {
        let bus = EventBus::new();
        let other = bus.clone();
        let count = Rc::new(RefCell::new(0));

        let counter = Rc::clone(&count);
        other.subscribe(Topic::Notify, move |_, _| {
            *counter.borrow_mut() += 1;
        });

        bus.publish(&notify("shared"));
        assert_eq!(*count.borrow(), 1);
    }
}
