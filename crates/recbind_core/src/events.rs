//! Lifecycle event feed.
//!
//! Records and aggregates emit events for attribute changes and
//! request-lifecycle outcomes, enabling:
//! - Reactive UI updates
//! - Audit logging
//!
//! Delivery is plain ordered fan-out: every subscriber sees every event in
//! emission order, and a listener cannot veto delivery to later listeners.

use crate::uid::Uid;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, Sender};

/// An event emitted by a record or aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An already-defined attribute changed value.
    Change {
        /// The top-level attribute that changed.
        attribute: String,
        /// The value before the change.
        previous: Value,
        /// The value after the change.
        value: Value,
    },
    /// Active state was reset to the reference snapshot.
    Reset,
    /// Active state was synced into the reference snapshot.
    Sync,
    /// A record joined an aggregate.
    Add {
        /// Uid of the added record.
        uid: Uid,
    },
    /// A record left an aggregate.
    Remove {
        /// Uid of the removed record.
        uid: Uid,
    },
    /// A fetch settled; `error` is set on failure.
    Fetch {
        /// Error message, when the fetch failed.
        error: Option<String>,
    },
    /// A save created the entity on the server.
    Create,
    /// A save updated an existing entity.
    Update,
    /// A save settled; `error` is set on failure.
    Save {
        /// Error message, when the save failed.
        error: Option<String>,
    },
    /// A delete settled; `error` is set on failure.
    Delete {
        /// Error message, when the delete failed.
        error: Option<String>,
    },
}

/// Distributes events to subscribers in emission order.
///
/// Each record and aggregate owns one feed. A bounded history is kept so
/// tests and late observers can poll past events without holding a
/// receiver open.
pub struct EventFeed {
    subscribers: RwLock<Vec<Sender<Event>>>,
    history: RwLock<Vec<Event>>,
    max_history: usize,
}

impl EventFeed {
    /// Creates a feed with the default history bound.
    pub fn new() -> Self {
        Self::with_max_history(1000)
    }

    /// Creates a feed with a specific history bound.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to every subscriber, dropping disconnected ones.
    pub fn emit(&self, event: Event) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let overflow = history.len() - self.max_history;
                history.drain(0..overflow);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns a copy of the retained event history.
    pub fn recent(&self) -> Vec<Event> {
        self.history.read().clone()
    }

    /// Returns the number of retained events.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_and_receive() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();

        let event = Event::Change {
            attribute: "name".into(),
            previous: json!("a"),
            value: json!("b"),
        };
        feed.emit(event.clone());

        assert_eq!(rx.recv().unwrap(), event);
    }

    #[test]
    fn ordered_fan_out_to_all_subscribers() {
        let feed = EventFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        feed.emit(Event::Sync);
        feed.emit(Event::Reset);

        assert_eq!(rx1.recv().unwrap(), Event::Sync);
        assert_eq!(rx1.recv().unwrap(), Event::Reset);
        assert_eq!(rx2.recv().unwrap(), Event::Sync);
        assert_eq!(rx2.recv().unwrap(), Event::Reset);
    }

    #[test]
    fn disconnected_subscribers_are_dropped() {
        let feed = EventFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(Event::Sync);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let feed = EventFeed::with_max_history(2);
        feed.emit(Event::Sync);
        feed.emit(Event::Reset);
        feed.emit(Event::Sync);

        assert_eq!(feed.history_len(), 2);
        assert_eq!(feed.recent(), vec![Event::Reset, Event::Sync]);
    }
}
