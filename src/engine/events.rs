//! Event system engine: in-process publish/subscribe bus.
//!
//! Used for signals that are not state: "the pipeline finished", "the query
//! changed, re-run". Handlers run synchronously on the firing thread in
//! subscription order. Threads that want to consume events on their own
//! schedule can use [`EventsEngine::subscribe_channel`].

use crate::id::{RunId, SubscriptionId};
use crate::store::Store;
use crate::types::BlobRef;
use crossbeam_channel::{unbounded, Receiver};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Events exchanged between sub-engines
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A search completed and its output was written
    PipelineFinished {
        run: RunId,
        record_count: usize,
        group_count: usize,
        /// Blob payloads referenced by the output
        blobs: Vec<BlobRef>,
    },
    /// A search failed
    PipelineFailed { run: RunId, message: String },
    /// The query spec was changed through a mutator
    QueryChanged,
    /// The grouping spec was changed through a mutator
    GroupingsChanged,
    /// A view asked the explorer to reset its controls
    ResetRequested,
    /// Application-defined event
    Custom { name: String, payload: Value },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::PipelineFinished { .. } => EventKind::PipelineFinished,
            EngineEvent::PipelineFailed { .. } => EventKind::PipelineFailed,
            EngineEvent::QueryChanged => EventKind::QueryChanged,
            EngineEvent::GroupingsChanged => EventKind::GroupingsChanged,
            EngineEvent::ResetRequested => EventKind::ResetRequested,
            EngineEvent::Custom { .. } => EventKind::Custom,
        }
    }
}

/// Discriminant of [`EngineEvent`], used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PipelineFinished,
    PipelineFailed,
    QueryChanged,
    GroupingsChanged,
    ResetRequested,
    Custom,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `events` slice
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsState {
    /// Number of fired events per kind
    pub fired: BTreeMap<EventKind, u64>,
}

impl EventsState {
    pub fn count(&self, kind: EventKind) -> u64 {
        self.fired.get(&kind).copied().unwrap_or(0)
    }
}

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every kind
    kind: Option<EventKind>,
    handler: Handler,
}

/// Handle to the event bus
#[derive(Clone)]
pub struct EventsEngine {
    store: Store,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl EventsEngine {
    pub fn new(store: Store) -> Self {
        store.set_state("events/@@INIT", |state| {
            state.events = EventsState::default();
        });
        Self {
            store,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn add(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, kind, handler });
        id
    }

    /// Subscribe to one kind of event
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Receive events of `kind` (or all events) through a channel
    pub fn subscribe_channel(
        &self,
        kind: Option<EventKind>,
    ) -> (SubscriptionId, Receiver<EngineEvent>) {
        let (tx, rx) = unbounded();
        let id = self.add(
            kind,
            Arc::new(move |event: &EngineEvent| {
                // A dropped receiver just stops listening
                let _ = tx.send(event.clone());
            }),
        );
        (id, rx)
    }

    /// Remove a subscription; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every matching subscriber
    pub fn fire(&self, event: EngineEvent) {
        let kind = event.kind();
        tracing::trace!("event fired: {}", kind);

        self.store.set_state("events/fire", |state| {
            *state.events.fired.entry(kind).or_insert(0) += 1;
        });

        let handlers: Vec<Handler> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of events of `kind` fired so far
    pub fn fired(&self, kind: EventKind) -> u64 {
        self.store.with_state(|state| state.events.count(kind))
    }
}

impl fmt::Debug for EventsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventsEngine")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExplorerState;
    use serde_json::json;

    fn engine() -> EventsEngine {
        EventsEngine::new(Store::new("test", ExplorerState::default()))
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let events = engine();
        let log = Arc::new(Mutex::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let log = log.clone();
            events.subscribe(EventKind::QueryChanged, move |_| {
                log.lock().unwrap().push(label);
            });
        }
        events.fire(EngineEvent::QueryChanged);

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(events.fired(EventKind::QueryChanged), 1);
    }

    #[test]
    fn test_kind_filtering_and_unsubscribe() {
        let events = engine();
        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        let id = events.subscribe(EventKind::GroupingsChanged, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        events.fire(EngineEvent::QueryChanged);
        events.fire(EngineEvent::GroupingsChanged);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(events.unsubscribe(id));
        events.fire(EngineEvent::GroupingsChanged);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(events.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribe_all_sees_every_kind() {
        let events = engine();
        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        events.subscribe_all(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        events.fire(EngineEvent::QueryChanged);
        events.fire(EngineEvent::GroupingsChanged);
        events.fire(EngineEvent::ResetRequested);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_handler_may_fire_nested_events() {
        let events = engine();
        let inner = events.clone();
        events.subscribe(EventKind::ResetRequested, move |_| {
            inner.fire(EngineEvent::QueryChanged);
        });

        events.fire(EngineEvent::ResetRequested);
        assert_eq!(events.fired(EventKind::QueryChanged), 1);
    }

    #[test]
    fn test_channel_subscription() {
        let events = engine();
        let (_, rx) = events.subscribe_channel(Some(EventKind::Custom));

        let sender = events.clone();
        std::thread::spawn(move || {
            sender.fire(EngineEvent::Custom {
                name: "export".to_string(),
                payload: json!({"format": "csv"}),
            });
        })
        .join()
        .unwrap();

        match rx.try_recv().unwrap() {
            EngineEvent::Custom { name, .. } => assert_eq!(name, "export"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
