use std::sync::{Arc, Mutex};

use tandem_core::events::{EventKind, FlowEvent};

/// Type alias for a boxed event listener.
pub type EventListener = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    kind: EventKind,
    listener: EventListener,
    once: bool,
}

#[derive(Default)]
struct EmitterInner {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Typed lifecycle-event emitter.
///
/// Listeners run synchronously in the emitting context and must not block.
/// Emission snapshots the matching listeners before calling out, so a
/// listener may subscribe or unsubscribe reentrantly and may observe the
/// flow already progressed further.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<Mutex<EmitterInner>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(listener), false)
    }

    /// Subscribe to the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(listener), true)
    }

    fn subscribe(&self, kind: EventKind, listener: EventListener, once: bool) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscriptions.push(Subscription {
            id,
            kind,
            listener,
            once,
        });
        SubscriptionId(id)
    }

    /// Remove a subscription. Returns false when it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id.0);
        inner.subscriptions.len() != before
    }

    /// Deliver an event to every matching listener.
    pub fn emit(&self, event: &FlowEvent) {
        let kind = event.kind();
        let listeners: Vec<EventListener> = {
            let mut inner = self.inner.lock().unwrap();
            let matching: Vec<EventListener> = inner
                .subscriptions
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.listener.clone())
                .collect();
            inner.subscriptions.retain(|s| s.kind != kind || !s.once);
            matching
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }
}
