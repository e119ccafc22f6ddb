//! Host event bus.
//!
//! Everything observable — tab lifecycle, gate decisions, session saves,
//! mode changes, memory pressure — is published here as a serialized JSON
//! notification. Embedders subscribe to drive their UI; the decision
//! logger subscribes to persist gate verdicts. The bus is lossy by
//! design: a slow or absent subscriber never blocks the host.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// One notification on the bus: an event name plus a JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: String,
    pub payload: Value,
}

/// Broadcasts [`Notification`]s to all subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Notification>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event to all subscribers.
    ///
    /// No subscribers is fine — the send error is ignored.
    pub fn publish(&self, event: &str, payload: Value) {
        let _ = self.tx.send(Notification {
            event: event.to_string(),
            payload,
        });
    }

    /// Subscribe to all host events.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (used by `doctor`).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
