//! Daemon-side event bus: task events from every shim, fanned out to
//! subscribers.

use mvirt_shim::proto::{Envelope, envelope::Event};
use mvirt_shim::services::events::{timestamp, topic};
use tokio::sync::broadcast;
use tracing::debug;

pub const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub namespace: String,
    pub topic: String,
    pub timestamp: Option<prost_types::Timestamp>,
    pub event: Event,
}

impl TaskEvent {
    /// Build an event that originates in the daemon itself.
    pub fn new(namespace: &str, event: Event) -> Self {
        Self {
            namespace: namespace.to_string(),
            topic: topic(&event).to_string(),
            timestamp: Some(timestamp(chrono::Utc::now())),
            event,
        }
    }

    /// Unwrap an envelope received from a shim. Envelopes without a
    /// payload are dropped.
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        Some(Self {
            namespace: envelope.namespace,
            topic: envelope.topic,
            timestamp: envelope.timestamp,
            event: envelope.event?,
        })
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TaskEvent) {
        debug!(namespace = %event.namespace, topic = %event.topic, "Publishing task event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}
