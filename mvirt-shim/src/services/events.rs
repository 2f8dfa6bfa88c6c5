//! Task event publishing.
//!
//! Handlers and the exit loop push events into one bounded queue through an
//! [`EventPublisher`]; a full queue blocks the publisher. The `Events` RPC
//! drains the queue through an [`EventForwarder`].

use crate::proto::{Envelope, envelope::Event};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{debug, warn};

pub const QUEUE_CAPACITY: usize = 1024;
const STREAM_CAPACITY: usize = 64;

/// Convert to the protobuf timestamp carried in events and responses.
pub fn timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

/// Topic an event is published under.
pub fn topic(event: &Event) -> &'static str {
    match event {
        Event::TaskCreate(_) => "/tasks/create",
        Event::TaskStart(_) => "/tasks/start",
        Event::TaskDelete(_) => "/tasks/delete",
        Event::TaskExit(_) => "/tasks/exit",
        Event::TaskOom(_) => "/tasks/oom",
        Event::TaskExecAdded(_) => "/tasks/exec-added",
        Event::TaskExecStarted(_) => "/tasks/exec-started",
        Event::TaskPaused(_) => "/tasks/paused",
        Event::TaskResumed(_) => "/tasks/resumed",
        Event::TaskCheckpointed(_) => "/tasks/checkpointed",
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    namespace: String,
    tx: mpsc::Sender<Envelope>,
}

pub struct EventForwarder {
    queue: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

/// Create a connected publisher/forwarder pair.
pub fn channel(namespace: &str, capacity: usize) -> (EventPublisher, EventForwarder) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventPublisher {
            namespace: namespace.to_string(),
            tx,
        },
        EventForwarder {
            queue: Arc::new(Mutex::new(rx)),
        },
    )
}

impl EventPublisher {
    pub async fn publish(&self, event: Event) {
        let envelope = Envelope {
            timestamp: Some(timestamp(Utc::now())),
            namespace: self.namespace.clone(),
            topic: topic(&event).to_string(),
            event: Some(event),
        };
        debug!(topic = %envelope.topic, "Publishing event");
        if self.tx.send(envelope).await.is_err() {
            warn!("Event queue closed, dropping event");
        }
    }
}

impl EventForwarder {
    /// Stream queued events to one subscriber.
    ///
    /// Subscribers take turns: a second stream receives events once the
    /// first has gone away. No event is taken off the queue unless the
    /// subscriber has room for it.
    pub fn subscribe(&self) -> ReceiverStream<Result<Envelope, Status>> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let queue = Arc::clone(&self.queue);

        tokio::spawn(async move {
            let mut queue = queue.lock().await;
            loop {
                let Ok(permit) = tx.reserve().await else {
                    break;
                };
                tokio::select! {
                    _ = tx.closed() => break,
                    envelope = queue.recv() => match envelope {
                        Some(envelope) => permit.send(Ok(envelope)),
                        None => break,
                    },
                }
            }
            debug!("Event subscriber detached");
        });

        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{TaskExit, TaskOom};
    use tokio_stream::StreamExt;

    fn oom(id: &str) -> Event {
        Event::TaskOom(TaskOom {
            container_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (publisher, forwarder) = channel("default", 16);
        publisher.publish(oom("c1")).await;
        publisher
            .publish(Event::TaskExit(TaskExit {
                container_id: "c1".into(),
                id: "c1".into(),
                pid: 10,
                exit_status: 1,
                exited_at: None,
            }))
            .await;

        let mut stream = forwarder.subscribe();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.topic, "/tasks/oom");
        assert_eq!(first.namespace, "default");
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.topic, "/tasks/exit");
    }

    #[tokio::test]
    async fn test_second_subscriber_takes_over() {
        let (publisher, forwarder) = channel("default", 16);
        let first = forwarder.subscribe();
        drop(first);

        let mut second = forwarder.subscribe();
        publisher.publish(oom("c2")).await;
        let envelope = second.next().await.unwrap().unwrap();
        match envelope.event {
            Some(Event::TaskOom(e)) => assert_eq!(e.container_id, "c2"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
