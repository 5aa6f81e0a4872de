//! Event Publisher: hands user-change events to the broker after a local commit.
//!
//! Publishing never fails from the caller's point of view. Two modes:
//!
//! - `Outbox`: the event is enqueued in a bounded `OutboxStore` and delivered
//!   by `OutboxRelay` with retries (at-least-once on the producer side).
//! - `Detached`: one delivery attempt on a spawned task; failures are logged
//!   and dropped.

use std::str::FromStr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use hrms_auth::UserRecord;
use hrms_core::Clock;
use hrms_events::{BrokerMessage, Method, Producer};

use crate::outbox::{OutboxEntry, OutboxId, OutboxStore};
use crate::role::ServiceRole;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishMode {
    Detached,
    #[default]
    Outbox,
}

impl FromStr for PublishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detached" => Ok(PublishMode::Detached),
            "outbox" => Ok(PublishMode::Outbox),
            other => Err(format!("unknown publish mode: {other}")),
        }
    }
}

/// What happened to a published event.
#[derive(Debug)]
pub enum Published {
    /// Delivery is running on this task.
    Spawned(JoinHandle<()>),
    Enqueued(OutboxId),
    /// Logged and dropped.
    Dropped,
}

enum Sink {
    Detached(Arc<dyn Producer>),
    Outbox {
        store: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
    },
}

pub struct EventPublisher {
    topic: String,
    origin: ServiceRole,
    sink: Sink,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.sink {
            Sink::Detached(_) => PublishMode::Detached,
            Sink::Outbox { .. } => PublishMode::Outbox,
        };
        f.debug_struct("EventPublisher")
            .field("topic", &self.topic)
            .field("origin", &self.origin)
            .field("mode", &mode)
            .finish()
    }
}

impl EventPublisher {
    pub fn detached(topic: impl Into<String>, origin: ServiceRole, producer: Arc<dyn Producer>) -> Self {
        Self {
            topic: topic.into(),
            origin,
            sink: Sink::Detached(producer),
        }
    }

    pub fn outbox(
        topic: impl Into<String>,
        origin: ServiceRole,
        store: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topic: topic.into(),
            origin,
            sink: Sink::Outbox { store, clock },
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `record` tagged with `method`.
    pub async fn publish(&self, record: &UserRecord, method: Method) -> Published {
        let payload = match record.to_message().to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                error!(user_id = %record.id, method = %method, error = %err, "failed to encode user event");
                return Published::Dropped;
            }
        };

        match &self.sink {
            Sink::Detached(producer) => {
                let producer = producer.clone();
                let message = BrokerMessage::user_change(&self.topic, method, Some(self.origin.as_str()), payload);
                let user_id = record.id;
                Published::Spawned(tokio::spawn(async move {
                    match producer.produce(message).await {
                        Ok(report) => info!(
                            user_id = %user_id,
                            method = %method,
                            topic = %report.topic,
                            partition = report.partition,
                            offset = %report.offset,
                            "event delivered"
                        ),
                        Err(err) => error!(user_id = %user_id, method = %method, error = %err, "event delivery failed"),
                    }
                }))
            }
            Sink::Outbox { store, clock } => {
                let entry = OutboxEntry::new(
                    self.topic.clone(),
                    method,
                    Some(self.origin.as_str().to_string()),
                    payload,
                    clock.now(),
                );
                match store.enqueue(entry).await {
                    Ok(id) => Published::Enqueued(id),
                    Err(err) => {
                        warn!(user_id = %record.id, method = %method, error = %err, "event not enqueued");
                        Published::Dropped
                    }
                }
            }
        }
    }
}
