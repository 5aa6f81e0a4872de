//! In-memory broker for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::bus::{BrokerError, Consumer, ConsumerEvent, Producer};
use crate::envelope::{BrokerMessage, DeliveryReport};

#[derive(Debug)]
struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<ConsumerEvent>,
}

/// In-memory broker.
///
/// - Per-topic monotonically increasing offsets, single partition `0`
/// - Fan-out to every consumer subscribed to the topic
/// - Every produced message is retained for inspection
/// - `fail_next_produces` / `close` simulate broker outages
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    subscribers: Mutex<Vec<Subscriber>>,
    offsets: Mutex<HashMap<String, u64>>,
    produced: Mutex<Vec<BrokerMessage>>,
    fail_next: AtomicU32,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topics`. Only messages produced after this call are seen.
    pub fn consumer<I, S>(&self, topics: I) -> InMemoryConsumer
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = topics.into_iter().map(Into::into).collect();

        // A poisoned lock leaves the consumer detached; it will observe closure.
        if let Ok(mut subs) = self.subscribers.lock() {
            if !self.closed.load(Ordering::SeqCst) {
                subs.push(Subscriber { topics, tx });
            }
        }

        InMemoryConsumer { rx, closed: false }
    }

    /// Make the next `n` produce calls fail with a transient error.
    pub fn fail_next_produces(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Push a non-message event to every subscriber of `topic`.
    pub fn inject(&self, topic: &str, event: ConsumerEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|s| !s.topics.iter().any(|t| t == topic) || s.tx.send(event.clone()).is_ok());
        }
    }

    /// Take the broker down: subscribers see a fatal error, producers fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        warn!("in-memory broker closed");
        if let Ok(mut subs) = self.subscribers.lock() {
            for s in subs.drain(..) {
                let _ = s
                    .tx
                    .send(ConsumerEvent::Error(BrokerError::all_brokers_down("broker closed")));
            }
        }
    }

    /// Every message accepted so far, in produce order.
    pub fn produced(&self) -> Vec<BrokerMessage> {
        self.produced.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_offset(&self, topic: &str) -> Result<u64, BrokerError> {
        let mut offsets = self
            .offsets
            .lock()
            .map_err(|_| BrokerError::command("offset lock poisoned"))?;
        let slot = offsets.entry(topic.to_string()).or_insert(0);
        let offset = *slot;
        *slot += 1;
        Ok(offset)
    }
}

#[async_trait]
impl Producer for InMemoryBroker {
    #[instrument(skip(self, message), fields(topic = %message.topic))]
    async fn produce(&self, mut message: BrokerMessage) -> Result<DeliveryReport, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::all_brokers_down("broker closed"));
        }
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            warn!("injected produce failure");
            return Err(BrokerError::command("injected produce failure"));
        }

        let offset = self.next_offset(&message.topic)?;
        message.id = Some(offset.to_string());

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| BrokerError::command("subscriber lock poisoned"))?;
        // Drop any dead subscribers while delivering.
        subs.retain(|s| {
            !s.topics.iter().any(|t| *t == message.topic)
                || s.tx.send(ConsumerEvent::Message(message.clone())).is_ok()
        });
        let subscribers = subs.len();
        drop(subs);
        debug!(offset, subscribers, "message produced");

        if let Ok(mut produced) = self.produced.lock() {
            produced.push(message.clone());
        }

        Ok(DeliveryReport {
            topic: message.topic,
            partition: 0,
            offset: offset.to_string(),
        })
    }
}

/// Subscription handle returned by [`InMemoryBroker::consumer`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    rx: mpsc::UnboundedReceiver<ConsumerEvent>,
    closed: bool,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Option<ConsumerEvent> {
        if self.closed {
            return Some(ConsumerEvent::Error(BrokerError::closed("consumer closed")));
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => Some(ConsumerEvent::Error(BrokerError::closed("broker dropped subscription"))),
            Err(_) => None,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}
