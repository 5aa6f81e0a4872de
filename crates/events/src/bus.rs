//! Broker abstraction (mechanics only).
//!
//! Two halves, one per direction:
//!
//! - **`Producer`**: send a `BrokerMessage` and wait for the broker's
//!   acknowledgment (`DeliveryReport`).
//! - **`Consumer`**: poll a subscribed set of topics with a bounded wait and
//!   surface whatever the broker reports (a message, an error, or something
//!   informational).
//!
//! ## Delivery guarantees
//!
//! Brokers deliver **at least once**: a message may be seen more than once and
//! messages may arrive out of order. Consumers must apply idempotently.
//!
//! ## Errors
//!
//! A `BrokerError` is either transient (one failed call) or **fatal** (every
//! broker is unreachable, the connection is gone for good). Consumer loops stop
//! on fatal errors and keep polling on everything else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{BrokerMessage, DeliveryReport};

/// Classification of broker failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Could not reach any broker.
    AllBrokersDown,
    /// The connection or subscription was closed.
    Closed,
    /// A single command failed.
    Command,
    /// Message could not be encoded for transport.
    Serialization,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn all_brokers_down(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::AllBrokersDown, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Closed, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Command, message)
    }

    /// Whether a consumer loop must stop on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::AllBrokersDown | BrokerErrorKind::Closed)
    }
}

/// What one poll tick produced.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Message(BrokerMessage),
    Error(BrokerError),
    /// Rebalance notices, partition EOF and the like.
    Info(String),
}

/// Sends messages to a broker.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Send one message and wait for the broker's acknowledgment.
    async fn produce(&self, message: BrokerMessage) -> Result<DeliveryReport, BrokerError>;
}

#[async_trait]
impl<P> Producer for Arc<P>
where
    P: Producer + ?Sized,
{
    async fn produce(&self, message: BrokerMessage) -> Result<DeliveryReport, BrokerError> {
        (**self).produce(message).await
    }
}

/// Receives messages for one subscription.
///
/// A consumer is owned by exactly one loop; methods take `&mut self`.
#[async_trait]
pub trait Consumer: Send {
    /// Wait up to `timeout` for the next event; `None` means nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Option<ConsumerEvent>;

    /// Mark a delivered message as processed. Brokers without explicit
    /// acknowledgment treat this as a no-op.
    async fn ack(&mut self, _message: &BrokerMessage) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Release the subscription. Further polls return a fatal error or `None`.
    async fn close(&mut self);
}

#[async_trait]
impl<C> Consumer for Box<C>
where
    C: Consumer + ?Sized,
{
    async fn poll(&mut self, timeout: Duration) -> Option<ConsumerEvent> {
        (**self).poll(timeout).await
    }

    async fn ack(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        (**self).ack(message).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
