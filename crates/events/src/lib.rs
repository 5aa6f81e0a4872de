//! User-change events and the broker abstraction they travel over.
//!
//! - `event`: the `Method` tag and the JSON `UserMessage` payload
//! - `envelope`: the transport-level `BrokerMessage` (topic, headers, bytes)
//! - `bus`: `Producer` / `Consumer` traits implemented by each broker
//! - `in_memory_bus`: a process-local broker for tests and single-node runs

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BrokerError, BrokerErrorKind, Consumer, ConsumerEvent, Producer};
pub use envelope::{BrokerMessage, DeliveryReport, METHOD_HEADER, ORIGIN_HEADER};
pub use event::{Method, UnknownMethod, UserMessage};
pub use in_memory_bus::{InMemoryBroker, InMemoryConsumer};
