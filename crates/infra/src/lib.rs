//! Infrastructure layer: storage, brokers, publishing, replication and the
//! account/reset services built on them.

pub mod event_bus;
pub mod outbox;
pub mod publisher;
pub mod replica;
pub mod role;
pub mod services;
pub mod store;
pub mod workers;

pub use publisher::{EventPublisher, PublishMode, Published};
pub use replica::{ApplyError, ApplyOutcome, ReplicaApplier, SkipReason};
pub use role::ServiceRole;
