//! Transactional outbox for user-change events.
//!
//! - `OutboxStore` holds events until the broker acknowledges them
//! - `OutboxRelay` delivers due entries with retry/backoff and dead-lettering
//! - `RetryPolicy` mirrors the backoff knobs of the `PUBLISH_*` configuration

pub mod relay;
pub mod store;
pub mod types;

pub use relay::{OutboxRelay, RelayConfig, RelayStats};
pub use store::{InMemoryOutboxStore, OutboxError, OutboxStats, OutboxStore, PgOutboxStore};
pub use types::{BackoffStrategy, OutboxEntry, OutboxId, OutboxStatus, RetryPolicy};
