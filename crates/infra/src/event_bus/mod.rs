//! Infrastructure broker implementations.
//!
//! The `Producer` / `Consumer` abstraction lives in `hrms-events` as pure
//! mechanics. This module provides infrastructure-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConsumer, RedisStreamsProducer};
