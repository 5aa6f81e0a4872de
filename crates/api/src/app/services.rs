use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use hrms_auth::{Argon2Hasher, CredentialHasher, ResetPolicy, SessionKeys};
use hrms_core::{Clock, SystemClock};
use hrms_events::{BrokerError, Consumer, InMemoryBroker, Producer};
use hrms_infra::{
    EventPublisher, PublishMode, ReplicaApplier, ServiceRole,
    outbox::{InMemoryOutboxStore, OutboxRelay, OutboxStore, PgOutboxStore, RelayConfig},
    services::{AccountService, LogNotifier, PasswordResetService, ResetNotifier},
    store::{InMemoryRecordStore, PgRecordStore, RecordStore, StoreError},
    workers::UserSyncWorker,
};

#[cfg(feature = "redis")]
use hrms_infra::event_bus::{RedisStreamsConsumer, RedisStreamsProducer};

use crate::config::{AppConfig, BrokerKind, SessionConfig};

/// Handles shared by every request handler.
pub struct AppServices {
    pub role: ServiceRole,
    pub accounts: Arc<AccountService>,
    pub resets: Arc<PasswordResetService>,
    pub session_ttl: chrono::Duration,
}

/// Building blocks the services are assembled from.
pub struct Components {
    pub store: Arc<dyn RecordStore>,
    pub publisher: Arc<EventPublisher>,
    pub clock: Arc<dyn Clock>,
    pub hasher: Arc<dyn CredentialHasher>,
    pub notifier: Arc<dyn ResetNotifier>,
}

impl AppServices {
    pub fn assemble(role: ServiceRole, parts: Components, session: &SessionConfig, reset: ResetPolicy) -> Self {
        let accounts = AccountService::new(
            parts.store.clone(),
            parts.hasher.clone(),
            parts.clock.clone(),
            parts.publisher.clone(),
            SessionKeys::from_secret(session.secret.as_bytes()),
            session.ttl,
            reset.min_password_len,
        );
        let resets = PasswordResetService::new(
            parts.store,
            parts.hasher,
            parts.clock,
            reset,
            parts.publisher,
            parts.notifier,
        );
        Self {
            role,
            accounts: Arc::new(accounts),
            resets: Arc::new(resets),
            session_ttl: session.ttl,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("record store: {0}")]
    Store(#[from] StoreError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("broker kind `{0}` requires the `redis` feature")]
    BrokerUnavailable(&'static str),
}

/// Everything a service process runs: the HTTP handlers plus the
/// background relay and consumer loop.
pub struct Runtime {
    pub services: Arc<AppServices>,
    /// Present in outbox mode only.
    pub relay: Option<OutboxRelay>,
    pub sync: UserSyncWorker,
    pub consumer: Box<dyn Consumer>,
}

struct Broker {
    producer: Arc<dyn Producer>,
    consumer: Box<dyn Consumer>,
}

/// Wire the process from configuration.
pub async fn build_runtime(config: &AppConfig) -> Result<Runtime, StartupError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (store, outbox): (Arc<dyn RecordStore>, Arc<dyn OutboxStore>) = match &config.database.url {
        Some(url) => {
            let pg = PgRecordStore::connect(url, config.database.max_connections, config.database.tx_timeout).await?;
            pg.ensure_schema().await?;
            info!(max_connections = config.database.max_connections, "connected to postgres");
            let outbox = PgOutboxStore::new(pg.pool().clone(), config.publish.outbox_capacity);
            (Arc::new(pg), Arc::new(outbox))
        }
        None => {
            warn!("no database configured; using the in-memory record store");
            (
                Arc::new(InMemoryRecordStore::new()),
                InMemoryOutboxStore::arc(config.publish.outbox_capacity),
            )
        }
    };

    let broker = connect_broker(config).await?;

    let (publisher, relay) = match config.publish.mode {
        PublishMode::Detached => (
            EventPublisher::detached(&config.broker.topic, config.role, broker.producer),
            None,
        ),
        PublishMode::Outbox => {
            let relay = OutboxRelay::new(
                outbox.clone(),
                broker.producer,
                clock.clone(),
                RelayConfig {
                    poll_interval: config.publish.relay_poll_interval,
                    batch_size: config.publish.relay_batch_size,
                    retry: config.publish.retry.clone(),
                },
            );
            (
                EventPublisher::outbox(&config.broker.topic, config.role, outbox, clock.clone()),
                Some(relay),
            )
        }
    };

    let applier = ReplicaApplier::new(store.clone()).with_version_gate(config.sync.version_gate);
    let sync = UserSyncWorker::new(config.role, applier)
        .with_poll_timeout(config.broker.poll_timeout)
        .with_deletes(config.sync.apply_deletes);

    let parts = Components {
        store,
        publisher: Arc::new(publisher),
        clock,
        hasher: Arc::new(Argon2Hasher::new()),
        notifier: Arc::new(LogNotifier),
    };
    let services = AppServices::assemble(config.role, parts, &config.session, config.reset.clone());

    Ok(Runtime {
        services: Arc::new(services),
        relay,
        sync,
        consumer: broker.consumer,
    })
}

async fn connect_broker(config: &AppConfig) -> Result<Broker, StartupError> {
    let topics = config.broker.subscribe_topics.clone();
    match config.broker.kind {
        BrokerKind::Memory => {
            warn!("using the in-memory broker; events stay inside this process");
            let broker = Arc::new(InMemoryBroker::new());
            let consumer = broker.consumer(topics);
            Ok(Broker {
                producer: broker,
                consumer: Box::new(consumer),
            })
        }
        #[cfg(feature = "redis")]
        BrokerKind::Redis => {
            let producer = RedisStreamsProducer::connect(&config.broker.url).await?;
            let consumer = RedisStreamsConsumer::connect(
                &config.broker.url,
                topics,
                config.broker.group_id.clone(),
                config.broker.consumer_name.clone(),
            )
            .await?;
            info!(group = %config.broker.group_id, "connected to redis streams");
            Ok(Broker {
                producer: Arc::new(producer),
                consumer: Box::new(consumer),
            })
        }
        #[cfg(not(feature = "redis"))]
        BrokerKind::Redis => Err(StartupError::BrokerUnavailable("redis")),
    }
}
