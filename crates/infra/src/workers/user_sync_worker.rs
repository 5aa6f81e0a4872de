use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use hrms_events::{BrokerMessage, Consumer, ConsumerEvent, Method};

use crate::replica::{ApplyOutcome, ReplicaApplier};
use crate::role::ServiceRole;

/// Lifecycle of the consumer loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncStats {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Own-origin, unknown or not-consumed methods.
    pub ignored: u64,
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    BrokerFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub state: LoopState,
    pub reason: StopReason,
    pub stats: SyncStats,
}

/// Event consumer loop for one service role.
///
/// - Polls the subscription with a bounded wait
/// - Dispatches on the exact `method` header through the role's table
/// - Acknowledges every message after dispatch, whatever the apply outcome
/// - Stops on shutdown or a fatal broker error, then closes the consumer
#[derive(Debug)]
pub struct UserSyncWorker {
    role: ServiceRole,
    dispatch: Vec<Method>,
    applier: ReplicaApplier,
    poll_timeout: Duration,
    state: LoopState,
    stats: SyncStats,
}

impl UserSyncWorker {
    pub fn new(role: ServiceRole, applier: ReplicaApplier) -> Self {
        Self {
            role,
            dispatch: role.dispatch_table(true),
            applier,
            poll_timeout: Duration::from_millis(100),
            state: LoopState::Running,
            stats: SyncStats::default(),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Whether `DELETE.USER` is applied (where the role consumes it).
    pub fn with_deletes(mut self, apply_deletes: bool) -> Self {
        self.dispatch = self.role.dispatch_table(apply_deletes);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Run until `shutdown` flips to `true` or the broker fails fatally.
    pub async fn run<C>(mut self, mut consumer: C, shutdown: watch::Receiver<bool>) -> SyncReport
    where
        C: Consumer,
    {
        info!(role = %self.role, methods = ?self.dispatch, "user sync started");

        let mut reason = StopReason::Shutdown;
        while self.state == LoopState::Running {
            // Observed once per tick; an in-flight apply always finishes first.
            if *shutdown.borrow() {
                self.state = LoopState::Stopping;
                break;
            }

            match consumer.poll(self.poll_timeout).await {
                None => continue,
                Some(ConsumerEvent::Message(message)) => {
                    self.handle_message(&message).await;
                    if let Err(err) = consumer.ack(&message).await {
                        warn!(topic = %message.topic, error = %err, "failed to acknowledge message");
                    }
                }
                Some(ConsumerEvent::Error(err)) if err.is_fatal() => {
                    error!(role = %self.role, error = %err, "broker unavailable; stopping user sync");
                    reason = StopReason::BrokerFailure(err.to_string());
                    self.state = LoopState::Stopping;
                }
                Some(ConsumerEvent::Error(err)) => {
                    warn!(role = %self.role, error = %err, "broker error");
                }
                Some(ConsumerEvent::Info(info)) => {
                    info!(role = %self.role, event = %info, "ignored broker event");
                }
            }
        }

        consumer.close().await;
        self.state = LoopState::Stopped;
        info!(
            role = %self.role,
            received = self.stats.received,
            applied = self.stats.applied,
            skipped = self.stats.skipped,
            failed = self.stats.failed,
            ignored = self.stats.ignored,
            "user sync stopped"
        );

        SyncReport {
            state: self.state,
            reason,
            stats: self.stats,
        }
    }

    async fn handle_message(&mut self, message: &BrokerMessage) {
        self.stats.received += 1;
        let raw_method = message.method().unwrap_or_default();

        if message.origin() == Some(self.role.as_str()) {
            self.stats.ignored += 1;
            return;
        }

        let method = match raw_method.parse::<Method>() {
            Ok(m) if self.dispatch.contains(&m) => m,
            Ok(_) | Err(_) => {
                info!(topic = %message.topic, method = %raw_method, "message not handled by this service");
                self.stats.ignored += 1;
                return;
            }
        };

        info!(topic = %message.topic, method = %method, "message received");
        match self.applier.apply(method, &message.payload).await {
            Ok(ApplyOutcome::Applied) => self.stats.applied += 1,
            Ok(ApplyOutcome::Skipped(reason)) => {
                info!(method = %method, reason = ?reason, "user event skipped");
                self.stats.skipped += 1;
            }
            Err(err) => {
                // Dropped: no retry, no dead letter.
                error!(method = %method, error = %err, "failed to apply user event");
                self.stats.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use hrms_core::UserId;
    use hrms_events::{BrokerError, InMemoryBroker, Producer, UserMessage};

    use crate::store::{InMemoryRecordStore, UserStore};

    const TOPIC: &str = "users";

    fn user_message(email: &str) -> UserMessage {
        let now = Utc::now();
        UserMessage {
            id: UserId::new(),
            name: "Dewi".into(),
            email: email.into(),
            password: "digest".into(),
            phone: email.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn msg(method: &str, origin: &str, user: &UserMessage) -> BrokerMessage {
        BrokerMessage::new(TOPIC, user.to_bytes().unwrap())
            .with_header(hrms_events::METHOD_HEADER, method)
            .with_header(hrms_events::ORIGIN_HEADER, origin)
    }

    fn worker(role: ServiceRole, store: Arc<InMemoryRecordStore>) -> UserSyncWorker {
        UserSyncWorker::new(role, ReplicaApplier::new(store)).with_poll_timeout(Duration::from_millis(10))
    }

    /// Scripted consumer: replays a fixed list of events, then reports the broker down.
    struct Scripted {
        events: Vec<ConsumerEvent>,
        acked: Arc<std::sync::Mutex<Vec<String>>>,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Consumer for Scripted {
        async fn poll(&mut self, _timeout: Duration) -> Option<ConsumerEvent> {
            if self.events.is_empty() {
                return Some(ConsumerEvent::Error(BrokerError::all_brokers_down("gone")));
            }
            Some(self.events.remove(0))
        }

        async fn ack(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
            self.acked
                .lock()
                .unwrap()
                .push(message.method().unwrap_or_default().to_string());
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatches_by_role_and_stops_on_fatal_error() {
        let store = Arc::new(InMemoryRecordStore::new());
        let created = user_message("e@x.com");
        let acked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let consumer = Scripted {
            events: vec![
                ConsumerEvent::Info("rebalance".into()),
                ConsumerEvent::Message(msg("POST.USER", "auth", &created)),
                ConsumerEvent::Message(msg("POST.USER", "auth", &created)),
                ConsumerEvent::Message(msg("PUT.USER", "profile", &created)),
                ConsumerEvent::Message(msg("post.user", "auth", &created)),
                ConsumerEvent::Message(msg("PUT.USER_PASS", "auth", &created)),
                ConsumerEvent::Error(BrokerError::command("transient")),
                ConsumerEvent::Message(BrokerMessage::new(TOPIC, b"{".to_vec()).with_header("method", "POST.USER")),
            ],
            acked: acked.clone(),
            closed: closed.clone(),
        };

        let (_tx, rx) = watch::channel(false);
        let report = worker(ServiceRole::Profile, store.clone()).run(consumer, rx).await;

        assert_eq!(report.state, LoopState::Stopped);
        assert!(matches!(report.reason, StopReason::BrokerFailure(_)));
        assert_eq!(
            report.stats,
            SyncStats {
                received: 6,
                applied: 1,
                skipped: 2,
                failed: 1,
                ignored: 2,
            }
        );
        assert_eq!(acked.lock().unwrap().len(), 6);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(store.find_by_id(created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn skips_own_origin() {
        let store = Arc::new(InMemoryRecordStore::new());
        let created = user_message("own@x.com");
        let consumer = Scripted {
            events: vec![ConsumerEvent::Message(msg("POST.USER", "user", &created))],
            acked: Default::default(),
            closed: Default::default(),
        };
        let (_tx, rx) = watch::channel(false);
        let report = worker(ServiceRole::User, store.clone()).run(consumer, rx).await;
        assert_eq!(report.stats.ignored, 1);
        assert!(store.find_by_id(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletes_can_be_disabled() {
        let store = Arc::new(InMemoryRecordStore::new());
        let user = user_message("del@x.com");
        store.create_user(&user.clone().into()).await.unwrap();
        let mut delete = user.clone();
        delete.updated_at = user.updated_at + chrono::Duration::seconds(1);
        delete.deleted_at = Some(delete.updated_at);

        let consumer = Scripted {
            events: vec![ConsumerEvent::Message(msg("DELETE.USER", "user", &delete))],
            acked: Default::default(),
            closed: Default::default(),
        };
        let (_tx, rx) = watch::channel(false);
        let report = worker(ServiceRole::Auth, store.clone())
            .with_deletes(false)
            .run(consumer, rx)
            .await;
        assert_eq!(report.stats.ignored, 1);
        assert!(store.find_active_by_id(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stops_on_shutdown_signal_with_in_memory_broker() {
        let store = Arc::new(InMemoryRecordStore::new());
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer([TOPIC]);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(worker(ServiceRole::User, store.clone()).run(consumer, rx));

        let created = user_message("live@x.com");
        broker.produce(msg("POST.USER", "auth", &created)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.reason, StopReason::Shutdown);
        assert_eq!(report.state, LoopState::Stopped);
        assert_eq!(report.stats.applied, 1);
        assert!(store.find_active_by_id(created.id).await.unwrap().is_some());
    }
}
