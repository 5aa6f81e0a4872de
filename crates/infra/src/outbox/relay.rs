//! Outbox relay: moves due entries from the outbox to the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hrms_core::Clock;
use hrms_events::Producer;

use super::store::{OutboxError, OutboxStore};
use super::types::{OutboxEntry, RetryPolicy};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often to look for due entries when the outbox is idle.
    pub poll_interval: Duration,
    /// Entries claimed per round.
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 32,
            retry: RetryPolicy::default(),
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub store_errors: u64,
}

impl RelayStats {
    fn absorb(&mut self, other: &RelayStats) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.store_errors += other.store_errors;
    }
}

/// Delivery worker behind `PublishMode::Outbox`.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    producer: Arc<dyn Producer>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        producer: Arc<dyn Producer>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            producer,
            clock,
            config,
        }
    }

    /// Claim one batch and attempt each entry once.
    pub async fn run_once(&self) -> Result<RelayStats, OutboxError> {
        let now = self.clock.now();
        let batch = self.store.claim_due(now, self.config.batch_size).await?;
        let mut stats = RelayStats::default();
        for entry in batch {
            self.deliver(entry, &mut stats).await;
        }
        Ok(stats)
    }

    async fn deliver(&self, entry: OutboxEntry, stats: &mut RelayStats) {
        let id = entry.id;
        match self.producer.produce(entry.to_message()).await {
            Ok(report) => {
                info!(
                    outbox_id = %id,
                    method = %entry.method,
                    topic = %report.topic,
                    partition = report.partition,
                    offset = %report.offset,
                    "event delivered"
                );
                if let Err(err) = self.store.remove_delivered(id).await {
                    // Entry stays in flight; released on the next start.
                    error!(outbox_id = %id, error = %err, "failed to remove delivered outbox entry");
                    stats.store_errors += 1;
                } else {
                    stats.delivered += 1;
                }
            }
            Err(err) => {
                let attempts = entry.attempts.saturating_add(1);
                let message = err.to_string();
                let result = if self.config.retry.should_retry(attempts) {
                    let delay = self.config.retry.delay_for_attempt(attempts);
                    let next = self.clock.now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
                    warn!(
                        outbox_id = %id,
                        method = %entry.method,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "event delivery failed; rescheduled"
                    );
                    stats.retried += 1;
                    self.store.reschedule(id, attempts, &message, next).await
                } else {
                    error!(
                        outbox_id = %id,
                        method = %entry.method,
                        attempts,
                        error = %message,
                        "event delivery failed; dead-lettered"
                    );
                    stats.dead_lettered += 1;
                    self.store.dead_letter(id, attempts, &message).await
                };
                if let Err(err) = result {
                    error!(outbox_id = %id, error = %err, "failed to record delivery failure");
                    stats.store_errors += 1;
                }
            }
        }
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RelayStats {
        let mut total = RelayStats::default();
        match self.store.release_in_flight().await {
            Ok(0) => {}
            Ok(n) => info!(released = n, "released in-flight outbox entries"),
            Err(err) => warn!(error = %err, "failed to release in-flight outbox entries"),
        }
        info!(batch_size = self.config.batch_size, "outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let round = match self.run_once().await {
                Ok(round) => round,
                Err(err) => {
                    error!(error = %err, "outbox claim failed");
                    total.store_errors += 1;
                    RelayStats::default()
                }
            };
            let busy = round.delivered + round.retried + round.dead_lettered > 0;
            total.absorb(&round);
            if busy {
                debug!(delivered = round.delivered, retried = round.retried, "outbox round");
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            delivered = total.delivered,
            retried = total.retried,
            dead_lettered = total.dead_lettered,
            finished_at = %Utc::now(),
            "outbox relay stopped"
        );
        total
    }
}
