//! Outbox storage implementations.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use hrms_events::Method;

use super::types::{OutboxEntry, OutboxId, OutboxStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox is full ({capacity} undelivered entries)")]
    Full { capacity: usize },
    #[error("outbox entry not found: {0}")]
    NotFound(OutboxId),
    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Outbox statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// Durable queue of events awaiting delivery.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Add an entry. Fails with `Full` once the undelivered backlog hits capacity.
    async fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxId, OutboxError>;

    /// Claim up to `limit` pending entries due at `now`, oldest first, marking them in flight.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError>;

    /// Drop an entry the broker accepted. Unknown ids are a no-op.
    async fn remove_delivered(&self, id: OutboxId) -> Result<(), OutboxError>;

    /// Back to pending with one more failed attempt recorded.
    async fn reschedule(
        &self,
        id: OutboxId,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    async fn dead_letter(&self, id: OutboxId, attempts: u32, error: &str) -> Result<(), OutboxError>;

    /// Return entries left in flight by a crashed relay to pending.
    async fn release_in_flight(&self) -> Result<usize, OutboxError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded in-memory outbox for tests/dev and single-node runs.
///
/// Entries are kept in enqueue order. Delivered entries are removed, so the
/// backing `Vec` only holds pending, in-flight and dead-lettered entries.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    entries: Mutex<Vec<OutboxEntry>>,
    capacity: usize,
}

impl InMemoryOutboxStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn arc(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    pub fn get(&self, id: OutboxId) -> Option<OutboxEntry> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.iter().find(|e| e.id == id).cloned())
    }

    /// Every entry, in enqueue order.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<OutboxEntry>>, OutboxError> {
        self.entries
            .lock()
            .map_err(|_| OutboxError::Storage("lock poisoned".to_string()))
    }

    fn update(&self, id: OutboxId, f: impl FnOnce(&mut OutboxEntry)) -> Result<(), OutboxError> {
        let mut entries = self.lock()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        f(entry);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxId, OutboxError> {
        let mut entries = self.lock()?;
        let backlog = entries.iter().filter(|e| !e.status.is_terminal()).count();
        if backlog >= self.capacity {
            return Err(OutboxError::Full {
                capacity: self.capacity,
            });
        }
        let id = entry.id;
        entries.push(entry);
        Ok(id)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut entries = self.lock()?;
        let mut due: Vec<&mut OutboxEntry> = entries
            .iter_mut()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= now)
            .collect();
        // Stable: ties keep enqueue order.
        due.sort_by_key(|e| e.created_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|e| {
                e.status = OutboxStatus::InFlight;
                e.clone()
            })
            .collect())
    }

    async fn remove_delivered(&self, id: OutboxId) -> Result<(), OutboxError> {
        self.lock()?.retain(|e| e.id != id);
        Ok(())
    }

    async fn reschedule(
        &self,
        id: OutboxId,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        self.update(id, |e| {
            e.status = OutboxStatus::Pending;
            e.attempts = attempts;
            e.last_error = Some(error.to_string());
            e.next_attempt_at = next_attempt_at;
        })
    }

    async fn dead_letter(&self, id: OutboxId, attempts: u32, error: &str) -> Result<(), OutboxError> {
        self.update(id, |e| {
            e.status = OutboxStatus::DeadLettered;
            e.attempts = attempts;
            e.last_error = Some(error.to_string());
        })
    }

    async fn release_in_flight(&self) -> Result<usize, OutboxError> {
        let mut entries = self.lock()?;
        let mut released = 0;
        for e in entries.iter_mut().filter(|e| e.status == OutboxStatus::InFlight) {
            e.status = OutboxStatus::Pending;
            released += 1;
        }
        Ok(released)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|e| e.status == OutboxStatus::DeadLettered)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let entries = self.lock()?;
        let mut stats = OutboxStats::default();
        for e in entries.iter() {
            match e.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::InFlight => stats.in_flight += 1,
                OutboxStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Postgres
// ─────────────────────────────────────────────────────────────────────────────

const OUTBOX_COLUMNS: &str =
    "id, topic, method, origin, payload, status, attempts, last_error, next_attempt_at, created_at";

/// Outbox table in the service's own database.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    capacity: usize,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, capacity: usize) -> Self {
        Self { pool, capacity }
    }
}

fn storage(operation: &str, err: sqlx::Error) -> OutboxError {
    OutboxError::Storage(format!("{operation}: {err}"))
}

fn entry_from_row(row: &PgRow) -> Result<OutboxEntry, OutboxError> {
    let decode = |e: sqlx::Error| storage("decode_outbox_entry", e);
    let method: String = row.try_get("method").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    Ok(OutboxEntry {
        id: OutboxId(row.try_get("id").map_err(decode)?),
        topic: row.try_get("topic").map_err(decode)?,
        method: method
            .parse::<Method>()
            .map_err(|e| OutboxError::Storage(e.to_string()))?,
        origin: row.try_get("origin").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status: {status}")))?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    #[instrument(skip(self, entry), fields(outbox_id = %entry.id, method = %entry.method), err)]
    async fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxId, OutboxError> {
        // Capacity check and insert in one statement.
        let result = sqlx::query(
            r#"
            INSERT INTO outbox (id, topic, method, origin, payload, status, attempts, next_attempt_at, created_at)
            SELECT $1, $2, $3, $4, $5, 'pending', 0, $6, $7
            WHERE (SELECT COUNT(*) FROM outbox WHERE status IN ('pending', 'in_flight')) < $8
            "#,
        )
        .bind(entry.id.0)
        .bind(&entry.topic)
        .bind(entry.method.as_str())
        .bind(&entry.origin)
        .bind(&entry.payload)
        .bind(entry.next_attempt_at)
        .bind(entry.created_at)
        .bind(self.capacity as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| storage("enqueue", e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::Full {
                capacity: self.capacity,
            });
        }
        Ok(entry.id)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox SET status = 'in_flight'
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage("claim_due", e))?;

        let mut claimed = rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|e| e.created_at);
        Ok(claimed)
    }

    async fn remove_delivered(&self, id: OutboxId) -> Result<(), OutboxError> {
        sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("remove_delivered", e))?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: OutboxId,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            "UPDATE outbox SET status = 'pending', attempts = $1, last_error = $2, next_attempt_at = $3 WHERE id = $4",
        )
        .bind(attempts as i32)
        .bind(error)
        .bind(next_attempt_at)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| storage("reschedule", e))?;
        Ok(())
    }

    async fn dead_letter(&self, id: OutboxId, attempts: u32, error: &str) -> Result<(), OutboxError> {
        sqlx::query("UPDATE outbox SET status = 'dead_lettered', attempts = $1, last_error = $2 WHERE id = $3")
            .bind(attempts as i32)
            .bind(error)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("dead_letter", e))?;
        Ok(())
    }

    async fn release_in_flight(&self) -> Result<usize, OutboxError> {
        let result = sqlx::query("UPDATE outbox SET status = 'pending' WHERE status = 'in_flight'")
            .execute(&self.pool)
            .await
            .map_err(|e| storage("release_in_flight", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'dead_lettered' ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage("list_dead_letters", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("stats", e))?;
        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| storage("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| storage("stats", e))?;
            let n = n.max(0) as usize;
            match OutboxStatus::parse(&status) {
                Some(OutboxStatus::Pending) => stats.pending = n,
                Some(OutboxStatus::InFlight) => stats.in_flight = n,
                Some(OutboxStatus::DeadLettered) => stats.dead_lettered = n,
                None => {}
            }
        }
        Ok(stats)
    }
}
