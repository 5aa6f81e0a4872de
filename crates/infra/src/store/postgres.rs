//! Postgres-backed record store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation { constraint }` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / Io / other | N/A | `Backend` |
//!
//! The violated constraint name is carried through so callers can tell a taken
//! email (`users_email_key`) from a taken phone (`users_phone_key`) or a
//! replayed create (`users_pkey`).
//!
//! ## Transactions
//!
//! Every write runs in its own transaction via [`PgRecordStore::with_transaction`]:
//! begin, run the closure, commit; roll back when the closure fails. The whole
//! unit is bounded by the configured timeout. Reads go through
//! [`PgRecordStore::without_transaction`].
//!
//! ## Versions
//!
//! `profile_updated_at` and `password_updated_at` version the two field groups
//! of a user row. Guarded writes compare against their own group's column and
//! raise `updated_at` to the newest write with `GREATEST`. Reset-token rows are
//! swapped with a compare-and-set on `(tokens, attempt, last_attempt)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use hrms_auth::{ResetToken, UserRecord};
use hrms_core::{ResetTokenId, UserId};

use super::{ResetTokenStore, StoreError, UserFilter, UserPage, UserStore, WriteGuard, WriteOutcome};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const USER_COLUMNS: &str = "id, name, email, password, phone, created_at, updated_at, deleted_at";

/// Boxed future handed back by a transaction body.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'c>>;

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: Arc<PgPool>,
    tx_timeout: Duration,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, tx_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            tx_timeout,
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32, tx_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(tx_timeout)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, tx_timeout))
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `f` inside one transaction bounded by the store's timeout.
    pub async fn with_transaction<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> TxFuture<'c, T> + Send,
    {
        let pool = Arc::clone(&self.pool);
        let work = async move {
            let mut tx = pool.begin().await.map_err(|e| map_sqlx_error(operation, e))?;
            match f(&mut *tx).await {
                Ok(value) => {
                    tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(operation, error = %rollback, "rollback failed");
                    }
                    Err(err)
                }
            }
        };

        // Dropping the transaction on timeout rolls it back.
        tokio::time::timeout(self.tx_timeout, work)
            .await
            .map_err(|_| StoreError::Timeout(self.tx_timeout))?
    }

    /// Run `f` directly against the pool.
    pub async fn without_transaction<'a, T, F, Fut>(&'a self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&'a PgPool) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        f(&self.pool).await
    }
}

/// Distinguish "guard said no" from "no such row" after an update touched nothing.
async fn outcome_after_update(
    conn: &mut PgConnection,
    table: &'static str,
    operation: &'static str,
    rows_affected: u64,
    id: Uuid,
) -> Result<WriteOutcome, StoreError> {
    if rows_affected > 0 {
        return Ok(WriteOutcome::Written);
    }
    let exists: bool = sqlx::query_scalar(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = $1)"))
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(if exists { WriteOutcome::Stale } else { WriteOutcome::Missing })
}

fn push_user_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &UserFilter) {
    qb.push(" WHERE TRUE");
    if let Some(name) = &filter.name {
        qb.push(" AND name LIKE ").push_bind(format!("%{name}%"));
    }
    if let Some(email) = &filter.email {
        qb.push(" AND email = ").push_bind(email.clone());
    }
    if let Some(phone) = &filter.phone {
        qb.push(" AND phone = ").push_bind(phone.clone());
    }
    if !filter.show_deleted {
        qb.push(" AND deleted_at IS NULL");
    }
}

#[async_trait]
impl UserStore for PgRecordStore {
    #[instrument(skip(self, user), fields(user_id = %user.id), err)]
    async fn create_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let user = user.clone();
        self.with_transaction("create_user", move |conn| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO users (id, name, email, password, phone, created_at, updated_at, deleted_at,
                                       profile_updated_at, password_updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7, $7)
                    "#,
                )
                .bind(user.id.as_uuid())
                .bind(&user.name)
                .bind(&user.email)
                .bind(&user.password_digest)
                .bind(&user.phone)
                .bind(user.created_at)
                .bind(user.updated_at)
                .bind(user.deleted_at)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("create_user", e))?;
                Ok(())
            })
        })
        .await
    }

    async fn find_active_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        self.without_transaction(|pool| async move {
            let row = sqlx::query(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND deleted_at IS NULL"
            ))
            .bind(email)
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx_error("find_active_by_email", e))?;
            row.as_ref().map(user_from_row).transpose()
        })
        .await
    }

    async fn find_active_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        self.without_transaction(|pool| async move {
            let row = sqlx::query(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL"
            ))
            .bind(id.as_uuid())
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx_error("find_active_by_id", e))?;
            row.as_ref().map(user_from_row).transpose()
        })
        .await
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        self.without_transaction(|pool| async move {
            let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(pool)
                .await
                .map_err(|e| map_sqlx_error("find_by_id", e))?;
            row.as_ref().map(user_from_row).transpose()
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_users(&self, filter: &UserFilter) -> Result<UserPage, StoreError> {
        self.without_transaction(|pool| async move {
            let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users");
            push_user_filter(&mut count, filter);
            let total: i64 = count
                .build_query_scalar::<i64>()
                .fetch_one(pool)
                .await
                .map_err(|e| map_sqlx_error("list_users.count", e))?;

            let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {USER_COLUMNS} FROM users"));
            push_user_filter(&mut select, filter);
            select
                .push(" ORDER BY created_at ASC, id ASC LIMIT ")
                .push_bind(i64::from(filter.effective_limit()))
                .push(" OFFSET ")
                .push_bind(filter.offset() as i64);
            let rows = select
                .build()
                .fetch_all(pool)
                .await
                .map_err(|e| map_sqlx_error("list_users", e))?;

            let users = rows.iter().map(user_from_row).collect::<Result<Vec<_>, _>>()?;
            Ok(UserPage {
                users,
                total: total.max(0) as u64,
            })
        })
        .await
    }

    #[instrument(skip(self, user), fields(user_id = %user.id), err)]
    async fn update_profile(&self, user: &UserRecord, guard: WriteGuard) -> Result<WriteOutcome, StoreError> {
        let user = user.clone();
        self.with_transaction("update_profile", move |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    UPDATE users SET name = $1, email = $2, phone = $3,
                        profile_updated_at = $4, updated_at = GREATEST(updated_at, $4)
                    WHERE id = $5 AND ($6::timestamptz IS NULL OR profile_updated_at < $6)
                    "#,
                )
                .bind(&user.name)
                .bind(&user.email)
                .bind(&user.phone)
                .bind(user.updated_at)
                .bind(user.id.as_uuid())
                .bind(guard.threshold())
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("update_profile", e))?;
                outcome_after_update(conn, "users", "update_profile", result.rows_affected(), *user.id.as_uuid()).await
            })
        })
        .await
    }

    #[instrument(skip(self, digest), fields(user_id = %id), err)]
    async fn update_password(
        &self,
        id: UserId,
        digest: &str,
        updated_at: DateTime<Utc>,
        guard: WriteGuard,
    ) -> Result<WriteOutcome, StoreError> {
        let digest = digest.to_string();
        self.with_transaction("update_password", move |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    UPDATE users SET password = $1,
                        password_updated_at = $2, updated_at = GREATEST(updated_at, $2)
                    WHERE id = $3 AND ($4::timestamptz IS NULL OR password_updated_at < $4)
                    "#,
                )
                .bind(&digest)
                .bind(updated_at)
                .bind(id.as_uuid())
                .bind(guard.threshold())
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("update_password", e))?;
                outcome_after_update(conn, "users", "update_password", result.rows_affected(), *id.as_uuid()).await
            })
        })
        .await
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn soft_delete(
        &self,
        id: UserId,
        deleted_at: DateTime<Utc>,
        guard: WriteGuard,
    ) -> Result<WriteOutcome, StoreError> {
        self.with_transaction("soft_delete", move |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    UPDATE users SET deleted_at = $1, updated_at = GREATEST(updated_at, $1)
                    WHERE id = $2 AND ($3::timestamptz IS NULL OR deleted_at IS NULL OR deleted_at < $3)
                    "#,
                )
                .bind(deleted_at)
                .bind(id.as_uuid())
                .bind(guard.threshold())
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("soft_delete", e))?;
                outcome_after_update(conn, "users", "soft_delete", result.rows_affected(), *id.as_uuid()).await
            })
        })
        .await
    }
}

#[async_trait]
impl ResetTokenStore for PgRecordStore {
    async fn find_token_by_email(&self, email: &str) -> Result<Option<ResetToken>, StoreError> {
        self.without_transaction(|pool| async move {
            let row = sqlx::query("SELECT id, tokens, email, attempt, last_attempt FROM reset_token WHERE email = $1")
                .bind(email)
                .fetch_optional(pool)
                .await
                .map_err(|e| map_sqlx_error("find_token_by_email", e))?;
            row.as_ref().map(token_from_row).transpose()
        })
        .await
    }

    async fn find_token_by_value(&self, value: &str) -> Result<Option<ResetToken>, StoreError> {
        self.without_transaction(|pool| async move {
            let row = sqlx::query("SELECT id, tokens, email, attempt, last_attempt FROM reset_token WHERE tokens = $1")
                .bind(value)
                .fetch_optional(pool)
                .await
                .map_err(|e| map_sqlx_error("find_token_by_value", e))?;
            row.as_ref().map(token_from_row).transpose()
        })
        .await
    }

    #[instrument(skip(self, token), fields(email = %token.email), err)]
    async fn insert_token(&self, token: &ResetToken) -> Result<(), StoreError> {
        let token = token.clone();
        self.with_transaction("insert_token", move |conn| {
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO reset_token (id, tokens, email, attempt, last_attempt) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(token.id.as_uuid())
                .bind(&token.tokens)
                .bind(&token.email)
                .bind(token.attempt)
                .bind(token.last_attempt)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("insert_token", e))?;
                Ok(())
            })
        })
        .await
    }

    #[instrument(skip(self, token), fields(email = %token.email), err)]
    async fn update_token(&self, token: &ResetToken) -> Result<(), StoreError> {
        let token = token.clone();
        self.with_transaction("update_token", move |conn| {
            Box::pin(async move {
                let result =
                    sqlx::query("UPDATE reset_token SET tokens = $1, attempt = $2, last_attempt = $3 WHERE id = $4")
                        .bind(&token.tokens)
                        .bind(token.attempt)
                        .bind(token.last_attempt)
                        .bind(token.id.as_uuid())
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| map_sqlx_error("update_token", e))?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::missing("reset_token", token.id));
                }
                Ok(())
            })
        })
        .await
    }

    #[instrument(skip(self, current, next), fields(email = %next.email), err)]
    async fn replace_token(&self, current: &ResetToken, next: &ResetToken) -> Result<WriteOutcome, StoreError> {
        let (current, next) = (current.clone(), next.clone());
        self.with_transaction("replace_token", move |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    UPDATE reset_token SET tokens = $1, attempt = $2, last_attempt = $3
                    WHERE id = $4 AND tokens = $5 AND attempt = $6 AND last_attempt = $7
                    "#,
                )
                .bind(&next.tokens)
                .bind(next.attempt)
                .bind(next.last_attempt)
                .bind(current.id.as_uuid())
                .bind(&current.tokens)
                .bind(current.attempt)
                .bind(current.last_attempt)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("replace_token", e))?;
                outcome_after_update(conn, "reset_token", "replace_token", result.rows_affected(), *current.id.as_uuid())
                    .await
            })
        })
        .await
    }
}

fn user_from_row(row: &PgRow) -> Result<UserRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::backend("decode_user", e.to_string());
    Ok(UserRecord {
        id: UserId::from_uuid(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        password_digest: row.try_get("password").map_err(decode)?,
        phone: row.try_get("phone").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        deleted_at: row.try_get("deleted_at").map_err(decode)?,
    })
}

fn token_from_row(row: &PgRow) -> Result<ResetToken, StoreError> {
    let decode = |e: sqlx::Error| StoreError::backend("decode_reset_token", e.to_string());
    Ok(ResetToken {
        id: ResetTokenId::from_uuid(row.try_get("id").map_err(decode)?),
        tokens: row.try_get("tokens").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        attempt: row.try_get("attempt").map_err(decode)?,
        last_attempt: row.try_get("last_attempt").map_err(decode)?,
    })
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                StoreError::unique(db_err.constraint().unwrap_or("unknown"))
            } else {
                StoreError::backend(operation, db_err.message())
            }
        }
        sqlx::Error::PoolClosed => StoreError::backend(operation, "connection pool closed"),
        sqlx::Error::PoolTimedOut => StoreError::backend(operation, "timed out acquiring a connection"),
        other => StoreError::backend(operation, other.to_string()),
    }
}
