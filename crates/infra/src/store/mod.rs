//! Record Store: the `users` and `reset_token` tables.
//!
//! The same contract backs all three services' replicas:
//!
//! - `UserStore` for user records (uniqueness of email/phone among
//!   non-deleted rows, soft delete, version-gated writes)
//! - `ResetTokenStore` for reset-token rows (one per email)
//!
//! Version gates are per field group. The profile fields (name, email, phone)
//! and the password digest each carry their own version, and a soft delete is
//! gated on the stored `deleted_at`. A password write never makes a later
//! profile event look stale, and the other way round. The row's `updated_at`
//! is the newest of those versions.
//!
//! Implementations:
//! - `PgRecordStore`: sqlx/Postgres, each write in its own bounded transaction
//! - `InMemoryRecordStore`: tests/dev

mod in_memory;
mod postgres;

pub use in_memory::InMemoryRecordStore;
pub use postgres::PgRecordStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use hrms_auth::{ResetToken, UserRecord};
use hrms_core::{DomainError, UserId};

/// Constraint names shared by both implementations.
pub mod constraints {
    pub const USERS_PKEY: &str = "users_pkey";
    pub const USERS_EMAIL_KEY: &str = "users_email_key";
    pub const USERS_PHONE_KEY: &str = "users_phone_key";
    pub const RESET_TOKEN_EMAIL_KEY: &str = "reset_token_email_key";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("transaction exceeded {0:?}")]
    Timeout(Duration),

    #[error("no {table} row with id {id}")]
    RowMissing { table: &'static str, id: String },

    #[error("storage error in {operation}: {message}")]
    Backend { operation: String, message: String },
}

impl StoreError {
    pub fn unique(constraint: impl Into<String>) -> Self {
        Self::UniqueViolation {
            constraint: constraint.into(),
        }
    }

    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn missing(table: &'static str, id: impl std::fmt::Display) -> Self {
        Self::RowMissing {
            table,
            id: id.to_string(),
        }
    }

    pub fn violated(&self, constraint: &str) -> bool {
        matches!(self, Self::UniqueViolation { constraint: c } if c == constraint)
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { constraint } => match constraint.as_str() {
                constraints::USERS_EMAIL_KEY => DomainError::conflict("email already exists"),
                constraints::USERS_PHONE_KEY => DomainError::conflict("phone already exists"),
                constraints::USERS_PKEY => DomainError::conflict("user already exists"),
                other => DomainError::conflict(format!("duplicate value violates {other}")),
            },
            other => DomainError::internal(other.to_string()),
        }
    }
}

/// Condition attached to a user write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteGuard {
    /// Write unconditionally.
    Always,
    /// Write only if the stored version of the written fields is strictly
    /// older than the given instant.
    IfOlderThan(DateTime<Utc>),
}

impl WriteGuard {
    pub fn permits(&self, stored_version: DateTime<Utc>) -> bool {
        match self {
            WriteGuard::Always => true,
            WriteGuard::IfOlderThan(incoming) => stored_version < *incoming,
        }
    }

    fn threshold(&self) -> Option<DateTime<Utc>> {
        match self {
            WriteGuard::Always => None,
            WriteGuard::IfOlderThan(ts) => Some(*ts),
        }
    }
}

/// What a guarded write did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The row exists but the guard rejected the write.
    Stale,
    /// No row with that id.
    Missing,
}

/// Listing filter for users.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    /// Substring of the name.
    pub name: Option<String>,
    /// Exact email.
    pub email: Option<String>,
    /// Exact phone.
    pub phone: Option<String>,
    pub show_deleted: bool,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

impl UserFilter {
    pub const DEFAULT_LIMIT: u32 = 10;
    pub const MAX_LIMIT: u32 = 100;

    pub fn effective_limit(&self) -> u32 {
        match self.limit {
            0 => Self::DEFAULT_LIMIT,
            l => l.min(Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.effective_limit())
    }

    pub(crate) fn matches(&self, u: &UserRecord) -> bool {
        (self.show_deleted || !u.is_deleted())
            && self.name.as_deref().is_none_or(|n| u.name.contains(n))
            && self.email.as_deref().is_none_or(|e| u.email == e)
            && self.phone.as_deref().is_none_or(|p| u.phone == p)
    }
}

/// One page of users plus the total matching the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPage {
    pub users: Vec<UserRecord>,
    pub total: u64,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user. Fails with `UniqueViolation` on a taken id, email or phone.
    async fn create_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    async fn find_active_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn find_active_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

    /// Includes soft-deleted rows.
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

    async fn list_users(&self, filter: &UserFilter) -> Result<UserPage, StoreError>;

    /// Overwrite name, email and phone from `user`, versioned at `user.updated_at`.
    /// The guard is checked against the stored profile version only.
    async fn update_profile(&self, user: &UserRecord, guard: WriteGuard) -> Result<WriteOutcome, StoreError>;

    /// The guard is checked against the stored password version only.
    async fn update_password(
        &self,
        id: UserId,
        digest: &str,
        updated_at: DateTime<Utc>,
        guard: WriteGuard,
    ) -> Result<WriteOutcome, StoreError>;

    /// Set `deleted_at` on the row. The guard is checked against the stored
    /// `deleted_at`; a row that was never deleted always accepts the write.
    async fn soft_delete(
        &self,
        id: UserId,
        deleted_at: DateTime<Utc>,
        guard: WriteGuard,
    ) -> Result<WriteOutcome, StoreError>;
}

#[async_trait]
pub trait ResetTokenStore: Send + Sync {
    async fn find_token_by_email(&self, email: &str) -> Result<Option<ResetToken>, StoreError>;

    async fn find_token_by_value(&self, value: &str) -> Result<Option<ResetToken>, StoreError>;

    /// Fails with `UniqueViolation(reset_token_email_key)` if the email already has a row.
    async fn insert_token(&self, token: &ResetToken) -> Result<(), StoreError>;

    /// Overwrite `tokens`, `attempt` and `last_attempt` of the row with this id.
    /// Fails with `RowMissing` if there is no such row.
    async fn update_token(&self, token: &ResetToken) -> Result<(), StoreError>;

    /// Write `next` over the row only if it still holds what `current` was read
    /// as. `Stale` means another writer got there first.
    async fn replace_token(&self, current: &ResetToken, next: &ResetToken) -> Result<WriteOutcome, StoreError>;
}

/// Both tables, as one handle.
pub trait RecordStore: UserStore + ResetTokenStore {}

impl<T> RecordStore for T where T: UserStore + ResetTokenStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn guard_is_strict() {
        let t = Utc::now();
        assert!(WriteGuard::Always.permits(t));
        assert!(WriteGuard::IfOlderThan(t).permits(t - ChronoDuration::seconds(1)));
        assert!(!WriteGuard::IfOlderThan(t).permits(t));
        assert!(!WriteGuard::IfOlderThan(t).permits(t + ChronoDuration::seconds(1)));
    }

    #[test]
    fn unique_violations_map_to_conflicts() {
        assert_eq!(
            DomainError::from(StoreError::unique(constraints::USERS_EMAIL_KEY)),
            DomainError::conflict("email already exists")
        );
        assert_eq!(
            DomainError::from(StoreError::unique(constraints::USERS_PHONE_KEY)),
            DomainError::conflict("phone already exists")
        );
        assert!(matches!(
            DomainError::from(StoreError::Timeout(Duration::from_secs(1))),
            DomainError::Internal(_)
        ));
        assert!(matches!(
            DomainError::from(StoreError::missing("reset_token", "t-1")),
            DomainError::Internal(_)
        ));
    }

    #[test]
    fn pagination_defaults() {
        let f = UserFilter::default();
        assert_eq!(f.effective_limit(), 10);
        assert_eq!(f.offset(), 0);
        let f = UserFilter { page: 3, limit: 500, ..Default::default() };
        assert_eq!(f.effective_limit(), 100);
        assert_eq!(f.offset(), 200);
    }
}
