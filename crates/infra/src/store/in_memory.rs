use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hrms_auth::{ResetToken, UserRecord};
use hrms_core::{ResetTokenId, UserId};

use super::{
    ResetTokenStore, StoreError, UserFilter, UserPage, UserStore, WriteGuard, WriteOutcome, constraints,
};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, UserRecord>,
    versions: HashMap<UserId, Versions>,
    tokens: HashMap<ResetTokenId, ResetToken>,
}

/// Per-field-group versions of one user row.
#[derive(Debug, Copy, Clone)]
struct Versions {
    profile: DateTime<Utc>,
    password: DateTime<Utc>,
}

impl Versions {
    fn at(ts: DateTime<Utc>) -> Self {
        Self {
            profile: ts,
            password: ts,
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum FieldGroup {
    Profile,
    Password,
    Deletion,
}

/// In-memory record store.
///
/// Intended for tests/dev. Enforces the same uniqueness rules as the SQL schema.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::backend("read", "lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables.write().map_err(|_| StoreError::backend("write", "lock poisoned"))
    }
}

/// Email/phone must be unique among non-deleted users other than `except`.
fn check_unique(tables: &Tables, candidate: &UserRecord, except: Option<UserId>) -> Result<(), StoreError> {
    if candidate.is_deleted() {
        return Ok(());
    }
    for other in tables.users.values() {
        if Some(other.id) == except || other.is_deleted() {
            continue;
        }
        if other.email == candidate.email {
            return Err(StoreError::unique(constraints::USERS_EMAIL_KEY));
        }
        if other.phone == candidate.phone {
            return Err(StoreError::unique(constraints::USERS_PHONE_KEY));
        }
    }
    Ok(())
}

/// Apply `mutate` if `guard` accepts the stored version of `group`, then stamp
/// that group with `written_at`.
fn guarded_write(
    tables: &mut Tables,
    id: UserId,
    group: FieldGroup,
    written_at: DateTime<Utc>,
    guard: WriteGuard,
    mutate: impl FnOnce(&mut UserRecord),
) -> Result<WriteOutcome, StoreError> {
    let Some(existing) = tables.users.get(&id) else {
        return Ok(WriteOutcome::Missing);
    };
    let mut versions = tables
        .versions
        .get(&id)
        .copied()
        .unwrap_or_else(|| Versions::at(existing.updated_at));
    let permitted = match group {
        FieldGroup::Profile => guard.permits(versions.profile),
        FieldGroup::Password => guard.permits(versions.password),
        FieldGroup::Deletion => existing.deleted_at.is_none_or(|d| guard.permits(d)),
    };
    if !permitted {
        return Ok(WriteOutcome::Stale);
    }

    let mut updated = existing.clone();
    mutate(&mut updated);
    updated.updated_at = updated.updated_at.max(written_at);
    check_unique(tables, &updated, Some(id))?;
    match group {
        FieldGroup::Profile => versions.profile = written_at,
        FieldGroup::Password => versions.password = written_at,
        FieldGroup::Deletion => {}
    }
    tables.users.insert(id, updated);
    tables.versions.insert(id, versions);
    Ok(WriteOutcome::Written)
}

#[async_trait]
impl UserStore for InMemoryRecordStore {
    async fn create_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.users.contains_key(&user.id) {
            return Err(StoreError::unique(constraints::USERS_PKEY));
        }
        check_unique(&tables, user, None)?;
        tables.users.insert(user.id, user.clone());
        tables.versions.insert(user.id, Versions::at(user.updated_at));
        Ok(())
    }

    async fn find_active_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| !u.is_deleted() && u.email == email)
            .cloned())
    }

    async fn find_active_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.read()?.users.get(&id).filter(|u| !u.is_deleted()).cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    async fn list_users(&self, filter: &UserFilter) -> Result<UserPage, StoreError> {
        let tables = self.read()?;
        let mut matching: Vec<UserRecord> = tables.users.values().filter(|u| filter.matches(u)).cloned().collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let users = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.effective_limit() as usize)
            .collect();
        Ok(UserPage { users, total })
    }

    async fn update_profile(&self, user: &UserRecord, guard: WriteGuard) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        guarded_write(&mut tables, user.id, FieldGroup::Profile, user.updated_at, guard, |row| {
            row.name = user.name.clone();
            row.email = user.email.clone();
            row.phone = user.phone.clone();
        })
    }

    async fn update_password(
        &self,
        id: UserId,
        digest: &str,
        updated_at: DateTime<Utc>,
        guard: WriteGuard,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        guarded_write(&mut tables, id, FieldGroup::Password, updated_at, guard, |row| {
            row.password_digest = digest.to_string();
        })
    }

    async fn soft_delete(
        &self,
        id: UserId,
        deleted_at: DateTime<Utc>,
        guard: WriteGuard,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        guarded_write(&mut tables, id, FieldGroup::Deletion, deleted_at, guard, |row| {
            row.deleted_at = Some(deleted_at);
        })
    }
}

#[async_trait]
impl ResetTokenStore for InMemoryRecordStore {
    async fn find_token_by_email(&self, email: &str) -> Result<Option<ResetToken>, StoreError> {
        Ok(self.read()?.tokens.values().find(|t| t.email == email).cloned())
    }

    async fn find_token_by_value(&self, value: &str) -> Result<Option<ResetToken>, StoreError> {
        Ok(self.read()?.tokens.values().find(|t| t.tokens == value).cloned())
    }

    async fn insert_token(&self, token: &ResetToken) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.tokens.values().any(|t| t.email == token.email) {
            return Err(StoreError::unique(constraints::RESET_TOKEN_EMAIL_KEY));
        }
        tables.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn update_token(&self, token: &ResetToken) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let row = tables
            .tokens
            .get_mut(&token.id)
            .ok_or_else(|| StoreError::missing("reset_token", token.id))?;
        overwrite_token(row, token);
        Ok(())
    }

    async fn replace_token(&self, current: &ResetToken, next: &ResetToken) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        let Some(row) = tables.tokens.get_mut(&current.id) else {
            return Ok(WriteOutcome::Missing);
        };
        if row != current {
            return Ok(WriteOutcome::Stale);
        }
        overwrite_token(row, next);
        Ok(WriteOutcome::Written)
    }
}

fn overwrite_token(row: &mut ResetToken, token: &ResetToken) {
    row.tokens = token.tokens.clone();
    row.attempt = token.attempt;
    row.last_attempt = token.last_attempt;
}
