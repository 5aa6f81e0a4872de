use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hrms_core::{DomainError, DomainResult, UserId};
use hrms_events::UserMessage;

/// A person's account as held by one service.
///
/// Each service keeps its own copy; other services' changes arrive as
/// `UserMessage`s and are applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub phone: String,
    /// Opaque password digest; empty until a password is set.
    pub password_digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Snapshot for publishing.
    pub fn to_message(&self) -> UserMessage {
        UserMessage {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            password: self.password_digest.clone(),
            phone: self.phone.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        }
    }
}

impl From<UserMessage> for UserRecord {
    fn from(m: UserMessage) -> Self {
        Self {
            id: m.id,
            name: m.name,
            email: m.email,
            phone: m.phone,
            password_digest: m.password,
            created_at: m.created_at,
            updated_at: m.updated_at,
            deleted_at: m.deleted_at,
        }
    }
}

/// Registration input (plaintext password, hashed by the caller).
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub password: String,
}

impl NewUser {
    pub fn validate(&self, min_password_len: usize) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::invalid_argument("name is required"));
        }
        if self.phone.trim().is_empty() {
            return Err(DomainError::invalid_argument("phone is required"));
        }
        validate_email(&self.email)?;
        check_password_len(&self.password, min_password_len)
    }
}

/// Minimum password length, counted in bytes of the UTF-8 encoding.
pub(crate) fn check_password_len(password: &str, min_len: usize) -> DomainResult<()> {
    if password.len() < min_len {
        return Err(DomainError::invalid_argument(format!(
            "password must be at least {min_len} characters"
        )));
    }
    Ok(())
}

/// Profile edit; empty fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

impl ProfileUpdate {
    pub fn validate(&self) -> DomainResult<()> {
        if !self.email.is_empty() {
            validate_email(&self.email)?;
        }
        Ok(())
    }

    /// Apply onto `record`, leaving blank fields untouched.
    pub fn merge_into(&self, record: &mut UserRecord) {
        if !self.name.is_empty() {
            record.name = self.name.clone();
        }
        if !self.email.is_empty() {
            record.email = self.email.clone();
        }
        if !self.phone.is_empty() {
            record.phone = self.phone.clone();
        }
    }
}

/// Minimal shape check: `local@domain.tld`.
pub fn validate_email(email: &str) -> DomainResult<()> {
    let invalid = || DomainError::invalid_argument("email is not valid");
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}
