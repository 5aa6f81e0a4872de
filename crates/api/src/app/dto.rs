use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hrms_auth::{ResetToken, UserRecord};
use hrms_infra::store::{UserFilter, UserPage};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ForgetPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordQuery {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub password: String,
    pub password_confirm: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListUsersQuery {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub show_deleted: bool,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

impl From<ListUsersQuery> for UserFilter {
    fn from(q: ListUsersQuery) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        UserFilter {
            name: non_empty(q.name),
            email: non_empty(q.email),
            phone: non_empty(q.phone),
            show_deleted: q.show_deleted,
            page: q.page,
            limit: q.limit,
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

/// Public view of a user; never carries the password digest.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<&UserRecord> for UserView {
    fn from(u: &UserRecord) -> Self {
        Self {
            id: u.id.to_string(),
            name: u.name.clone(),
            email: u.email.clone(),
            phone: u.phone.clone(),
            created_at: u.created_at,
            updated_at: u.updated_at,
            deleted_at: u.deleted_at,
        }
    }
}

/// Reset metadata; the token itself only travels in the reset link.
#[derive(Debug, Serialize)]
pub struct ResetIssuedView {
    pub email: String,
    pub attempt: i32,
    pub last_attempt: DateTime<Utc>,
}

impl From<&ResetToken> for ResetIssuedView {
    fn from(t: &ResetToken) -> Self {
        Self {
            email: t.email.clone(),
            attempt: t.attempt,
            last_attempt: t.last_attempt,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserPageView {
    pub items: Vec<UserView>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

impl UserPageView {
    pub fn new(page: &UserPage, filter: &UserFilter) -> Self {
        Self {
            items: page.users.iter().map(UserView::from).collect(),
            total: page.total,
            page: filter.page.max(1),
            limit: filter.effective_limit(),
        }
    }
}
