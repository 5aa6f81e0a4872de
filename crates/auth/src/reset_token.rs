//! Password-reset tokens.
//!
//! One row per email. A row moves between two observable states:
//!
//! - **Issued**: `tokens` holds a random value that a reset link carries.
//! - **Consumed**: `tokens` is empty and `attempt` is zero.
//!
//! Re-issuing is limited per calendar day, where "day" is computed in a fixed
//! UTC offset rather than the server's local zone.

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use hrms_core::{DomainError, DomainResult, ResetTokenId};

/// Message returned once the daily cap is hit.
pub const RATE_LIMIT_MESSAGE: &str = "too many attempts, retry after 1 day";

/// Tunables of the reset flow.
#[derive(Debug, Clone)]
pub struct ResetPolicy {
    /// Base of the reset link; `?email=..&token=..` is appended.
    pub url_base: String,
    /// Offset that defines the calendar day for rate limiting.
    pub day_offset: FixedOffset,
    pub max_daily_attempts: i32,
    pub ttl: Duration,
    pub token_len: usize,
    pub min_password_len: usize,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            url_base: String::new(),
            day_offset: FixedOffset::east_opt(7 * 3600).unwrap_or_else(|| Utc.fix()),
            max_daily_attempts: 3,
            ttl: Duration::hours(1),
            token_len: 30,
            min_password_len: 6,
        }
    }
}

impl ResetPolicy {
    pub fn with_day_offset_hours(mut self, hours: i32) -> DomainResult<Self> {
        self.day_offset = FixedOffset::east_opt(hours * 3600)
            .ok_or_else(|| DomainError::invalid_argument(format!("day offset out of range: {hours}h")))?;
        Ok(self)
    }

    pub fn with_url_base(mut self, url_base: impl Into<String>) -> Self {
        self.url_base = url_base.into();
        self
    }

    /// Whether `a` and `b` fall on the same calendar day in `day_offset`.
    pub fn same_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        a.with_timezone(&self.day_offset).date_naive() == b.with_timezone(&self.day_offset).date_naive()
    }

    /// Attempt number a new request would get, given the stored row.
    pub fn next_attempt(&self, attempt: i32, last_attempt: DateTime<Utc>, now: DateTime<Utc>) -> i32 {
        if self.same_day(now, last_attempt) {
            attempt.saturating_add(1)
        } else {
            1
        }
    }

    pub fn is_expired(&self, last_attempt: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last_attempt > self.ttl
    }

    /// A fresh lowercase alphanumeric token.
    pub fn generate_token(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.token_len)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect()
    }

    /// Reset link carrying `email` and `token` as query parameters.
    pub fn reset_url(&self, email: &str, token: &str) -> String {
        format!("{}?email={}&token={}", self.url_base, email, token)
    }

    /// Length is counted in bytes, so multi-byte characters count more than once.
    pub fn check_password(&self, password: &str) -> DomainResult<()> {
        crate::user::check_password_len(password, self.min_password_len)
    }
}

/// Stored reset-token row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetToken {
    pub id: ResetTokenId,
    /// Current token value; empty once consumed.
    pub tokens: String,
    pub email: String,
    /// Requests issued on the day of `last_attempt`.
    pub attempt: i32,
    pub last_attempt: DateTime<Utc>,
}

/// Result of a successful reset request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedReset {
    pub token: ResetToken,
    pub url: String,
}

impl ResetToken {
    /// First request for an email.
    pub fn issue(email: impl Into<String>, policy: &ResetPolicy, now: DateTime<Utc>) -> Self {
        Self {
            id: ResetTokenId::new(),
            tokens: policy.generate_token(),
            email: email.into(),
            attempt: 1,
            last_attempt: now,
        }
    }

    /// Subsequent request: new value, same row.
    ///
    /// On `RateLimited` the row is left exactly as it was.
    pub fn reissue(&mut self, policy: &ResetPolicy, now: DateTime<Utc>) -> DomainResult<()> {
        let attempt = policy.next_attempt(self.attempt, self.last_attempt, now);
        if attempt > policy.max_daily_attempts {
            return Err(DomainError::rate_limited(RATE_LIMIT_MESSAGE));
        }
        self.attempt = attempt;
        self.tokens = policy.generate_token();
        self.last_attempt = now;
        Ok(())
    }

    /// Check a presented `(email, token)` pair against this row.
    pub fn verify(&self, email: &str, token: &str, policy: &ResetPolicy, now: DateTime<Utc>) -> DomainResult<()> {
        if token.is_empty() || self.tokens != token || self.email != email {
            return Err(DomainError::Invalid);
        }
        if policy.is_expired(self.last_attempt, now) {
            return Err(DomainError::Expired);
        }
        Ok(())
    }

    pub fn consume(&mut self) {
        self.attempt = 0;
        self.tokens.clear();
    }

    pub fn is_consumed(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn url(&self, policy: &ResetPolicy) -> String {
        policy.reset_url(&self.email, &self.tokens)
    }
}
