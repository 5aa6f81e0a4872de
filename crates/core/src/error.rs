//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// These are the failures the synchronous operations (registration, login,
/// profile edits, password reset) report to their callers. The HTTP layer maps
/// each variant onto a status code; asynchronous publishing and consuming never
/// produce a `DomainError` for anyone to see.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An email, user or token does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input failed validation (e.g. password too short, mismatched confirmation).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A reset token is unknown, consumed, or belongs to another email.
    #[error("token invalid")]
    Invalid,

    /// A reset token is older than its time-to-live.
    #[error("token expired")]
    Expired,

    /// Too many reset requests for the current day.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A uniqueness rule was violated (email / phone already taken).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials did not match.
    #[error("unauthorized")]
    Unauthorized,

    /// Store or broker failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error concerns the validity of a reset token.
    ///
    /// Callers that must not reveal *why* a token was rejected collapse every
    /// variant for which this returns `true` into one response.
    pub fn is_token_rejection(&self) -> bool {
        matches!(self, Self::Invalid | Self::Expired)
    }
}
