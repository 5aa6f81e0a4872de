use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use hrms_core::DomainError;

/// Message shown for both unknown and expired reset tokens.
pub const TOKEN_INVALID_MESSAGE: &str = "Token invalid.";

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Invalid | DomainError::Expired => {
            json_error(StatusCode::BAD_REQUEST, "token_invalid", TOKEN_INVALID_MESSAGE)
        }
        DomainError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        DomainError::InvalidArgument(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::RateLimited(msg) => json_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", msg),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::Unauthorized => json_error(StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized"),
        DomainError::Internal(msg) => {
            error!(error = %msg, "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal server error")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
