use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde_json::json;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/forget-password", post(forget_password))
        .route("/reset-password", post(reset_password))
}

/// Issue a reset link. The token only travels through the notifier.
pub async fn forget_password(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ForgetPasswordRequest>,
) -> axum::response::Response {
    match services.resets.request_reset(body.email.trim()).await {
        Ok(issued) => {
            let view = dto::ResetIssuedView::from(&issued.token);
            (
                StatusCode::OK,
                Json(json!({
                    "email": view.email,
                    "attempt": view.attempt,
                    "last_attempt": view.last_attempt,
                    "message": "reset password link has been sent",
                })),
            )
                .into_response()
        }
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn reset_password(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ResetPasswordQuery>,
    Json(body): Json<dto::ResetPasswordRequest>,
) -> axum::response::Response {
    let result = services
        .resets
        .verify_and_consume(query.email.trim(), &query.token, &body.password, &body.password_confirm)
        .await;

    match result {
        Ok(_) => (StatusCode::OK, Json(json!({ "message": "password has been reset" }))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
