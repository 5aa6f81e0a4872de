use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::post,
};
use chrono::{DateTime, Utc};
use serde_json::json;

use hrms_auth::NewUser;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::middleware::SESSION_COOKIE;

pub fn router() -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
}

pub async fn register(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<NewUser>,
) -> axum::response::Response {
    match services.accounts.register(body).await {
        Ok(user) => (StatusCode::CREATED, Json(dto::UserView::from(&user))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn login(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::LoginRequest>,
) -> axum::response::Response {
    let session = match services.accounts.login(body.email.trim(), &body.password).await {
        Ok(s) => s,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let cookie = session_cookie(&session.token, services.session_ttl.num_seconds());
    let expires_at: DateTime<Utc> = session.expires_at;
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "id": session.claims.sub.to_string(),
            "name": session.claims.name,
            "email": session.claims.email,
            "phone": session.claims.phone,
            "expires_at": expires_at,
        })),
    )
        .into_response()
}

pub async fn logout() -> axum::response::Response {
    (
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie("", 0))],
        Json(json!({ "message": "logged out" })),
    )
        .into_response()
}

fn session_cookie(value: &str, max_age_secs: i64) -> String {
    format!("{SESSION_COOKIE}={value}; HttpOnly; Path=/; SameSite=Lax; Max-Age={max_age_secs}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logout_cookie_expires_immediately() {
        assert_eq!(session_cookie("", 0), "token=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0");
    }
}
