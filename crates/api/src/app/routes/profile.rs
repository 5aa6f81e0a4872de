use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::put,
};

use hrms_auth::ProfileUpdate;
use hrms_core::UserId;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::SessionContext;

pub fn router() -> Router {
    Router::new().route("/:profile_id", put(update_profile))
}

/// A session may only edit its own profile.
pub async fn update_profile(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(session): Extension<SessionContext>,
    Path(profile_id): Path<String>,
    Json(body): Json<ProfileUpdate>,
) -> axum::response::Response {
    let id: UserId = match profile_id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    if id != session.user_id() {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "cannot edit another user's profile");
    }

    match services.accounts.update_profile(id, body).await {
        Ok(user) => (StatusCode::OK, Json(dto::UserView::from(&user))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
