use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use hrms_core::UserId;
use hrms_infra::store::UserFilter;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_users))
        .route("/:id", get(get_user).delete(delete_user))
}

pub async fn list_users(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListUsersQuery>,
) -> axum::response::Response {
    let filter = UserFilter::from(query);
    match services.accounts.list_users(&filter).await {
        Ok(page) => (StatusCode::OK, Json(dto::UserPageView::new(&page, &filter))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn get_user(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: UserId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match services.accounts.get_user(id).await {
        Ok(user) => (StatusCode::OK, Json(dto::UserView::from(&user))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn delete_user(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: UserId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match services.accounts.delete_user(id).await {
        Ok(user) => (StatusCode::OK, Json(dto::UserView::from(&user))).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
