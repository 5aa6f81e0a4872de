use axum::{Router, routing::get};

use hrms_infra::ServiceRole;

pub mod auth;
pub mod profile;
pub mod reset;
pub mod system;
pub mod users;

/// Endpoints reachable without a session.
pub fn public_router(role: ServiceRole) -> Router {
    let router = Router::new()
        .route("/ping", get(system::ping))
        .route("/health", get(system::health))
        .merge(reset::router());

    match role {
        ServiceRole::Auth => router.merge(auth::router()),
        ServiceRole::Profile | ServiceRole::User => router,
    }
}

/// Endpoints behind the session middleware; the auth service has none.
pub fn protected_router(role: ServiceRole) -> Option<Router> {
    match role {
        ServiceRole::Auth => None,
        ServiceRole::Profile => Some(profile::router()),
        ServiceRole::User => Some(Router::new().nest("/users", users::router())),
    }
}
