//! HTTP application wiring (axum router + service wiring).
//!
//! - `services.rs`: the shared handles and the process runtime built from config
//! - `routes/`: handlers, one file per area; which ones mount depends on the role
//! - `dto.rs`: request/response shapes
//! - `errors.rs`: domain error to HTTP mapping

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;
use services::AppServices;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the HTTP router for the service's role.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let role = services.role;

    let mut app = routes::public_router(role);
    if let Some(protected) = routes::protected_router(role) {
        app = app.merge(protected.route_layer(axum::middleware::from_fn_with_state(
            services.clone(),
            middleware::session_middleware,
        )));
    }

    app.layer(ServiceBuilder::new().layer(Extension(services)))
}

