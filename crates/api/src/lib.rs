//! HTTP API and process wiring for the auth, profile and user services.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
