#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode, header},
};
use chrono::{Duration, Utc};
use tower::ServiceExt;

use hrms_api::app::build_app;
use hrms_api::app::services::{AppServices, Components};
use hrms_api::config::SessionConfig;
use hrms_auth::{Argon2Hasher, ResetPolicy};
use hrms_core::FixedClock;
use hrms_infra::outbox::InMemoryOutboxStore;
use hrms_infra::services::LogNotifier;
use hrms_infra::store::InMemoryRecordStore;
use hrms_infra::{EventPublisher, ServiceRole};

pub const SECRET: &str = "test-secret";

/// State shared by every service in one test: one replica, one outbox, one clock.
#[derive(Clone)]
pub struct Shared {
    pub store: Arc<InMemoryRecordStore>,
    pub outbox: Arc<InMemoryOutboxStore>,
    pub clock: Arc<FixedClock>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryRecordStore::new()),
            outbox: InMemoryOutboxStore::arc(256),
            clock: Arc::new(FixedClock::new(Utc::now())),
        }
    }

    pub fn app(&self, role: ServiceRole) -> Router {
        let publisher = EventPublisher::outbox("hrms.users", role, self.outbox.clone(), self.clock.clone());
        let parts = Components {
            store: self.store.clone(),
            publisher: Arc::new(publisher),
            clock: self.clock.clone(),
            hasher: Arc::new(Argon2Hasher::with_cost(8, 1, 1).unwrap()),
            notifier: Arc::new(LogNotifier),
        };
        let session = SessionConfig {
            secret: SECRET.to_string(),
            ttl: Duration::hours(24),
        };
        let reset = ResetPolicy::default().with_url_base("http://localhost/reset-password");
        build_app(Arc::new(AppServices::assemble(role, parts, &session, reset)))
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

impl Reply {
    /// `name=value` of the session cookie, ready for a `Cookie` header.
    pub fn session_cookie(&self) -> String {
        let raw = self
            .headers
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        raw.split(';').next().unwrap_or_default().to_string()
    }
}

pub async fn send(app: &Router, req: Request<Body>) -> Reply {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    Reply { status, headers, body }
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authed(method: &str, uri: &str, cookie: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::COOKIE, cookie);
    match body {
        Some(b) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Register through the auth service and return the new user's id.
pub async fn register(auth: &Router, email: &str, phone: &str, password: &str) -> String {
    let reply = send(
        auth,
        json_request(
            "POST",
            "/register",
            serde_json::json!({ "name": "Rina", "email": email, "phone": phone, "password": password }),
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
    reply.body["id"].as_str().unwrap().to_string()
}

pub async fn login(auth: &Router, email: &str, password: &str) -> Reply {
    send(
        auth,
        json_request("POST", "/login", serde_json::json!({ "email": email, "password": password })),
    )
    .await
}
