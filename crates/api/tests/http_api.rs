mod common;

use axum::http::StatusCode;
use chrono::Duration;
use serde_json::json;

use hrms_events::Method;
use hrms_infra::ServiceRole;
use hrms_infra::store::ResetTokenStore;

use common::{Shared, authed, get, json_request, login, register, send};

async fn current_token(shared: &Shared, email: &str) -> String {
    shared
        .store
        .find_token_by_email(email)
        .await
        .unwrap()
        .expect("token row")
        .tokens
}

fn reset_uri(email: &str, token: &str) -> String {
    format!("/reset-password?email={email}&token={token}")
}

#[tokio::test]
async fn ping_and_health() {
    let shared = Shared::new();
    let app = shared.app(ServiceRole::Profile);

    let pong = send(&app, get("/ping")).await;
    assert_eq!(pong.status, StatusCode::OK);

    let health = send(&app, get("/health")).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.body["service"], "profile");
}

#[tokio::test]
async fn password_reset_end_to_end() {
    let shared = Shared::new();
    let auth = shared.app(ServiceRole::Auth);
    register(&auth, "rina@example.com", "0811", "old-secret").await;

    let issued = send(
        &auth,
        json_request("POST", "/forget-password", json!({ "email": "rina@example.com" })),
    )
    .await;
    assert_eq!(issued.status, StatusCode::OK);
    assert_eq!(issued.body["email"], "rina@example.com");
    assert_eq!(issued.body["attempt"], 1);
    assert!(issued.body.get("token").is_none());

    let token = current_token(&shared, "rina@example.com").await;
    let reset = send(
        &auth,
        json_request(
            "POST",
            &reset_uri("rina@example.com", &token),
            json!({ "password": "new-secret", "password_confirm": "new-secret" }),
        ),
    )
    .await;
    assert_eq!(reset.status, StatusCode::OK, "{}", reset.body);

    assert_eq!(login(&auth, "rina@example.com", "old-secret").await.status, StatusCode::UNAUTHORIZED);
    assert_eq!(login(&auth, "rina@example.com", "new-secret").await.status, StatusCode::OK);

    // The token is single use.
    let again = send(
        &auth,
        json_request(
            "POST",
            &reset_uri("rina@example.com", &token),
            json!({ "password": "third-secret", "password_confirm": "third-secret" }),
        ),
    )
    .await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);

    let methods: Vec<Method> = shared.outbox.entries().iter().map(|e| e.method).collect();
    assert_eq!(methods, vec![Method::CreateUser, Method::UpdatePassword]);
}

#[tokio::test]
async fn fourth_request_on_the_same_day_is_rate_limited() {
    let shared = Shared::new();
    let auth = shared.app(ServiceRole::Auth);
    register(&auth, "limit@example.com", "0812", "secret1").await;

    for attempt in 1..=3 {
        let reply = send(
            &auth,
            json_request("POST", "/forget-password", json!({ "email": "limit@example.com" })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["attempt"], attempt);
    }
    let token_before = current_token(&shared, "limit@example.com").await;

    let limited = send(
        &auth,
        json_request("POST", "/forget-password", json!({ "email": "limit@example.com" })),
    )
    .await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(current_token(&shared, "limit@example.com").await, token_before);
}

#[tokio::test]
async fn unknown_and_expired_tokens_get_the_same_answer() {
    let shared = Shared::new();
    let users = shared.app(ServiceRole::User);
    let auth = shared.app(ServiceRole::Auth);
    register(&auth, "exp@example.com", "0813", "secret1").await;

    send(
        &users,
        json_request("POST", "/forget-password", json!({ "email": "exp@example.com" })),
    )
    .await;
    let body = json!({ "password": "secret2", "password_confirm": "secret2" });

    let unknown = send(
        &users,
        json_request("POST", &reset_uri("exp@example.com", "not-a-token"), body.clone()),
    )
    .await;

    shared.clock.advance(Duration::hours(2));
    let token = current_token(&shared, "exp@example.com").await;
    let expired = send(&users, json_request("POST", &reset_uri("exp@example.com", &token), body)).await;

    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
    assert_eq!(expired.status, StatusCode::BAD_REQUEST);
    assert_eq!(unknown.body, expired.body);
    assert_eq!(expired.body["message"], "Token invalid.");
}

#[tokio::test]
async fn reset_input_errors() {
    let shared = Shared::new();
    let auth = shared.app(ServiceRole::Auth);

    let missing = send(
        &auth,
        json_request("POST", "/forget-password", json!({ "email": "ghost@example.com" })),
    )
    .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let mismatch = send(
        &auth,
        json_request(
            "POST",
            &reset_uri("ghost@example.com", "abc"),
            json!({ "password": "secret1", "password_confirm": "secret2" }),
        ),
    )
    .await;
    assert_eq!(mismatch.status, StatusCode::BAD_REQUEST);
    assert_eq!(mismatch.body["error"], "validation_error");

    let empty_token = send(
        &auth,
        json_request(
            "POST",
            "/reset-password?email=ghost@example.com",
            json!({ "password": "secret1", "password_confirm": "secret1" }),
        ),
    )
    .await;
    assert_eq!(empty_token.status, StatusCode::BAD_REQUEST);
    assert_eq!(empty_token.body["error"], "token_invalid");
}

#[tokio::test]
async fn login_sets_and_logout_clears_the_session_cookie() {
    let shared = Shared::new();
    let auth = shared.app(ServiceRole::Auth);
    let id = register(&auth, "cookie@example.com", "0814", "secret1").await;

    let reply = login(&auth, "cookie@example.com", "secret1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["id"], id.as_str());
    let set_cookie = reply.headers["set-cookie"].to_str().unwrap();
    assert!(set_cookie.starts_with("token="));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("Max-Age=86400"));

    assert_eq!(login(&auth, "nobody@example.com", "secret1").await.status, StatusCode::UNAUTHORIZED);

    let out = send(&auth, json_request("POST", "/logout", json!({}))).await;
    assert_eq!(out.status, StatusCode::OK);
    assert!(out.headers["set-cookie"].to_str().unwrap().contains("Max-Age=0"));
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let shared = Shared::new();
    let auth = shared.app(ServiceRole::Auth);
    register(&auth, "dup@example.com", "0815", "secret1").await;

    let reply = send(
        &auth,
        json_request(
            "POST",
            "/register",
            json!({ "name": "Other", "email": "dup@example.com", "phone": "0899", "password": "secret1" }),
        ),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    assert_eq!(reply.body["message"], "email already exists");
}

#[tokio::test]
async fn user_service_routes_require_a_session() {
    let shared = Shared::new();
    let auth = shared.app(ServiceRole::Auth);
    let users = shared.app(ServiceRole::User);
    let id = register(&auth, "admin@example.com", "0816", "secret1").await;

    assert_eq!(send(&users, get("/users")).await.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        send(&users, authed("GET", "/users", "token=garbage", None)).await.status,
        StatusCode::UNAUTHORIZED
    );

    let cookie = login(&auth, "admin@example.com", "secret1").await.session_cookie();

    let list = send(&users, authed("GET", "/users?limit=5", &cookie, None)).await;
    assert_eq!(list.status, StatusCode::OK);
    assert_eq!(list.body["total"], 1);
    assert_eq!(list.body["limit"], 5);
    assert!(list.body["items"][0].get("password").is_none());

    let one = send(&users, authed("GET", &format!("/users/{id}"), &cookie, None)).await;
    assert_eq!(one.status, StatusCode::OK);
    assert_eq!(one.body["email"], "admin@example.com");

    let deleted = send(&users, authed("DELETE", &format!("/users/{id}"), &cookie, None)).await;
    assert_eq!(deleted.status, StatusCode::OK);
    assert!(!deleted.body["deleted_at"].is_null());

    let gone = send(&users, authed("GET", &format!("/users/{id}"), &cookie, None)).await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);

    let bad_id = send(&users, authed("GET", "/users/not-a-uuid", &cookie, None)).await;
    assert_eq!(bad_id.status, StatusCode::BAD_REQUEST);

    let last = shared.outbox.entries().last().map(|e| e.method);
    assert_eq!(last, Some(Method::DeleteUser));
}

#[tokio::test]
async fn profile_updates_are_limited_to_the_session_owner() {
    let shared = Shared::new();
    let auth = shared.app(ServiceRole::Auth);
    let profile = shared.app(ServiceRole::Profile);
    let own = register(&auth, "own@example.com", "0817", "secret1").await;
    let other = register(&auth, "other@example.com", "0818", "secret1").await;
    let cookie = login(&auth, "own@example.com", "secret1").await.session_cookie();

    let body = json!({ "name": "Rina Putri" });
    let unauthenticated = send(&profile, json_request("PUT", &format!("/{own}"), body.clone())).await;
    assert_eq!(unauthenticated.status, StatusCode::UNAUTHORIZED);

    let updated = send(&profile, authed("PUT", &format!("/{own}"), &cookie, Some(body.clone()))).await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.body["name"], "Rina Putri");
    assert_eq!(updated.body["email"], "own@example.com");

    let forbidden = send(&profile, authed("PUT", &format!("/{other}"), &cookie, Some(body))).await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

    let taken = send(
        &profile,
        authed("PUT", &format!("/{own}"), &cookie, Some(json!({ "phone": "0818" }))),
    )
    .await;
    assert_eq!(taken.status, StatusCode::CONFLICT);

    let last = shared.outbox.entries().last().map(|e| e.method);
    assert_eq!(last, Some(Method::UpdateUser));
}

#[tokio::test]
async fn routes_mount_per_role() {
    let shared = Shared::new();

    let auth = shared.app(ServiceRole::Auth);
    assert_eq!(send(&auth, get("/users")).await.status, StatusCode::NOT_FOUND);

    let users = shared.app(ServiceRole::User);
    let register = send(
        &users,
        json_request(
            "POST",
            "/register",
            json!({ "name": "X", "email": "x@example.com", "phone": "1", "password": "secret1" }),
        ),
    )
    .await;
    assert_eq!(register.status, StatusCode::NOT_FOUND);

    for role in ServiceRole::ALL {
        let app = shared.app(role);
        let reply = send(
            &app,
            json_request("POST", "/forget-password", json!({ "email": "none@example.com" })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND, "role {role}");
    }
}
