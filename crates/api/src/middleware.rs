use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};

use crate::app::errors::domain_error_to_response;
use crate::app::services::AppServices;
use crate::context::SessionContext;

/// Name of the session cookie set at login.
pub const SESSION_COOKIE: &str = "token";

/// Require a valid session (cookie `token`, or a bearer header).
pub async fn session_middleware(
    State(services): State<Arc<AppServices>>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_session_token(req.headers())
        .ok_or_else(|| domain_error_to_response(hrms_core::DomainError::Unauthorized))?;

    let claims = services
        .accounts
        .authenticate(&token)
        .map_err(domain_error_to_response)?;

    req.extensions_mut().insert(SessionContext::new(claims));
    Ok(next.run(req).await)
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string());

    let token = from_cookie.or_else(|| {
        headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(|t| t.trim().to_string())
    })?;

    if token.is_empty() { None } else { Some(token) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_token_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; token=abc.def; lang=id"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("abc.def"));
    }

    #[test]
    fn falls_back_to_bearer_and_rejects_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_session_token(&headers).as_deref(), Some("xyz"));

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, HeaderValue::from_static("token="));
        assert_eq!(extract_session_token(&empty), None);
    }
}
