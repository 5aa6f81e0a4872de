use hrms_auth::SessionClaims;
use hrms_core::UserId;

/// Authenticated session for a request (from the `token` cookie).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    claims: SessionClaims,
}

impl SessionContext {
    pub fn new(claims: SessionClaims) -> Self {
        Self { claims }
    }

    pub fn user_id(&self) -> UserId {
        self.claims.sub
    }

    pub fn claims(&self) -> &SessionClaims {
        &self.claims
    }
}
