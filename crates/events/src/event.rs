//! The user-change event: a method tag plus a user snapshot.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hrms_core::UserId;

/// Semantic operation carried in the `method` header of a user-change event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// A user was registered.
    #[serde(rename = "POST.USER")]
    CreateUser,
    /// Profile fields (name, email, phone) changed.
    #[serde(rename = "PUT.USER")]
    UpdateUser,
    /// The password digest changed.
    #[serde(rename = "PUT.USER_PASS")]
    UpdatePassword,
    /// The user was soft-deleted.
    #[serde(rename = "DELETE.USER")]
    DeleteUser,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::CreateUser,
        Method::UpdateUser,
        Method::UpdatePassword,
        Method::DeleteUser,
    ];

    /// Exact header value on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::CreateUser => "POST.USER",
            Method::UpdateUser => "PUT.USER",
            Method::UpdatePassword => "PUT.USER_PASS",
            Method::DeleteUser => "DELETE.USER",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `method` header value that matches no known operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Matching is exact: no trimming, no case folding.
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

/// JSON payload of a user-change event.
///
/// A full snapshot of the user as the producing service sees it after its
/// commit. Consumers pick the fields relevant to the method: create uses all of
/// them, profile updates use name/email/phone, password updates use the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    /// Password digest, never the plaintext.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub phone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
