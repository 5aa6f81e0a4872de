//! `hrms-auth`: account records and credential policy.
//!
//! This crate is decoupled from HTTP, storage and brokers. It owns:
//! - `UserRecord` and its conversions to/from the wire `UserMessage`
//! - `ResetToken` with the per-day attempt limit and expiry rules
//! - password hashing behind `CredentialHasher`
//! - session JWT claims

pub mod claims;
pub mod password;
pub mod reset_token;
pub mod user;

pub use claims::{SessionClaims, SessionError, SessionKeys};
pub use password::{Argon2Hasher, CredentialHasher, HashError};
pub use reset_token::{IssuedReset, ResetPolicy, ResetToken};
pub use user::{NewUser, ProfileUpdate, UserRecord, validate_email};
