//! Password hashing.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("failed to hash password: {0}")]
    Hash(String),
    #[error("stored password digest is malformed: {0}")]
    MalformedDigest(String),
    #[error("failed to verify password: {0}")]
    Verify(String),
}

/// Irreversible salted hashing of passwords.
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, HashError>;

    /// `Ok(false)` for a wrong password; `Err` only when verification itself
    /// could not run.
    fn verify(&self, digest: &str, password: &str) -> Result<bool, HashError>;
}

/// Argon2id in PHC string format.
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    pub fn new() -> Self {
        Self {
            params: Params::DEFAULT,
        }
    }

    /// Custom cost parameters (memory KiB, iterations, lanes).
    pub fn with_cost(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self, HashError> {
        let params = Params::new(m_cost, t_cost, p_cost, None).map_err(|e| HashError::Hash(e.to_string()))?;
        Ok(Self { params })
    }

    fn context(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .context()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| HashError::Hash(e.to_string()))?;
        Ok(hash.to_string())
    }

    fn verify(&self, digest: &str, password: &str) -> Result<bool, HashError> {
        if digest.is_empty() {
            return Ok(false);
        }
        let parsed = PasswordHash::new(digest).map_err(|e| HashError::MalformedDigest(e.to_string()))?;

        // Cost parameters come from the digest itself.
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError::Verify(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> Argon2Hasher {
        Argon2Hasher::with_cost(8, 1, 1).unwrap()
    }

    #[test]
    fn verifies_own_digest() {
        let h = cheap();
        let digest = h.hash("secret1").unwrap();
        assert_ne!(digest, "secret1");
        assert!(h.verify(&digest, "secret1").unwrap());
        assert!(!h.verify(&digest, "secret2").unwrap());
    }

    #[test]
    fn salts_differ() {
        let h = cheap();
        assert_ne!(h.hash("same").unwrap(), h.hash("same").unwrap());
    }

    #[test]
    fn empty_digest_never_matches() {
        assert!(!cheap().verify("", "anything").unwrap());
    }

    #[test]
    fn garbage_digest_is_an_error() {
        assert!(matches!(cheap().verify("not-a-phc", "x"), Err(HashError::MalformedDigest(_))));
    }
}
