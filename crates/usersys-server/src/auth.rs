//! Credential and session checks used by the dispatcher.

use std::time::Duration;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use usersys_db::SessionStore;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid session")]
    InvalidSession,

    #[error("session store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Resolve `token` to a user id and slide its expiry forward by `ttl`.
///
/// A token that was never issued, was logged out, or sat idle longer than
/// its TTL is `InvalidSession`.
pub fn validate(sessions: &dyn SessionStore, token: &str, ttl: Duration) -> Result<i64, AuthError> {
    if !sessions.exists(token)? {
        return Err(AuthError::InvalidSession);
    }

    // Can still vanish between the two calls if it expires right now.
    let user_id = sessions.get(token)?.ok_or(AuthError::InvalidSession)?;

    sessions.refresh(token, ttl)?;
    Ok(user_id)
}

/// Argon2id PHC string for a new password.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored hash.
///
/// Accepts Argon2 PHC strings and, for rows written by the previous
/// generation of the service, bare unsalted SHA-256 hex digests.
pub fn verify_password(password: &str, stored: &str) -> bool {
    if is_legacy_digest(stored) {
        let expected = stored.to_ascii_lowercase();
        let matches = constant_time_eq(legacy_digest(password).as_bytes(), expected.as_bytes());
        if matches {
            warn!("Login accepted against a legacy unsalted SHA-256 password hash");
        }
        return matches;
    }

    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is unparseable: {}", e);
            false
        }
    }
}

/// Hex SHA-256 of `password`, the legacy stored format.
pub fn legacy_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn is_legacy_digest(stored: &str) -> bool {
    stored.len() == 64 && stored.bytes().all(|b| b.is_ascii_hexdigit())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
