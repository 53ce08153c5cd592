//! Password storage and login sessions.
//!
//! Passwords are PBKDF2-HMAC-SHA256 (150 000 iterations, 16-byte random
//! salt), hex-encoded at rest. All secret comparisons are constant-time.
//! Sessions are volatile: token -> (user, issued_at), 12-hour idle TTL
//! renewed on every authenticated use.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;

pub const PBKDF2_ROUNDS: u32 = 150_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Fresh random salt, hex-encoded.
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    hex::encode(salt)
}

/// Derive the stored hash for a password under a hex salt.
pub fn hash_password(password: &str, salt_hex: &str) -> Result<String, ApiError> {
    let salt = hex::decode(salt_hex)
        .map_err(|_| ApiError::internal("malformed password salt"))?;
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut out);
    Ok(hex::encode(out))
}

/// Constant-time password check against the stored salt + hash.
pub fn verify_password(password: &str, salt_hex: &str, expected_hash_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hash_hex) else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut out);
    out.ct_eq(&expected).into()
}

/// Constant-time equality for bearer tokens.
pub fn tokens_match(supplied: &str, expected: &str) -> bool {
    supplied.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub username: String,
    pub issued_at: DateTime<Utc>,
}

/// Volatile session table. Lost on restart; clients just log in again.
pub struct SessionTable {
    ttl: Duration,
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    pub fn new(ttl_hours: i64) -> Self {
        Self {
            ttl: Duration::hours(ttl_hours),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a session for `username` and return the opaque token.
    pub fn create(&self, username: &str, now: DateTime<Utc>) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.inner.lock().insert(
            token.clone(),
            SessionEntry {
                username: username.to_string(),
                issued_at: now,
            },
        );
        token
    }

    /// Resolve a token to its user, renewing the TTL. Expired sessions are
    /// removed on the way out.
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Option<String> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(token)?;
        if now - entry.issued_at > self.ttl {
            inner.remove(token);
            return None;
        }
        entry.issued_at = now;
        Some(entry.username.clone())
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.inner.lock().remove(token).is_some()
    }

    /// Drop every session past its TTL.
    pub fn purge_expired(&self, now: DateTime<Utc>) {
        self.inner.lock().retain(|_, e| now - e.issued_at <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_per_salt() {
        let salt = generate_salt();
        let a = hash_password("hunter2", &salt).unwrap();
        let b = hash_password("hunter2", &salt).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_LEN * 2);

        let other_salt = generate_salt();
        assert_ne!(a, hash_password("hunter2", &other_salt).unwrap());
    }

    #[test]
    fn verify_accepts_correct_and_rejects_wrong() {
        let salt = generate_salt();
        let hash = hash_password("hunter2", &salt).unwrap();
        assert!(verify_password("hunter2", &salt, &hash));
        assert!(!verify_password("hunter3", &salt, &hash));
        assert!(!verify_password("hunter2", &salt, "deadbeef"));
    }

    #[test]
    fn sessions_expire_and_renew() {
        let table = SessionTable::new(12);
        let t0 = Utc::now();
        let token = table.create("alice", t0);

        // Renewed at +11h, so still valid at +22h.
        assert_eq!(table.validate(&token, t0 + Duration::hours(11)), Some("alice".into()));
        assert_eq!(table.validate(&token, t0 + Duration::hours(22)), Some("alice".into()));

        // 13h idle after the last touch: expired and removed.
        assert_eq!(table.validate(&token, t0 + Duration::hours(35)), None);
        assert_eq!(table.validate(&token, t0 + Duration::hours(36)), None);
    }

    #[test]
    fn revoke_invalidates_immediately() {
        let table = SessionTable::new(12);
        let now = Utc::now();
        let token = table.create("alice", now);
        assert!(table.revoke(&token));
        assert!(!table.revoke(&token));
        assert_eq!(table.validate(&token, now), None);
    }

    #[test]
    fn purge_drops_only_stale_sessions() {
        let table = SessionTable::new(12);
        let t0 = Utc::now();
        let stale = table.create("alice", t0);
        let fresh = table.create("bob", t0 + Duration::hours(10));

        table.purge_expired(t0 + Duration::hours(13));
        assert_eq!(table.validate(&stale, t0 + Duration::hours(13)), None);
        assert_eq!(
            table.validate(&fresh, t0 + Duration::hours(13)),
            Some("bob".into())
        );
    }
}
