//! In-memory account store with Argon2 PHC password hashes.

use std::collections::HashMap;

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use tessera_protocol::Rejection;

/// Longest accepted account name, in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Registered accounts keyed by name.
#[derive(Default)]
pub struct AccountStore {
    hashes: HashMap<String, String>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account. Names are trimmed and must be 1..=32 characters.
    pub fn register(&mut self, name: &str, password: &str) -> Result<(), Rejection> {
        let name = validate_name(name)?;
        if self.hashes.contains_key(name) {
            return Err(Rejection::AccountExists);
        }
        let hash = hash_password(password)?;
        self.hashes.insert(name.to_string(), hash);
        tracing::info!("Registered account {name}");
        Ok(())
    }

    /// Check a login attempt. Returns the canonical account name.
    pub fn verify(&self, name: &str, password: &str) -> Result<String, Rejection> {
        let name = name.trim();
        let stored = self.hashes.get(name).ok_or(Rejection::BadCredentials)?;
        let parsed = PasswordHash::new(stored).map_err(|e| {
            tracing::error!("Stored hash for {name} is unreadable: {e}");
            Rejection::BadCredentials
        })?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Rejection::BadCredentials)?;
        Ok(name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hashes.contains_key(name.trim())
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Trimmed `name` if it is a usable account or room name.
pub fn validate_name(name: &str) -> Result<&str, Rejection> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(Rejection::InvalidName);
    }
    Ok(name)
}

fn hash_password(password: &str) -> Result<String, Rejection> {
    let salt_bytes: [u8; 16] = rand::random();
    let hashed = SaltString::b64_encode(&salt_bytes).and_then(|salt| {
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
    });
    hashed.map_err(|e| {
        tracing::error!("Password hashing failed: {e}");
        Rejection::AuthFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_verify() {
        let mut store = AccountStore::new();
        store.register("alice", "pw").unwrap();
        assert_eq!(store.verify("alice", "pw"), Ok("alice".to_string()));
        assert_eq!(store.verify("alice", "nope"), Err(Rejection::BadCredentials));
        assert_eq!(store.verify("bob", "pw"), Err(Rejection::BadCredentials));
    }

    #[test]
    fn test_duplicate_account() {
        let mut store = AccountStore::new();
        store.register("alice", "pw").unwrap();
        assert_eq!(store.register(" alice ", "other"), Err(Rejection::AccountExists));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_hash_is_phc_string() {
        let mut store = AccountStore::new();
        store.register("alice", "pw").unwrap();
        let stored = &store.hashes["alice"];
        assert!(stored.starts_with("$argon2id$"), "{stored}");
        assert!(!stored.contains("pw$"));
    }

    #[test]
    fn test_name_validation() {
        assert_eq!(validate_name("  "), Err(Rejection::InvalidName));
        assert_eq!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)), Err(Rejection::InvalidName));
        assert_eq!(validate_name(" Room1 "), Ok("Room1"));
    }
}
