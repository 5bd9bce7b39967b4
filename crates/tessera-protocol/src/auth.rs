//! Shared-secret proof for the lobby connection handshake.
//!
//! The lobby sends a random nonce; the connecting peer answers with an
//! Argon2id key derived from the shared secret, salted with that nonce. The
//! parameters are deliberately small: the proof gates casual connections, it
//! is not a password store.

use argon2::{Algorithm, Argon2, Params, Version};

/// Length of a challenge nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// Length of a proof in bytes.
pub const PROOF_LEN: usize = 32;

/// Errors from deriving a proof.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The key derivation function rejected its inputs.
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

fn kdf() -> Result<Argon2<'static>, AuthError> {
    let params = Params::new(64, 1, 1, Some(PROOF_LEN)).map_err(|e| AuthError::Kdf(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Fresh random nonce for a [`crate::Packet::Challenge`].
pub fn new_nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

/// Proof of knowledge of `secret` for the given nonce.
pub fn challenge_proof(secret: &str, nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, AuthError> {
    let mut out = vec![0u8; PROOF_LEN];
    kdf()?
        .hash_password_into(secret.as_bytes(), nonce, &mut out)
        .map_err(|e| AuthError::Kdf(e.to_string()))?;
    Ok(out)
}

/// Check a proof received from a peer.
///
/// Comparison runs over the full length regardless of where the first
/// mismatch is.
pub fn verify_proof(secret: &str, nonce: &[u8; NONCE_LEN], proof: &[u8]) -> Result<bool, AuthError> {
    let expected = challenge_proof(secret, nonce)?;
    if proof.len() != expected.len() {
        return Ok(false);
    }
    let diff = expected
        .iter()
        .zip(proof)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    Ok(diff == 0)
}
