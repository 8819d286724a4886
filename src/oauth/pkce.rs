//! PKCE (RFC 7636) and CSRF state generation

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// PKCE code verifier and its S256 challenge.
///
/// Generated fresh per authorization attempt and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    /// Secret sent only with the token exchange
    pub code_verifier: String,
    /// `base64url_nopad(SHA256(code_verifier))`, sent with the authorization request
    pub code_challenge: String,
}

impl PkcePair {
    /// Generate a new pair from 32 random bytes (a 43 character verifier)
    #[must_use]
    pub fn generate() -> Self {
        let verifier_bytes: [u8; 32] = rand::rng().random();
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let code_challenge = challenge_for(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
        }
    }
}

/// Compute the S256 challenge for a verifier
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Check a verifier against a previously issued challenge
#[must_use]
pub fn verify(verifier: &str, challenge: &str) -> bool {
    let expected = challenge_for(verifier);
    expected.len() == challenge.len() && bool::from(expected.as_bytes().ct_eq(challenge.as_bytes()))
}

/// Generate a random CSRF state nonce (16 bytes, base64url)
#[must_use]
pub fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
