//! Room Secrets
//!
//! SHA-256 digests of room passwords, constant-time verification, and the
//! random material used for generated passwords and session tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Length of a stored secret digest in bytes
pub const DIGEST_LEN: usize = 32;

/// Candidates longer than this are rejected without hashing
pub const MAX_PASSWORD_LEN: usize = 1024;

/// Random bytes behind a generated room password
const GENERATED_PASSWORD_BYTES: usize = 18;

/// SHA-256 digest of a room password.
///
/// Deliberately has no `PartialEq`: comparisons go through
/// [`SessionAuthenticator::verify`].
#[derive(Clone)]
pub struct SecretDigest([u8; DIGEST_LEN]);

impl SecretDigest {
    /// Digest a plaintext password
    pub fn of(password: &str) -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&Sha256::digest(password.as_bytes()));
        Self(bytes)
    }
}

impl fmt::Debug for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretDigest(<redacted>)")
    }
}

/// Checks join credentials against a room's stored digest
pub struct SessionAuthenticator;

impl SessionAuthenticator {
    /// Verify a candidate password against a stored digest.
    ///
    /// The candidate is hashed and the two fixed-length digests are compared
    /// in constant time, so the running time does not depend on where they
    /// first differ. Empty or oversized candidates are rejected.
    pub fn verify(candidate: &str, stored: &SecretDigest) -> bool {
        if candidate.is_empty() || candidate.len() > MAX_PASSWORD_LEN {
            return false;
        }
        let digest = SecretDigest::of(candidate);
        digest.0.ct_eq(&stored.0).into()
    }

    /// Generate a random password and its digest
    pub fn generate_secret() -> (String, SecretDigest) {
        let password = random_token(GENERATED_PASSWORD_BYTES);
        let digest = SecretDigest::of(&password);
        (password, digest)
    }
}

/// URL-safe random string backed by `len` bytes from the OS RNG
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
