//! Credential hashing.
//!
//! Passwords use Argon2id with a per-hash salt and a server-side pepper. Session tokens
//! and backup codes use HMAC-SHA256 under a server key so the hash can be looked up
//! directly. API tokens use a plain SHA-256 digest.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::errors::{AuthError, AuthResult};

type HmacSha256 = Hmac<Sha256>;

/// One-way hashing of passwords, tokens and backup codes
#[derive(Clone)]
pub struct CredentialHasher {
    pepper: String,
    token_mac: HmacSha256,
}

impl CredentialHasher {
    /// Create a hasher
    ///
    /// # Arguments
    ///
    /// * `pepper` - Server-side pepper appended to passwords before hashing
    /// * `token_key` - HMAC key for token and backup-code hashes
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Empty token key
    pub fn new(pepper: &str, token_key: &[u8]) -> AuthResult<Self> {
        if token_key.is_empty() {
            return Err(AuthError::Validation("token hash key must not be empty".into()));
        }
        let token_mac = HmacSha256::new_from_slice(token_key)
            .map_err(|_| AuthError::Validation("invalid token hash key".into()))?;

        Ok(Self {
            pepper: pepper.to_string(),
            token_mac,
        })
    }

    pub fn from_config(security: &SecurityConfig) -> AuthResult<Self> {
        Self::new(&security.password_pepper, security.token_hash_key.as_bytes())
    }

    /// Hash password with Argon2id + pepper
    pub fn hash_password(&self, password: &str) -> AuthResult<String> {
        let peppered = format!("{}{}", password, self.pepper);
        let salt = SaltString::generate(&mut OsRng);

        Ok(Argon2::default()
            .hash_password(peppered.as_bytes(), &salt)
            .map_err(|_| AuthError::HashingFailed)?
            .to_string())
    }

    /// Verify password against a stored PHC hash
    ///
    /// An unparseable stored hash never verifies.
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            log::warn!("Stored password hash is not a valid PHC string");
            return false;
        };
        let peppered = format!("{}{}", password, self.pepper);

        Argon2::default()
            .verify_password(peppered.as_bytes(), &parsed)
            .is_ok()
    }

    /// Keyed hash of a session token (hex)
    pub fn hash_token(&self, token: &str) -> String {
        let mut mac = self.token_mac.clone();
        mac.update(token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Keyed hash of a backup code, bound to its owner
    pub fn hash_backup_code(&self, identity_id: Uuid, code: &str) -> String {
        let mut mac = self.token_mac.clone();
        mac.update(identity_id.as_bytes());
        mac.update(b":");
        mac.update(code.trim().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// SHA-256 hex digest (API tokens)
    pub fn digest(value: &str) -> String {
        hex::encode(Sha256::digest(value.as_bytes()))
    }

    /// Constant-time string comparison
    pub fn constant_time_eq(a: &str, b: &str) -> bool {
        a.as_bytes().ct_eq(b.as_bytes()).into()
    }
}

impl std::fmt::Debug for CredentialHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> CredentialHasher {
        CredentialHasher::new("pepper-pepper-pe", b"0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn test_password_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash_password("Correct-Horse-9").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("Correct-Horse-9"));
        assert!(hasher.verify_password("Correct-Horse-9", &hash));
        assert!(!hasher.verify_password("Correct-Horse-8", &hash));
    }

    #[test]
    fn test_pepper_is_part_of_hash() {
        let hash = hasher().hash_password("Correct-Horse-9").unwrap();
        let other =
            CredentialHasher::new("another-pepper!!", b"0123456789abcdef0123456789abcdef").unwrap();
        assert!(!other.verify_password("Correct-Horse-9", &hash));
    }

    #[test]
    fn test_token_hash_is_keyed_and_deterministic() {
        let hasher = hasher();
        let a = hasher.hash_token("token-value");
        assert_eq!(a, hasher.hash_token("token-value"));
        assert_eq!(a.len(), 64);

        let other = CredentialHasher::new("pepper-pepper-pe", b"another-key-another-key-another!").unwrap();
        assert_ne!(a, other.hash_token("token-value"));
        assert_ne!(a, CredentialHasher::digest("token-value"));
    }

    #[test]
    fn test_backup_code_hash_bound_to_identity() {
        let hasher = hasher();
        let code = "12345678";
        assert_ne!(
            hasher.hash_backup_code(Uuid::new_v4(), code),
            hasher.hash_backup_code(Uuid::new_v4(), code)
        );
    }

    #[test]
    fn test_digest_known_value() {
        assert_eq!(
            CredentialHasher::digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(CredentialHasher::constant_time_eq("123456", "123456"));
        assert!(!CredentialHasher::constant_time_eq("123456", "123457"));
        assert!(!CredentialHasher::constant_time_eq("123456", "1234567"));
    }
}
