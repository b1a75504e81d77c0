//! Error types shared by every component of the identity core.

use thiserror::Error;

/// Coarse classification of an [`AuthError`], used by callers to decide how to react
/// (retry, back off, re-authenticate, surface to the user).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any state change
    Validation,
    /// Bad credential, invalid token, unusable session or federation attempt
    Authentication,
    /// Valid identity without the required permission
    Authorization,
    /// Duplicate or conflicting state
    Conflict,
    /// Store or identity provider unavailable; retry at a higher layer
    ExternalDependency,
    /// Quota exceeded; back off, do not re-authenticate
    RateLimited,
    /// Local failure (hashing, encoding)
    Internal,
}

/// Why a bearer token was rejected. Never returned to callers verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Malformed,
    BadSignature,
    Expired,
    NotYetValid,
    WrongIssuer,
    WrongAudience,
    WrongType,
    MissingSubject,
    UnknownSession,
    AlreadyUsed,
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            TokenRejection::Malformed => "malformed",
            TokenRejection::BadSignature => "bad signature",
            TokenRejection::Expired => "expired",
            TokenRejection::NotYetValid => "not yet valid",
            TokenRejection::WrongIssuer => "wrong issuer",
            TokenRejection::WrongAudience => "wrong audience",
            TokenRejection::WrongType => "wrong token type",
            TokenRejection::MissingSubject => "missing subject",
            TokenRejection::UnknownSession => "no active session",
            TokenRejection::AlreadyUsed => "already used",
        };
        f.write_str(reason)
    }
}

/// Authentication core errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// Input failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Candidate password rejected by the password policy
    #[error("Password rejected: {}", .0.join("; "))]
    WeakPassword(Vec<String>),

    /// Unknown identity or wrong password
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Too many failed attempts
    #[error("Account locked, retry after {retry_after_secs}s")]
    AccountLocked { retry_after_secs: u64 },

    /// Identity disabled by an operator
    #[error("Account disabled")]
    AccountDisabled,

    /// Bearer token rejected
    #[error("Invalid token: {0}")]
    InvalidToken(TokenRejection),

    /// Session missing, revoked or expired
    #[error("Session is not active")]
    SessionInactive,

    /// MFA code or backup code rejected
    #[error("Invalid two-factor authentication code")]
    InvalidMfaCode,

    /// Operation requires MFA to be enrolled
    #[error("Two-factor authentication not enabled")]
    MfaNotEnabled,

    /// Federation state unknown, expired or already consumed
    #[error("Unknown or expired federation state")]
    InvalidFederationState,

    /// Federation failed after the state was accepted
    #[error("Federation failed: {0}")]
    FederationFailed(String),

    /// API token unknown, revoked or expired
    #[error("Invalid API token")]
    InvalidApiToken,

    /// Permission or role missing
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Entity not found inside the caller's tenant
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Duplicate or conflicting state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Quota exceeded
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Identity provider unreachable or misbehaving
    #[error("Identity provider error: {0}")]
    IdentityProvider(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store unavailable (timeout, poisoned lock)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Password hashing failed
    #[error("Password hashing failed")]
    HashingFailed,

    /// JWT encoding failed
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// TOTP secret could not be used
    #[error("TOTP error: {0}")]
    Totp(String),

    /// Stored document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuthError {
    /// Classify the error according to the platform taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Validation(_) | AuthError::WeakPassword(_) => ErrorKind::Validation,
            AuthError::InvalidCredentials
            | AuthError::AccountLocked { .. }
            | AuthError::AccountDisabled
            | AuthError::InvalidToken(_)
            | AuthError::SessionInactive
            | AuthError::InvalidMfaCode
            | AuthError::MfaNotEnabled
            | AuthError::InvalidFederationState
            | AuthError::FederationFailed(_)
            | AuthError::InvalidApiToken => ErrorKind::Authentication,
            AuthError::Forbidden(_) | AuthError::NotFound(_) => ErrorKind::Authorization,
            AuthError::Conflict(_) => ErrorKind::Conflict,
            AuthError::RateLimited { .. } => ErrorKind::RateLimited,
            AuthError::IdentityProvider(_)
            | AuthError::Database(_)
            | AuthError::StoreUnavailable(_) => ErrorKind::ExternalDependency,
            AuthError::HashingFailed
            | AuthError::Jwt(_)
            | AuthError::Totp(_)
            | AuthError::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Seconds the caller should wait before retrying, when the error implies one
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AuthError::AccountLocked { retry_after_secs }
            | AuthError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Get a client-safe error message that doesn't leak sensitive information
    ///
    /// Authentication failures collapse to generic messages; store, provider and
    /// crypto errors are reported as internal errors.
    pub fn client_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials | AuthError::AccountDisabled => {
                "Invalid credentials".to_string()
            }
            AuthError::InvalidToken(_) | AuthError::SessionInactive => {
                "Invalid token".to_string()
            }
            AuthError::InvalidFederationState | AuthError::FederationFailed(_) => {
                "Single sign-on failed".to_string()
            }
            AuthError::NotFound(_) => "Not found".to_string(),
            AuthError::IdentityProvider(_)
            | AuthError::Database(_)
            | AuthError::StoreUnavailable(_)
            | AuthError::HashingFailed
            | AuthError::Jwt(_)
            | AuthError::Totp(_)
            | AuthError::Serialization(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Result type for authentication operations
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_errors_are_generic_for_clients() {
        let expired = AuthError::InvalidToken(TokenRejection::Expired);
        let wrong_type = AuthError::InvalidToken(TokenRejection::WrongType);
        assert_eq!(expired.client_message(), wrong_type.client_message());
        assert_eq!(expired.kind(), ErrorKind::Authentication);

        let federation = AuthError::FederationFailed("token endpoint returned 500".into());
        assert!(!federation.client_message().contains("500"));
    }

    #[test]
    fn test_rate_limited_is_distinct_from_authentication() {
        let err = AuthError::RateLimited { retry_after_secs: 12 };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(12));
    }

    #[test]
    fn test_lockout_is_authentication_with_retry_after() {
        let err = AuthError::AccountLocked { retry_after_secs: 900 };
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.retry_after(), Some(900));
        assert!(err.client_message().contains("900"));
    }

    #[test]
    fn test_store_errors_are_sanitized() {
        let err = AuthError::StoreUnavailable("connection refused to 10.0.0.3".into());
        assert_eq!(err.kind(), ErrorKind::ExternalDependency);
        assert_eq!(err.client_message(), "Internal server error");
    }
}
