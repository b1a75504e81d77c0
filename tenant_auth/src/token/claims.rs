//! Token claims and the authenticated principal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AuthError, AuthResult};

/// Token kind, carried in every token so kinds cannot be used interchangeably
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    /// Pre-auth token binding a password login to its MFA challenge
    MfaPending,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::MfaPending => "mfa_pending",
        }
    }
}

/// Identity snapshot copied into every token of a pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    pub email: String,
    pub role: String,
    pub permissions: Vec<String>,
}

/// Signed token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity id
    pub sub: Uuid,
    /// Tenant id
    pub tid: Uuid,
    pub email: String,
    pub role: String,
    pub perms: Vec<String>,
    /// Unique per issuance
    pub jti: Uuid,
    pub typ: TokenKind,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
}

impl Claims {
    pub fn claim_set(&self) -> ClaimSet {
        ClaimSet {
            email: self.email.clone(),
            role: self.role.clone(),
            permissions: self.perms.clone(),
        }
    }
}

/// Access/refresh token pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    /// Always `Bearer`
    pub token_type: String,
}

/// How a principal authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Session { session_id: Uuid },
    ApiToken { token_id: Uuid },
}

/// Authenticated caller of a tenant-scoped operation
#[derive(Debug, Clone)]
pub struct Principal {
    pub identity_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub method: AuthMethod,
}

/// Permission granting every other permission
pub const WILDCARD_PERMISSION: &str = "*";

impl Principal {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == permission || p == WILDCARD_PERMISSION)
    }

    /// # Errors
    ///
    /// * `AuthError::Forbidden` - Permission missing
    pub fn require_permission(&self, permission: &str) -> AuthResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!("missing permission {permission}")))
        }
    }

    /// # Errors
    ///
    /// * `AuthError::Forbidden` - Role differs
    pub fn require_role(&self, role: &str) -> AuthResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!("requires role {role}")))
        }
    }

    pub fn context(&self) -> crate::context::TenantContext {
        crate::context::TenantContext::identity(self.tenant_id, self.identity_id)
    }
}
