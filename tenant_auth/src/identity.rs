//! Tenant-scoped identity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token::ClaimSet;

/// Role assigned to newly registered identities
pub const DEFAULT_ROLE: &str = "member";

/// A tenant-scoped principal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Lower-cased, unique per tenant
    pub email: String,
    pub username: String,
    /// Argon2id PHC string; `None` for identities created through federation
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub role: String,
    pub permissions: Vec<String>,
    pub is_active: bool,
    pub mfa_enabled: bool,
    pub failed_login_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub email_verified: bool,
    /// Created by single sign-on
    pub sso_origin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// New password identity
    pub fn new(
        tenant_id: Uuid,
        email: &str,
        username: &str,
        password_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            email: normalize_email(email),
            username: username.trim().to_string(),
            password_hash: Some(password_hash),
            role: DEFAULT_ROLE.to_string(),
            permissions: Vec::new(),
            is_active: true,
            mfa_enabled: false,
            failed_login_count: 0,
            locked_until: None,
            email_verified: false,
            sso_origin: false,
            created_at: now,
            updated_at: now,
            last_login_at: None,
        }
    }

    /// New identity created by federation: no password, email pre-verified
    pub fn federated(tenant_id: Uuid, email: &str, name: &str, role: &str, now: DateTime<Utc>) -> Self {
        Self {
            password_hash: None,
            role: role.to_string(),
            email_verified: true,
            sso_origin: true,
            ..Self::new(tenant_id, email, name, String::new(), now)
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Claims copied into issued tokens
    pub fn claim_set(&self) -> ClaimSet {
        ClaimSet {
            email: self.email.clone(),
            role: self.role.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

/// Outcome of recording a failed login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedLogin {
    pub failed_login_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
