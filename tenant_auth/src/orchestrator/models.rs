//! Request and response types for the login entry points.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;
use crate::token::TokenPair;

/// Password registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

/// Password login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Second half of a login for an identity with MFA enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaVerifyRequest {
    /// Token returned by [`LoginOutcome::MfaRequired`]
    pub pre_auth_token: String,
    pub code: String,
    #[serde(default)]
    pub is_backup_code: bool,
    /// Device to check; every active device is tried when absent
    pub device_id: Option<Uuid>,
}

/// Tokens and session minted by a completed login
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub identity: Identity,
    pub session_id: Uuid,
    pub tokens: TokenPair,
}

/// Result of the password step
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    /// No second factor needed
    Authenticated(LoginResponse),
    /// Finish with [`crate::AuthOrchestrator::verify_mfa`] before `expires_at`
    MfaRequired {
        pre_auth_token: String,
        expires_at: DateTime<Utc>,
    },
}

impl LoginOutcome {
    pub fn requires_mfa(&self) -> bool {
        matches!(self, LoginOutcome::MfaRequired { .. })
    }
}
