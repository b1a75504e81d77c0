//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Revoke reason used when the per-identity cap evicts a session
pub const REASON_EXCEEDED_MAX_SESSIONS: &str = "exceeded_max_sessions";
pub const REASON_LOGOUT: &str = "logout";
pub const REASON_LOGOUT_ALL: &str = "logout_all";
pub const REASON_PASSWORD_CHANGED: &str = "password_changed";
pub const REASON_EXPIRED: &str = "expired";

/// Client device details recorded with a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
}

/// Server-side record binding a device to an issued token pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(skip_serializing)]
    pub hashed_access_token: String,
    #[serde(skip_serializing)]
    pub hashed_refresh_token: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Refresh token expiry
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
}

impl Session {
    /// Active and not past expiry
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }

    /// Mark revoked; a revoked session never becomes active again
    pub fn revoke(&mut self, reason: &str, now: DateTime<Utc>) {
        if self.is_active {
            self.is_active = false;
            self.revoked_at = Some(now);
            self.revoke_reason = Some(reason.to_string());
        }
    }
}
