//! MFA data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Second-factor device kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaDeviceType {
    Totp,
    Sms,
    Email,
}

impl MfaDeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaDeviceType::Totp => "totp",
            MfaDeviceType::Sms => "sms",
            MfaDeviceType::Email => "email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "totp" => Some(MfaDeviceType::Totp),
            "sms" => Some(MfaDeviceType::Sms),
            "email" => Some(MfaDeviceType::Email),
            _ => None,
        }
    }

    /// Codes are delivered out of band rather than computed by the user's app
    pub fn is_delivered(&self) -> bool {
        !matches!(self, MfaDeviceType::Totp)
    }
}

/// Enrolled second factor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaDevice {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub tenant_id: Uuid,
    pub device_type: MfaDeviceType,
    /// Base32 TOTP secret (server-held for sms/email devices)
    #[serde(skip_serializing)]
    pub secret: String,
    /// Phone number or email address for delivered codes
    pub address: Option<String>,
    pub is_active: bool,
    pub is_primary: bool,
    /// Last accepted time step; codes at or before it are replays
    pub last_used_step: Option<i64>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Single-use fallback credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCode {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(skip_serializing)]
    pub hashed_code: String,
    /// Device whose verification activates this code; `None` once live
    pub pending_device_id: Option<Uuid>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Returned once from enrollment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub device_id: Uuid,
    /// Base32 secret, TOTP devices only
    pub secret: Option<String>,
    /// `otpauth://` URI for QR rendering, TOTP devices only
    pub qr_payload: Option<String>,
    /// Plaintext backup codes; never retrievable again
    pub backup_codes: Vec<String>,
}

/// Which factor satisfied a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Device { device_id: Uuid },
    BackupCode,
}
