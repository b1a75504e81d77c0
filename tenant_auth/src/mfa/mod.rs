//! Multi-factor authentication: TOTP and delivered codes, backup codes.

pub mod backup;
pub mod engine;
pub mod models;
pub mod totp;

pub use engine::{LogDispatcher, MfaEngine, OtpDispatcher};
pub use models::{BackupCode, ChallengeOutcome, Enrollment, MfaDevice, MfaDeviceType};
pub use totp::TotpParams;
