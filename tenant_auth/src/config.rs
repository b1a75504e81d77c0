//! Core configuration.
//!
//! Built once at process start and handed to each component constructor. Nothing in
//! the core reads the environment after construction.

use chrono::Duration;
use std::collections::HashMap;

use crate::password::PasswordPolicy;

/// Fixed issuer stamped into and required from every bearer token
pub const DEFAULT_ISSUER: &str = "tenant-auth";

/// Default audience for bearer tokens
pub const DEFAULT_AUDIENCE: &str = "tenant-auth-api";

/// Complete configuration of the identity core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub security: SecurityConfig,
    pub token: TokenConfig,
    pub session: SessionConfig,
    pub mfa: MfaConfig,
    pub lockout: LockoutConfig,
    pub sso: SsoConfig,
    pub rate_limit: RateLimitConfig,
    pub password: PasswordPolicy,
}

/// Secret material
#[derive(Clone)]
pub struct SecurityConfig {
    /// HMAC key for bearer-token signatures
    pub signing_key: String,
    /// HMAC key for session-token and backup-code hashes
    pub token_hash_key: String,
    /// Server-side pepper mixed into password hashes
    pub password_pepper: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("signing_key", &"<redacted>")
            .field("token_hash_key", &"<redacted>")
            .field("password_pepper", &"<redacted>")
            .finish()
    }
}

/// Bearer token settings
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Lifetime of the pre-auth token binding `login` to `verify_mfa`
    pub mfa_pending_ttl: Duration,
}

/// Session admission settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_active_sessions: usize,
}

/// MFA settings
#[derive(Debug, Clone)]
pub struct MfaConfig {
    /// Label shown by authenticator apps
    pub issuer: String,
    pub totp_period_secs: u64,
    pub totp_digits: usize,
    /// Accepted clock drift in periods on each side
    pub totp_skew: u8,
    pub backup_code_count: usize,
    pub backup_code_length: usize,
    /// Period of codes delivered over sms/email
    pub delivered_code_period_secs: u64,
}

/// Account lockout settings
#[derive(Debug, Clone)]
pub struct LockoutConfig {
    pub max_failed_attempts: u32,
    pub lock_duration: Duration,
}

/// Federation settings
#[derive(Debug, Clone)]
pub struct SsoConfig {
    pub session_ttl: Duration,
    pub exchange_timeout: std::time::Duration,
}

/// API-token rate limit settings
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_secs: i64,
    /// Windows older than this are deleted by cleanup
    pub retention: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
            mfa_pending_ttl: Duration::minutes(5),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 5,
        }
    }
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            issuer: "TenantAuth".to_string(),
            totp_period_secs: 30,
            totp_digits: 6,
            totp_skew: 1,
            backup_code_count: 10,
            backup_code_length: 8,
            delivered_code_period_secs: 300,
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lock_duration: Duration::minutes(15),
        }
    }
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::minutes(15),
            exchange_timeout: std::time::Duration::from_secs(10),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            retention: Duration::hours(1),
        }
    }
}

/// Source of secret values (signing key, hash key, pepper)
pub trait SecretProvider {
    fn secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from environment variables
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed secret map, for embedding and tests
#[derive(Debug, Default, Clone)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), value.to_string());
        self
    }
}

impl SecretProvider for StaticSecretProvider {
    fn secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name).cloned()
    }
}

impl CoreConfig {
    /// Configuration with default settings around the given secrets
    pub fn new(security: SecurityConfig) -> Self {
        Self {
            security,
            token: TokenConfig::default(),
            session: SessionConfig::default(),
            mfa: MfaConfig::default(),
            lockout: LockoutConfig::default(),
            sso: SsoConfig::default(),
            rate_limit: RateLimitConfig::default(),
            password: PasswordPolicy::default(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// Secrets:
    /// - `JWT_SECRET`: token signing key (>= 32 bytes, required)
    /// - `TOKEN_HASH_KEY`: session/backup-code hash key (>= 32 bytes, required)
    /// - `PASSWORD_PEPPER`: password pepper (>= 16 bytes, required)
    ///
    /// Settings (all optional): `ACCESS_TOKEN_TTL_SECS`, `REFRESH_TOKEN_TTL_SECS`,
    /// `MFA_PENDING_TTL_SECS`, `MAX_ACTIVE_SESSIONS`, `TOTP_PERIOD_SECS`, `TOTP_DIGITS`,
    /// `TOTP_SKEW`, `DELIVERED_CODE_PERIOD_SECS`, `LOCKOUT_MAX_ATTEMPTS`, `LOCKOUT_DURATION_SECS`,
    /// `SSO_SESSION_TTL_SECS`, `SSO_EXCHANGE_TIMEOUT_SECS`, `PASSWORD_MIN_LENGTH`,
    /// `PASSWORD_MAX_LENGTH`, `PASSWORD_COMPLEXITY_THRESHOLD`.
    ///
    /// # Errors
    ///
    /// Returns error if a required secret is missing or too short, or if the
    /// resulting configuration fails [`CoreConfig::validate`]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_provider(&EnvSecretProvider)
    }

    /// Like [`CoreConfig::from_env`], with secrets from an explicit provider
    pub fn from_provider(secrets: &dyn SecretProvider) -> Result<Self, ConfigError> {
        let signing_key = required_secret(secrets, "JWT_SECRET", 32, "openssl rand -hex 32")?;
        let token_hash_key =
            required_secret(secrets, "TOKEN_HASH_KEY", 32, "openssl rand -hex 32")?;
        let password_pepper =
            required_secret(secrets, "PASSWORD_PEPPER", 16, "openssl rand -hex 16")?;

        let mut config = Self::new(SecurityConfig {
            signing_key,
            token_hash_key,
            password_pepper,
        });

        config.token.access_ttl = Duration::seconds(parse_env_or("ACCESS_TOKEN_TTL_SECS", 900));
        config.token.refresh_ttl =
            Duration::seconds(parse_env_or("REFRESH_TOKEN_TTL_SECS", 604_800));
        config.token.mfa_pending_ttl = Duration::seconds(parse_env_or("MFA_PENDING_TTL_SECS", 300));
        if let Ok(issuer) = std::env::var("TOKEN_ISSUER") {
            config.token.issuer = issuer;
        }

        config.session.max_active_sessions = parse_env_or("MAX_ACTIVE_SESSIONS", 5);

        config.mfa.totp_period_secs = parse_env_or("TOTP_PERIOD_SECS", 30);
        config.mfa.totp_digits = parse_env_or("TOTP_DIGITS", 6);
        config.mfa.totp_skew = parse_env_or("TOTP_SKEW", 1);
        config.mfa.delivered_code_period_secs = parse_env_or("DELIVERED_CODE_PERIOD_SECS", 300);

        config.lockout.max_failed_attempts = parse_env_or("LOCKOUT_MAX_ATTEMPTS", 5);
        config.lockout.lock_duration = Duration::seconds(parse_env_or("LOCKOUT_DURATION_SECS", 900));

        config.sso.session_ttl = Duration::seconds(parse_env_or("SSO_SESSION_TTL_SECS", 900));
        config.sso.exchange_timeout =
            std::time::Duration::from_secs(parse_env_or("SSO_EXCHANGE_TIMEOUT_SECS", 10));

        config.password.min_length = parse_env_or("PASSWORD_MIN_LENGTH", config.password.min_length);
        config.password.max_length = parse_env_or("PASSWORD_MAX_LENGTH", config.password.max_length);
        config.password.complexity_threshold = parse_env_or(
            "PASSWORD_COMPLEXITY_THRESHOLD",
            config.password.complexity_threshold,
        );

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.security.signing_key.len() < 32 {
            return Err(ConfigError::Invalid {
                var: "JWT_SECRET".to_string(),
                reason: "Must be at least 32 characters".to_string(),
            });
        }

        if self.token.access_ttl <= Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "ACCESS_TOKEN_TTL_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.token.refresh_ttl <= self.token.access_ttl {
            return Err(ConfigError::Invalid {
                var: "REFRESH_TOKEN_TTL_SECS".to_string(),
                reason: "Must be longer than the access token lifetime".to_string(),
            });
        }

        if self.session.max_active_sessions == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_ACTIVE_SESSIONS".to_string(),
                reason: "Must be at least 1".to_string(),
            });
        }

        if !(6..=8).contains(&self.mfa.totp_digits) {
            return Err(ConfigError::Invalid {
                var: "TOTP_DIGITS".to_string(),
                reason: "Must be between 6 and 8".to_string(),
            });
        }

        if self.mfa.totp_period_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "TOTP_PERIOD_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.mfa.delivered_code_period_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "DELIVERED_CODE_PERIOD_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.lockout.max_failed_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "LOCKOUT_MAX_ATTEMPTS".to_string(),
                reason: "Must be at least 1".to_string(),
            });
        }

        if self.password.min_length > self.password.max_length {
            return Err(ConfigError::Invalid {
                var: "PASSWORD_MIN_LENGTH".to_string(),
                reason: format!("Must not exceed max length ({})", self.password.max_length),
            });
        }

        if self.password.complexity_threshold > 100 {
            return Err(ConfigError::Invalid {
                var: "PASSWORD_COMPLEXITY_THRESHOLD".to_string(),
                reason: "Must be between 0 and 100".to_string(),
            });
        }

        if self.rate_limit.window_secs <= 0 {
            return Err(ConfigError::Invalid {
                var: "RATE_LIMIT_WINDOW_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required secret: {var}\nHint: generate with `{hint}`")]
    MissingRequired { var: String, hint: String },

    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

fn required_secret(
    secrets: &dyn SecretProvider,
    name: &str,
    min_len: usize,
    hint: &str,
) -> Result<String, ConfigError> {
    let value = secrets
        .secret(name)
        .ok_or_else(|| ConfigError::MissingRequired {
            var: name.to_string(),
            hint: hint.to_string(),
        })?;

    if value.len() < min_len {
        return Err(ConfigError::Invalid {
            var: name.to_string(),
            reason: format!("Must be at least {min_len} characters"),
        });
    }

    Ok(value)
}

/// Helper to parse environment variable with default fallback
pub(crate) fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
