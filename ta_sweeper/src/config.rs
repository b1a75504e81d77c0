//! Sweeper configuration management.
//!
//! Consolidates all environment variable reads and provides validated configuration.

use std::time::Duration;

use tenant_auth::config::{RateLimitConfig, SsoConfig};
use tenant_auth::db::DatabaseConfig;

/// Complete sweeper configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Pause between sweep passes
    pub interval: Duration,
    /// Federation settings (pending session expiry)
    pub sso: SsoConfig,
    /// Rate-limit window retention
    pub rate_limit: RateLimitConfig,
}

impl SweeperConfig {
    /// Load configuration from environment variables
    ///
    /// # Arguments
    ///
    /// * `database_url_override` - Optional database URL override (from CLI args)
    /// * `interval_override` - Optional pass interval in seconds (from CLI args)
    ///
    /// # Errors
    ///
    /// Returns error if no database URL is available or a value is invalid
    pub fn from_env(
        database_url_override: Option<String>,
        interval_override: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let database = match database_url_override {
            Some(url) => DatabaseConfig::from_env()
                .unwrap_or_else(|_| DatabaseConfig::development())
                .with_url(url),
            None => DatabaseConfig::from_env()?,
        };

        let interval_secs =
            interval_override.unwrap_or_else(|| parse_env_or("SWEEP_INTERVAL_SECS", 60));

        let mut rate_limit = RateLimitConfig::default();
        rate_limit.retention =
            chrono::Duration::seconds(parse_env_or("RATE_LIMIT_RETENTION_SECS", 3600));

        let config = SweeperConfig {
            database,
            interval: Duration::from_secs(interval_secs),
            sso: SsoConfig::default(),
            rate_limit,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "SWEEP_INTERVAL_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.rate_limit.retention < chrono::Duration::seconds(self.rate_limit.window_secs) {
            return Err(ConfigError::Invalid {
                var: "RATE_LIMIT_RETENTION_SECS".to_string(),
                reason: format!(
                    "Must be at least one rate-limit window ({}s)",
                    self.rate_limit.window_secs
                ),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },

    #[error(transparent)]
    Core(#[from] tenant_auth::ConfigError),
}

/// Helper to parse environment variable with default fallback
fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SweeperConfig {
        SweeperConfig {
            database: DatabaseConfig::development(),
            interval: Duration::from_secs(60),
            sso: SsoConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = config();
        config.interval = Duration::ZERO;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("SWEEP_INTERVAL_SECS"));
    }

    #[test]
    fn test_retention_shorter_than_window_rejected() {
        let mut config = config();
        config.rate_limit.retention = chrono::Duration::seconds(10);

        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_url_override_wins() {
        let config = SweeperConfig::from_env(Some("postgres://sweeper@db/auth".into()), Some(5)).unwrap();
        assert_eq!(config.database.database_url, "postgres://sweeper@db/auth");
        assert_eq!(config.interval, Duration::from_secs(5));
    }
}
