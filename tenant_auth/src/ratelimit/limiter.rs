//! Fixed-window rate limiting for API tokens.
//!
//! Windows are keyed by `(token_id, window_start)` where `window_start` is the request
//! time truncated to the window size. A fresh row starts each window; nothing carries
//! over. Across a window boundary a caller can therefore burst up to twice the nominal
//! rate. Callers that need smoothing should use a sliding window or token bucket.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::context::SharedClock;
use crate::db::RateLimitRepository;
use crate::errors::{AuthError, AuthResult};

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request counted
    Allowed {
        /// Requests left in this window
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    /// Window exhausted
    Denied { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Fixed-window counter backed by a [`RateLimitRepository`]
#[derive(Clone)]
pub struct RateLimiter {
    repo: Arc<dyn RateLimitRepository>,
    config: RateLimitConfig,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(repo: Arc<dyn RateLimitRepository>, config: RateLimitConfig, clock: SharedClock) -> Self {
        Self { repo, config, clock }
    }

    /// Count one request against the token's current window
    ///
    /// # Arguments
    ///
    /// * `token_id` - API token being used
    /// * `rate_limit_rps` - Nominal requests per second; the window cap is `rps * window_secs`
    ///
    /// # Returns
    ///
    /// * `RateLimitDecision::Allowed` - Counter incremented
    /// * `RateLimitDecision::Denied` - Window already at cap, counter unchanged
    pub async fn check(&self, token_id: Uuid, rate_limit_rps: u32) -> AuthResult<RateLimitDecision> {
        let now = self.clock.now();
        let window_start = self.window_start(now)?;
        let reset_at = window_start + Duration::seconds(self.config.window_secs);
        let cap = rate_limit_rps.saturating_mul(self.config.window_secs as u32);

        let count = if cap == 0 {
            None
        } else {
            self.repo
                .increment(token_id, window_start, self.config.window_secs, cap)
                .await?
        };

        match count {
            Some(count) => Ok(RateLimitDecision::Allowed {
                remaining: cap.saturating_sub(count),
                reset_at,
            }),
            None => {
                let retry_after_secs = (reset_at - now).num_seconds().max(1) as u64;
                log::warn!(
                    "Rate limit exceeded for API token {} (cap {} per {}s)",
                    token_id,
                    cap,
                    self.config.window_secs
                );
                Ok(RateLimitDecision::Denied { retry_after_secs })
            }
        }
    }

    /// Delete windows that started more than `older_than` ago
    pub async fn cleanup(&self, older_than: Duration) -> AuthResult<u64> {
        let cutoff = self.clock.now() - older_than;
        let deleted = self.repo.delete_before(cutoff).await?;
        if deleted > 0 {
            log::debug!("Deleted {} rate limit windows", deleted);
        }
        Ok(deleted)
    }

    /// Delete windows older than the configured retention
    pub async fn cleanup_retained(&self) -> AuthResult<u64> {
        self.cleanup(self.config.retention).await
    }

    fn window_start(&self, now: DateTime<Utc>) -> AuthResult<DateTime<Utc>> {
        let ts = now.timestamp();
        let start = ts - ts.rem_euclid(self.config.window_secs);
        Utc.timestamp_opt(start, 0)
            .single()
            .ok_or_else(|| AuthError::Validation("timestamp out of range".into()))
    }
}
