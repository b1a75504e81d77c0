//! Expiry and cleanup passes over the identity store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tenant_auth::context::SharedClock;
use tenant_auth::db::{MfaRepository, RateLimitRepository, SessionRepository, SsoRepository};
use tenant_auth::ratelimit::RateLimiter;
use tenant_auth::session::REASON_EXPIRED;
use tenant_auth::sso::SsoFederator;

use crate::config::SweeperConfig;

/// Counts from one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_expired: u64,
    pub sso_sessions_expired: u64,
    pub rate_windows_deleted: u64,
    pub pre_auth_ids_purged: u64,
    /// Steps that failed; the other steps still ran
    pub failures: u32,
}

/// Runs the periodic expiry sweeps
pub struct Sweeper {
    sessions: Arc<dyn SessionRepository>,
    mfa: Arc<dyn MfaRepository>,
    sso: SsoFederator,
    rate_limiter: RateLimiter,
    clock: SharedClock,
}

impl Sweeper {
    pub fn new<S>(store: Arc<S>, config: &SweeperConfig, clock: SharedClock) -> Self
    where
        S: SessionRepository + MfaRepository + SsoRepository + RateLimitRepository + 'static,
    {
        Self {
            sessions: store.clone(),
            mfa: store.clone(),
            sso: SsoFederator::new(store.clone(), config.sso.clone(), clock.clone()),
            rate_limiter: RateLimiter::new(store, config.rate_limit.clone(), clock.clone()),
            clock,
        }
    }

    /// Run every sweep once
    ///
    /// A failing step is logged and counted; it does not stop the others.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        // Sessions are revoked with reason "expired"
        match self.sessions.revoke_expired(self.clock.now()).await {
            Ok(count) => report.sessions_expired = count,
            Err(e) => {
                tracing::error!(error = %e, reason = REASON_EXPIRED, "Session sweep failed");
                report.failures += 1;
            }
        }

        match self.sso.sweep_expired().await {
            Ok(count) => report.sso_sessions_expired = count,
            Err(e) => {
                tracing::error!(error = %e, "SSO session sweep failed");
                report.failures += 1;
            }
        }

        match self.rate_limiter.cleanup_retained().await {
            Ok(count) => report.rate_windows_deleted = count,
            Err(e) => {
                tracing::error!(error = %e, "Rate limit cleanup failed");
                report.failures += 1;
            }
        }

        match self.mfa.purge_spent_pre_auth(self.clock.now()).await {
            Ok(count) => report.pre_auth_ids_purged = count,
            Err(e) => {
                tracing::error!(error = %e, "Spent pre-auth purge failed");
                report.failures += 1;
            }
        }

        report
    }

    /// Sweep every `interval` until `shutdown` resolves
    ///
    /// # Returns
    ///
    /// * `u64` - Number of passes run
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut passes = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(passes, "Sweeper stopping");
                    return passes;
                }
                _ = ticker.tick() => {
                    let started = std::time::Instant::now();
                    let report = self.run_once().await;
                    crate::logging::log_sweep(&report, started.elapsed().as_millis() as u64);
                    passes += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tenant_auth::context::{Clock, ManualClock};
    use tenant_auth::db::{DatabaseConfig, IdentityRepository, MemoryStore};
    use tenant_auth::identity::Identity;
    use tenant_auth::session::Session;
    use uuid::Uuid;

    fn config() -> SweeperConfig {
        SweeperConfig {
            database: DatabaseConfig::development(),
            interval: Duration::from_millis(10),
            sso: Default::default(),
            rate_limit: Default::default(),
        }
    }

    fn session(identity: &Identity, now: chrono::DateTime<Utc>, ttl: ChronoDuration) -> Session {
        Session {
            id: Uuid::new_v4(),
            identity_id: identity.id,
            tenant_id: identity.tenant_id,
            hashed_access_token: Uuid::new_v4().to_string(),
            hashed_refresh_token: Uuid::new_v4().to_string(),
            ip_address: None,
            user_agent: None,
            device_fingerprint: None,
            is_active: true,
            created_at: now,
            last_activity: now,
            expires_at: now + ttl,
            revoked_at: None,
            revoke_reason: None,
        }
    }

    #[tokio::test]
    async fn test_run_once_sweeps_every_table() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let now = clock.now();

        let identity = Identity::new(Uuid::new_v4(), "ada@example.com", "ada", "hash".into(), now);
        IdentityRepository::create(store.as_ref(), &identity).await.unwrap();

        store
            .admit(&session(&identity, now, ChronoDuration::minutes(1)), 5, now)
            .await
            .unwrap();
        store
            .admit(&session(&identity, now, ChronoDuration::days(1)), 5, now)
            .await
            .unwrap();

        let token_id = Uuid::new_v4();
        store.increment(token_id, now, 60, 10).await.unwrap();

        let pre_auth = Uuid::new_v4();
        assert!(store.spend_pre_auth(pre_auth, now + ChronoDuration::minutes(5)).await.unwrap());

        let sweeper = Sweeper::new(store.clone(), &config(), clock.clone());
        clock.advance(ChronoDuration::hours(2));

        let report = sweeper.run_once().await;
        assert_eq!(report.sessions_expired, 1);
        assert_eq!(report.rate_windows_deleted, 1);
        assert_eq!(report.pre_auth_ids_purged, 1);
        assert_eq!(report.failures, 0);

        let live = store
            .list_active(identity.tenant_id, identity.id, clock.now())
            .await
            .unwrap();
        assert_eq!(live.len(), 1);

        // Second pass finds nothing left
        assert_eq!(sweeper.run_once().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sweeper = Sweeper::new(Arc::new(MemoryStore::new()), &config(), clock);

        let passes = sweeper
            .run_until(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(35)),
            )
            .await;
        assert!(passes >= 1);
    }
}
