//! Session lifecycle: admission under the per-identity cap, validation, rotation and
//! revocation.

use std::sync::Arc;
use uuid::Uuid;

use super::models::{DeviceInfo, REASON_EXCEEDED_MAX_SESSIONS, Session};
use crate::context::{SharedClock, TenantContext};
use crate::crypto::CredentialHasher;
use crate::db::SessionRepository;
use crate::errors::{AuthError, AuthResult};
use crate::token::TokenPair;

/// Tracks sessions; tokens are only ever stored as keyed hashes
#[derive(Clone)]
pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    hasher: Arc<CredentialHasher>,
    max_active: usize,
    clock: SharedClock,
}

impl SessionStore {
    /// Create a session store
    ///
    /// # Arguments
    ///
    /// * `repo` - Session persistence
    /// * `hasher` - Keyed hash for access and refresh tokens
    /// * `max_active` - Live sessions allowed per identity
    /// * `clock` - Time source
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        hasher: Arc<CredentialHasher>,
        max_active: usize,
        clock: SharedClock,
    ) -> Self {
        Self {
            repo,
            hasher,
            max_active: max_active.max(1),
            clock,
        }
    }

    /// Persist a session for a freshly issued pair
    ///
    /// Never rejects because of the cap: the least recently active sessions are
    /// evicted inside the same transaction as the insert.
    ///
    /// # Errors
    ///
    /// * `AuthError::NotFound` - Identity does not exist in the tenant
    pub async fn create(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        device: DeviceInfo,
        pair: &TokenPair,
    ) -> AuthResult<Session> {
        let now = self.clock.now();
        let session = Session {
            id: Uuid::new_v4(),
            identity_id,
            tenant_id,
            hashed_access_token: self.hasher.hash_token(&pair.access_token),
            hashed_refresh_token: self.hasher.hash_token(&pair.refresh_token),
            ip_address: device.ip_address,
            user_agent: device.user_agent,
            device_fingerprint: device.device_fingerprint,
            is_active: true,
            created_at: now,
            last_activity: now,
            expires_at: pair.refresh_expires_at,
            revoked_at: None,
            revoke_reason: None,
        };

        let evicted = self.repo.admit(&session, self.max_active, now).await?;
        for id in &evicted {
            log::info!(
                "Session {} of identity {} revoked: {}",
                id,
                identity_id,
                REASON_EXCEEDED_MAX_SESSIONS
            );
        }

        Ok(session)
    }

    /// Resolve the live session behind an access token and bump its activity
    ///
    /// # Errors
    ///
    /// * `AuthError::SessionInactive` - Unknown token, foreign identity, revoked or expired session
    pub async fn validate(&self, access_token: &str, identity_id: Uuid) -> AuthResult<Session> {
        let now = self.clock.now();
        let mut session = self
            .repo
            .find_by_access_hash(&self.hasher.hash_token(access_token))
            .await?
            .filter(|s| s.identity_id == identity_id)
            .ok_or(AuthError::SessionInactive)?;

        if !session.is_live(now) {
            return Err(AuthError::SessionInactive);
        }

        self.repo.touch(session.id, now).await?;
        session.last_activity = session.last_activity.max(now);
        Ok(session)
    }

    /// Replace both token hashes of the session owning `old_refresh_token`
    ///
    /// # Errors
    ///
    /// * `AuthError::SessionInactive` - No live session holds the presented refresh token
    pub async fn rotate(&self, old_refresh_token: &str, pair: &TokenPair) -> AuthResult<Session> {
        self.repo
            .rotate_tokens(
                &self.hasher.hash_token(old_refresh_token),
                &self.hasher.hash_token(&pair.access_token),
                &self.hasher.hash_token(&pair.refresh_token),
                pair.refresh_expires_at,
                self.clock.now(),
            )
            .await?
            .ok_or(AuthError::SessionInactive)
    }

    /// Live session holding a refresh token, if any
    pub async fn find_by_refresh(&self, refresh_token: &str) -> AuthResult<Option<Session>> {
        let now = self.clock.now();
        Ok(self
            .repo
            .find_by_refresh_hash(&self.hasher.hash_token(refresh_token))
            .await?
            .filter(|s| s.is_live(now)))
    }

    /// Revoke one session of the tenant
    ///
    /// Revoking an already inactive session is a no-op.
    pub async fn revoke(&self, ctx: TenantContext, session_id: Uuid, reason: &str) -> AuthResult<()> {
        if self
            .repo
            .revoke(ctx.tenant_id, session_id, reason, self.clock.now())
            .await?
        {
            log::info!("Session {} revoked: {}", session_id, reason);
        }
        Ok(())
    }

    /// Revoke every live session of the acting identity, optionally sparing one
    ///
    /// # Returns
    ///
    /// * `AuthResult<u64>` - Number of sessions revoked
    pub async fn revoke_all(
        &self,
        ctx: TenantContext,
        except: Option<Uuid>,
        reason: &str,
    ) -> AuthResult<u64> {
        let identity_id = ctx.require_identity()?;
        let revoked = self
            .repo
            .revoke_all(ctx.tenant_id, identity_id, except, reason, self.clock.now())
            .await?;

        log::info!(
            "Revoked {} sessions of identity {} in tenant {}: {}",
            revoked,
            identity_id,
            ctx.tenant_id,
            reason
        );
        Ok(revoked)
    }

    /// Live sessions of the acting identity, most recently active first
    pub async fn list_active(&self, ctx: TenantContext) -> AuthResult<Vec<Session>> {
        let identity_id = ctx.require_identity()?;
        self.repo
            .list_active(ctx.tenant_id, identity_id, self.clock.now())
            .await
    }

    pub async fn touch(&self, session_id: Uuid) -> AuthResult<()> {
        self.repo.touch(session_id, self.clock.now()).await
    }

    /// Revoke every session past its expiry
    pub async fn sweep_expired(&self) -> AuthResult<u64> {
        let swept = self.repo.revoke_expired(self.clock.now()).await?;
        if swept > 0 {
            log::info!("Expired {} sessions", swept);
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, ManualClock};
    use crate::db::{IdentityRepository, MemoryStore};
    use crate::identity::Identity;
    use crate::session::models::{REASON_LOGOUT, REASON_PASSWORD_CHANGED};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        store: SessionStore,
        clock: ManualClock,
        identity: Identity,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let repo = Arc::new(MemoryStore::new());
        let identity = Identity::new(Uuid::new_v4(), "s@example.com", "s", "hash".into(), clock.now());
        IdentityRepository::create(repo.as_ref(), &identity).await.unwrap();

        let hasher =
            Arc::new(CredentialHasher::new("pepper-pepper-pe", b"0123456789abcdef0123456789abcdef").unwrap());
        let store = SessionStore::new(repo, hasher, 5, Arc::new(clock.clone()));
        Fixture {
            store,
            clock,
            identity,
        }
    }

    fn pair(clock: &ManualClock, tag: &str) -> TokenPair {
        TokenPair {
            access_token: format!("access-{tag}"),
            refresh_token: format!("refresh-{tag}"),
            expires_at: clock.now() + Duration::minutes(15),
            refresh_expires_at: clock.now() + Duration::days(7),
            token_type: "Bearer".into(),
        }
    }

    #[tokio::test]
    async fn test_tokens_are_hashed() {
        let f = fixture().await;
        let p = pair(&f.clock, "a");
        let session = f
            .store
            .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &p)
            .await
            .unwrap();

        assert_ne!(session.hashed_access_token, p.access_token);
        assert_eq!(session.hashed_access_token.len(), 64);
    }

    #[tokio::test]
    async fn test_sixth_session_evicts_least_recent() {
        let f = fixture().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let p = pair(&f.clock, &i.to_string());
            let s = f
                .store
                .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &p)
                .await
                .unwrap();
            ids.push(s.id);
            f.clock.advance(Duration::seconds(1));
        }

        // Session 0 becomes recent; session 1 is now the oldest
        f.store.validate("access-0", f.identity.id).await.unwrap();
        f.clock.advance(Duration::seconds(1));

        f.store
            .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &pair(&f.clock, "new"))
            .await
            .unwrap();

        let ctx = TenantContext::identity(f.identity.tenant_id, f.identity.id);
        let active = f.store.list_active(ctx).await.unwrap();
        assert_eq!(active.len(), 5);
        assert!(!active.iter().any(|s| s.id == ids[1]));
        assert!(active.iter().any(|s| s.id == ids[0]));

        let err = f.store.validate("access-1", f.identity.id).await.unwrap_err();
        assert!(matches!(err, AuthError::SessionInactive));
    }

    #[tokio::test]
    async fn test_validate_rejects_foreign_identity_and_expiry() {
        let f = fixture().await;
        f.store
            .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &pair(&f.clock, "a"))
            .await
            .unwrap();

        assert!(f.store.validate("access-a", Uuid::new_v4()).await.is_err());
        assert!(f.store.validate("unknown", f.identity.id).await.is_err());

        f.clock.advance(Duration::days(8));
        assert!(f.store.validate("access-a", f.identity.id).await.is_err());
    }

    #[tokio::test]
    async fn test_rotate_replaces_both_hashes() {
        let f = fixture().await;
        f.store
            .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &pair(&f.clock, "a"))
            .await
            .unwrap();

        let next = pair(&f.clock, "b");
        f.store.rotate("refresh-a", &next).await.unwrap();

        assert!(f.store.validate("access-a", f.identity.id).await.is_err());
        assert!(f.store.validate("access-b", f.identity.id).await.is_ok());
        assert!(matches!(
            f.store.rotate("refresh-a", &pair(&f.clock, "c")).await,
            Err(AuthError::SessionInactive)
        ));
    }

    #[tokio::test]
    async fn test_revoke_all_spares_current() {
        let f = fixture().await;
        let keep = f
            .store
            .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &pair(&f.clock, "a"))
            .await
            .unwrap();
        f.store
            .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &pair(&f.clock, "b"))
            .await
            .unwrap();

        let ctx = TenantContext::identity(f.identity.tenant_id, f.identity.id);
        let revoked = f
            .store
            .revoke_all(ctx, Some(keep.id), REASON_PASSWORD_CHANGED)
            .await
            .unwrap();
        assert_eq!(revoked, 1);

        let active = f.store.list_active(ctx).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);

        f.store.revoke(ctx, keep.id, REASON_LOGOUT).await.unwrap();
        assert!(f.store.list_active(ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let f = fixture().await;
        f.store
            .create(f.identity.tenant_id, f.identity.id, DeviceInfo::default(), &pair(&f.clock, "a"))
            .await
            .unwrap();

        assert_eq!(f.store.sweep_expired().await.unwrap(), 0);
        f.clock.advance(Duration::days(7));
        assert_eq!(f.store.sweep_expired().await.unwrap(), 1);
    }
}
