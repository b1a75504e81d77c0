//! Repository trait definitions for testability and dependency injection.
//!
//! One trait per entity family. Every multi-step mutation that must not partially
//! apply is a single method that implementations execute atomically (one
//! transaction, or one conditional statement).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::errors::AuthResult;
use crate::identity::{FailedLogin, Identity};
use crate::mfa::models::{BackupCode, MfaDevice};
use crate::session::models::Session;
use crate::sso::models::{
    ExternalUserInfo, SsoProvider, SsoResolution, SsoSession, SsoSessionStatus, SsoUserMapping,
};
use crate::token::ApiToken;

/// Identity persistence and lockout counters
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    /// Insert a new identity
    ///
    /// Fails with `AuthError::Conflict` if the tenant already has the email.
    async fn create(&self, identity: &Identity) -> AuthResult<()>;

    async fn find_by_id(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Option<Identity>>;

    /// Find by normalized email
    async fn find_by_email(&self, tenant_id: Uuid, email: &str) -> AuthResult<Option<Identity>>;

    async fn update_password(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<()>;

    /// Atomically increment the failure counter, locking the identity for `lock_for`
    /// once the counter reaches `threshold`
    async fn record_failed_login(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        threshold: u32,
        lock_for: Duration,
        now: DateTime<Utc>,
    ) -> AuthResult<FailedLogin>;

    /// Reset the failure counter and stamp the login time
    async fn record_successful_login(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<()>;
}

/// Session persistence
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Count live sessions for the identity, revoke the least recently active ones
    /// until fewer than `max_active` remain, then insert `session`, all in one
    /// transaction
    ///
    /// Returns the ids of evicted sessions.
    async fn admit(
        &self,
        session: &Session,
        max_active: usize,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<Uuid>>;

    async fn find_by_access_hash(&self, hash: &str) -> AuthResult<Option<Session>>;

    async fn find_by_refresh_hash(&self, hash: &str) -> AuthResult<Option<Session>>;

    /// Replace both token hashes of the live session holding `old_refresh_hash`
    ///
    /// Returns `None` if no live session holds that hash.
    async fn rotate_tokens(
        &self,
        old_refresh_hash: &str,
        new_access_hash: &str,
        new_refresh_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Session>>;

    /// Bump `last_activity`
    async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) -> AuthResult<()>;

    /// Revoke one session; `false` if it was not active
    async fn revoke(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<bool>;

    /// Revoke every active session of an identity, optionally sparing one
    async fn revoke_all(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        except: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64>;

    async fn list_active(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<Session>>;

    /// Revoke active sessions past `expires_at`
    async fn revoke_expired(&self, now: DateTime<Utc>) -> AuthResult<u64>;
}

/// MFA device and backup-code persistence
#[async_trait]
pub trait MfaRepository: Send + Sync {
    /// Insert an inactive device together with its pending backup codes, in one
    /// transaction; the identity's live codes are left untouched
    async fn create_device(&self, device: &MfaDevice, backup_codes: &[BackupCode]) -> AuthResult<()>;

    async fn find_device(&self, tenant_id: Uuid, device_id: Uuid) -> AuthResult<Option<MfaDevice>>;

    async fn list_devices(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Vec<MfaDevice>>;

    /// Activate a pending device and enable MFA on its identity, in one transaction
    ///
    /// The device becomes primary if the identity has no primary device. If the
    /// device carries pending backup codes they replace the identity's live codes.
    /// Returns `false` if the device is missing or already active.
    async fn activate_device(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        step: i64,
        now: DateTime<Utc>,
    ) -> AuthResult<bool>;

    /// Record an accepted time step; succeeds only when `step` is after the last
    /// accepted one
    async fn record_totp_step(&self, device_id: Uuid, step: i64, now: DateTime<Utc>) -> AuthResult<bool>;

    /// Mark the matching unused live code as used; `false` if none matched
    async fn consume_backup_code(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        hashed_code: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<bool>;

    /// Replace the identity's live backup codes; pending batches are kept
    async fn replace_backup_codes(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        backup_codes: &[BackupCode],
    ) -> AuthResult<()>;

    async fn count_unused_backup_codes(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<u64>;

    /// Delete devices and backup codes and clear `mfa_enabled`, in one transaction
    async fn disable(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<()>;

    /// Mark a pre-auth token id as spent; `false` if it already was
    async fn spend_pre_auth(&self, jti: Uuid, expires_at: DateTime<Utc>) -> AuthResult<bool>;

    /// Forget spent pre-auth token ids whose tokens have expired
    async fn purge_spent_pre_auth(&self, now: DateTime<Utc>) -> AuthResult<u64>;
}

/// Federation persistence
#[async_trait]
pub trait SsoRepository: Send + Sync {
    async fn create_provider(&self, provider: &SsoProvider) -> AuthResult<()>;

    async fn find_provider(&self, tenant_id: Uuid, provider_id: Uuid) -> AuthResult<Option<SsoProvider>>;

    async fn create_session(&self, session: &SsoSession) -> AuthResult<()>;

    async fn find_session_by_state(&self, state: &str) -> AuthResult<Option<SsoSession>>;

    /// Conditional status change; `false` if the session was not in `from`
    async fn transition(
        &self,
        session_id: Uuid,
        from: SsoSessionStatus,
        to: SsoSessionStatus,
    ) -> AuthResult<bool>;

    /// Move a pending session to completed and resolve the local identity, in one
    /// transaction
    ///
    /// Resolution order: existing mapping, then identity with the same email in the
    /// tenant, then a new identity plus mapping. Returns `None` if the session was
    /// no longer pending.
    async fn complete_session(
        &self,
        session: &SsoSession,
        info: &ExternalUserInfo,
        default_role: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<SsoResolution>>;

    async fn find_mapping(
        &self,
        tenant_id: Uuid,
        provider_id: Uuid,
        external_user_id: &str,
    ) -> AuthResult<Option<SsoUserMapping>>;

    /// Move pending sessions past expiry to expired
    async fn expire_pending(&self, now: DateTime<Utc>) -> AuthResult<u64>;
}

/// API-token persistence
#[async_trait]
pub trait ApiTokenRepository: Send + Sync {
    async fn create(&self, token: &ApiToken) -> AuthResult<()>;

    async fn find_by_hash(&self, token_hash: &str) -> AuthResult<Option<ApiToken>>;

    async fn list(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Vec<ApiToken>>;

    /// `false` if the token was missing or already revoked
    async fn revoke(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<bool>;

    async fn touch(&self, token_id: Uuid, now: DateTime<Utc>) -> AuthResult<()>;
}

/// Fixed-window counters
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Insert the window row or increment it if below `cap`
    ///
    /// Returns the new count, or `None` when the window is already at `cap`.
    async fn increment(
        &self,
        token_id: Uuid,
        window_start: DateTime<Utc>,
        window_secs: i64,
        cap: u32,
    ) -> AuthResult<Option<u32>>;

    /// Delete windows that started before `cutoff`
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> AuthResult<u64>;
}
