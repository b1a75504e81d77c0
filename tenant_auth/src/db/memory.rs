//! In-memory implementation of every repository trait.
//!
//! All tables sit behind one mutex, so each trait method is atomic with respect to
//! every other. Used by tests and by embedders that do not need durability.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::repository::{
    ApiTokenRepository, IdentityRepository, MfaRepository, RateLimitRepository, SessionRepository,
    SsoRepository,
};
use crate::errors::{AuthError, AuthResult};
use crate::identity::{FailedLogin, Identity};
use crate::mfa::models::{BackupCode, MfaDevice};
use crate::session::models::{REASON_EXCEEDED_MAX_SESSIONS, Session};
use crate::sso::models::{
    ExternalUserInfo, Resolution, SsoProvider, SsoResolution, SsoSession, SsoSessionStatus,
    SsoUserMapping,
};
use crate::token::ApiToken;

#[derive(Default)]
struct Tables {
    identities: HashMap<Uuid, Identity>,
    sessions: HashMap<Uuid, Session>,
    devices: HashMap<Uuid, MfaDevice>,
    backup_codes: Vec<BackupCode>,
    providers: HashMap<Uuid, SsoProvider>,
    sso_sessions: HashMap<Uuid, SsoSession>,
    mappings: Vec<SsoUserMapping>,
    api_tokens: HashMap<Uuid, ApiToken>,
    windows: HashMap<(Uuid, DateTime<Utc>), u32>,
    spent_pre_auth: HashMap<Uuid, DateTime<Utc>>,
}

/// Mutex-guarded in-memory store
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> AuthResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| AuthError::StoreUnavailable("memory store lock poisoned".into()))
    }
}

impl Tables {
    fn email_taken(&self, tenant_id: Uuid, email: &str) -> bool {
        self.identities
            .values()
            .any(|i| i.tenant_id == tenant_id && i.email == email)
    }
}

#[async_trait]
impl IdentityRepository for MemoryStore {
    async fn create(&self, identity: &Identity) -> AuthResult<()> {
        let mut t = self.tables()?;
        if t.email_taken(identity.tenant_id, &identity.email) {
            return Err(AuthError::Conflict("email already registered".into()));
        }
        t.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Option<Identity>> {
        let t = self.tables()?;
        Ok(t.identities
            .get(&identity_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_by_email(&self, tenant_id: Uuid, email: &str) -> AuthResult<Option<Identity>> {
        let t = self.tables()?;
        Ok(t.identities
            .values()
            .find(|i| i.tenant_id == tenant_id && i.email == email)
            .cloned())
    }

    async fn update_password(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        let mut t = self.tables()?;
        let identity = t
            .identities
            .get_mut(&identity_id)
            .filter(|i| i.tenant_id == tenant_id)
            .ok_or(AuthError::NotFound("identity"))?;
        identity.password_hash = Some(password_hash.to_string());
        identity.updated_at = now;
        Ok(())
    }

    async fn record_failed_login(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        threshold: u32,
        lock_for: Duration,
        now: DateTime<Utc>,
    ) -> AuthResult<FailedLogin> {
        let mut t = self.tables()?;
        let identity = t
            .identities
            .get_mut(&identity_id)
            .filter(|i| i.tenant_id == tenant_id)
            .ok_or(AuthError::NotFound("identity"))?;

        // A lapsed lock starts a fresh count
        if identity.locked_until.is_some_and(|until| until <= now) {
            identity.failed_login_count = 0;
            identity.locked_until = None;
        }
        identity.failed_login_count += 1;
        if identity.failed_login_count >= threshold {
            identity.locked_until = Some(now + lock_for);
        }
        identity.updated_at = now;

        Ok(FailedLogin {
            failed_login_count: identity.failed_login_count,
            locked_until: identity.locked_until,
        })
    }

    async fn record_successful_login(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        let mut t = self.tables()?;
        if let Some(identity) = t
            .identities
            .get_mut(&identity_id)
            .filter(|i| i.tenant_id == tenant_id)
        {
            identity.failed_login_count = 0;
            identity.locked_until = None;
            identity.last_login_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn admit(
        &self,
        session: &Session,
        max_active: usize,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<Uuid>> {
        let mut t = self.tables()?;

        let mut live: Vec<(DateTime<Utc>, Uuid)> = t
            .sessions
            .values()
            .filter(|s| {
                s.tenant_id == session.tenant_id
                    && s.identity_id == session.identity_id
                    && s.is_live(now)
            })
            .map(|s| (s.last_activity, s.id))
            .collect();
        live.sort();

        let excess = (live.len() + 1).saturating_sub(max_active);
        let evicted: Vec<Uuid> = live.iter().take(excess).map(|(_, id)| *id).collect();
        for id in &evicted {
            if let Some(s) = t.sessions.get_mut(id) {
                s.revoke(REASON_EXCEEDED_MAX_SESSIONS, now);
            }
        }

        t.sessions.insert(session.id, session.clone());
        Ok(evicted)
    }

    async fn find_by_access_hash(&self, hash: &str) -> AuthResult<Option<Session>> {
        let t = self.tables()?;
        Ok(t.sessions
            .values()
            .find(|s| s.hashed_access_token == hash)
            .cloned())
    }

    async fn find_by_refresh_hash(&self, hash: &str) -> AuthResult<Option<Session>> {
        let t = self.tables()?;
        Ok(t.sessions
            .values()
            .find(|s| s.hashed_refresh_token == hash)
            .cloned())
    }

    async fn rotate_tokens(
        &self,
        old_refresh_hash: &str,
        new_access_hash: &str,
        new_refresh_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Session>> {
        let mut t = self.tables()?;
        let Some(session) = t
            .sessions
            .values_mut()
            .find(|s| s.hashed_refresh_token == old_refresh_hash && s.is_live(now))
        else {
            return Ok(None);
        };

        session.hashed_access_token = new_access_hash.to_string();
        session.hashed_refresh_token = new_refresh_hash.to_string();
        session.expires_at = expires_at;
        session.last_activity = now;
        Ok(Some(session.clone()))
    }

    async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) -> AuthResult<()> {
        let mut t = self.tables()?;
        if let Some(s) = t.sessions.get_mut(&session_id).filter(|s| s.is_active) {
            s.last_activity = s.last_activity.max(now);
        }
        Ok(())
    }

    async fn revoke(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut t = self.tables()?;
        match t
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.tenant_id == tenant_id && s.is_active)
        {
            Some(s) => {
                s.revoke(reason, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_all(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        except: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        let mut t = self.tables()?;
        let mut count = 0;
        for s in t.sessions.values_mut().filter(|s| {
            s.tenant_id == tenant_id
                && s.identity_id == identity_id
                && s.is_active
                && Some(s.id) != except
        }) {
            s.revoke(reason, now);
            count += 1;
        }
        Ok(count)
    }

    async fn list_active(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<Session>> {
        let t = self.tables()?;
        let mut sessions: Vec<Session> = t
            .sessions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.identity_id == identity_id && s.is_live(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    async fn revoke_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let mut t = self.tables()?;
        let mut count = 0;
        for s in t
            .sessions
            .values_mut()
            .filter(|s| s.is_active && s.expires_at <= now)
        {
            s.revoke(crate::session::models::REASON_EXPIRED, now);
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl MfaRepository for MemoryStore {
    async fn create_device(&self, device: &MfaDevice, backup_codes: &[BackupCode]) -> AuthResult<()> {
        let mut t = self.tables()?;
        t.devices.insert(device.id, device.clone());
        t.backup_codes.extend_from_slice(backup_codes);
        Ok(())
    }

    async fn find_device(&self, tenant_id: Uuid, device_id: Uuid) -> AuthResult<Option<MfaDevice>> {
        let t = self.tables()?;
        Ok(t.devices
            .get(&device_id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_devices(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Vec<MfaDevice>> {
        let t = self.tables()?;
        let mut devices: Vec<MfaDevice> = t
            .devices
            .values()
            .filter(|d| d.tenant_id == tenant_id && d.identity_id == identity_id)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.created_at);
        Ok(devices)
    }

    async fn activate_device(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        step: i64,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut t = self.tables()?;
        let Some(device) = t
            .devices
            .get(&device_id)
            .filter(|d| d.tenant_id == tenant_id && !d.is_active)
            .cloned()
        else {
            return Ok(false);
        };

        let has_primary = t
            .devices
            .values()
            .any(|d| d.identity_id == device.identity_id && d.is_primary);

        if let Some(d) = t.devices.get_mut(&device_id) {
            d.is_active = true;
            d.is_primary = !has_primary;
            d.last_used_step = Some(step);
            d.last_used_at = Some(now);
        }
        if let Some(identity) = t.identities.get_mut(&device.identity_id) {
            identity.mfa_enabled = true;
            identity.updated_at = now;
        }

        let has_pending = t
            .backup_codes
            .iter()
            .any(|c| c.pending_device_id == Some(device_id));
        if has_pending {
            t.backup_codes.retain(|c| {
                !(c.tenant_id == device.tenant_id
                    && c.identity_id == device.identity_id
                    && c.pending_device_id != Some(device_id))
            });
            for code in t.backup_codes.iter_mut() {
                if code.pending_device_id == Some(device_id) {
                    code.pending_device_id = None;
                }
            }
        }
        Ok(true)
    }

    async fn record_totp_step(&self, device_id: Uuid, step: i64, now: DateTime<Utc>) -> AuthResult<bool> {
        let mut t = self.tables()?;
        match t.devices.get_mut(&device_id).filter(|d| d.is_active) {
            Some(d) if d.last_used_step.is_none_or(|last| last < step) => {
                d.last_used_step = Some(step);
                d.last_used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume_backup_code(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        hashed_code: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut t = self.tables()?;
        match t.backup_codes.iter_mut().find(|c| {
            c.tenant_id == tenant_id
                && c.identity_id == identity_id
                && c.pending_device_id.is_none()
                && !c.used
                && c.hashed_code == hashed_code
        }) {
            Some(code) => {
                code.used = true;
                code.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace_backup_codes(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        backup_codes: &[BackupCode],
    ) -> AuthResult<()> {
        let mut t = self.tables()?;
        t.backup_codes.retain(|c| {
            !(c.tenant_id == tenant_id && c.identity_id == identity_id && c.pending_device_id.is_none())
        });
        t.backup_codes.extend_from_slice(backup_codes);
        Ok(())
    }

    async fn count_unused_backup_codes(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<u64> {
        let t = self.tables()?;
        Ok(t.backup_codes
            .iter()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.identity_id == identity_id
                    && c.pending_device_id.is_none()
                    && !c.used
            })
            .count() as u64)
    }

    async fn disable(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<()> {
        let mut t = self.tables()?;
        t.devices
            .retain(|_, d| !(d.tenant_id == tenant_id && d.identity_id == identity_id));
        t.backup_codes
            .retain(|c| !(c.tenant_id == tenant_id && c.identity_id == identity_id));
        if let Some(identity) = t
            .identities
            .get_mut(&identity_id)
            .filter(|i| i.tenant_id == tenant_id)
        {
            identity.mfa_enabled = false;
        }
        Ok(())
    }

    async fn spend_pre_auth(&self, jti: Uuid, expires_at: DateTime<Utc>) -> AuthResult<bool> {
        let mut t = self.tables()?;
        if t.spent_pre_auth.contains_key(&jti) {
            return Ok(false);
        }
        t.spent_pre_auth.insert(jti, expires_at);
        Ok(true)
    }

    async fn purge_spent_pre_auth(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let mut t = self.tables()?;
        let before = t.spent_pre_auth.len();
        t.spent_pre_auth.retain(|_, expires_at| *expires_at > now);
        Ok((before - t.spent_pre_auth.len()) as u64)
    }
}

#[async_trait]
impl SsoRepository for MemoryStore {
    async fn create_provider(&self, provider: &SsoProvider) -> AuthResult<()> {
        let mut t = self.tables()?;
        t.providers.insert(provider.id, provider.clone());
        Ok(())
    }

    async fn find_provider(&self, tenant_id: Uuid, provider_id: Uuid) -> AuthResult<Option<SsoProvider>> {
        let t = self.tables()?;
        Ok(t.providers
            .get(&provider_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn create_session(&self, session: &SsoSession) -> AuthResult<()> {
        let mut t = self.tables()?;
        if t.sso_sessions.values().any(|s| s.state == session.state) {
            return Err(AuthError::Conflict("duplicate federation state".into()));
        }
        t.sso_sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session_by_state(&self, state: &str) -> AuthResult<Option<SsoSession>> {
        let t = self.tables()?;
        Ok(t.sso_sessions.values().find(|s| s.state == state).cloned())
    }

    async fn transition(
        &self,
        session_id: Uuid,
        from: SsoSessionStatus,
        to: SsoSessionStatus,
    ) -> AuthResult<bool> {
        let mut t = self.tables()?;
        match t.sso_sessions.get_mut(&session_id).filter(|s| s.status == from) {
            Some(s) => {
                s.status = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_session(
        &self,
        session: &SsoSession,
        info: &ExternalUserInfo,
        default_role: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<SsoResolution>> {
        let mut t = self.tables()?;

        let pending = t.sso_sessions.get(&session.id).is_some_and(|s| {
            s.status == SsoSessionStatus::Pending && s.expires_at > now
        });
        if !pending {
            return Ok(None);
        }

        let (tenant_id, provider_id) = (session.tenant_id, session.provider_id);

        // Resolve before mutating anything
        let mapped = t.mappings.iter().position(|m| {
            m.tenant_id == tenant_id
                && m.provider_id == provider_id
                && m.external_user_id == info.external_user_id
        });

        let resolution = match mapped {
            Some(index) => {
                let identity_id = t.mappings[index].identity_id;
                let identity = t
                    .identities
                    .get(&identity_id)
                    .filter(|i| i.tenant_id == tenant_id)
                    .cloned()
                    .ok_or(AuthError::NotFound("identity"))?;

                let mapping = &mut t.mappings[index];
                mapping.external_email = info.email.clone();
                mapping.external_name = info.name.clone();
                mapping.attributes = info.attributes.clone();
                mapping.updated_at = now;

                SsoResolution {
                    identity,
                    mapping: mapping.clone(),
                    resolution: Resolution::ExistingMapping,
                }
            }
            None => {
                let existing = t
                    .identities
                    .values()
                    .find(|i| i.tenant_id == tenant_id && !info.email.is_empty() && i.email == info.email)
                    .cloned();

                let (identity, resolution) = match existing {
                    Some(identity) => (identity, Resolution::LinkedByEmail),
                    None => {
                        let identity =
                            Identity::federated(tenant_id, &info.email, &info.name, default_role, now);
                        t.identities.insert(identity.id, identity.clone());
                        (identity, Resolution::Created)
                    }
                };

                let mapping = SsoUserMapping {
                    id: Uuid::new_v4(),
                    tenant_id,
                    identity_id: identity.id,
                    provider_id,
                    external_user_id: info.external_user_id.clone(),
                    external_email: info.email.clone(),
                    external_name: info.name.clone(),
                    attributes: info.attributes.clone(),
                    created_at: now,
                    updated_at: now,
                };
                t.mappings.push(mapping.clone());

                SsoResolution {
                    identity,
                    mapping,
                    resolution,
                }
            }
        };

        if let Some(s) = t.sso_sessions.get_mut(&session.id) {
            s.status = SsoSessionStatus::Completed;
        }
        Ok(Some(resolution))
    }

    async fn find_mapping(
        &self,
        tenant_id: Uuid,
        provider_id: Uuid,
        external_user_id: &str,
    ) -> AuthResult<Option<SsoUserMapping>> {
        let t = self.tables()?;
        Ok(t.mappings
            .iter()
            .find(|m| {
                m.tenant_id == tenant_id
                    && m.provider_id == provider_id
                    && m.external_user_id == external_user_id
            })
            .cloned())
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let mut t = self.tables()?;
        let mut count = 0;
        for s in t
            .sso_sessions
            .values_mut()
            .filter(|s| s.status == SsoSessionStatus::Pending && s.expires_at <= now)
        {
            s.status = SsoSessionStatus::Expired;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl ApiTokenRepository for MemoryStore {
    async fn create(&self, token: &ApiToken) -> AuthResult<()> {
        let mut t = self.tables()?;
        t.api_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> AuthResult<Option<ApiToken>> {
        let t = self.tables()?;
        Ok(t.api_tokens
            .values()
            .find(|tok| tok.token_hash == token_hash)
            .cloned())
    }

    async fn list(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Vec<ApiToken>> {
        let t = self.tables()?;
        let mut tokens: Vec<ApiToken> = t
            .api_tokens
            .values()
            .filter(|tok| tok.tenant_id == tenant_id && tok.identity_id == identity_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|tok| tok.created_at);
        Ok(tokens)
    }

    async fn revoke(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut t = self.tables()?;
        match t.api_tokens.get_mut(&token_id).filter(|tok| {
            tok.tenant_id == tenant_id && tok.identity_id == identity_id && tok.revoked_at.is_none()
        })
        {
            Some(tok) => {
                tok.revoked_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch(&self, token_id: Uuid, now: DateTime<Utc>) -> AuthResult<()> {
        let mut t = self.tables()?;
        if let Some(tok) = t.api_tokens.get_mut(&token_id) {
            tok.last_used_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitRepository for MemoryStore {
    async fn increment(
        &self,
        token_id: Uuid,
        window_start: DateTime<Utc>,
        _window_secs: i64,
        cap: u32,
    ) -> AuthResult<Option<u32>> {
        let mut t = self.tables()?;
        let count = t.windows.entry((token_id, window_start)).or_insert(0);
        if *count >= cap {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> AuthResult<u64> {
        let mut t = self.tables()?;
        let before = t.windows.len();
        t.windows.retain(|(_, start), _| *start >= cutoff);
        Ok((before - t.windows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(tenant_id: Uuid, identity_id: Uuid, last_activity: DateTime<Utc>) -> Session {
        Session {
            id: Uuid::new_v4(),
            identity_id,
            tenant_id,
            hashed_access_token: Uuid::new_v4().to_string(),
            hashed_refresh_token: Uuid::new_v4().to_string(),
            ip_address: None,
            user_agent: None,
            device_fingerprint: None,
            is_active: true,
            created_at: last_activity,
            last_activity,
            expires_at: last_activity + Duration::days(7),
            revoked_at: None,
            revoke_reason: None,
        }
    }

    #[tokio::test]
    async fn test_admit_evicts_least_recent() {
        let store = MemoryStore::new();
        let (tenant, identity) = (Uuid::new_v4(), Uuid::new_v4());
        let start = Utc::now();

        let mut ids = Vec::new();
        for i in 0..5 {
            let s = session(tenant, identity, start + Duration::seconds(i));
            ids.push(s.id);
            assert!(store.admit(&s, 5, start).await.unwrap().is_empty());
        }

        let sixth = session(tenant, identity, start + Duration::seconds(10));
        let evicted = store.admit(&sixth, 5, start).await.unwrap();
        assert_eq!(evicted, vec![ids[0]]);

        let live = store.list_active(tenant, identity, start).await.unwrap();
        assert_eq!(live.len(), 5);
    }

    #[tokio::test]
    async fn test_admit_ignores_other_tenants() {
        let store = MemoryStore::new();
        let identity = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..5 {
            store.admit(&session(Uuid::new_v4(), identity, now), 5, now).await.unwrap();
        }
        let evicted = store.admit(&session(Uuid::new_v4(), identity, now), 5, now).await.unwrap();
        assert!(evicted.is_empty());
    }

    #[tokio::test]
    async fn test_revoked_session_stays_revoked() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let s = session(Uuid::new_v4(), Uuid::new_v4(), now);
        store.admit(&s, 5, now).await.unwrap();

        assert!(SessionRepository::revoke(&store, s.tenant_id, s.id, "logout", now).await.unwrap());
        assert!(!SessionRepository::revoke(&store, s.tenant_id, s.id, "again", now).await.unwrap());

        let stored = store.find_by_access_hash(&s.hashed_access_token).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.revoke_reason.as_deref(), Some("logout"));
    }

    #[tokio::test]
    async fn test_failed_login_locks_at_threshold() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let identity = Identity::new(Uuid::new_v4(), "a@example.com", "a", "hash".into(), now);
        IdentityRepository::create(&store, &identity).await.unwrap();

        for attempt in 1..=4 {
            let outcome = store
                .record_failed_login(identity.tenant_id, identity.id, 5, Duration::minutes(15), now)
                .await
                .unwrap();
            assert_eq!(outcome.failed_login_count, attempt);
            assert!(outcome.locked_until.is_none());
        }

        let locked = store
            .record_failed_login(identity.tenant_id, identity.id, 5, Duration::minutes(15), now)
            .await
            .unwrap();
        assert_eq!(locked.locked_until, Some(now + Duration::minutes(15)));

        let later = now + Duration::minutes(20);
        let fresh = store
            .record_failed_login(identity.tenant_id, identity.id, 5, Duration::minutes(15), later)
            .await
            .unwrap();
        assert_eq!(fresh.failed_login_count, 1);
        assert!(fresh.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        IdentityRepository::create(&store, &Identity::new(tenant, "a@example.com", "a", "h".into(), now))
            .await
            .unwrap();

        let err = IdentityRepository::create(&store, &Identity::new(tenant, "A@example.com", "b", "h".into(), now))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));

        IdentityRepository::create(&store, &Identity::new(Uuid::new_v4(), "a@example.com", "c", "h".into(), now))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_totp_step_must_advance() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let device = MfaDevice {
            id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            device_type: crate::mfa::models::MfaDeviceType::Totp,
            secret: "SECRET".into(),
            address: None,
            is_active: false,
            is_primary: false,
            last_used_step: None,
            last_used_at: None,
            created_at: now,
        };
        store.create_device(&device, &[]).await.unwrap();
        assert!(store.activate_device(device.tenant_id, device.id, 100, now).await.unwrap());
        assert!(!store.activate_device(device.tenant_id, device.id, 100, now).await.unwrap());

        assert!(!store.record_totp_step(device.id, 100, now).await.unwrap());
        assert!(store.record_totp_step(device.id, 101, now).await.unwrap());
        assert!(!store.record_totp_step(device.id, 99, now).await.unwrap());
    }
}
