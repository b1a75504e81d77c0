//! PostgreSQL implementation of every repository trait.
//!
//! Multi-step mutations run inside one `pool.begin()` transaction with row locks
//! (`SELECT ... FOR UPDATE`); single-row races are closed with conditional
//! `UPDATE ... WHERE` and `INSERT ... ON CONFLICT`. Every statement is bounded by
//! [`with_default_timeout`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::repository::{
    ApiTokenRepository, IdentityRepository, MfaRepository, RateLimitRepository, SessionRepository,
    SsoRepository,
};
use super::timeouts::{with_default_timeout, with_long_timeout};
use crate::errors::{AuthError, AuthResult};
use crate::identity::{FailedLogin, Identity};
use crate::mfa::models::{BackupCode, MfaDevice, MfaDeviceType};
use crate::session::models::{REASON_EXCEEDED_MAX_SESSIONS, REASON_EXPIRED, Session};
use crate::sso::models::{
    ExternalUserInfo, ProviderStatus, Resolution, SsoProvider, SsoResolution, SsoSession,
    SsoSessionStatus, SsoUserMapping,
};
use crate::token::ApiToken;

const IDENTITY_COLUMNS: &str = "id, tenant_id, email, username, password_hash, role, permissions, \
     is_active, mfa_enabled, failed_login_count, locked_until, email_verified, sso_origin, \
     created_at, updated_at, last_login_at";

const SESSION_COLUMNS: &str = "id, identity_id, tenant_id, hashed_access_token, hashed_refresh_token, \
     ip_address, user_agent, device_fingerprint, is_active, created_at, last_activity, expires_at, \
     revoked_at, revoke_reason";

const DEVICE_COLUMNS: &str = "id, identity_id, tenant_id, device_type, secret, address, is_active, \
     is_primary, last_used_step, last_used_at, created_at";

const MAPPING_COLUMNS: &str = "id, tenant_id, identity_id, provider_id, external_user_id, \
     external_email, external_name, attributes, created_at, updated_at";

const API_TOKEN_COLUMNS: &str = "id, tenant_id, identity_id, name, token_hash, token_prefix, scopes, \
     rate_limit_rps, expires_at, last_used_at, revoked_at, created_at";

/// sqlx-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_json<T: Serialize>(value: &T) -> AuthResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> AuthResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn unique_violation(err: sqlx::Error, what: &str) -> AuthError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            AuthError::Conflict(format!("{what} already exists"))
        }
        other => AuthError::Database(other),
    }
}

fn identity_from_row(row: &PgRow) -> AuthResult<Identity> {
    Ok(Identity {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role: row.try_get("role")?,
        permissions: from_json(row.try_get("permissions")?)?,
        is_active: row.try_get("is_active")?,
        mfa_enabled: row.try_get("mfa_enabled")?,
        failed_login_count: row.try_get::<i32, _>("failed_login_count")?.max(0) as u32,
        locked_until: row.try_get("locked_until")?,
        email_verified: row.try_get("email_verified")?,
        sso_origin: row.try_get("sso_origin")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_login_at: row.try_get("last_login_at")?,
    })
}

fn session_from_row(row: &PgRow) -> AuthResult<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        tenant_id: row.try_get("tenant_id")?,
        hashed_access_token: row.try_get("hashed_access_token")?,
        hashed_refresh_token: row.try_get("hashed_refresh_token")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        device_fingerprint: row.try_get("device_fingerprint")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        last_activity: row.try_get("last_activity")?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        revoke_reason: row.try_get("revoke_reason")?,
    })
}

fn device_from_row(row: &PgRow) -> AuthResult<MfaDevice> {
    let device_type: String = row.try_get("device_type")?;
    Ok(MfaDevice {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        tenant_id: row.try_get("tenant_id")?,
        device_type: MfaDeviceType::parse(&device_type)
            .ok_or_else(|| AuthError::StoreUnavailable(format!("unknown device type {device_type}")))?,
        secret: row.try_get("secret")?,
        address: row.try_get("address")?,
        is_active: row.try_get("is_active")?,
        is_primary: row.try_get("is_primary")?,
        last_used_step: row.try_get("last_used_step")?,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn provider_from_row(row: &PgRow) -> AuthResult<SsoProvider> {
    let status: String = row.try_get("status")?;
    Ok(SsoProvider {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        status: if status == "active" {
            ProviderStatus::Active
        } else {
            ProviderStatus::Disabled
        },
        config: from_json(row.try_get("configuration")?)?,
        allowed_redirect_uris: from_json(row.try_get("allowed_redirect_uris")?)?,
        default_role: row.try_get("default_role")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sso_session_from_row(row: &PgRow) -> AuthResult<SsoSession> {
    let status: String = row.try_get("status")?;
    Ok(SsoSession {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        provider_id: row.try_get("provider_id")?,
        state: row.try_get("state")?,
        nonce: row.try_get("nonce")?,
        redirect_uri: row.try_get("redirect_uri")?,
        status: SsoSessionStatus::parse(&status)
            .ok_or_else(|| AuthError::StoreUnavailable(format!("unknown sso status {status}")))?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn mapping_from_row(row: &PgRow) -> AuthResult<SsoUserMapping> {
    Ok(SsoUserMapping {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        identity_id: row.try_get("identity_id")?,
        provider_id: row.try_get("provider_id")?,
        external_user_id: row.try_get("external_user_id")?,
        external_email: row.try_get("external_email")?,
        external_name: row.try_get("external_name")?,
        attributes: from_json(row.try_get("attributes")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn api_token_from_row(row: &PgRow) -> AuthResult<ApiToken> {
    Ok(ApiToken {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        identity_id: row.try_get("identity_id")?,
        name: row.try_get("name")?,
        token_hash: row.try_get("token_hash")?,
        token_prefix: row.try_get("token_prefix")?,
        scopes: from_json(row.try_get("scopes")?)?,
        rate_limit_rps: row.try_get::<i32, _>("rate_limit_rps")?.max(0) as u32,
        expires_at: row.try_get("expires_at")?,
        last_used_at: row.try_get("last_used_at")?,
        revoked_at: row.try_get("revoked_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl IdentityRepository for PgStore {
    async fn create(&self, identity: &Identity) -> AuthResult<()> {
        with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO identities (id, tenant_id, email, username, password_hash, role, permissions,
                    is_active, mfa_enabled, failed_login_count, locked_until, email_verified, sso_origin,
                    created_at, updated_at, last_login_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(identity.id)
            .bind(identity.tenant_id)
            .bind(&identity.email)
            .bind(&identity.username)
            .bind(&identity.password_hash)
            .bind(&identity.role)
            .bind(to_json(&identity.permissions)?)
            .bind(identity.is_active)
            .bind(identity.mfa_enabled)
            .bind(identity.failed_login_count as i32)
            .bind(identity.locked_until)
            .bind(identity.email_verified)
            .bind(identity.sso_origin)
            .bind(identity.created_at)
            .bind(identity.updated_at)
            .bind(identity.last_login_at)
            .execute(&self.pool),
        )
        .await
        .map_err(|e| match e {
            super::timeouts::TimeoutError::Database(db) => unique_violation(db, "identity email"),
            other => other.into(),
        })?;
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE tenant_id = $1 AND id = $2");
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(identity_id)
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(identity_from_row).transpose()
    }

    async fn find_by_email(&self, tenant_id: Uuid, email: &str) -> AuthResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE tenant_id = $1 AND email = $2");
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(email)
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(identity_from_row).transpose()
    }

    async fn update_password(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        let result = with_default_timeout(
            sqlx::query(
                "UPDATE identities SET password_hash = $3, updated_at = $4 WHERE tenant_id = $1 AND id = $2",
            )
            .bind(tenant_id)
            .bind(identity_id)
            .bind(password_hash)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound("identity"));
        }
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
        // A lapsed lock starts a fresh count
        let row = with_default_timeout(
            sqlx::query(
                r#"
                UPDATE identities
                SET failed_login_count = CASE
                        WHEN locked_until IS NOT NULL AND locked_until <= $4 THEN 1
                        ELSE failed_login_count + 1
                    END,
                    locked_until = CASE
                        WHEN locked_until IS NOT NULL AND locked_until <= $4 THEN
                            CASE WHEN 1 >= $3 THEN $5 ELSE NULL END
                        WHEN failed_login_count + 1 >= $3 THEN $5
                        ELSE locked_until
                    END,
                    updated_at = $4
                WHERE tenant_id = $1 AND id = $2
                RETURNING failed_login_count, locked_until
                "#,
            )
            .bind(tenant_id)
            .bind(identity_id)
            .bind(threshold as i32)
            .bind(now)
            .bind(now + lock_for)
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or(AuthError::NotFound("identity"))?;

        Ok(FailedLogin {
            failed_login_count: row.try_get::<i32, _>("failed_login_count")?.max(0) as u32,
            locked_until: row.try_get("locked_until")?,
        })
    }

    async fn record_successful_login(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        with_default_timeout(
            sqlx::query(
                r#"
                UPDATE identities
                SET failed_login_count = 0, locked_until = NULL, last_login_at = $3
                WHERE tenant_id = $1 AND id = $2
                "#,
            )
            .bind(tenant_id)
            .bind(identity_id)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for PgStore {
    async fn admit(
        &self,
        session: &Session,
        max_active: usize,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent logins of the same identity
        with_default_timeout(
            sqlx::query("SELECT id FROM identities WHERE tenant_id = $1 AND id = $2 FOR UPDATE")
                .bind(session.tenant_id)
                .bind(session.identity_id)
                .fetch_optional(&mut *tx),
        )
        .await?
        .ok_or(AuthError::NotFound("identity"))?;

        let live = with_default_timeout(
            sqlx::query(
                r#"
                SELECT id FROM sessions
                WHERE tenant_id = $1 AND identity_id = $2 AND is_active AND expires_at > $3
                ORDER BY last_activity ASC, id ASC
                FOR UPDATE
                "#,
            )
            .bind(session.tenant_id)
            .bind(session.identity_id)
            .bind(now)
            .fetch_all(&mut *tx),
        )
        .await?;

        let excess = (live.len() + 1).saturating_sub(max_active);
        let evicted = live
            .iter()
            .take(excess)
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;

        if !evicted.is_empty() {
            with_default_timeout(
                sqlx::query(
                    r#"
                    UPDATE sessions SET is_active = FALSE, revoked_at = $2, revoke_reason = $3
                    WHERE id = ANY($1) AND is_active
                    "#,
                )
                .bind(&evicted)
                .bind(now)
                .bind(REASON_EXCEEDED_MAX_SESSIONS)
                .execute(&mut *tx),
            )
            .await?;
        }

        with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO sessions (id, identity_id, tenant_id, hashed_access_token, hashed_refresh_token,
                    ip_address, user_agent, device_fingerprint, is_active, created_at, last_activity,
                    expires_at, revoked_at, revoke_reason)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(session.id)
            .bind(session.identity_id)
            .bind(session.tenant_id)
            .bind(&session.hashed_access_token)
            .bind(&session.hashed_refresh_token)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .bind(&session.device_fingerprint)
            .bind(session.is_active)
            .bind(session.created_at)
            .bind(session.last_activity)
            .bind(session.expires_at)
            .bind(session.revoked_at)
            .bind(&session.revoke_reason)
            .execute(&mut *tx),
        )
        .await?;

        tx.commit().await?;
        Ok(evicted)
    }

    async fn find_by_access_hash(&self, hash: &str) -> AuthResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE hashed_access_token = $1");
        let row = with_default_timeout(sqlx::query(&sql).bind(hash).fetch_optional(&self.pool)).await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_by_refresh_hash(&self, hash: &str) -> AuthResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE hashed_refresh_token = $1");
        let row = with_default_timeout(sqlx::query(&sql).bind(hash).fetch_optional(&self.pool)).await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn rotate_tokens(
        &self,
        old_refresh_hash: &str,
        new_access_hash: &str,
        new_refresh_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Session>> {
        let sql = format!(
            r#"
            UPDATE sessions
            SET hashed_access_token = $2, hashed_refresh_token = $3, expires_at = $4, last_activity = $5
            WHERE hashed_refresh_token = $1 AND is_active AND expires_at > $5
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(old_refresh_hash)
                .bind(new_access_hash)
                .bind(new_refresh_hash)
                .bind(expires_at)
                .bind(now)
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) -> AuthResult<()> {
        with_default_timeout(
            sqlx::query(
                "UPDATE sessions SET last_activity = GREATEST(last_activity, $2) WHERE id = $1 AND is_active",
            )
            .bind(session_id)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn revoke(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let result = with_default_timeout(
            sqlx::query(
                r#"
                UPDATE sessions SET is_active = FALSE, revoked_at = $3, revoke_reason = $4
                WHERE tenant_id = $1 AND id = $2 AND is_active
                "#,
            )
            .bind(tenant_id)
            .bind(session_id)
            .bind(now)
            .bind(reason)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_all(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        except: Option<Uuid>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<u64> {
        let result = with_default_timeout(
            sqlx::query(
                r#"
                UPDATE sessions SET is_active = FALSE, revoked_at = $4, revoke_reason = $5
                WHERE tenant_id = $1 AND identity_id = $2 AND is_active
                  AND ($3::uuid IS NULL OR id <> $3)
                "#,
            )
            .bind(tenant_id)
            .bind(identity_id)
            .bind(except)
            .bind(now)
            .bind(reason)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_active(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<Session>> {
        let sql = format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE tenant_id = $1 AND identity_id = $2 AND is_active AND expires_at > $3
            ORDER BY last_activity DESC
            "#
        );
        let rows = with_default_timeout(
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(identity_id)
                .bind(now)
                .fetch_all(&self.pool),
        )
        .await?;

        rows.iter().map(session_from_row).collect()
    }

    async fn revoke_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let result = with_long_timeout(
            sqlx::query(
                r#"
                UPDATE sessions SET is_active = FALSE, revoked_at = $1, revoke_reason = $2
                WHERE is_active AND expires_at <= $1
                "#,
            )
            .bind(now)
            .bind(REASON_EXPIRED)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }
}

impl PgStore {
    async fn insert_backup_codes(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        backup_codes: &[BackupCode],
    ) -> AuthResult<()> {
        for code in backup_codes {
            with_default_timeout(
                sqlx::query(
                    r#"
                    INSERT INTO backup_codes (id, identity_id, tenant_id, hashed_code, pending_device_id,
                        used, used_at, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(code.id)
                .bind(code.identity_id)
                .bind(code.tenant_id)
                .bind(&code.hashed_code)
                .bind(code.pending_device_id)
                .bind(code.used)
                .bind(code.used_at)
                .bind(code.created_at)
                .execute(&mut **tx),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MfaRepository for PgStore {
    async fn create_device(&self, device: &MfaDevice, backup_codes: &[BackupCode]) -> AuthResult<()> {
        let mut tx = self.pool.begin().await?;

        with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO mfa_devices (id, identity_id, tenant_id, device_type, secret, address,
                    is_active, is_primary, last_used_step, last_used_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(device.id)
            .bind(device.identity_id)
            .bind(device.tenant_id)
            .bind(device.device_type.as_str())
            .bind(&device.secret)
            .bind(&device.address)
            .bind(device.is_active)
            .bind(device.is_primary)
            .bind(device.last_used_step)
            .bind(device.last_used_at)
            .bind(device.created_at)
            .execute(&mut *tx),
        )
        .await?;

        Self::insert_backup_codes(&mut tx, backup_codes).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_device(&self, tenant_id: Uuid, device_id: Uuid) -> AuthResult<Option<MfaDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM mfa_devices WHERE tenant_id = $1 AND id = $2");
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(device_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn list_devices(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Vec<MfaDevice>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM mfa_devices WHERE tenant_id = $1 AND identity_id = $2 ORDER BY created_at"
        );
        let rows = with_default_timeout(
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(identity_id)
                .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn activate_device(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        step: i64,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = with_default_timeout(
            sqlx::query(
                "SELECT identity_id FROM mfa_devices WHERE tenant_id = $1 AND id = $2 AND NOT is_active FOR UPDATE",
            )
            .bind(tenant_id)
            .bind(device_id)
            .fetch_optional(&mut *tx),
        )
        .await?
        else {
            return Ok(false);
        };
        let identity_id: Uuid = row.try_get("identity_id")?;

        let has_primary: bool = with_default_timeout(
            sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM mfa_devices WHERE identity_id = $1 AND is_primary)",
            )
            .bind(identity_id)
            .fetch_one(&mut *tx),
        )
        .await?;

        with_default_timeout(
            sqlx::query(
                r#"
                UPDATE mfa_devices
                SET is_active = TRUE, is_primary = $2, last_used_step = $3, last_used_at = $4
                WHERE id = $1
                "#,
            )
            .bind(device_id)
            .bind(!has_primary)
            .bind(step)
            .bind(now)
            .execute(&mut *tx),
        )
        .await?;

        with_default_timeout(
            sqlx::query("UPDATE identities SET mfa_enabled = TRUE, updated_at = $3 WHERE tenant_id = $1 AND id = $2")
                .bind(tenant_id)
                .bind(identity_id)
                .bind(now)
                .execute(&mut *tx),
        )
        .await?;

        // The device's pending batch replaces the live codes
        let has_pending: bool = with_default_timeout(
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM backup_codes WHERE pending_device_id = $1)")
                .bind(device_id)
                .fetch_one(&mut *tx),
        )
        .await?;
        if has_pending {
            with_default_timeout(
                sqlx::query(
                    r#"
                    DELETE FROM backup_codes
                    WHERE tenant_id = $1 AND identity_id = $2 AND pending_device_id IS DISTINCT FROM $3
                    "#,
                )
                .bind(tenant_id)
                .bind(identity_id)
                .bind(device_id)
                .execute(&mut *tx),
            )
            .await?;
            with_default_timeout(
                sqlx::query("UPDATE backup_codes SET pending_device_id = NULL WHERE pending_device_id = $1")
                    .bind(device_id)
                    .execute(&mut *tx),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_totp_step(&self, device_id: Uuid, step: i64, now: DateTime<Utc>) -> AuthResult<bool> {
        let result = with_default_timeout(
            sqlx::query(
                r#"
                UPDATE mfa_devices SET last_used_step = $2, last_used_at = $3
                WHERE id = $1 AND is_active AND (last_used_step IS NULL OR last_used_step < $2)
                "#,
            )
            .bind(device_id)
            .bind(step)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn consume_backup_code(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        hashed_code: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        // One conditional statement: at most one caller flips a given code
        let row = with_default_timeout(
            sqlx::query(
                r#"
                UPDATE backup_codes SET used = TRUE, used_at = $4
                WHERE id = (
                    SELECT id FROM backup_codes
                    WHERE tenant_id = $1 AND identity_id = $2 AND hashed_code = $3
                      AND pending_device_id IS NULL AND NOT used
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                AND NOT used
                RETURNING id
                "#,
            )
            .bind(tenant_id)
            .bind(identity_id)
            .bind(hashed_code)
            .bind(now)
            .fetch_optional(&self.pool),
        )
        .await?;
        Ok(row.is_some())
    }

    async fn replace_backup_codes(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        backup_codes: &[BackupCode],
    ) -> AuthResult<()> {
        let mut tx = self.pool.begin().await?;
        with_default_timeout(
            sqlx::query(
                "DELETE FROM backup_codes WHERE tenant_id = $1 AND identity_id = $2 AND pending_device_id IS NULL",
            )
            .bind(tenant_id)
            .bind(identity_id)
            .execute(&mut *tx),
        )
        .await?;
        Self::insert_backup_codes(&mut tx, backup_codes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn count_unused_backup_codes(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<u64> {
        let count: i64 = with_default_timeout(
            sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM backup_codes
                WHERE tenant_id = $1 AND identity_id = $2 AND pending_device_id IS NULL AND NOT used
                "#,
            )
            .bind(tenant_id)
            .bind(identity_id)
            .fetch_one(&self.pool),
        )
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn disable(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<()> {
        let mut tx = self.pool.begin().await?;

        with_default_timeout(
            sqlx::query("DELETE FROM mfa_devices WHERE tenant_id = $1 AND identity_id = $2")
                .bind(tenant_id)
                .bind(identity_id)
                .execute(&mut *tx),
        )
        .await?;
        with_default_timeout(
            sqlx::query("DELETE FROM backup_codes WHERE tenant_id = $1 AND identity_id = $2")
                .bind(tenant_id)
                .bind(identity_id)
                .execute(&mut *tx),
        )
        .await?;
        with_default_timeout(
            sqlx::query("UPDATE identities SET mfa_enabled = FALSE WHERE tenant_id = $1 AND id = $2")
                .bind(tenant_id)
                .bind(identity_id)
                .execute(&mut *tx),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn spend_pre_auth(&self, jti: Uuid, expires_at: DateTime<Utc>) -> AuthResult<bool> {
        let result = with_default_timeout(
            sqlx::query(
                "INSERT INTO spent_pre_auth_tokens (jti, expires_at) VALUES ($1, $2) ON CONFLICT (jti) DO NOTHING",
            )
            .bind(jti)
            .bind(expires_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_spent_pre_auth(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let result = with_default_timeout(
            sqlx::query("DELETE FROM spent_pre_auth_tokens WHERE expires_at <= $1")
                .bind(now)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SsoRepository for PgStore {
    async fn create_provider(&self, provider: &SsoProvider) -> AuthResult<()> {
        with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO sso_providers (id, tenant_id, name, provider_type, status, configuration,
                    allowed_redirect_uris, default_role, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(provider.id)
            .bind(provider.tenant_id)
            .bind(&provider.name)
            .bind(provider.provider_type().as_str())
            .bind(match provider.status {
                ProviderStatus::Active => "active",
                ProviderStatus::Disabled => "disabled",
            })
            .bind(to_json(&provider.config)?)
            .bind(to_json(&provider.allowed_redirect_uris)?)
            .bind(&provider.default_role)
            .bind(provider.created_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn find_provider(&self, tenant_id: Uuid, provider_id: Uuid) -> AuthResult<Option<SsoProvider>> {
        let row = with_default_timeout(
            sqlx::query(
                r#"
                SELECT id, tenant_id, name, status, configuration, allowed_redirect_uris, default_role, created_at
                FROM sso_providers WHERE tenant_id = $1 AND id = $2
                "#,
            )
            .bind(tenant_id)
            .bind(provider_id)
            .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(provider_from_row).transpose()
    }

    async fn create_session(&self, session: &SsoSession) -> AuthResult<()> {
        with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO sso_sessions (id, tenant_id, provider_id, state, nonce, redirect_uri, status,
                    created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(session.id)
            .bind(session.tenant_id)
            .bind(session.provider_id)
            .bind(&session.state)
            .bind(&session.nonce)
            .bind(&session.redirect_uri)
            .bind(session.status.as_str())
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn find_session_by_state(&self, state: &str) -> AuthResult<Option<SsoSession>> {
        let row = with_default_timeout(
            sqlx::query(
                r#"
                SELECT id, tenant_id, provider_id, state, nonce, redirect_uri, status, created_at, expires_at
                FROM sso_sessions WHERE state = $1
                "#,
            )
            .bind(state)
            .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(sso_session_from_row).transpose()
    }

    async fn transition(
        &self,
        session_id: Uuid,
        from: SsoSessionStatus,
        to: SsoSessionStatus,
    ) -> AuthResult<bool> {
        let result = with_default_timeout(
            sqlx::query("UPDATE sso_sessions SET status = $3 WHERE id = $1 AND status = $2")
                .bind(session_id)
                .bind(from.as_str())
                .bind(to.as_str())
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_session(
        &self,
        session: &SsoSession,
        info: &ExternalUserInfo,
        default_role: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<SsoResolution>> {
        let mut tx = self.pool.begin().await?;

        let claimed = with_default_timeout(
            sqlx::query(
                r#"
                UPDATE sso_sessions SET status = 'completed', completed_at = $2
                WHERE id = $1 AND status = 'pending' AND expires_at > $2
                RETURNING id
                "#,
            )
            .bind(session.id)
            .bind(now)
            .fetch_optional(&mut *tx),
        )
        .await?;
        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let attributes = to_json(&info.attributes)?;
        let mapping_sql = format!(
            r#"
            UPDATE sso_user_mappings
            SET external_email = $4, external_name = $5, attributes = $6, updated_at = $7
            WHERE tenant_id = $1 AND provider_id = $2 AND external_user_id = $3
            RETURNING {MAPPING_COLUMNS}
            "#
        );
        let existing = with_default_timeout(
            sqlx::query(&mapping_sql)
                .bind(session.tenant_id)
                .bind(session.provider_id)
                .bind(&info.external_user_id)
                .bind(&info.email)
                .bind(&info.name)
                .bind(&attributes)
                .bind(now)
                .fetch_optional(&mut *tx),
        )
        .await?;

        let identity_sql =
            format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE tenant_id = $1 AND id = $2");

        if let Some(row) = existing {
            let mapping = mapping_from_row(&row)?;
            let identity_row = with_default_timeout(
                sqlx::query(&identity_sql)
                    .bind(session.tenant_id)
                    .bind(mapping.identity_id)
                    .fetch_optional(&mut *tx),
            )
            .await?
            .ok_or(AuthError::NotFound("identity"))?;
            let identity = identity_from_row(&identity_row)?;

            tx.commit().await?;
            return Ok(Some(SsoResolution {
                identity,
                mapping,
                resolution: Resolution::ExistingMapping,
            }));
        }

        let by_email_sql = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE tenant_id = $1 AND email = $2 FOR UPDATE"
        );
        let linked = if info.email.is_empty() {
            None
        } else {
            with_default_timeout(
                sqlx::query(&by_email_sql)
                    .bind(session.tenant_id)
                    .bind(&info.email)
                    .fetch_optional(&mut *tx),
            )
            .await?
        };

        let (identity, resolution) = match linked {
            Some(row) => (identity_from_row(&row)?, Resolution::LinkedByEmail),
            None => {
                let identity = Identity::federated(session.tenant_id, &info.email, &info.name, default_role, now);
                with_default_timeout(
                    sqlx::query(
                        r#"
                        INSERT INTO identities (id, tenant_id, email, username, password_hash, role, permissions,
                            is_active, mfa_enabled, failed_login_count, email_verified, sso_origin,
                            created_at, updated_at)
                        VALUES ($1, $2, $3, $4, NULL, $5, $6, TRUE, FALSE, 0, TRUE, TRUE, $7, $7)
                        "#,
                    )
                    .bind(identity.id)
                    .bind(identity.tenant_id)
                    .bind(&identity.email)
                    .bind(&identity.username)
                    .bind(&identity.role)
                    .bind(to_json(&identity.permissions)?)
                    .bind(now)
                    .execute(&mut *tx),
                )
                .await
                .map_err(|e| match e {
                    super::timeouts::TimeoutError::Database(db) => unique_violation(db, "identity email"),
                    other => other.into(),
                })?;
                (identity, Resolution::Created)
            }
        };

        let mapping = SsoUserMapping {
            id: Uuid::new_v4(),
            tenant_id: session.tenant_id,
            identity_id: identity.id,
            provider_id: session.provider_id,
            external_user_id: info.external_user_id.clone(),
            external_email: info.email.clone(),
            external_name: info.name.clone(),
            attributes: info.attributes.clone(),
            created_at: now,
            updated_at: now,
        };
        with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO sso_user_mappings (id, tenant_id, identity_id, provider_id, external_user_id,
                    external_email, external_name, attributes, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
                "#,
            )
            .bind(mapping.id)
            .bind(mapping.tenant_id)
            .bind(mapping.identity_id)
            .bind(mapping.provider_id)
            .bind(&mapping.external_user_id)
            .bind(&mapping.external_email)
            .bind(&mapping.external_name)
            .bind(&attributes)
            .bind(now)
            .execute(&mut *tx),
        )
        .await
        .map_err(|e| match e {
            super::timeouts::TimeoutError::Database(db) => unique_violation(db, "sso mapping"),
            other => other.into(),
        })?;

        tx.commit().await?;
        Ok(Some(SsoResolution {
            identity,
            mapping,
            resolution,
        }))
    }

    async fn find_mapping(
        &self,
        tenant_id: Uuid,
        provider_id: Uuid,
        external_user_id: &str,
    ) -> AuthResult<Option<SsoUserMapping>> {
        let sql = format!(
            r#"
            SELECT {MAPPING_COLUMNS} FROM sso_user_mappings
            WHERE tenant_id = $1 AND provider_id = $2 AND external_user_id = $3
            "#
        );
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(provider_id)
                .bind(external_user_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let result = with_long_timeout(
            sqlx::query("UPDATE sso_sessions SET status = 'expired' WHERE status = 'pending' AND expires_at <= $1")
                .bind(now)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ApiTokenRepository for PgStore {
    async fn create(&self, token: &ApiToken) -> AuthResult<()> {
        with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO api_tokens (id, tenant_id, identity_id, name, token_hash, token_prefix, scopes,
                    rate_limit_rps, expires_at, last_used_at, revoked_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(token.id)
            .bind(token.tenant_id)
            .bind(token.identity_id)
            .bind(&token.name)
            .bind(&token.token_hash)
            .bind(&token.token_prefix)
            .bind(to_json(&token.scopes)?)
            .bind(token.rate_limit_rps as i32)
            .bind(token.expires_at)
            .bind(token.last_used_at)
            .bind(token.revoked_at)
            .bind(token.created_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> AuthResult<Option<ApiToken>> {
        let sql = format!("SELECT {API_TOKEN_COLUMNS} FROM api_tokens WHERE token_hash = $1");
        let row = with_default_timeout(sqlx::query(&sql).bind(token_hash).fetch_optional(&self.pool)).await?;
        row.as_ref().map(api_token_from_row).transpose()
    }

    async fn list(&self, tenant_id: Uuid, identity_id: Uuid) -> AuthResult<Vec<ApiToken>> {
        let sql = format!(
            "SELECT {API_TOKEN_COLUMNS} FROM api_tokens WHERE tenant_id = $1 AND identity_id = $2 ORDER BY created_at"
        );
        let rows = with_default_timeout(
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(identity_id)
                .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(api_token_from_row).collect()
    }

    async fn revoke(
        &self,
        tenant_id: Uuid,
        identity_id: Uuid,
        token_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let result = with_default_timeout(
            sqlx::query(
                r#"
                UPDATE api_tokens SET revoked_at = $4
                WHERE tenant_id = $1 AND identity_id = $2 AND id = $3 AND revoked_at IS NULL
                "#,
            )
            .bind(tenant_id)
            .bind(identity_id)
            .bind(token_id)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch(&self, token_id: Uuid, now: DateTime<Utc>) -> AuthResult<()> {
        with_default_timeout(
            sqlx::query("UPDATE api_tokens SET last_used_at = $2 WHERE id = $1")
                .bind(token_id)
                .bind(now)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitRepository for PgStore {
    async fn increment(
        &self,
        token_id: Uuid,
        window_start: DateTime<Utc>,
        window_secs: i64,
        cap: u32,
    ) -> AuthResult<Option<u32>> {
        let row = with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO rate_limit_windows (token_id, window_start, window_size_seconds, request_count)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (token_id, window_start)
                DO UPDATE SET request_count = rate_limit_windows.request_count + 1
                WHERE rate_limit_windows.request_count < $4
                RETURNING request_count
                "#,
            )
            .bind(token_id)
            .bind(window_start)
            .bind(window_secs as i32)
            .bind(cap as i32)
            .fetch_optional(&self.pool),
        )
        .await?;

        row.map(|r| r.try_get::<i32, _>("request_count").map(|c| c.max(0) as u32))
            .transpose()
            .map_err(AuthError::from)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> AuthResult<u64> {
        let result = with_long_timeout(
            sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < $1")
                .bind(cutoff)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }
}
