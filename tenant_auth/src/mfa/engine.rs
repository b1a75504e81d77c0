//! Second-factor enrollment and challenges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::backup;
use super::models::{ChallengeOutcome, Enrollment, MfaDevice, MfaDeviceType};
use super::totp::{self, TotpParams};
use crate::config::MfaConfig;
use crate::context::{SharedClock, TenantContext};
use crate::crypto::CredentialHasher;
use crate::db::{IdentityRepository, MfaRepository};
use crate::errors::{AuthError, AuthResult, TokenRejection};
use crate::identity::Identity;

/// Delivers one-time codes for sms and email devices
#[async_trait]
pub trait OtpDispatcher: Send + Sync {
    async fn dispatch(&self, device: &MfaDevice, code: &str) -> AuthResult<()>;
}

/// Records that a code was dispatched; the code itself is never logged
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl OtpDispatcher for LogDispatcher {
    async fn dispatch(&self, device: &MfaDevice, _code: &str) -> AuthResult<()> {
        log::info!(
            "One-time code dispatched via {} to device {}",
            device.device_type.as_str(),
            device.id
        );
        Ok(())
    }
}

/// TOTP, delivered-code and backup-code verification
#[derive(Clone)]
pub struct MfaEngine {
    repo: Arc<dyn MfaRepository>,
    identities: Arc<dyn IdentityRepository>,
    hasher: Arc<CredentialHasher>,
    dispatcher: Arc<dyn OtpDispatcher>,
    config: MfaConfig,
    clock: SharedClock,
}

impl MfaEngine {
    pub fn new(
        repo: Arc<dyn MfaRepository>,
        identities: Arc<dyn IdentityRepository>,
        hasher: Arc<CredentialHasher>,
        config: MfaConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            repo,
            identities,
            hasher,
            dispatcher: Arc::new(LogDispatcher),
            config,
            clock,
        }
    }

    /// Replace the default logging dispatcher
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn OtpDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Parameters for a device kind; delivered codes live longer than app codes
    pub fn params_for(&self, device_type: MfaDeviceType) -> TotpParams {
        TotpParams {
            digits: self.config.totp_digits,
            period_secs: if device_type.is_delivered() {
                self.config.delivered_code_period_secs
            } else {
                self.config.totp_period_secs
            },
            skew: self.config.totp_skew,
        }
    }

    /// Start enrolling the first device of an identity
    ///
    /// The device stays inactive until [`verify_enrollment`](Self::verify_enrollment)
    /// proves possession. Its backup code batch only becomes usable at that point.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Tenant and acting identity
    /// * `device_type` - Kind of device
    /// * `address` - Phone number or email address, required for delivered codes
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Missing identity or delivery address
    /// * `AuthError::NotFound` - Identity does not exist in the tenant
    /// * `AuthError::Conflict` - MFA is already enabled; use [`enroll_additional`](Self::enroll_additional)
    pub async fn enroll(
        &self,
        ctx: TenantContext,
        device_type: MfaDeviceType,
        address: Option<String>,
    ) -> AuthResult<Enrollment> {
        let identity = self.acting_identity(ctx).await?;
        if identity.mfa_enabled {
            return Err(AuthError::Conflict("MFA already enabled".into()));
        }
        self.begin_enrollment(ctx, &identity, device_type, address).await
    }

    /// Start enrolling another device once MFA is on; requires a passing challenge
    ///
    /// # Errors
    ///
    /// * `AuthError::MfaNotEnabled` - No active device yet; use [`enroll`](Self::enroll)
    /// * `AuthError::InvalidMfaCode` - Challenge failed
    pub async fn enroll_additional(
        &self,
        ctx: TenantContext,
        device_type: MfaDeviceType,
        address: Option<String>,
        code: &str,
        is_backup_code: bool,
    ) -> AuthResult<Enrollment> {
        let identity = self.acting_identity(ctx).await?;
        self.challenge(ctx, code, is_backup_code, None).await?;
        self.begin_enrollment(ctx, &identity, device_type, address).await
    }

    async fn acting_identity(&self, ctx: TenantContext) -> AuthResult<Identity> {
        let identity_id = ctx.require_identity()?;
        self.identities
            .find_by_id(ctx.tenant_id, identity_id)
            .await?
            .ok_or(AuthError::NotFound("identity"))
    }

    async fn begin_enrollment(
        &self,
        ctx: TenantContext,
        identity: &Identity,
        device_type: MfaDeviceType,
        address: Option<String>,
    ) -> AuthResult<Enrollment> {
        let address = address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        if device_type.is_delivered() && address.is_none() {
            return Err(AuthError::Validation(format!(
                "{} device requires an address",
                device_type.as_str()
            )));
        }

        let now = self.clock.now();
        let secret = totp::generate_secret();
        let device = MfaDevice {
            id: Uuid::new_v4(),
            identity_id: identity.id,
            tenant_id: ctx.tenant_id,
            device_type,
            secret: secret.clone(),
            address,
            is_active: false,
            is_primary: false,
            last_used_step: None,
            last_used_at: None,
            created_at: now,
        };

        let batch = backup::generate(
            &self.hasher,
            ctx.tenant_id,
            identity.id,
            Some(device.id),
            self.config.backup_code_count,
            self.config.backup_code_length,
            now,
        );
        self.repo.create_device(&device, &batch.codes).await?;

        log::info!(
            "MFA {} device {} enrolled for identity {}",
            device_type.as_str(),
            device.id,
            identity.id
        );

        let (secret, qr_payload) = match device_type {
            MfaDeviceType::Totp => {
                let uri = totp::provisioning_uri(
                    &self.config.issuer,
                    &identity.email,
                    &secret,
                    self.params_for(device_type),
                );
                (Some(secret), Some(uri))
            }
            _ => {
                self.dispatch_current(&device).await?;
                (None, None)
            }
        };

        Ok(Enrollment {
            device_id: device.id,
            secret,
            qr_payload,
            backup_codes: batch.plaintext,
        })
    }

    /// Prove possession of a pending device and turn MFA on
    ///
    /// # Errors
    ///
    /// * `AuthError::NotFound` - Device unknown in the tenant or owned by another identity
    /// * `AuthError::Conflict` - Device already verified
    /// * `AuthError::InvalidMfaCode` - Code does not match
    pub async fn verify_enrollment(&self, ctx: TenantContext, device_id: Uuid, code: &str) -> AuthResult<()> {
        let identity_id = ctx.require_identity()?;
        let device = self
            .repo
            .find_device(ctx.tenant_id, device_id)
            .await?
            .filter(|d| d.identity_id == identity_id)
            .ok_or(AuthError::NotFound("MFA device"))?;

        if device.is_active {
            return Err(AuthError::Conflict("device already verified".into()));
        }

        let code = code.trim();
        let now = self.clock.now();
        let step = if totp::is_well_formed(code, self.config.totp_digits) {
            totp::verify(&device.secret, self.params_for(device.device_type), code, now)?
        } else {
            None
        };

        let Some(step) = step else {
            log::warn!(
                "MFA enrollment verification failed for identity {} device {}: code mismatch",
                identity_id,
                device_id
            );
            return Err(AuthError::InvalidMfaCode);
        };

        if !self.repo.activate_device(ctx.tenant_id, device_id, step, now).await? {
            return Err(AuthError::Conflict("device already verified".into()));
        }

        log::info!("MFA enabled for identity {} with device {}", identity_id, device_id);
        Ok(())
    }

    /// Verify a second factor for the acting identity
    ///
    /// Backup codes are consumed in the same statement that accepts them. Device codes
    /// are accepted once per time step. Every attempt is logged with its outcome.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Tenant and acting identity
    /// * `code` - Device code or backup code
    /// * `is_backup_code` - Treat `code` as a backup code
    /// * `device_id` - Restrict the check to one device; otherwise every active device is tried
    ///
    /// # Errors
    ///
    /// * `AuthError::MfaNotEnabled` - No active device
    /// * `AuthError::InvalidMfaCode` - Malformed, wrong, replayed or already used code
    pub async fn challenge(
        &self,
        ctx: TenantContext,
        code: &str,
        is_backup_code: bool,
        device_id: Option<Uuid>,
    ) -> AuthResult<ChallengeOutcome> {
        let identity_id = ctx.require_identity()?;
        let code = code.trim();
        let now = self.clock.now();

        let devices: Vec<MfaDevice> = self
            .repo
            .list_devices(ctx.tenant_id, identity_id)
            .await?
            .into_iter()
            .filter(|d| d.is_active)
            .collect();
        if devices.is_empty() {
            log::warn!("MFA challenge for identity {} rejected: MFA not enabled", identity_id);
            return Err(AuthError::MfaNotEnabled);
        }

        if is_backup_code {
            let hashed = self.hasher.hash_backup_code(identity_id, code);
            return if self
                .repo
                .consume_backup_code(ctx.tenant_id, identity_id, &hashed, now)
                .await?
            {
                log::info!("MFA challenge passed for identity {} with backup code", identity_id);
                Ok(ChallengeOutcome::BackupCode)
            } else {
                self.reject(identity_id, "unknown or used backup code")
            };
        }

        if !totp::is_well_formed(code, self.config.totp_digits) {
            return self.reject(identity_id, "malformed code");
        }

        let mut replayed = false;
        for device in devices.iter().filter(|d| device_id.is_none_or(|id| id == d.id)) {
            let Some(step) = totp::verify(&device.secret, self.params_for(device.device_type), code, now)?
            else {
                continue;
            };

            if self.repo.record_totp_step(device.id, step, now).await? {
                log::info!(
                    "MFA challenge passed for identity {} with device {}",
                    identity_id,
                    device.id
                );
                return Ok(ChallengeOutcome::Device { device_id: device.id });
            }
            replayed = true;
        }

        self.reject(
            identity_id,
            if replayed { "code already used" } else { "code mismatch" },
        )
    }

    fn reject<T>(&self, identity_id: Uuid, reason: &str) -> AuthResult<T> {
        log::warn!("MFA challenge failed for identity {}: {}", identity_id, reason);
        Err(AuthError::InvalidMfaCode)
    }

    /// Turn MFA off after a successful challenge; removes every device and backup code
    pub async fn disable(&self, ctx: TenantContext, code: &str, is_backup_code: bool) -> AuthResult<()> {
        let identity_id = ctx.require_identity()?;
        self.challenge(ctx, code, is_backup_code, None).await?;
        self.repo.disable(ctx.tenant_id, identity_id).await?;

        log::info!("MFA disabled for identity {}", identity_id);
        Ok(())
    }

    /// Replace the backup code batch; requires a device code
    ///
    /// # Returns
    ///
    /// * `AuthResult<Vec<String>>` - New plaintext codes, shown once
    pub async fn regenerate_backup_codes(&self, ctx: TenantContext, code: &str) -> AuthResult<Vec<String>> {
        let identity_id = ctx.require_identity()?;
        self.challenge(ctx, code, false, None).await?;

        let batch = backup::generate(
            &self.hasher,
            ctx.tenant_id,
            identity_id,
            None,
            self.config.backup_code_count,
            self.config.backup_code_length,
            self.clock.now(),
        );
        self.repo
            .replace_backup_codes(ctx.tenant_id, identity_id, &batch.codes)
            .await?;

        log::info!("Backup codes regenerated for identity {}", identity_id);
        Ok(batch.plaintext)
    }

    /// Spend the id of a pre-auth token so it completes at most one login
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidToken` - The token was already spent
    pub async fn spend_pre_auth(&self, jti: Uuid, expires_at: DateTime<Utc>) -> AuthResult<()> {
        if self.repo.spend_pre_auth(jti, expires_at).await? {
            Ok(())
        } else {
            log::warn!("Pre-auth token {} presented again after a completed login", jti);
            Err(AuthError::InvalidToken(TokenRejection::AlreadyUsed))
        }
    }

    pub async fn remaining_backup_codes(&self, ctx: TenantContext) -> AuthResult<u64> {
        let identity_id = ctx.require_identity()?;
        self.repo
            .count_unused_backup_codes(ctx.tenant_id, identity_id)
            .await
    }

    pub async fn list_devices(&self, ctx: TenantContext) -> AuthResult<Vec<MfaDevice>> {
        let identity_id = ctx.require_identity()?;
        self.repo.list_devices(ctx.tenant_id, identity_id).await
    }

    /// Send the current code to an sms or email device
    ///
    /// # Errors
    ///
    /// * `AuthError::NotFound` - Device unknown or owned by another identity
    /// * `AuthError::Validation` - Device computes its own codes
    pub async fn send_code(&self, ctx: TenantContext, device_id: Uuid) -> AuthResult<()> {
        let identity_id = ctx.require_identity()?;
        let device = self
            .repo
            .find_device(ctx.tenant_id, device_id)
            .await?
            .filter(|d| d.identity_id == identity_id)
            .ok_or(AuthError::NotFound("MFA device"))?;

        if !device.device_type.is_delivered() {
            return Err(AuthError::Validation("device does not receive codes".into()));
        }
        self.dispatch_current(&device).await
    }

    async fn dispatch_current(&self, device: &MfaDevice) -> AuthResult<()> {
        let code = totp::current_code(
            &device.secret,
            self.params_for(device.device_type),
            self.clock.now(),
        )?;
        self.dispatcher.dispatch(device, &code).await
    }
}
