//! Login, logout and refresh entry points.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::models::{LoginOutcome, LoginRequest, LoginResponse, MfaVerifyRequest, RegisterRequest};
use crate::config::{CoreConfig, LockoutConfig};
use crate::context::{SharedClock, TenantContext};
use crate::crypto::CredentialHasher;
use crate::db::{
    ApiTokenRepository, IdentityRepository, MfaRepository, RateLimitRepository, SessionRepository,
    SsoRepository,
};
use crate::errors::{AuthError, AuthResult, TokenRejection};
use crate::identity::{normalize_email, Identity};
use crate::mfa::MfaEngine;
use crate::password::PasswordPolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::session::{DeviceInfo, SessionStore, REASON_LOGOUT, REASON_LOGOUT_ALL, REASON_PASSWORD_CHANGED};
use crate::sso::SsoFederator;
use crate::token::{ApiTokenService, AuthMethod, Principal, TokenKind, TokenPair, TokenService};

/// Sequences the core components into the platform's login entry points
pub struct AuthOrchestrator {
    identities: Arc<dyn IdentityRepository>,
    hasher: Arc<CredentialHasher>,
    passwords: PasswordPolicyEngine,
    tokens: TokenService,
    sessions: SessionStore,
    mfa: MfaEngine,
    sso: SsoFederator,
    api_tokens: ApiTokenService,
    rate_limiter: RateLimiter,
    lockout: LockoutConfig,
    /// Verified against when the email is unknown, so both paths pay for one hash
    decoy_hash: String,
    clock: SharedClock,
}

impl AuthOrchestrator {
    /// Wire every component around one store
    ///
    /// # Arguments
    ///
    /// * `config` - Validated core configuration
    /// * `store` - Implementation of every repository trait
    /// * `clock` - Time source shared by all components
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Configuration fails validation
    /// * `AuthError::HashingFailed` - Secrets unusable by the hasher
    pub fn new<S>(config: CoreConfig, store: Arc<S>, clock: SharedClock) -> AuthResult<Self>
    where
        S: IdentityRepository
            + SessionRepository
            + MfaRepository
            + SsoRepository
            + ApiTokenRepository
            + RateLimitRepository
            + 'static,
    {
        config
            .validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let identities: Arc<dyn IdentityRepository> = store.clone();
        let hasher = Arc::new(CredentialHasher::from_config(&config.security)?);
        let decoy_hash = hasher.hash_password(&crate::crypto::random::random_hex(16))?;

        let tokens = TokenService::new(&config.security.signing_key, config.token.clone(), clock.clone());
        let sessions = SessionStore::new(
            store.clone(),
            hasher.clone(),
            config.session.max_active_sessions,
            clock.clone(),
        );
        let mfa = MfaEngine::new(
            store.clone(),
            identities.clone(),
            hasher.clone(),
            config.mfa.clone(),
            clock.clone(),
        );
        let sso = SsoFederator::new(store.clone(), config.sso.clone(), clock.clone());
        let rate_limiter = RateLimiter::new(store.clone(), config.rate_limit.clone(), clock.clone());
        let api_tokens = ApiTokenService::new(store, identities.clone(), rate_limiter.clone(), clock.clone());

        Ok(Self {
            identities,
            hasher,
            passwords: PasswordPolicyEngine::new(config.password),
            tokens,
            sessions,
            mfa,
            sso,
            api_tokens,
            rate_limiter,
            lockout: config.lockout,
            decoy_hash,
            clock,
        })
    }

    /// Replace the federator, e.g. to register extra strategies or a SAML verifier
    pub fn with_federator(mut self, sso: SsoFederator) -> Self {
        self.sso = sso;
        self
    }

    /// Replace the MFA engine, e.g. to install an out-of-band dispatcher
    pub fn with_mfa_engine(mut self, mfa: MfaEngine) -> Self {
        self.mfa = mfa;
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn mfa(&self) -> &MfaEngine {
        &self.mfa
    }

    pub fn sso(&self) -> &SsoFederator {
        &self.sso
    }

    pub fn api_tokens(&self) -> &ApiTokenService {
        &self.api_tokens
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn passwords(&self) -> &PasswordPolicyEngine {
        &self.passwords
    }

    /// Register a password identity
    ///
    /// # Arguments
    ///
    /// * `ctx` - Tenant the identity belongs to
    /// * `request` - Email, username and candidate password
    ///
    /// # Returns
    ///
    /// * `AuthResult<Identity>` - Stored identity
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Malformed email or empty username
    /// * `AuthError::WeakPassword` - Password rejected by the policy
    /// * `AuthError::Conflict` - Email already registered in the tenant
    pub async fn register(&self, ctx: TenantContext, request: RegisterRequest) -> AuthResult<Identity> {
        let email = normalize_email(&request.email);
        validate_email(&email)?;
        let username = request.username.trim();
        if username.is_empty() {
            return Err(AuthError::Validation("username is required".into()));
        }

        self.passwords.enforce(&request.password, username, &email)?;

        if self.identities.find_by_email(ctx.tenant_id, &email).await?.is_some() {
            return Err(AuthError::Conflict("email already registered".into()));
        }

        let hash = self.hasher.hash_password(&request.password)?;
        let identity = Identity::new(ctx.tenant_id, &email, username, hash, self.clock.now());
        self.identities.create(&identity).await?;

        log::info!("Registered identity {} in tenant {}", identity.id, ctx.tenant_id);
        Ok(identity)
    }

    /// Password step of a login
    ///
    /// Identities with MFA enabled receive a short-lived pre-auth token instead of a
    /// token pair; [`AuthOrchestrator::verify_mfa`] finishes the login.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidCredentials` - Unknown email, wrong password or no password set
    /// * `AuthError::AccountLocked` - Locked now, or this failure reached the threshold
    /// * `AuthError::AccountDisabled` - Identity disabled
    pub async fn login(
        &self,
        ctx: TenantContext,
        request: LoginRequest,
        device: DeviceInfo,
    ) -> AuthResult<LoginOutcome> {
        let email = normalize_email(&request.email);
        let now = self.clock.now();

        let Some(identity) = self.identities.find_by_email(ctx.tenant_id, &email).await? else {
            self.hasher.verify_password(&request.password, &self.decoy_hash);
            log::warn!("Login failed in tenant {}: unknown email", ctx.tenant_id);
            return Err(AuthError::InvalidCredentials);
        };

        self.check_usable(&identity, now)?;

        let password_ok = identity
            .password_hash
            .as_deref()
            .is_some_and(|hash| self.hasher.verify_password(&request.password, hash));
        if !password_ok {
            log::warn!(
                "Login failed for identity {} in tenant {}: wrong password",
                identity.id,
                identity.tenant_id
            );
            return Err(self.record_failure(&identity, now, AuthError::InvalidCredentials).await);
        }

        if identity.mfa_enabled {
            let (pre_auth_token, expires_at) =
                self.tokens
                    .issue_mfa_pending(identity.id, identity.tenant_id, &identity.claim_set())?;
            log::info!("Identity {} passed password step, MFA required", identity.id);
            return Ok(LoginOutcome::MfaRequired {
                pre_auth_token,
                expires_at,
            });
        }

        Ok(LoginOutcome::Authenticated(self.finish_login(identity, device).await?))
    }

    /// Second step of a login for an MFA-enabled identity
    ///
    /// Rejected codes count toward the lockout threshold.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidToken` - Pre-auth token invalid, expired or of another kind
    /// * `AuthError::InvalidMfaCode` - Code rejected
    /// * `AuthError::AccountLocked` - Locked now, or this failure reached the threshold
    pub async fn verify_mfa(&self, request: MfaVerifyRequest, device: DeviceInfo) -> AuthResult<LoginResponse> {
        let claims = self.tokens.validate(&request.pre_auth_token, TokenKind::MfaPending)?;
        let now = self.clock.now();

        let identity = self
            .identities
            .find_by_id(claims.tid, claims.sub)
            .await?
            .ok_or(AuthError::InvalidToken(TokenRejection::MissingSubject))?;
        self.check_usable(&identity, now)?;

        let ctx = TenantContext::identity(identity.tenant_id, identity.id);
        match self
            .mfa
            .challenge(ctx, &request.code, request.is_backup_code, request.device_id)
            .await
        {
            Ok(_) => {
                let expires_at = DateTime::from_timestamp(claims.exp, 0)
                    .ok_or(AuthError::InvalidToken(TokenRejection::Malformed))?;
                self.mfa.spend_pre_auth(claims.jti, expires_at).await?;
                self.finish_login(identity, device).await
            }
            Err(AuthError::InvalidMfaCode) => {
                Err(self.record_failure(&identity, now, AuthError::InvalidMfaCode).await)
            }
            Err(e) => Err(e),
        }
    }

    /// Finish a federated login: resolve the identity and mint a session
    ///
    /// The identity provider authenticated the user; no local MFA step follows.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidFederationState` - Unknown, expired or consumed state
    /// * `AuthError::FederationFailed` - Exchange with the provider failed
    /// * `AuthError::AccountLocked` / `AuthError::AccountDisabled` - Resolved identity unusable
    pub async fn login_sso(&self, state: &str, code: &str, device: DeviceInfo) -> AuthResult<LoginResponse> {
        let resolution = self.sso.complete(state, code).await?;
        self.check_usable(&resolution.identity, self.clock.now())?;
        log::info!(
            "SSO login for identity {} resolved as {:?}",
            resolution.identity.id,
            resolution.resolution
        );
        self.finish_login(resolution.identity, device).await
    }

    /// Exchange a refresh token for a new pair and rotate the session's hashes
    ///
    /// The new pair carries the snapshot of the presented refresh token.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidToken` - Not a valid refresh token
    /// * `AuthError::SessionInactive` - Owning session revoked, expired or already rotated
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let pair = self.tokens.refresh(refresh_token)?;
        let session = self.sessions.rotate(refresh_token, &pair).await?;
        log::debug!("Rotated tokens for session {}", session.id);
        Ok(pair)
    }

    /// Authenticate a bearer access token against its live session
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidToken` - Token invalid
    /// * `AuthError::SessionInactive` - Session revoked or expired
    pub async fn authenticate(&self, access_token: &str) -> AuthResult<Principal> {
        let claims = self.tokens.validate_access(access_token)?;
        let session = self.sessions.validate(access_token, claims.sub).await?;
        if session.tenant_id != claims.tid {
            return Err(AuthError::SessionInactive);
        }

        Ok(Principal {
            identity_id: claims.sub,
            tenant_id: claims.tid,
            email: claims.email,
            role: claims.role,
            permissions: claims.perms,
            method: AuthMethod::Session {
                session_id: session.id,
            },
        })
    }

    /// Authenticate an API token, counting the request against its quota
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidApiToken` - Unknown, revoked or expired token
    /// * `AuthError::RateLimited` - Quota for the current window used up
    pub async fn authenticate_api_token(&self, plaintext: &str) -> AuthResult<Principal> {
        self.api_tokens.authenticate(plaintext).await
    }

    /// Revoke the session the principal authenticated with
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Principal authenticated with an API token
    pub async fn logout(&self, principal: &Principal) -> AuthResult<()> {
        let AuthMethod::Session { session_id } = principal.method else {
            return Err(AuthError::Validation("API tokens are revoked, not logged out".into()));
        };
        self.sessions
            .revoke(principal.context(), session_id, REASON_LOGOUT)
            .await
    }

    /// Revoke every session of the principal's identity
    ///
    /// # Returns
    ///
    /// * `AuthResult<u64>` - Number of sessions revoked
    pub async fn logout_all(&self, principal: &Principal) -> AuthResult<u64> {
        self.sessions
            .revoke_all(principal.context(), None, REASON_LOGOUT_ALL)
            .await
    }

    /// Change the principal's password and sign out every other session
    ///
    /// # Returns
    ///
    /// * `AuthResult<u64>` - Number of other sessions revoked
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidCredentials` - Current password wrong (counts toward lockout)
    /// * `AuthError::WeakPassword` - New password rejected by the policy
    /// * `AuthError::Validation` - New password equals the current one
    pub async fn change_password(
        &self,
        principal: &Principal,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<u64> {
        let now = self.clock.now();
        let identity = self
            .identities
            .find_by_id(principal.tenant_id, principal.identity_id)
            .await?
            .ok_or(AuthError::NotFound("identity"))?;
        self.check_usable(&identity, now)?;

        let current_ok = identity
            .password_hash
            .as_deref()
            .is_some_and(|hash| self.hasher.verify_password(current_password, hash));
        if !current_ok {
            log::warn!("Password change for identity {} rejected: wrong current password", identity.id);
            return Err(self.record_failure(&identity, now, AuthError::InvalidCredentials).await);
        }
        if current_password == new_password {
            return Err(AuthError::Validation(
                "new password must differ from the current one".into(),
            ));
        }

        self.passwords
            .enforce(new_password, &identity.username, &identity.email)?;
        let hash = self.hasher.hash_password(new_password)?;
        self.identities
            .update_password(identity.tenant_id, identity.id, &hash, now)
            .await?;

        let keep = match principal.method {
            AuthMethod::Session { session_id } => Some(session_id),
            AuthMethod::ApiToken { .. } => None,
        };
        let revoked = self
            .sessions
            .revoke_all(principal.context(), keep, REASON_PASSWORD_CHANGED)
            .await?;

        log::info!(
            "Password changed for identity {}, {} other session(s) revoked",
            identity.id,
            revoked
        );
        Ok(revoked)
    }

    fn check_usable(&self, identity: &Identity, now: DateTime<Utc>) -> AuthResult<()> {
        if !identity.is_active {
            log::warn!("Login rejected for identity {}: disabled", identity.id);
            return Err(AuthError::AccountDisabled);
        }
        if let Some(until) = identity.locked_until.filter(|until| *until > now) {
            log::warn!("Login rejected for identity {}: locked until {}", identity.id, until);
            return Err(AuthError::AccountLocked {
                retry_after_secs: retry_after(until, now),
            });
        }
        Ok(())
    }

    /// Count a failure; returns the lockout error when it reached the threshold,
    /// `otherwise` when it did not
    async fn record_failure(&self, identity: &Identity, now: DateTime<Utc>, otherwise: AuthError) -> AuthError {
        let outcome = match self
            .identities
            .record_failed_login(
                identity.tenant_id,
                identity.id,
                self.lockout.max_failed_attempts,
                self.lockout.lock_duration,
                now,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return e,
        };

        match outcome.locked_until.filter(|until| *until > now) {
            Some(until) => {
                log::warn!(
                    "Identity {} locked after {} failed attempts",
                    identity.id,
                    outcome.failed_login_count
                );
                AuthError::AccountLocked {
                    retry_after_secs: retry_after(until, now),
                }
            }
            None => otherwise,
        }
    }

    async fn finish_login(&self, identity: Identity, device: DeviceInfo) -> AuthResult<LoginResponse> {
        let now = self.clock.now();
        self.identities
            .record_successful_login(identity.tenant_id, identity.id, now)
            .await?;

        let tokens = self
            .tokens
            .issue(identity.id, identity.tenant_id, &identity.claim_set())?;
        let session = self
            .sessions
            .create(identity.tenant_id, identity.id, device, &tokens)
            .await?;

        log::info!(
            "Identity {} logged in to tenant {} (session {})",
            identity.id,
            identity.tenant_id,
            session.id
        );
        Ok(LoginResponse {
            identity,
            session_id: session.id,
            tokens,
        })
    }
}

fn retry_after(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (until - now).num_seconds().max(1) as u64
}

fn validate_email(email: &str) -> AuthResult<()> {
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'));
    if valid {
        Ok(())
    } else {
        Err(AuthError::Validation("invalid email address".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::context::{Clock, ManualClock};
    use crate::db::MemoryStore;
    use crate::mfa::{totp, MfaDeviceType};
    use chrono::Duration;
    use uuid::Uuid;

    const PASSWORD: &str = "Quartz-Falcon-93!";

    struct Fixture {
        auth: AuthOrchestrator,
        clock: Arc<ManualClock>,
        ctx: TenantContext,
    }

    fn config() -> CoreConfig {
        CoreConfig::new(SecurityConfig {
            signing_key: "k".repeat(32),
            token_hash_key: "h".repeat(32),
            password_pepper: "p".repeat(16),
        })
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let auth = AuthOrchestrator::new(config(), store, clock.clone()).unwrap();
        Fixture {
            auth,
            clock,
            ctx: TenantContext::tenant(Uuid::new_v4()),
        }
    }

    async fn register(f: &Fixture) -> Identity {
        f.auth
            .register(
                f.ctx,
                RegisterRequest {
                    email: "Ada@Example.com".into(),
                    username: "ada".into(),
                    password: PASSWORD.into(),
                },
            )
            .await
            .unwrap()
    }

    async fn login(f: &Fixture, password: &str) -> AuthResult<LoginOutcome> {
        f.auth
            .login(
                f.ctx,
                LoginRequest {
                    email: "ada@example.com".into(),
                    password: password.into(),
                },
                DeviceInfo::default(),
            )
            .await
    }

    fn authenticated(outcome: LoginOutcome) -> LoginResponse {
        match outcome {
            LoginOutcome::Authenticated(response) => response,
            LoginOutcome::MfaRequired { .. } => panic!("unexpected MFA step"),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_weak_passwords() {
        let f = fixture();
        register(&f).await;

        let duplicate = f
            .auth
            .register(
                f.ctx,
                RegisterRequest {
                    email: "ADA@example.com".into(),
                    username: "ada2".into(),
                    password: PASSWORD.into(),
                },
            )
            .await;
        assert!(matches!(duplicate, Err(AuthError::Conflict(_))));

        let weak = f
            .auth
            .register(
                f.ctx,
                RegisterRequest {
                    email: "bob@example.com".into(),
                    username: "bob".into(),
                    password: "password".into(),
                },
            )
            .await;
        assert!(matches!(weak, Err(AuthError::WeakPassword(_))));
    }

    #[tokio::test]
    async fn test_login_issues_session_backed_tokens() {
        let f = fixture();
        let identity = register(&f).await;

        let response = authenticated(login(&f, PASSWORD).await.unwrap());
        assert_eq!(response.identity.id, identity.id);

        let principal = f.auth.authenticate(&response.tokens.access_token).await.unwrap();
        assert_eq!(principal.identity_id, identity.id);
        assert_eq!(
            principal.method,
            AuthMethod::Session {
                session_id: response.session_id
            }
        );

        f.auth.logout(&principal).await.unwrap();
        assert!(matches!(
            f.auth.authenticate(&response.tokens.access_token).await,
            Err(AuthError::SessionInactive)
        ));
    }

    #[tokio::test]
    async fn test_lockout_after_threshold_and_expiry() {
        let f = fixture();
        register(&f).await;

        for _ in 0..4 {
            assert!(matches!(login(&f, "wrong").await, Err(AuthError::InvalidCredentials)));
        }
        assert!(matches!(
            login(&f, "wrong").await,
            Err(AuthError::AccountLocked { .. })
        ));
        // Correct password is still refused while locked
        assert!(matches!(
            login(&f, PASSWORD).await,
            Err(AuthError::AccountLocked { .. })
        ));

        f.clock.advance(Duration::minutes(16));
        assert!(login(&f, PASSWORD).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_email_is_indistinguishable() {
        let f = fixture();
        let err = f
            .auth
            .login(
                f.ctx,
                LoginRequest {
                    email: "nobody@example.com".into(),
                    password: PASSWORD.into(),
                },
                DeviceInfo::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_mfa_login_is_two_step() {
        let f = fixture();
        let identity = register(&f).await;
        let ctx = TenantContext::identity(f.ctx.tenant_id, identity.id);

        let enrollment = f.auth.mfa().enroll(ctx, MfaDeviceType::Totp, None).await.unwrap();
        let secret = enrollment.secret.clone().unwrap();
        let params = f.auth.mfa().params_for(MfaDeviceType::Totp);
        let code = totp::current_code(&secret, params, f.clock.now()).unwrap();
        f.auth
            .mfa()
            .verify_enrollment(ctx, enrollment.device_id, &code)
            .await
            .unwrap();

        let LoginOutcome::MfaRequired { pre_auth_token, .. } = login(&f, PASSWORD).await.unwrap() else {
            panic!("expected MFA step");
        };

        // Pre-auth token is not an access token
        assert!(matches!(
            f.auth.authenticate(&pre_auth_token).await,
            Err(AuthError::InvalidToken(TokenRejection::WrongType))
        ));

        let wrong = f
            .auth
            .verify_mfa(
                MfaVerifyRequest {
                    pre_auth_token: pre_auth_token.clone(),
                    code: "000000".into(),
                    is_backup_code: false,
                    device_id: None,
                },
                DeviceInfo::default(),
            )
            .await;
        assert!(matches!(wrong, Err(AuthError::InvalidMfaCode)));

        f.clock.advance(Duration::seconds(30));
        let code = totp::current_code(&secret, params, f.clock.now()).unwrap();
        let response = f
            .auth
            .verify_mfa(
                MfaVerifyRequest {
                    pre_auth_token: pre_auth_token.clone(),
                    code,
                    is_backup_code: false,
                    device_id: Some(enrollment.device_id),
                },
                DeviceInfo::default(),
            )
            .await
            .unwrap();
        assert!(f.auth.authenticate(&response.tokens.access_token).await.is_ok());

        // A completed pre-auth token cannot mint a second session
        let reused = f
            .auth
            .verify_mfa(
                MfaVerifyRequest {
                    pre_auth_token,
                    code: enrollment.backup_codes[0].clone(),
                    is_backup_code: true,
                    device_id: None,
                },
                DeviceInfo::default(),
            )
            .await;
        assert!(matches!(
            reused,
            Err(AuthError::InvalidToken(TokenRejection::AlreadyUsed))
        ));
        let sessions = f.auth.sessions().list_active(ctx).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_old_refresh_is_dead() {
        let f = fixture();
        register(&f).await;
        let response = authenticated(login(&f, PASSWORD).await.unwrap());

        f.clock.advance(Duration::seconds(5));
        let pair = f.auth.refresh(&response.tokens.refresh_token).await.unwrap();
        let principal = f.auth.authenticate(&pair.access_token).await.unwrap();
        assert_eq!(principal.identity_id, response.identity.id);

        assert!(matches!(
            f.auth.refresh(&response.tokens.refresh_token).await,
            Err(AuthError::SessionInactive)
        ));
        assert!(matches!(
            f.auth.refresh(&pair.access_token).await,
            Err(AuthError::InvalidToken(TokenRejection::WrongType))
        ));
    }

    #[tokio::test]
    async fn test_change_password_keeps_only_current_session() {
        let f = fixture();
        register(&f).await;
        let first = authenticated(login(&f, PASSWORD).await.unwrap());
        let second = authenticated(login(&f, PASSWORD).await.unwrap());

        let principal = f.auth.authenticate(&first.tokens.access_token).await.unwrap();
        let revoked = f
            .auth
            .change_password(&principal, PASSWORD, "Granite-Osprey-47#")
            .await
            .unwrap();
        assert_eq!(revoked, 1);

        assert!(f.auth.authenticate(&first.tokens.access_token).await.is_ok());
        assert!(matches!(
            f.auth.authenticate(&second.tokens.access_token).await,
            Err(AuthError::SessionInactive)
        ));
        assert!(matches!(login(&f, PASSWORD).await, Err(AuthError::InvalidCredentials)));
        assert!(login(&f, "Granite-Osprey-47#").await.is_ok());
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email("ada@localhost").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("ada.example.com").is_err());
    }
}
