//! Integration tests for the login entry points.
//!
//! Drives registration, login, MFA, refresh, session cap, password change and API
//! tokens through `AuthOrchestrator` over the in-memory store.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tenant_auth::context::{Clock, ManualClock};
use tenant_auth::mfa::{MfaDeviceType, totp};
use tenant_auth::session::DeviceInfo;
use tenant_auth::{
    AuthError, AuthOrchestrator, CoreConfig, LoginOutcome, LoginRequest, LoginResponse, MemoryStore,
    MfaVerifyRequest, RateLimitDecision, RegisterRequest, SecurityConfig, TenantContext,
};
use tokio::task::JoinSet;
use uuid::Uuid;

const PASSWORD: &str = "Quartz-Falcon-93!";

struct Harness {
    auth: Arc<AuthOrchestrator>,
    clock: Arc<ManualClock>,
    tenant: TenantContext,
}

fn test_config() -> CoreConfig {
    CoreConfig::new(SecurityConfig {
        signing_key: "integration-signing-key-0123456789abcdef".to_string(),
        token_hash_key: "integration-token-hash-key-0123456789abcdef".to_string(),
        password_pepper: "integration-pepper".to_string(),
    })
}

/// Helper to build an orchestrator over a fresh store
fn setup() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let auth = AuthOrchestrator::new(test_config(), Arc::new(MemoryStore::new()), clock.clone())
        .expect("valid configuration");
    Harness {
        auth: Arc::new(auth),
        clock,
        tenant: TenantContext::tenant(Uuid::new_v4()),
    }
}

async fn register(h: &Harness, tenant: TenantContext, email: &str) -> tenant_auth::Identity {
    h.auth
        .register(
            tenant,
            RegisterRequest {
                email: email.to_string(),
                username: email.split('@').next().unwrap_or("user").to_string(),
                password: PASSWORD.to_string(),
            },
        )
        .await
        .expect("registration should succeed")
}

async fn login(h: &Harness, tenant: TenantContext, email: &str) -> Result<LoginOutcome, AuthError> {
    h.auth
        .login(
            tenant,
            LoginRequest {
                email: email.to_string(),
                password: PASSWORD.to_string(),
            },
            DeviceInfo {
                ip_address: Some("203.0.113.7".to_string()),
                user_agent: Some("integration-test".to_string()),
                device_fingerprint: None,
            },
        )
        .await
}

fn expect_authenticated(outcome: LoginOutcome) -> LoginResponse {
    match outcome {
        LoginOutcome::Authenticated(response) => response,
        LoginOutcome::MfaRequired { .. } => panic!("MFA step was not expected"),
    }
}

/// Enroll and activate a TOTP device; returns the secret and backup codes
async fn enable_mfa(h: &Harness, identity_id: Uuid) -> (String, Vec<String>) {
    let ctx = TenantContext::identity(h.tenant.tenant_id, identity_id);
    let enrollment = h
        .auth
        .mfa()
        .enroll(ctx, MfaDeviceType::Totp, None)
        .await
        .expect("enroll");
    let secret = enrollment.secret.clone().expect("TOTP secret");
    let params = h.auth.mfa().params_for(MfaDeviceType::Totp);
    let code = totp::current_code(&secret, params, h.clock.now()).unwrap();
    h.auth
        .mfa()
        .verify_enrollment(ctx, enrollment.device_id, &code)
        .await
        .expect("verify enrollment");
    (secret, enrollment.backup_codes)
}

#[tokio::test]
async fn test_login_refresh_logout_round_trip() {
    let h = setup();
    let identity = register(&h, h.tenant, "ada@example.com").await;

    let response = expect_authenticated(login(&h, h.tenant, "ada@example.com").await.unwrap());
    let principal = h.auth.authenticate(&response.tokens.access_token).await.unwrap();
    assert_eq!(principal.identity_id, identity.id);
    assert_eq!(principal.tenant_id, h.tenant.tenant_id);

    h.clock.advance(Duration::minutes(1));
    let refreshed = h.auth.refresh(&response.tokens.refresh_token).await.unwrap();
    let principal = h.auth.authenticate(&refreshed.access_token).await.unwrap();
    assert_eq!(principal.identity_id, identity.id);

    // The access token of the superseded pair no longer maps to the session
    assert!(h.auth.authenticate(&response.tokens.access_token).await.is_err());

    h.auth.logout(&principal).await.unwrap();
    assert!(matches!(
        h.auth.refresh(&refreshed.refresh_token).await,
        Err(AuthError::SessionInactive)
    ));
}

#[tokio::test]
async fn test_sixth_login_evicts_least_recently_active_session() {
    let h = setup();
    register(&h, h.tenant, "ada@example.com").await;

    let mut responses = Vec::new();
    for _ in 0..6 {
        responses.push(expect_authenticated(
            login(&h, h.tenant, "ada@example.com").await.unwrap(),
        ));
        h.clock.advance(Duration::seconds(1));
    }

    assert!(matches!(
        h.auth.authenticate(&responses[0].tokens.access_token).await,
        Err(AuthError::SessionInactive)
    ));
    for response in &responses[1..] {
        assert!(h.auth.authenticate(&response.tokens.access_token).await.is_ok());
    }

    let ctx = TenantContext::identity(h.tenant.tenant_id, responses[0].identity.id);
    assert_eq!(h.auth.sessions().list_active(ctx).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_mfa_login_with_totp() {
    let h = setup();
    let identity = register(&h, h.tenant, "ada@example.com").await;
    let (secret, _) = enable_mfa(&h, identity.id).await;

    let outcome = login(&h, h.tenant, "ada@example.com").await.unwrap();
    let LoginOutcome::MfaRequired { pre_auth_token, expires_at } = outcome else {
        panic!("expected MFA step");
    };
    assert!(expires_at > h.clock.now());

    h.clock.advance(Duration::seconds(30));
    let params = h.auth.mfa().params_for(MfaDeviceType::Totp);
    let code = totp::current_code(&secret, params, h.clock.now()).unwrap();

    let response = h
        .auth
        .verify_mfa(
            MfaVerifyRequest {
                pre_auth_token: pre_auth_token.clone(),
                code: code.clone(),
                is_backup_code: false,
                device_id: None,
            },
            DeviceInfo::default(),
        )
        .await
        .unwrap();
    assert!(h.auth.authenticate(&response.tokens.access_token).await.is_ok());

    // Same code again is a replay
    let replay = h
        .auth
        .verify_mfa(
            MfaVerifyRequest {
                pre_auth_token,
                code,
                is_backup_code: false,
                device_id: None,
            },
            DeviceInfo::default(),
        )
        .await;
    assert!(matches!(replay, Err(AuthError::InvalidMfaCode)));
}

#[tokio::test]
async fn test_pre_auth_token_expires() {
    let h = setup();
    let identity = register(&h, h.tenant, "ada@example.com").await;
    let (_, backup_codes) = enable_mfa(&h, identity.id).await;

    let LoginOutcome::MfaRequired { pre_auth_token, .. } =
        login(&h, h.tenant, "ada@example.com").await.unwrap()
    else {
        panic!("expected MFA step");
    };

    h.clock.advance(Duration::minutes(6));
    let result = h
        .auth
        .verify_mfa(
            MfaVerifyRequest {
                pre_auth_token,
                code: backup_codes[0].clone(),
                is_backup_code: true,
                device_id: None,
            },
            DeviceInfo::default(),
        )
        .await;
    assert!(matches!(result, Err(AuthError::InvalidToken(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_backup_code_redemption_succeeds_once() {
    let h = setup();
    let identity = register(&h, h.tenant, "ada@example.com").await;
    let (_, backup_codes) = enable_mfa(&h, identity.id).await;

    let LoginOutcome::MfaRequired { pre_auth_token, .. } =
        login(&h, h.tenant, "ada@example.com").await.unwrap()
    else {
        panic!("expected MFA step");
    };

    let mut set = JoinSet::new();
    for _ in 0..4 {
        let auth = h.auth.clone();
        let request = MfaVerifyRequest {
            pre_auth_token: pre_auth_token.clone(),
            code: backup_codes[0].clone(),
            is_backup_code: true,
            device_id: None,
        };
        set.spawn(async move { auth.verify_mfa(request, DeviceInfo::default()).await });
    }

    let mut successes = 0;
    let mut rejections = 0;
    while let Some(joined) = set.join_next().await {
        match joined.expect("task panicked") {
            Ok(_) => successes += 1,
            Err(AuthError::InvalidMfaCode) => rejections += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(rejections, 3);

    let ctx = TenantContext::identity(h.tenant.tenant_id, identity.id);
    assert_eq!(
        h.auth.mfa().remaining_backup_codes(ctx).await.unwrap(),
        backup_codes.len() as u64 - 1
    );
}

#[tokio::test]
async fn test_failed_mfa_attempts_lock_the_account() {
    let h = setup();
    let identity = register(&h, h.tenant, "ada@example.com").await;
    enable_mfa(&h, identity.id).await;

    let LoginOutcome::MfaRequired { pre_auth_token, .. } =
        login(&h, h.tenant, "ada@example.com").await.unwrap()
    else {
        panic!("expected MFA step");
    };

    let mut last = None;
    for _ in 0..5 {
        last = Some(
            h.auth
                .verify_mfa(
                    MfaVerifyRequest {
                        pre_auth_token: pre_auth_token.clone(),
                        code: "not-a-code".to_string(),
                        is_backup_code: false,
                        device_id: None,
                    },
                    DeviceInfo::default(),
                )
                .await,
        );
    }
    assert!(matches!(last, Some(Err(AuthError::AccountLocked { .. }))));
    assert!(matches!(
        login(&h, h.tenant, "ada@example.com").await,
        Err(AuthError::AccountLocked { .. })
    ));
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let h = setup();
    let other = TenantContext::tenant(Uuid::new_v4());
    let a = register(&h, h.tenant, "ada@example.com").await;
    let b = register(&h, other, "ada@example.com").await;
    assert_ne!(a.id, b.id);

    let response = expect_authenticated(login(&h, other, "ada@example.com").await.unwrap());
    assert_eq!(response.identity.id, b.id);
    assert_eq!(response.identity.tenant_id, other.tenant_id);

    // Only known in the first tenant
    register(&h, h.tenant, "grace@example.com").await;
    assert!(matches!(
        login(&h, other, "grace@example.com").await,
        Err(AuthError::InvalidCredentials)
    ));
}

#[tokio::test]
async fn test_api_token_quota_and_revocation() {
    let h = setup();
    let identity = register(&h, h.tenant, "ada@example.com").await;
    let ctx = TenantContext::identity(h.tenant.tenant_id, identity.id);

    let created = h
        .auth
        .api_tokens()
        .create(ctx, "ci", vec!["builds:read".to_string()], 1, None)
        .await
        .unwrap();
    assert!(created.plaintext.starts_with("tat_"));

    let principal = h.auth.authenticate_api_token(&created.plaintext).await.unwrap();
    assert_eq!(principal.identity_id, identity.id);

    // One request per second over a 60s window
    for _ in 1..60 {
        h.auth.authenticate_api_token(&created.plaintext).await.unwrap();
    }
    let denied = h.auth.authenticate_api_token(&created.plaintext).await;
    assert!(matches!(denied, Err(AuthError::RateLimited { .. })));

    h.clock.advance(Duration::seconds(60));
    assert!(h.auth.authenticate_api_token(&created.plaintext).await.is_ok());

    h.auth.api_tokens().revoke(ctx, created.token.id).await.unwrap();
    assert!(matches!(
        h.auth.authenticate_api_token(&created.plaintext).await,
        Err(AuthError::InvalidApiToken)
    ));
}

#[tokio::test]
async fn test_api_token_is_revocable_only_by_its_owner() {
    let h = setup();
    let ada = register(&h, h.tenant, "ada@example.com").await;
    let grace = register(&h, h.tenant, "grace@example.com").await;
    let ada_ctx = TenantContext::identity(h.tenant.tenant_id, ada.id);
    let grace_ctx = TenantContext::identity(h.tenant.tenant_id, grace.id);

    let created = h
        .auth
        .api_tokens()
        .create(ada_ctx, "deploy", vec!["builds:write".to_string()], 5, None)
        .await
        .unwrap();

    assert!(matches!(
        h.auth.api_tokens().revoke(grace_ctx, created.token.id).await,
        Err(AuthError::NotFound(_))
    ));
    assert!(matches!(
        h.auth.api_tokens().revoke(h.tenant, created.token.id).await,
        Err(AuthError::Validation(_))
    ));
    assert!(h.auth.authenticate_api_token(&created.plaintext).await.is_ok());

    h.auth.api_tokens().revoke(ada_ctx, created.token.id).await.unwrap();
    assert!(matches!(
        h.auth.authenticate_api_token(&created.plaintext).await,
        Err(AuthError::InvalidApiToken)
    ));
}

#[tokio::test]
async fn test_rate_limiter_windows_are_independent_per_token() {
    let h = setup();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    for _ in 0..60 {
        assert!(matches!(
            h.auth.rate_limiter().check(first, 1).await.unwrap(),
            RateLimitDecision::Allowed { .. }
        ));
    }
    assert!(matches!(
        h.auth.rate_limiter().check(first, 1).await.unwrap(),
        RateLimitDecision::Denied { .. }
    ));
    assert!(matches!(
        h.auth.rate_limiter().check(second, 1).await.unwrap(),
        RateLimitDecision::Allowed { remaining: 59, .. }
    ));
}
