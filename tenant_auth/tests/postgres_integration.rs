//! Integration tests against PostgreSQL.
//!
//! Run with `DATABASE_URL` pointing at a scratch database and `--ignored`.

use std::sync::Arc;
use tenant_auth::db::{Database, DatabaseConfig, PgStore};
use tenant_auth::session::DeviceInfo;
use tenant_auth::{
    AuthError, AuthOrchestrator, CoreConfig, LoginOutcome, LoginRequest, RegisterRequest,
    SecurityConfig, SystemClock, TenantContext,
};
use tokio::task::JoinSet;
use uuid::Uuid;

const PASSWORD: &str = "Quartz-Falcon-93!";

/// Helper to create a migrated test database
async fn setup_test_db() -> Database {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/tenant_auth_test".to_string());

    let db = Database::new(&DatabaseConfig::development().with_url(database_url))
        .await
        .expect("Failed to create test database");
    sqlx::migrate!("./migrations")
        .run(db.pool())
        .await
        .expect("Failed to run migrations");
    db
}

async fn setup_auth() -> Arc<AuthOrchestrator> {
    let db = setup_test_db().await;
    let config = CoreConfig::new(SecurityConfig {
        signing_key: "postgres-signing-key-0123456789abcdef".to_string(),
        token_hash_key: "postgres-token-hash-key-0123456789ab".to_string(),
        password_pepper: "postgres-pepper-01".to_string(),
    });
    let store: Arc<PgStore> = Arc::new(db.store());
    Arc::new(AuthOrchestrator::new(config, store, Arc::new(SystemClock)).unwrap())
}

#[tokio::test]
#[ignore = "Requires database setup"]
async fn test_register_and_login_over_postgres() {
    let auth = setup_auth().await;
    let tenant = TenantContext::tenant(Uuid::new_v4());

    auth.register(
        tenant,
        RegisterRequest {
            email: "ada@example.com".to_string(),
            username: "ada".to_string(),
            password: PASSWORD.to_string(),
        },
    )
    .await
    .unwrap();

    let duplicate = auth
        .register(
            tenant,
            RegisterRequest {
                email: "ADA@example.com".to_string(),
                username: "ada2".to_string(),
                password: PASSWORD.to_string(),
            },
        )
        .await;
    assert!(matches!(duplicate, Err(AuthError::Conflict(_))));

    let outcome = auth
        .login(
            tenant,
            LoginRequest {
                email: "ada@example.com".to_string(),
                password: PASSWORD.to_string(),
            },
            DeviceInfo::default(),
        )
        .await
        .unwrap();
    let LoginOutcome::Authenticated(response) = outcome else {
        panic!("MFA step was not expected");
    };

    let principal = auth.authenticate(&response.tokens.access_token).await.unwrap();
    assert_eq!(principal.identity_id, response.identity.id);
}

#[tokio::test]
#[ignore = "Requires database setup"]
async fn test_concurrent_logins_respect_session_cap() {
    let auth = setup_auth().await;
    let tenant = TenantContext::tenant(Uuid::new_v4());

    let identity = auth
        .register(
            tenant,
            RegisterRequest {
                email: "grace@example.com".to_string(),
                username: "grace".to_string(),
                password: PASSWORD.to_string(),
            },
        )
        .await
        .unwrap();

    let mut set = JoinSet::new();
    for _ in 0..12 {
        let auth = auth.clone();
        set.spawn(async move {
            auth.login(
                tenant,
                LoginRequest {
                    email: "grace@example.com".to_string(),
                    password: PASSWORD.to_string(),
                },
                DeviceInfo::default(),
            )
            .await
        });
    }
    while let Some(joined) = set.join_next().await {
        assert!(joined.unwrap().is_ok(), "a login never fails because of the cap");
    }

    let ctx = TenantContext::identity(tenant.tenant_id, identity.id);
    let live = auth.sessions().list_active(ctx).await.unwrap();
    assert_eq!(live.len(), 5);
}
