//! Federation state machine.
//!
//! ```text
//! pending --(valid code, matching state)--> completed
//! pending --(exchange or resolution failure)--> failed
//! pending --(now >= expires_at)--> expired
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use super::models::{
    ProviderConfig, ProviderStatus, ProviderType, SsoProvider, SsoResolution, SsoSession,
    SsoSessionStatus,
};
use super::oauth::{OAuth2Strategy, OidcStrategy};
use super::saml::{AssertionVerifier, RejectingVerifier, SamlStrategy};
use super::strategy::FederationStrategy;
use crate::config::SsoConfig;
use crate::context::{SharedClock, TenantContext};
use crate::crypto::random;
use crate::db::SsoRepository;
use crate::errors::{AuthError, AuthResult};
use crate::identity::DEFAULT_ROLE;

/// Message surfaced for every failure after the state was accepted
const GENERIC_FAILURE: &str = "identity provider login failed";

/// Drives external identity provider logins
#[derive(Clone)]
pub struct SsoFederator {
    repo: Arc<dyn SsoRepository>,
    strategies: HashMap<ProviderType, Arc<dyn FederationStrategy>>,
    config: SsoConfig,
    clock: SharedClock,
}

impl SsoFederator {
    /// Create a federator with the built-in strategies
    ///
    /// SAML responses are refused until a verifier is installed with
    /// [`with_saml_verifier`](Self::with_saml_verifier).
    pub fn new(repo: Arc<dyn SsoRepository>, config: SsoConfig, clock: SharedClock) -> Self {
        let http = reqwest::Client::new();
        let mut strategies: HashMap<ProviderType, Arc<dyn FederationStrategy>> = HashMap::new();
        strategies.insert(ProviderType::Oauth2, Arc::new(OAuth2Strategy::new(http.clone())));
        strategies.insert(ProviderType::Oidc, Arc::new(OidcStrategy::new(http)));
        strategies.insert(
            ProviderType::Saml,
            Arc::new(SamlStrategy::new(Arc::new(RejectingVerifier), clock.clone())),
        );

        Self {
            repo,
            strategies,
            config,
            clock,
        }
    }

    /// Replace the strategy for one provider type
    pub fn with_strategy(mut self, provider_type: ProviderType, strategy: Arc<dyn FederationStrategy>) -> Self {
        self.strategies.insert(provider_type, strategy);
        self
    }

    /// Install the SAML signature verifier
    pub fn with_saml_verifier(self, verifier: Arc<dyn AssertionVerifier>) -> Self {
        let strategy = Arc::new(SamlStrategy::new(verifier, self.clock.clone()));
        self.with_strategy(ProviderType::Saml, strategy)
    }

    /// Register a provider for the tenant
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Empty name or unparseable endpoint
    pub async fn register_provider(
        &self,
        ctx: TenantContext,
        name: &str,
        config: ProviderConfig,
        allowed_redirect_uris: Vec<String>,
        default_role: Option<String>,
    ) -> AuthResult<SsoProvider> {
        if name.trim().is_empty() {
            return Err(AuthError::Validation("provider name is required".into()));
        }

        let endpoints: Vec<&str> = match &config {
            ProviderConfig::Oauth2(c) => vec![
                c.authorization_endpoint.as_str(),
                c.token_endpoint.as_str(),
                c.userinfo_endpoint.as_str(),
            ],
            ProviderConfig::Oidc(c) => vec![
                c.authorization_endpoint.as_str(),
                c.token_endpoint.as_str(),
                c.jwks_uri.as_str(),
            ],
            ProviderConfig::Saml(c) => vec![c.sso_url.as_str(), c.acs_url.as_str()],
        };
        for endpoint in endpoints.into_iter().chain(allowed_redirect_uris.iter().map(String::as_str)) {
            Url::parse(endpoint)
                .map_err(|e| AuthError::Validation(format!("invalid URL {endpoint}: {e}")))?;
        }

        let provider = SsoProvider {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            name: name.trim().to_string(),
            status: ProviderStatus::Active,
            config,
            allowed_redirect_uris,
            default_role: default_role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            created_at: self.clock.now(),
        };
        self.repo.create_provider(&provider).await?;

        log::info!(
            "SSO provider {} ({}) registered for tenant {}",
            provider.id,
            provider.provider_type().as_str(),
            ctx.tenant_id
        );
        Ok(provider)
    }

    fn strategy(&self, provider_type: ProviderType) -> AuthResult<&Arc<dyn FederationStrategy>> {
        self.strategies.get(&provider_type).ok_or_else(|| {
            AuthError::FederationFailed(format!("no strategy for {}", provider_type.as_str()))
        })
    }

    /// Start a federation attempt
    ///
    /// # Returns
    ///
    /// * `AuthResult<(SsoSession, String)>` - Pending session and the URL to send the user to
    ///
    /// # Errors
    ///
    /// * `AuthError::NotFound` - Provider unknown in the tenant
    /// * `AuthError::Validation` - Provider disabled, or redirect URI malformed or not allowed
    pub async fn initiate(
        &self,
        ctx: TenantContext,
        provider_id: Uuid,
        redirect_uri: &str,
    ) -> AuthResult<(SsoSession, String)> {
        let provider = self
            .repo
            .find_provider(ctx.tenant_id, provider_id)
            .await?
            .ok_or(AuthError::NotFound("SSO provider"))?;

        if !provider.is_active() {
            return Err(AuthError::Validation("SSO provider is disabled".into()));
        }
        Url::parse(redirect_uri).map_err(|e| AuthError::Validation(format!("invalid redirect URI: {e}")))?;
        if !provider.allows_redirect(redirect_uri) {
            return Err(AuthError::Validation("redirect URI not allowed for provider".into()));
        }

        let now = self.clock.now();
        let session = SsoSession {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            provider_id,
            state: random::random_hex(32),
            nonce: random::random_hex(32),
            redirect_uri: redirect_uri.to_string(),
            status: SsoSessionStatus::Pending,
            created_at: now,
            expires_at: now + self.config.session_ttl,
        };

        let url = self
            .strategy(provider.provider_type())?
            .authorization_url(&provider, &session)?;
        self.repo.create_session(&session).await?;

        log::info!(
            "SSO session {} started with provider {} for tenant {}",
            session.id,
            provider_id,
            ctx.tenant_id
        );
        Ok((session, url))
    }

    /// Finish a federation attempt
    ///
    /// Consumes the pending session at most once and resolves the local identity:
    /// existing mapping, then same-email identity, then a new identity.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidFederationState` - Unknown, expired or already finished state
    /// * `AuthError::FederationFailed` - Exchange or resolution failed; the session is now failed
    pub async fn complete(&self, state: &str, code: &str) -> AuthResult<SsoResolution> {
        if state.is_empty() {
            return Err(AuthError::InvalidFederationState);
        }

        let Some(session) = self.repo.find_session_by_state(state).await? else {
            log::warn!("SSO completion with unknown state");
            return Err(AuthError::InvalidFederationState);
        };

        if session.status != SsoSessionStatus::Pending {
            log::warn!(
                "SSO completion for session {} in status {}",
                session.id,
                session.status.as_str()
            );
            return Err(AuthError::InvalidFederationState);
        }

        let now = self.clock.now();
        if now >= session.expires_at {
            self.repo
                .transition(session.id, SsoSessionStatus::Pending, SsoSessionStatus::Expired)
                .await?;
            log::warn!("SSO session {} expired before completion", session.id);
            return Err(AuthError::InvalidFederationState);
        }

        if code.trim().is_empty() {
            return self.fail(&session, "empty authorization code").await;
        }

        let provider = match self
            .repo
            .find_provider(session.tenant_id, session.provider_id)
            .await?
        {
            Some(p) if p.is_active() => p,
            _ => return self.fail(&session, "provider missing or disabled").await,
        };

        let strategy = match self.strategy(provider.provider_type()) {
            Ok(s) => s.clone(),
            Err(e) => return self.fail(&session, &e.to_string()).await,
        };

        let exchange = tokio::time::timeout(
            self.config.exchange_timeout,
            strategy.exchange(&provider, &session, code.trim()),
        )
        .await;

        let info = match exchange {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return self.fail(&session, &e.to_string()).await,
            Err(_) => {
                let cause = format!("exchange timed out after {:?}", self.config.exchange_timeout);
                return self.fail(&session, &cause).await;
            }
        };

        let resolved = match self
            .repo
            .complete_session(&session, &info, &provider.default_role, self.clock.now())
            .await
        {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                log::warn!("SSO session {} was finished concurrently", session.id);
                return Err(AuthError::InvalidFederationState);
            }
            Err(e) => return self.fail(&session, &e.to_string()).await,
        };

        log::info!(
            "SSO session {} completed for identity {} ({:?})",
            session.id,
            resolved.identity.id,
            resolved.resolution
        );
        Ok(resolved)
    }

    async fn fail<T>(&self, session: &SsoSession, cause: &str) -> AuthResult<T> {
        log::warn!("SSO session {} failed: {}", session.id, cause);
        if let Err(e) = self
            .repo
            .transition(session.id, SsoSessionStatus::Pending, SsoSessionStatus::Failed)
            .await
        {
            log::error!("Failed to mark SSO session {} failed: {}", session.id, e);
        }
        Err(AuthError::FederationFailed(GENERIC_FAILURE.into()))
    }

    /// Mark every pending session past its expiry as expired
    pub async fn sweep_expired(&self) -> AuthResult<u64> {
        let swept = self.repo.expire_pending(self.clock.now()).await?;
        if swept > 0 {
            log::info!("Expired {} pending SSO sessions", swept);
        }
        Ok(swept)
    }
}
