//! Long-lived API tokens.
//!
//! Plaintext format is `tat_<64 hex>`. Only the SHA-256 hex digest and the first 10
//! plaintext characters (for display) are stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::claims::{AuthMethod, Principal};
use crate::context::{SharedClock, TenantContext};
use crate::crypto::{CredentialHasher, random};
use crate::db::{ApiTokenRepository, IdentityRepository};
use crate::errors::{AuthError, AuthResult};
use crate::ratelimit::{RateLimitDecision, RateLimiter};

/// Fixed plaintext prefix
pub const API_TOKEN_PREFIX: &str = "tat";

/// Plaintext characters kept for display
const DISPLAY_PREFIX_LEN: usize = 10;

/// Default quota for new tokens
pub const DEFAULT_RATE_LIMIT_RPS: u32 = 10;

/// Stored API token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub identity_id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    /// First characters of the plaintext, for display only
    pub token_prefix: String,
    pub scopes: Vec<String>,
    pub rate_limit_rps: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiToken {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| exp > now)
    }
}

/// Returned once from [`ApiTokenService::create`]
#[derive(Debug, Clone)]
pub struct CreatedApiToken {
    pub token: ApiToken,
    /// Plaintext; never retrievable again
    pub plaintext: String,
}

/// Creates, authenticates and revokes API tokens
#[derive(Clone)]
pub struct ApiTokenService {
    tokens: Arc<dyn ApiTokenRepository>,
    identities: Arc<dyn IdentityRepository>,
    limiter: RateLimiter,
    clock: SharedClock,
}

impl ApiTokenService {
    pub fn new(
        tokens: Arc<dyn ApiTokenRepository>,
        identities: Arc<dyn IdentityRepository>,
        limiter: RateLimiter,
        clock: SharedClock,
    ) -> Self {
        Self {
            tokens,
            identities,
            limiter,
            clock,
        }
    }

    /// Create a token for the acting identity
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Missing identity, empty name, zero rate, past expiry
    /// * `AuthError::NotFound` - Identity does not exist in the tenant
    pub async fn create(
        &self,
        ctx: TenantContext,
        name: &str,
        scopes: Vec<String>,
        rate_limit_rps: u32,
        expires_at: Option<DateTime<Utc>>,
    ) -> AuthResult<CreatedApiToken> {
        let identity_id = ctx.require_identity()?;
        let now = self.clock.now();

        if name.trim().is_empty() {
            return Err(AuthError::Validation("token name is required".into()));
        }
        if rate_limit_rps == 0 {
            return Err(AuthError::Validation("rate limit must be at least 1".into()));
        }
        if expires_at.is_some_and(|exp| exp <= now) {
            return Err(AuthError::Validation("expiry must be in the future".into()));
        }

        self.identities
            .find_by_id(ctx.tenant_id, identity_id)
            .await?
            .ok_or(AuthError::NotFound("identity"))?;

        let plaintext = format!("{}_{}", API_TOKEN_PREFIX, random::random_hex(32));
        let token = ApiToken {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            identity_id,
            name: name.trim().to_string(),
            token_hash: CredentialHasher::digest(&plaintext),
            token_prefix: plaintext.chars().take(DISPLAY_PREFIX_LEN).collect(),
            scopes,
            rate_limit_rps,
            expires_at,
            last_used_at: None,
            revoked_at: None,
            created_at: now,
        };

        self.tokens.create(&token).await?;
        log::info!(
            "API token {} created for identity {} in tenant {}",
            token.id,
            identity_id,
            ctx.tenant_id
        );

        Ok(CreatedApiToken { token, plaintext })
    }

    /// Authenticate a request bearing an API token
    ///
    /// Counts the request against the token's rate limit.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidApiToken` - Malformed, unknown, revoked or expired token,
    ///   or its identity is gone or disabled
    /// * `AuthError::RateLimited` - Quota for the current window exhausted
    pub async fn authenticate(&self, plaintext: &str) -> AuthResult<Principal> {
        if !is_well_formed(plaintext) {
            return Err(AuthError::InvalidApiToken);
        }

        let now = self.clock.now();
        let token = self
            .tokens
            .find_by_hash(&CredentialHasher::digest(plaintext))
            .await?
            .ok_or(AuthError::InvalidApiToken)?;

        if !token.is_usable(now) {
            log::warn!("Rejected revoked or expired API token {}", token.id);
            return Err(AuthError::InvalidApiToken);
        }

        if let RateLimitDecision::Denied { retry_after_secs } =
            self.limiter.check(token.id, token.rate_limit_rps).await?
        {
            return Err(AuthError::RateLimited { retry_after_secs });
        }

        let identity = self
            .identities
            .find_by_id(token.tenant_id, token.identity_id)
            .await?
            .filter(|i| i.is_active)
            .ok_or(AuthError::InvalidApiToken)?;

        self.tokens.touch(token.id, now).await?;

        Ok(Principal {
            identity_id: identity.id,
            tenant_id: token.tenant_id,
            email: identity.email,
            role: identity.role,
            permissions: token.scopes,
            method: AuthMethod::ApiToken { token_id: token.id },
        })
    }

    /// Revoke a token owned by the acting identity
    ///
    /// # Errors
    ///
    /// * `AuthError::NotFound` - Unknown, already revoked, or owned by another identity
    pub async fn revoke(&self, ctx: TenantContext, token_id: Uuid) -> AuthResult<()> {
        let identity_id = ctx.require_identity()?;
        if self
            .tokens
            .revoke(ctx.tenant_id, identity_id, token_id, self.clock.now())
            .await?
        {
            log::info!(
                "API token {} of identity {} revoked in tenant {}",
                token_id,
                identity_id,
                ctx.tenant_id
            );
            Ok(())
        } else {
            Err(AuthError::NotFound("API token"))
        }
    }

    /// Tokens of the acting identity
    pub async fn list(&self, ctx: TenantContext) -> AuthResult<Vec<ApiToken>> {
        let identity_id = ctx.require_identity()?;
        self.tokens.list(ctx.tenant_id, identity_id).await
    }
}

fn is_well_formed(plaintext: &str) -> bool {
    plaintext
        .strip_prefix(API_TOKEN_PREFIX)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_check() {
        let good = format!("tat_{}", "a1".repeat(32));
        assert!(is_well_formed(&good));
        assert!(!is_well_formed("tat_short"));
        assert!(!is_well_formed(&format!("xyz_{}", "a1".repeat(32))));
        assert!(!is_well_formed(&format!("tat_{}", "zz".repeat(32))));
    }
}
