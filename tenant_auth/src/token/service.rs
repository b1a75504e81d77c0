//! Issuance, validation and refresh of signed bearer tokens.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind as JwtErrorKind,
};
use uuid::Uuid;

use super::claims::{ClaimSet, Claims, TokenKind, TokenPair};
use crate::config::TokenConfig;
use crate::context::SharedClock;
use crate::errors::{AuthError, AuthResult, TokenRejection};

/// Issues and validates HS256 token pairs
///
/// Tokens are self-contained. Revocation is enforced by the session store, not here.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    config: TokenConfig,
    clock: SharedClock,
}

impl TokenService {
    /// Create a new token service
    ///
    /// # Arguments
    ///
    /// * `signing_key` - Shared HMAC secret
    /// * `config` - Issuer, audience and lifetimes
    /// * `clock` - Time source for `iat`/`exp` and expiry checks
    pub fn new(signing_key: &str, config: TokenConfig, clock: SharedClock) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
            config,
            clock,
        }
    }

    /// Issue a fresh access/refresh pair
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Nil identity or tenant id
    /// * `AuthError::Jwt` - Encoding failed
    pub fn issue(&self, identity_id: Uuid, tenant_id: Uuid, claims: &ClaimSet) -> AuthResult<TokenPair> {
        if identity_id.is_nil() || tenant_id.is_nil() {
            return Err(AuthError::Validation("identity and tenant ids are required".into()));
        }

        let now = self.clock.now();
        let (access_token, expires_at) =
            self.sign(identity_id, tenant_id, claims, TokenKind::Access, now, self.config.access_ttl)?;
        let (refresh_token, refresh_expires_at) = self.sign(
            identity_id,
            tenant_id,
            claims,
            TokenKind::Refresh,
            now,
            self.config.refresh_ttl,
        )?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_at,
            refresh_expires_at,
            token_type: "Bearer".to_string(),
        })
    }

    /// Issue the short-lived token binding a password login to its MFA challenge
    pub fn issue_mfa_pending(
        &self,
        identity_id: Uuid,
        tenant_id: Uuid,
        claims: &ClaimSet,
    ) -> AuthResult<(String, DateTime<Utc>)> {
        let now = self.clock.now();
        self.sign(
            identity_id,
            tenant_id,
            claims,
            TokenKind::MfaPending,
            now,
            self.config.mfa_pending_ttl,
        )
    }

    /// Validate a token of the expected kind
    ///
    /// A good signature is not enough: subject and tenant must be non-nil, issuer and
    /// audience must match, `nbf <= now < exp`, and the kind must equal `expected`.
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidToken` - With the rejection reason
    pub fn validate(&self, token: &str, expected: TokenKind) -> AuthResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                let reason = match e.kind() {
                    JwtErrorKind::InvalidSignature => TokenRejection::BadSignature,
                    _ => TokenRejection::Malformed,
                };
                AuthError::InvalidToken(reason)
            })?
            .claims;

        if claims.sub.is_nil() || claims.tid.is_nil() {
            return Err(AuthError::InvalidToken(TokenRejection::MissingSubject));
        }
        if claims.iss.is_empty() || claims.iss != self.config.issuer {
            return Err(AuthError::InvalidToken(TokenRejection::WrongIssuer));
        }
        if claims.aud != self.config.audience {
            return Err(AuthError::InvalidToken(TokenRejection::WrongAudience));
        }

        let now = self.clock.now().timestamp();
        if now < claims.nbf {
            return Err(AuthError::InvalidToken(TokenRejection::NotYetValid));
        }
        if now >= claims.exp {
            return Err(AuthError::InvalidToken(TokenRejection::Expired));
        }
        if claims.typ != expected {
            return Err(AuthError::InvalidToken(TokenRejection::WrongType));
        }

        Ok(claims)
    }

    /// Validate an access token
    pub fn validate_access(&self, token: &str) -> AuthResult<Claims> {
        self.validate(token, TokenKind::Access)
    }

    /// Re-issue a pair from a valid refresh token
    ///
    /// The new pair carries the identity, tenant, role and permission snapshot of the
    /// presented token; nothing is re-read from current state.
    pub fn refresh(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let claims = self.validate(refresh_token, TokenKind::Refresh)?;
        self.issue(claims.sub, claims.tid, &claims.claim_set())
    }

    fn sign(
        &self,
        identity_id: Uuid,
        tenant_id: Uuid,
        set: &ClaimSet,
        kind: TokenKind,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AuthResult<(String, DateTime<Utc>)> {
        let expires_at = now + ttl;
        let claims = Claims {
            sub: identity_id,
            tid: tenant_id,
            email: set.email.clone(),
            role: set.role.clone(),
            perms: set.permissions.clone(),
            jti: Uuid::new_v4(),
            typ: kind,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            nbf: now.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok((token, expires_at))
    }
}
