//! OAuth2 authorization-code and OpenID Connect strategies.

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use super::models::{
    AttributeMap, ExternalUserInfo, OAuth2Config, OidcConfig, ProviderConfig, SsoProvider, SsoSession,
};
use super::strategy::{FederationStrategy, flatten_claims};
use crate::errors::{AuthError, AuthResult};

/// Clock skew tolerated on ID token timestamps
const ID_TOKEN_LEEWAY_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
}

fn authorization_url(
    endpoint: &str,
    client_id: &str,
    scopes: &[String],
    session: &SsoSession,
    nonce: Option<&str>,
) -> AuthResult<String> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| AuthError::Validation(format!("invalid authorization endpoint: {e}")))?;

    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", &session.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", &session.state);
        if let Some(nonce) = nonce {
            pairs.append_pair("nonce", nonce);
        }
    }

    Ok(url.to_string())
}

async fn exchange_code(
    http: &Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    redirect_uri: &str,
    code: &str,
) -> AuthResult<TokenResponse> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];

    let response = http
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| AuthError::IdentityProvider(format!("token exchange failed: {e}")))?;

    if !response.status().is_success() {
        return Err(AuthError::IdentityProvider(format!(
            "token exchange failed with status {}",
            response.status()
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| AuthError::IdentityProvider(format!("failed to parse token response: {e}")))
}

fn user_info(map: &AttributeMap, attributes: HashMap<String, String>) -> AuthResult<ExternalUserInfo> {
    ExternalUserInfo::from_attributes(map, attributes)
        .ok_or_else(|| AuthError::FederationFailed("provider response lacks an external user id".into()))
}

/// Plain OAuth2: code exchange followed by a userinfo request
#[derive(Debug, Clone, Default)]
pub struct OAuth2Strategy {
    http: Client,
}

impl OAuth2Strategy {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    fn config(provider: &SsoProvider) -> AuthResult<&OAuth2Config> {
        match &provider.config {
            ProviderConfig::Oauth2(config) => Ok(config),
            _ => Err(AuthError::FederationFailed("provider is not an OAuth2 provider".into())),
        }
    }
}

#[async_trait]
impl FederationStrategy for OAuth2Strategy {
    fn authorization_url(&self, provider: &SsoProvider, session: &SsoSession) -> AuthResult<String> {
        let config = Self::config(provider)?;
        authorization_url(
            &config.authorization_endpoint,
            &config.client_id,
            &config.scopes,
            session,
            None,
        )
    }

    async fn exchange(
        &self,
        provider: &SsoProvider,
        session: &SsoSession,
        code: &str,
    ) -> AuthResult<ExternalUserInfo> {
        let config = Self::config(provider)?;
        let tokens = exchange_code(
            &self.http,
            &config.token_endpoint,
            &config.client_id,
            &config.client_secret,
            &session.redirect_uri,
            code,
        )
        .await?;

        let response = self
            .http
            .get(&config.userinfo_endpoint)
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|e| AuthError::IdentityProvider(format!("userinfo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::IdentityProvider(format!(
                "userinfo request failed with status {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AuthError::IdentityProvider(format!("failed to parse userinfo: {e}")))?;

        user_info(&config.attribute_map, flatten_claims(&body))
    }
}

/// OpenID Connect: code exchange plus ID token validation against the provider JWKS
#[derive(Debug, Clone, Default)]
pub struct OidcStrategy {
    http: Client,
    /// Key sets by JWKS URI
    jwks_cache: Arc<RwLock<HashMap<String, JwkSet>>>,
}

impl OidcStrategy {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            jwks_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn config(provider: &SsoProvider) -> AuthResult<&OidcConfig> {
        match &provider.config {
            ProviderConfig::Oidc(config) => Ok(config),
            _ => Err(AuthError::FederationFailed("provider is not an OIDC provider".into())),
        }
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> AuthResult<JwkSet> {
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::IdentityProvider(format!("failed to fetch JWKS: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::IdentityProvider(format!("failed to parse JWKS: {e}")))?;

        self.jwks_cache
            .write()
            .await
            .insert(jwks_uri.to_string(), jwks.clone());
        Ok(jwks)
    }

    /// Decoding key for `kid`; refetches the key set once when the kid is unknown
    async fn decoding_key(&self, jwks_uri: &str, kid: &str) -> AuthResult<DecodingKey> {
        let cached = self
            .jwks_cache
            .read()
            .await
            .get(jwks_uri)
            .and_then(|set| set.find(kid).cloned());

        let jwk = match cached {
            Some(jwk) => jwk,
            None => self
                .fetch_jwks(jwks_uri)
                .await?
                .find(kid)
                .cloned()
                .ok_or_else(|| AuthError::FederationFailed(format!("no JWKS key for kid {kid}")))?,
        };

        DecodingKey::from_jwk(&jwk)
            .map_err(|e| AuthError::FederationFailed(format!("unusable JWKS key: {e}")))
    }

    /// Validate signature, issuer, audience, expiry and nonce of an ID token
    pub async fn validate_id_token(
        &self,
        config: &OidcConfig,
        id_token: &str,
        expected_nonce: &str,
    ) -> AuthResult<HashMap<String, String>> {
        let header = decode_header(id_token)
            .map_err(|e| AuthError::FederationFailed(format!("malformed ID token: {e}")))?;

        if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(AuthError::FederationFailed("symmetric ID token algorithm rejected".into()));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::FederationFailed("ID token header lacks kid".into()))?;

        let key = self.decoding_key(&config.jwks_uri, &kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.client_id]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = ID_TOKEN_LEEWAY_SECS;

        let claims = decode::<serde_json::Value>(id_token, &key, &validation)
            .map_err(|e| AuthError::FederationFailed(format!("ID token rejected: {e}")))?
            .claims;

        check_nonce(&claims, expected_nonce)?;
        Ok(flatten_claims(&claims))
    }
}

fn check_nonce(claims: &serde_json::Value, expected: &str) -> AuthResult<()> {
    match claims.get("nonce").and_then(|n| n.as_str()) {
        Some(nonce) if crate::crypto::CredentialHasher::constant_time_eq(nonce, expected) => Ok(()),
        Some(_) => Err(AuthError::FederationFailed("ID token nonce mismatch".into())),
        None => Err(AuthError::FederationFailed("ID token lacks nonce".into())),
    }
}

#[async_trait]
impl FederationStrategy for OidcStrategy {
    fn authorization_url(&self, provider: &SsoProvider, session: &SsoSession) -> AuthResult<String> {
        let config = Self::config(provider)?;
        let mut scopes = config.scopes.clone();
        if !scopes.iter().any(|s| s == "openid") {
            scopes.insert(0, "openid".to_string());
        }
        authorization_url(
            &config.authorization_endpoint,
            &config.client_id,
            &scopes,
            session,
            Some(&session.nonce),
        )
    }

    async fn exchange(
        &self,
        provider: &SsoProvider,
        session: &SsoSession,
        code: &str,
    ) -> AuthResult<ExternalUserInfo> {
        let config = Self::config(provider)?;
        let tokens = exchange_code(
            &self.http,
            &config.token_endpoint,
            &config.client_id,
            &config.client_secret,
            &session.redirect_uri,
            code,
        )
        .await?;

        let id_token = tokens
            .id_token
            .ok_or_else(|| AuthError::FederationFailed("token response lacks id_token".into()))?;

        let attributes = self
            .validate_id_token(config, &id_token, &session.nonce)
            .await?;
        user_info(&config.attribute_map, attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sso::models::{ProviderStatus, SsoSessionStatus};
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::{Value, json};
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SIGNING_KEY_1: &str = include_str!("../../tests/fixtures/oidc_signing_key_1.pem");
    const SIGNING_KEY_2: &str = include_str!("../../tests/fixtures/oidc_signing_key_2.pem");
    const JWK_1: &str = include_str!("../../tests/fixtures/oidc_jwk_1.json");
    const JWK_2: &str = include_str!("../../tests/fixtures/oidc_jwk_2.json");

    fn session() -> SsoSession {
        let now = Utc::now();
        SsoSession {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            state: "state-123".into(),
            nonce: "nonce-456".into(),
            redirect_uri: "https://app.example.com/callback".into(),
            status: SsoSessionStatus::Pending,
            created_at: now,
            expires_at: now + Duration::minutes(15),
        }
    }

    fn provider(config: ProviderConfig) -> SsoProvider {
        SsoProvider {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "idp".into(),
            status: ProviderStatus::Active,
            config,
            allowed_redirect_uris: Vec::new(),
            default_role: "member".into(),
            created_at: Utc::now(),
        }
    }

    fn oidc_config() -> OidcConfig {
        OidcConfig {
            client_id: "client".into(),
            client_secret: "secret".into(),
            issuer: "https://idp.example.com".into(),
            authorization_endpoint: "https://idp.example.com/authorize".into(),
            token_endpoint: "https://idp.example.com/token".into(),
            jwks_uri: "https://idp.example.com/jwks".into(),
            scopes: vec!["email".into(), "profile".into()],
            attribute_map: AttributeMap::oidc(),
        }
    }

    #[test]
    fn test_oidc_url_carries_nonce_and_openid_scope() {
        let url = OidcStrategy::default()
            .authorization_url(&provider(ProviderConfig::Oidc(oidc_config())), &session())
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let query: HashMap<String, String> = parsed.query_pairs().into_owned().collect();

        assert_eq!(query["client_id"], "client");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["state"], "state-123");
        assert_eq!(query["nonce"], "nonce-456");
        assert_eq!(query["scope"], "openid email profile");
        assert_eq!(query["redirect_uri"], "https://app.example.com/callback");
    }

    #[test]
    fn test_strategy_rejects_other_provider_type() {
        let result = OAuth2Strategy::default()
            .authorization_url(&provider(ProviderConfig::Oidc(oidc_config())), &session());
        assert!(matches!(result, Err(AuthError::FederationFailed(_))));
    }

    #[test]
    fn test_nonce_check() {
        assert!(check_nonce(&json!({"nonce": "n"}), "n").is_ok());
        assert!(check_nonce(&json!({"nonce": "other"}), "n").is_err());
        assert!(check_nonce(&json!({}), "n").is_err());
    }

    #[tokio::test]
    async fn test_symmetric_id_token_rejected() {
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &json!({"sub": "x", "nonce": "nonce-456"}),
            &jsonwebtoken::EncodingKey::from_secret(b"shared"),
        )
        .unwrap();

        let result = OidcStrategy::default()
            .validate_id_token(&oidc_config(), &token, "nonce-456")
            .await;
        assert!(matches!(result, Err(AuthError::FederationFailed(_))));
    }

    fn jwks(keys: &[&str]) -> Value {
        let keys: Vec<Value> = keys.iter().map(|k| serde_json::from_str(k).unwrap()).collect();
        json!({ "keys": keys })
    }

    fn id_claims() -> Value {
        let now = Utc::now().timestamp();
        json!({
            "iss": "https://idp.example.com",
            "aud": "client",
            "sub": "user-42",
            "email": "Ada@Example.com",
            "name": "Ada Lovelace",
            "nonce": "nonce-456",
            "iat": now,
            "exp": now + 300,
        })
    }

    fn sign(pem: &str, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap()).unwrap()
    }

    fn served_config(server: &MockServer) -> OidcConfig {
        OidcConfig {
            jwks_uri: format!("{}/jwks", server.uri()),
            ..oidc_config()
        }
    }

    #[tokio::test]
    async fn test_rs256_id_token_validates_and_maps_claims() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks(&[JWK_1])))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = OidcStrategy::default();
        let config = served_config(&server);
        let token = sign(SIGNING_KEY_1, "signing-key-1", &id_claims());

        let attributes = strategy
            .validate_id_token(&config, &token, "nonce-456")
            .await
            .unwrap();
        let info = user_info(&config.attribute_map, attributes).unwrap();
        assert_eq!(info.external_user_id, "user-42");
        assert_eq!(info.email, "ada@example.com");
        assert_eq!(info.name, "Ada Lovelace");

        // Served from the cached key set
        let again = sign(SIGNING_KEY_1, "signing-key-1", &id_claims());
        assert!(strategy.validate_id_token(&config, &again, "nonce-456").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_kid_refetches_key_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks(&[JWK_1])))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks(&[JWK_1, JWK_2])))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = OidcStrategy::default();
        let config = served_config(&server);

        let before_rotation = sign(SIGNING_KEY_1, "signing-key-1", &id_claims());
        assert!(
            strategy
                .validate_id_token(&config, &before_rotation, "nonce-456")
                .await
                .is_ok()
        );

        let rotated = sign(SIGNING_KEY_2, "signing-key-2", &id_claims());
        assert!(strategy.validate_id_token(&config, &rotated, "nonce-456").await.is_ok());
        assert!(strategy.validate_id_token(&config, &rotated, "nonce-456").await.is_ok());

        assert_eq!(server.received_requests().await.unwrap_or_default().len(), 2);
    }

    #[tokio::test]
    async fn test_id_token_with_bad_issuer_audience_or_expiry_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks(&[JWK_1])))
            .mount(&server)
            .await;

        let strategy = OidcStrategy::default();
        let config = served_config(&server);
        let expired_at = Utc::now().timestamp() - 2 * ID_TOKEN_LEEWAY_SECS as i64;

        let cases = [
            ("iss", json!("https://evil.example.net")),
            ("aud", json!("someone-else")),
            ("exp", json!(expired_at)),
        ];
        for (claim, value) in cases {
            let mut claims = id_claims();
            claims[claim] = value;
            let token = sign(SIGNING_KEY_1, "signing-key-1", &claims);

            let result = strategy.validate_id_token(&config, &token, "nonce-456").await;
            assert!(
                matches!(result, Err(AuthError::FederationFailed(_))),
                "token with bad {claim} was accepted"
            );
        }

        // Signed by a key the provider never published
        let foreign = sign(SIGNING_KEY_2, "signing-key-1", &id_claims());
        assert!(strategy.validate_id_token(&config, &foreign, "nonce-456").await.is_err());
    }
}
