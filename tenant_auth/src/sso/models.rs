//! Federation data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::identity::Identity;

/// Provider protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Oauth2,
    Oidc,
    Saml,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Oauth2 => "oauth2",
            ProviderType::Oidc => "oidc",
            ProviderType::Saml => "saml",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Disabled,
}

/// Maps provider attribute names onto normalized user fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMap {
    pub external_id: String,
    pub email: String,
    pub name: String,
}

impl AttributeMap {
    pub fn oauth2() -> Self {
        Self {
            external_id: "id".into(),
            email: "email".into(),
            name: "name".into(),
        }
    }

    pub fn oidc() -> Self {
        Self {
            external_id: "sub".into(),
            email: "email".into(),
            name: "name".into(),
        }
    }

    pub fn saml() -> Self {
        Self {
            external_id: "NameID".into(),
            email: "email".into(),
            name: "displayName".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub scopes: Vec<String>,
    pub attribute_map: AttributeMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcConfig {
    pub client_id: String,
    pub client_secret: String,
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub scopes: Vec<String>,
    pub attribute_map: AttributeMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamlConfig {
    /// Our service-provider entity id (AuthnRequest issuer, expected audience)
    pub entity_id: String,
    /// IdP entity id expected as the assertion issuer
    pub idp_entity_id: String,
    pub sso_url: String,
    /// Assertion consumer service URL
    pub acs_url: String,
    /// PEM certificate handed to the assertion verifier
    pub idp_certificate: String,
    pub attribute_map: AttributeMap,
}

/// Closed, provider-typed configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Oauth2(OAuth2Config),
    Oidc(OidcConfig),
    Saml(SamlConfig),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderConfig::Oauth2(_) => ProviderType::Oauth2,
            ProviderConfig::Oidc(_) => ProviderType::Oidc,
            ProviderConfig::Saml(_) => ProviderType::Saml,
        }
    }

    pub fn attribute_map(&self) -> &AttributeMap {
        match self {
            ProviderConfig::Oauth2(c) => &c.attribute_map,
            ProviderConfig::Oidc(c) => &c.attribute_map,
            ProviderConfig::Saml(c) => &c.attribute_map,
        }
    }
}

/// Tenant-configured identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoProvider {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: ProviderStatus,
    pub config: ProviderConfig,
    /// Allowed post-login redirect URIs; empty allows any
    pub allowed_redirect_uris: Vec<String>,
    /// Role given to identities created by this provider
    pub default_role: String,
    pub created_at: DateTime<Utc>,
}

impl SsoProvider {
    pub fn provider_type(&self) -> ProviderType {
        self.config.provider_type()
    }

    pub fn is_active(&self) -> bool {
        self.status == ProviderStatus::Active
    }

    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.allowed_redirect_uris.is_empty()
            || self.allowed_redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SsoSessionStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl SsoSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SsoSessionStatus::Pending => "pending",
            SsoSessionStatus::Completed => "completed",
            SsoSessionStatus::Failed => "failed",
            SsoSessionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SsoSessionStatus::Pending),
            "completed" => Some(SsoSessionStatus::Completed),
            "failed" => Some(SsoSessionStatus::Failed),
            "expired" => Some(SsoSessionStatus::Expired),
            _ => None,
        }
    }
}

/// One federation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider_id: Uuid,
    pub state: String,
    pub nonce: String,
    pub redirect_uri: String,
    pub status: SsoSessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SsoSession {
    /// SAML request id derived from the session id
    pub fn saml_request_id(&self) -> String {
        format!("_{}", self.id.simple())
    }
}

/// Durable link between an external identity and a local one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoUserMapping {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub identity_id: Uuid,
    pub provider_id: Uuid,
    pub external_user_id: String,
    pub external_email: String,
    pub external_name: String,
    pub attributes: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized user returned by every provider strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalUserInfo {
    pub external_user_id: String,
    pub email: String,
    pub name: String,
    pub attributes: HashMap<String, String>,
}

impl ExternalUserInfo {
    /// Build from a flat attribute bag using the provider's attribute map
    pub fn from_attributes(map: &AttributeMap, attributes: HashMap<String, String>) -> Option<Self> {
        let external_user_id = attributes.get(&map.external_id)?.trim().to_string();
        if external_user_id.is_empty() {
            return None;
        }
        let email = attributes
            .get(&map.email)
            .map(|e| e.trim().to_lowercase())
            .unwrap_or_default();
        let name = attributes.get(&map.name).cloned().unwrap_or_default();

        Some(Self {
            external_user_id,
            email,
            name,
            attributes,
        })
    }
}

/// How `complete` resolved the local identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Existing mapping reused
    ExistingMapping,
    /// Existing identity with the same email linked
    LinkedByEmail,
    /// New identity and mapping created
    Created,
}

/// Identity resolved by a completed federation attempt
#[derive(Debug, Clone)]
pub struct SsoResolution {
    pub identity: Identity,
    pub mapping: SsoUserMapping,
    pub resolution: Resolution,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_mapping() {
        let attrs = HashMap::from([
            ("sub".to_string(), "abc-123".to_string()),
            ("email".to_string(), "Ada@Example.com".to_string()),
            ("name".to_string(), "Ada".to_string()),
        ]);
        let info = ExternalUserInfo::from_attributes(&AttributeMap::oidc(), attrs).unwrap();
        assert_eq!(info.external_user_id, "abc-123");
        assert_eq!(info.email, "ada@example.com");
    }

    #[test]
    fn test_attribute_mapping_requires_external_id() {
        let attrs = HashMap::from([("email".to_string(), "a@b.c".to_string())]);
        assert!(ExternalUserInfo::from_attributes(&AttributeMap::oidc(), attrs).is_none());
    }

    #[test]
    fn test_provider_config_is_tagged() {
        let config = ProviderConfig::Saml(SamlConfig {
            entity_id: "sp".into(),
            idp_entity_id: "idp".into(),
            sso_url: "https://idp.example.com/sso".into(),
            acs_url: "https://sp.example.com/acs".into(),
            idp_certificate: String::new(),
            attribute_map: AttributeMap::saml(),
        });
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "saml");
        let back: ProviderConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
