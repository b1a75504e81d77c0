//! Provider-typed exchange contract.

use async_trait::async_trait;
use std::collections::HashMap;

use super::models::{ExternalUserInfo, SsoProvider, SsoSession};
use crate::errors::AuthResult;

/// One protocol's half of a federation attempt
#[async_trait]
pub trait FederationStrategy: Send + Sync {
    /// URL the user agent is sent to; carries the session's `state`
    fn authorization_url(&self, provider: &SsoProvider, session: &SsoSession) -> AuthResult<String>;

    /// Turn what the provider sent back (authorization code, SAML response) into a
    /// normalized external user
    async fn exchange(
        &self,
        provider: &SsoProvider,
        session: &SsoSession,
        code: &str,
    ) -> AuthResult<ExternalUserInfo>;
}

/// Flatten top-level scalar JSON members into string attributes
pub fn flatten_claims(value: &serde_json::Value) -> HashMap<String, String> {
    let Some(object) = value.as_object() else {
        return HashMap::new();
    };

    object
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_claims_keeps_scalars() {
        let attrs = flatten_claims(&json!({
            "id": 42,
            "email": "ada@example.com",
            "verified": true,
            "groups": ["a", "b"],
            "profile": {"x": 1}
        }));

        assert_eq!(attrs.get("id").map(String::as_str), Some("42"));
        assert_eq!(attrs.get("verified").map(String::as_str), Some("true"));
        assert!(!attrs.contains_key("groups"));
        assert!(!attrs.contains_key("profile"));
    }
}
