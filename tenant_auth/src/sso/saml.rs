//! SAML 2.0 HTTP-Redirect AuthnRequest and assertion parsing.
//!
//! XML signature verification is delegated to an [`AssertionVerifier`]; the default
//! verifier refuses every response, so a SAML provider only works once a real verifier
//! is installed.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use url::Url;

use super::models::{ExternalUserInfo, ProviderConfig, SamlConfig, SsoProvider, SsoSession};
use super::strategy::FederationStrategy;
use crate::context::SharedClock;
use crate::errors::{AuthError, AuthResult};

/// Attribute under which the subject NameID is exposed to the attribute map
pub const NAME_ID_ATTRIBUTE: &str = "NameID";

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Checks the XML signature of a SAML response
pub trait AssertionVerifier: Send + Sync {
    /// # Arguments
    ///
    /// * `response_xml` - Decoded `samlp:Response` document
    /// * `idp_certificate` - PEM certificate configured for the provider
    fn verify(&self, response_xml: &str, idp_certificate: &str) -> AuthResult<()>;
}

/// Refuses every response
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingVerifier;

impl AssertionVerifier for RejectingVerifier {
    fn verify(&self, _response_xml: &str, _idp_certificate: &str) -> AuthResult<()> {
        Err(AuthError::FederationFailed(
            "no SAML signature verifier configured".into(),
        ))
    }
}

/// Fields of a SAML response relevant to login
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAssertion {
    pub status: Option<String>,
    pub issuer: Option<String>,
    pub in_response_to: Option<String>,
    pub audiences: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub name_id: Option<String>,
    pub attributes: HashMap<String, String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TextField {
    Issuer,
    Audience,
    NameId,
    AttributeValue,
}

fn attr(element: &BytesStart<'_>, name: &[u8]) -> AuthResult<Option<String>> {
    for attribute in element.attributes() {
        let attribute =
            attribute.map_err(|e| AuthError::FederationFailed(format!("malformed SAML attribute: {e}")))?;
        if attribute.key.local_name().as_ref() == name {
            let value = attribute
                .unescape_value()
                .map_err(|e| AuthError::FederationFailed(format!("malformed SAML attribute: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn timestamp(value: Option<String>) -> AuthResult<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| AuthError::FederationFailed(format!("malformed SAML timestamp: {e}")))
        })
        .transpose()
}

/// Earliest of two optional instants
fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Extract login-relevant fields from a `samlp:Response`
pub fn parse_response(xml: &str) -> AuthResult<ParsedAssertion> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parsed = ParsedAssertion::default();
    let mut field: Option<TextField> = None;
    let mut attribute_name: Option<String> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| AuthError::FederationFailed(format!("malformed SAML response: {e}")))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                b"Response" => {
                    parsed.in_response_to = attr(e, b"InResponseTo")?.or(parsed.in_response_to);
                }
                b"StatusCode" if parsed.status.is_none() => {
                    parsed.status = attr(e, b"Value")?;
                }
                b"Issuer" => field = Some(TextField::Issuer),
                b"Audience" => field = Some(TextField::Audience),
                b"NameID" => field = Some(TextField::NameId),
                b"SubjectConfirmationData" => {
                    if parsed.in_response_to.is_none() {
                        parsed.in_response_to = attr(e, b"InResponseTo")?;
                    }
                    let limit = timestamp(attr(e, b"NotOnOrAfter")?)?;
                    parsed.not_on_or_after = earliest(parsed.not_on_or_after, limit);
                }
                b"Conditions" => {
                    parsed.not_before = timestamp(attr(e, b"NotBefore")?)?;
                    let limit = timestamp(attr(e, b"NotOnOrAfter")?)?;
                    parsed.not_on_or_after = earliest(parsed.not_on_or_after, limit);
                }
                b"Attribute" => attribute_name = attr(e, b"Name")?,
                b"AttributeValue" => field = Some(TextField::AttributeValue),
                _ => {}
            },
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map_err(|e| AuthError::FederationFailed(format!("malformed SAML text: {e}")))?
                    .into_owned();

                match field {
                    // The first Issuer wins; the response and assertion issuers must agree anyway
                    Some(TextField::Issuer) if parsed.issuer.is_none() => parsed.issuer = Some(text),
                    Some(TextField::Audience) => parsed.audiences.push(text),
                    Some(TextField::NameId) => parsed.name_id = Some(text),
                    Some(TextField::AttributeValue) => {
                        if let Some(name) = &attribute_name {
                            parsed.attributes.entry(name.clone()).or_insert(text);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"Attribute" {
                    attribute_name = None;
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(parsed)
}

/// HTTP-Redirect binding with POSTed responses
#[derive(Clone)]
pub struct SamlStrategy {
    verifier: Arc<dyn AssertionVerifier>,
    clock: SharedClock,
}

impl SamlStrategy {
    pub fn new(verifier: Arc<dyn AssertionVerifier>, clock: SharedClock) -> Self {
        Self { verifier, clock }
    }

    fn config(provider: &SsoProvider) -> AuthResult<&SamlConfig> {
        match &provider.config {
            ProviderConfig::Saml(config) => Ok(config),
            _ => Err(AuthError::FederationFailed("provider is not a SAML provider".into())),
        }
    }

    /// Deflated, base64-encoded AuthnRequest
    pub fn encode_authn_request(config: &SamlConfig, session: &SsoSession) -> AuthResult<String> {
        let xml = format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
                r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0" "#,
                r#"IssueInstant="{}" Destination="{}" AssertionConsumerServiceURL="{}" "#,
                r#"ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST">"#,
                r#"<saml:Issuer>{}</saml:Issuer></samlp:AuthnRequest>"#
            ),
            session.saml_request_id(),
            session.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            escape(config.sso_url.as_str()),
            escape(config.acs_url.as_str()),
            escape(config.entity_id.as_str()),
        );

        let encode_failed = |e: std::io::Error| AuthError::FederationFailed(format!("failed to encode AuthnRequest: {e}"));
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(xml.as_bytes()).map_err(encode_failed)?;
        let deflated = encoder.finish().map_err(encode_failed)?;

        Ok(STANDARD.encode(deflated))
    }

    fn check(&self, config: &SamlConfig, session: &SsoSession, parsed: &ParsedAssertion) -> AuthResult<()> {
        let now = self.clock.now();

        if parsed.status.as_deref().is_some_and(|s| s != STATUS_SUCCESS) {
            return Err(AuthError::FederationFailed("SAML response status is not success".into()));
        }
        if parsed.in_response_to.as_deref() != Some(session.saml_request_id().as_str()) {
            return Err(AuthError::FederationFailed("SAML InResponseTo mismatch".into()));
        }
        if parsed.issuer.as_deref() != Some(config.idp_entity_id.as_str()) {
            return Err(AuthError::FederationFailed("SAML issuer mismatch".into()));
        }
        if !parsed.audiences.iter().any(|a| a == &config.entity_id) {
            return Err(AuthError::FederationFailed("SAML audience mismatch".into()));
        }
        if parsed.not_before.is_some_and(|t| now < t) {
            return Err(AuthError::FederationFailed("SAML assertion not yet valid".into()));
        }
        match parsed.not_on_or_after {
            Some(limit) if now < limit => Ok(()),
            Some(_) => Err(AuthError::FederationFailed("SAML assertion expired".into())),
            None => Err(AuthError::FederationFailed("SAML assertion lacks NotOnOrAfter".into())),
        }
    }
}

#[async_trait]
impl FederationStrategy for SamlStrategy {
    fn authorization_url(&self, provider: &SsoProvider, session: &SsoSession) -> AuthResult<String> {
        let config = Self::config(provider)?;
        let request = Self::encode_authn_request(config, session)?;

        let mut url = Url::parse(&config.sso_url)
            .map_err(|e| AuthError::Validation(format!("invalid SAML SSO URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("SAMLRequest", &request)
            .append_pair("RelayState", &session.state);

        Ok(url.to_string())
    }

    /// `code` is the base64 `SAMLResponse` form value
    async fn exchange(
        &self,
        provider: &SsoProvider,
        session: &SsoSession,
        code: &str,
    ) -> AuthResult<ExternalUserInfo> {
        let config = Self::config(provider)?;

        let compact: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        let xml = STANDARD
            .decode(compact)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| AuthError::FederationFailed("SAMLResponse is not base64 XML".into()))?;

        self.verifier.verify(&xml, &config.idp_certificate)?;

        let parsed = parse_response(&xml)?;
        self.check(config, session, &parsed)?;

        let mut attributes = parsed.attributes;
        if let Some(name_id) = parsed.name_id {
            attributes.insert(NAME_ID_ATTRIBUTE.to_string(), name_id);
        }

        ExternalUserInfo::from_attributes(&config.attribute_map, attributes)
            .ok_or_else(|| AuthError::FederationFailed("SAML assertion lacks a subject".into()))
    }
}
