//! Single sign-on through external identity providers.

pub mod federator;
pub mod models;
pub mod oauth;
pub mod saml;
pub mod strategy;

pub use federator::SsoFederator;
pub use models::{
    AttributeMap, ExternalUserInfo, OAuth2Config, OidcConfig, ProviderConfig, ProviderStatus,
    ProviderType, Resolution, SamlConfig, SsoProvider, SsoResolution, SsoSession, SsoSessionStatus,
    SsoUserMapping,
};
pub use oauth::{OAuth2Strategy, OidcStrategy};
pub use saml::{AssertionVerifier, RejectingVerifier, SamlStrategy};
pub use strategy::FederationStrategy;
