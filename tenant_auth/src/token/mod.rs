//! Bearer tokens and API tokens.

pub mod api_token;
pub mod claims;
pub mod service;

pub use api_token::{ApiToken, ApiTokenService, CreatedApiToken, API_TOKEN_PREFIX};
pub use claims::{AuthMethod, ClaimSet, Claims, Principal, TokenKind, TokenPair};
pub use service::TokenService;
