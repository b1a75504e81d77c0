//! # Tenant Auth
//!
//! Identity and session security core for a multi-tenant platform.
//!
//! The crate issues and verifies bearer credentials, runs multi-factor authentication,
//! federates logins through external identity providers, tracks per-device sessions,
//! enforces password strength and rate-limits API tokens. Storage sits behind async
//! repository traits with a PostgreSQL and an in-memory implementation.
//!
//! ## Architecture
//!
//! Components, leaf-first:
//!
//! - **PasswordPolicyEngine**: scores and accepts or rejects candidate passwords
//! - **CredentialHasher**: Argon2id passwords, keyed hashes for tokens and backup codes
//! - **MfaEngine**: TOTP, delivered codes and single-use backup codes
//! - **TokenService**: signed access/refresh pairs
//! - **SessionStore**: per-device sessions with a per-identity cap
//! - **SsoFederator**: OAuth2, OIDC and SAML login state machine
//! - **RateLimiter**: fixed-window quota per API token
//! - **AuthOrchestrator**: login, MFA verification, refresh and logout entry points
//!
//! ## Core Modules
//!
//! - [`orchestrator`]: Entry points sequencing the components
//! - [`db`]: Repository traits, [`PgStore`] and [`MemoryStore`]
//! - [`config`]: [`CoreConfig`] and environment loading

pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod identity;
pub mod mfa;
pub mod orchestrator;
pub mod password;
pub mod ratelimit;
pub mod session;
pub mod sso;
pub mod token;

pub use config::{ConfigError, CoreConfig, SecurityConfig};
pub use context::{Clock, ManualClock, SharedClock, SystemClock, TenantContext};
pub use crypto::CredentialHasher;
pub use db::{Database, DatabaseConfig, MemoryStore, PgStore};
pub use errors::{AuthError, AuthResult, ErrorKind, TokenRejection};
pub use identity::Identity;
pub use mfa::MfaEngine;
pub use orchestrator::{
    AuthOrchestrator, LoginOutcome, LoginRequest, LoginResponse, MfaVerifyRequest, RegisterRequest,
};
pub use password::{PasswordPolicy, PasswordPolicyEngine};
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use session::SessionStore;
pub use sso::SsoFederator;
pub use token::{Principal, TokenPair, TokenService};
