//! Login entry points sequencing password, MFA, federation, tokens and sessions.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenant_auth::{
//!     AuthOrchestrator, CoreConfig, LoginOutcome, LoginRequest, MemoryStore, SystemClock,
//!     TenantContext,
//! };
//! use tenant_auth::session::DeviceInfo;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::from_env()?;
//!     let auth = AuthOrchestrator::new(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock))?;
//!
//!     let ctx = TenantContext::tenant(Uuid::new_v4());
//!     let request = LoginRequest {
//!         email: "ada@example.com".to_string(),
//!         password: "Quartz-Falcon-93!".to_string(),
//!     };
//!
//!     match auth.login(ctx, request, DeviceInfo::default()).await? {
//!         LoginOutcome::Authenticated(response) => println!("session {}", response.session_id),
//!         LoginOutcome::MfaRequired { .. } => println!("second factor required"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod manager;
pub mod models;

pub use manager::AuthOrchestrator;
pub use models::{LoginOutcome, LoginRequest, LoginResponse, MfaVerifyRequest, RegisterRequest};
