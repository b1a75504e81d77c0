//! Password strength enforcement.
//!
//! Scoring is local and stateless: no I/O, no shared state.

pub mod patterns;
pub mod policy;

pub use policy::{PasswordPolicy, PasswordPolicyEngine, PasswordStrength, PasswordValidation};
