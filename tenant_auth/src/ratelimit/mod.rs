//! Per-credential request quotas.

pub mod limiter;

pub use limiter::{RateLimitDecision, RateLimiter};
