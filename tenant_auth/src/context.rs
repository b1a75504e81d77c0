//! Explicit tenant context and the clock every time rule is evaluated against.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::errors::{AuthError, AuthResult};

/// Tenant and (optionally) acting identity for one request.
///
/// Passed by value into every tenant-scoped operation; repositories filter every
/// query by `tenant_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub identity_id: Option<Uuid>,
}

impl TenantContext {
    /// Context for anonymous, tenant-scoped operations (login, registration)
    pub fn tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            identity_id: None,
        }
    }

    /// Context acting on behalf of an identity
    pub fn identity(tenant_id: Uuid, identity_id: Uuid) -> Self {
        Self {
            tenant_id,
            identity_id: Some(identity_id),
        }
    }

    /// The acting identity, or a validation error if the context has none
    pub fn require_identity(&self) -> AuthResult<Uuid> {
        self.identity_id
            .ok_or_else(|| AuthError::Validation("operation requires an identity".to_string()))
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for simulations and tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward (or backward, with a negative duration)
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;
