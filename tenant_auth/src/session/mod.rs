//! Per-device sessions backed by hashed tokens.

pub mod models;
pub mod store;

pub use models::{
    DeviceInfo, REASON_EXCEEDED_MAX_SESSIONS, REASON_EXPIRED, REASON_LOGOUT, REASON_LOGOUT_ALL,
    REASON_PASSWORD_CHANGED, Session,
};
pub use store::SessionStore;
