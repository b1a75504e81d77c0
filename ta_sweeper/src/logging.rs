//! Structured logging configuration.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging
///
/// Levels come from `RUST_LOG` (default `info,sqlx=warn`). Records emitted by the
/// library through the `log` facade are bridged into the same subscriber.
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Structured logging initialized");
}

/// Log the outcome of one sweep pass with structured fields
pub fn log_sweep(report: &crate::sweep::SweepReport, duration_ms: u64) {
    if report.failures > 0 {
        tracing::warn!(
            sessions_expired = report.sessions_expired,
            sso_sessions_expired = report.sso_sessions_expired,
            rate_windows_deleted = report.rate_windows_deleted,
            pre_auth_ids_purged = report.pre_auth_ids_purged,
            failures = report.failures,
            duration_ms = duration_ms,
            "Sweep pass finished with failures"
        );
    } else {
        tracing::info!(
            sessions_expired = report.sessions_expired,
            sso_sessions_expired = report.sso_sessions_expired,
            rate_windows_deleted = report.rate_windows_deleted,
            pre_auth_ids_purged = report.pre_auth_ids_purged,
            duration_ms = duration_ms,
            "Sweep pass finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::SweepReport;

    #[test]
    fn test_log_sweep() {
        log_sweep(&SweepReport::default(), 3);
        log_sweep(
            &SweepReport {
                failures: 1,
                ..SweepReport::default()
            },
            1500,
        );
    }
}
