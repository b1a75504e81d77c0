//! Periodic expiry sweeper for the tenant_auth identity store.
//!
//! Revokes sessions past their expiry, expires abandoned SSO attempts and deletes
//! old rate-limit windows, on an interval until Ctrl-C.

mod config;
mod logging;
mod sweep;

use std::sync::Arc;

use anyhow::Error;
use pico_args::Arguments;
use tenant_auth::{Database, SystemClock};

use crate::config::SweeperConfig;
use crate::sweep::Sweeper;

const HELP: &str = "\
Sweep expired sessions, SSO attempts, rate-limit windows and spent pre-auth ids

USAGE:
  ta_sweeper [OPTIONS]

OPTIONS:
  --db-url     URL         Database connection string  [default: env DATABASE_URL]
  --interval   SECS        Seconds between passes      [default: env SWEEP_INTERVAL_SECS or 60]

FLAGS:
  --once                   Run a single pass and exit
  -h, --help               Print help information

ENVIRONMENT:
  DATABASE_URL             PostgreSQL connection string
  SWEEP_INTERVAL_SECS      Seconds between passes
  RATE_LIMIT_RETENTION_SECS  Age after which rate-limit windows are deleted [default: 3600]
  RUST_LOG                 Log filter [default: info,sqlx=warn]
";

struct Args {
    database_url: Option<String>,
    interval: Option<u64>,
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    let args = Args {
        database_url: pargs.opt_value_from_str("--db-url")?,
        interval: pargs.opt_value_from_str("--interval")?,
        once: pargs.contains("--once"),
    };

    logging::init();

    let config = SweeperConfig::from_env(args.database_url, args.interval)?;

    tracing::info!("Connecting to database");
    let db = Database::new(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
    db.health_check()
        .await
        .map_err(|e| anyhow::anyhow!("Database health check failed: {}", e))?;
    tracing::info!("Database connected successfully");

    let sweeper = Sweeper::new(Arc::new(db.store()), &config, Arc::new(SystemClock));

    if args.once {
        let started = std::time::Instant::now();
        let report = sweeper.run_once().await;
        logging::log_sweep(&report, started.elapsed().as_millis() as u64);
        db.close().await;
        if report.failures > 0 {
            anyhow::bail!("{} sweep step(s) failed", report.failures);
        }
        return Ok(());
    }

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        "Sweeper running. Press Ctrl+C to stop."
    );
    sweeper.run_until(config.interval, shutdown_signal()).await;

    db.close().await;
    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
