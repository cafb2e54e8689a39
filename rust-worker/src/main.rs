//! Mailqueue Worker - email delivery workers for the email_delivery queue.
//!
//! Leases delivery jobs, sends them through the mail provider API under a
//! per-job deadline, and reports the outcome back to the queue store so
//! failures are retried with backoff.

mod consumer;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailqueue::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        concurrency = config.worker_concurrency,
        attempts = config.email_attempts,
        backoff = config.email_backoff.kind(),
        backoff_delay_ms = config.email_backoff.base_delay_ms(),
        timeout_ms = config.email_timeout_ms,
        lock_duration_ms = config.lock_duration_ms,
        mail_domain = ?config.mail_domain,
        "config_loaded"
    );

    // Start the workers
    consumer::run(config).await?;

    Ok(())
}
