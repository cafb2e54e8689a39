//! Mailqueue Admin - HTTP producer and admin API.
//!
//! This binary provides the HTTP surface over both queues:
//! - Enqueues single emails, bulk emails and campaign requests
//! - Reports queue stats and failed jobs
//! - Retries, removes, pauses, resumes and cleans
//!
//! Workers run in the other two binaries.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailqueue::util::shutdown_signal;
use mailqueue::web::{router, AppState};
use mailqueue::{
    Admin, CampaignJob, Config, EmailJob, Producer, Queue, QueueStore, RedisStore,
    CAMPAIGN_QUEUE, EMAIL_QUEUE,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("admin_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        admin_auth_configured = config.admin_token.is_some(),
        "config_loaded"
    );

    let store: Arc<dyn QueueStore> = Arc::new(
        RedisStore::connect(&config.redis_url, &config.queue_prefix)
            .await
            .context("Failed to connect to Redis")?,
    );

    let emails: Queue<EmailJob> =
        Queue::new(EMAIL_QUEUE, Arc::clone(&store), config.email_queue_settings());
    let campaigns: Queue<CampaignJob> =
        Queue::new(CAMPAIGN_QUEUE, store, config.campaign_queue_settings());

    // Create application state
    let state = AppState::new(
        Producer::new(emails.clone(), campaigns.clone()),
        Admin::new(emails, campaigns),
        config.admin_token.clone(),
    );

    // Build the router
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "admin_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("admin_server_shutting_down");
        })
        .await
        .context("Server error")?;

    info!("admin_server_shutdown_complete");

    Ok(())
}
