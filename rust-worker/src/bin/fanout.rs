//! Mailqueue Fanout - campaign fan-out worker.
//!
//! This binary:
//! 1. Leases campaign jobs from the campaign_fanout queue
//! 2. Asks the CRUD app to render one message per subscriber
//! 3. Bulk-enqueues the resulting delivery jobs on the email_delivery queue
//!
//! It also runs the stalled-job checker for the campaign queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailqueue::tracking::is_tracking_enabled;
use mailqueue::util::shutdown_channel;
use mailqueue::{
    run_stalled_checker, CampaignJob, CampaignWorker, Config, EmailJob, HttpComposer,
    MessageComposer, Queue, QueueStore, RedisStore, CAMPAIGN_QUEUE, EMAIL_QUEUE,
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

    info!("fanout_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        concurrency = config.campaign_concurrency,
        composer_configured = config.composer_url.is_some(),
        tracking_enabled = is_tracking_enabled(&config.tracking_secret),
        "config_loaded"
    );

    // Run the fan-out workers
    run(config).await?;

    Ok(())
}

/// Run the fan-out workers.
async fn run(config: Config) -> Result<()> {
    info!(prefix = %config.queue_prefix, "queue_store_connecting");

    let store: Arc<dyn QueueStore> = Arc::new(
        RedisStore::connect(&config.redis_url, &config.queue_prefix)
            .await
            .context("Failed to connect to Redis")?,
    );

    let campaigns: Queue<CampaignJob> = Queue::new(
        CAMPAIGN_QUEUE,
        Arc::clone(&store),
        config.campaign_queue_settings(),
    );
    let emails: Queue<EmailJob> = Queue::new(EMAIL_QUEUE, store, config.email_queue_settings());

    let composer_url = config
        .composer_url
        .as_deref()
        .context("COMPOSER_URL must be set")?;

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .context("Failed to create HTTP client")?;

    let composer: Arc<dyn MessageComposer> = Arc::new(
        HttpComposer::new(client, composer_url).context("Invalid COMPOSER_URL")?,
    );

    let shutdown = shutdown_channel();
    let mut tasks = Vec::with_capacity(config.campaign_concurrency + 1);

    tasks.push(tokio::spawn(run_stalled_checker(
        campaigns.clone(),
        shutdown.clone(),
    )));

    for _ in 0..config.campaign_concurrency {
        let worker = CampaignWorker::new(campaigns.clone(), emails.clone(), Arc::clone(&composer))
            .with_tracking_secret(config.tracking_secret.clone())
            .with_poll_interval(config.poll_interval());
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    info!(
        campaign_queue = CAMPAIGN_QUEUE,
        email_queue = EMAIL_QUEUE,
        workers = config.campaign_concurrency,
        "fanout_ready"
    );

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "fanout_task_panicked");
        }
    }

    info!("fanout_shutdown_complete");
    Ok(())
}
