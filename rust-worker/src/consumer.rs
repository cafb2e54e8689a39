//! Email delivery runtime.
//!
//! Connects to the queue store, then runs `WORKER_CONCURRENCY` delivery
//! workers plus the stalled-job checker for the `email_delivery` queue until
//! SIGINT/SIGTERM. Workers finish the job they hold before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::{error, info};

use mailqueue::util::shutdown_channel;
use mailqueue::{
    run_stalled_checker, Config, EmailJob, EmailWorker, HttpMailTransport, MailTransport, Queue,
    QueueStore, RedisStore, EMAIL_QUEUE,
};

/// Run the delivery workers.
pub async fn run(config: Config) -> Result<()> {
    // Connect to the queue store
    info!(prefix = %config.queue_prefix, "queue_store_connecting");

    let store: Arc<dyn QueueStore> = Arc::new(
        RedisStore::connect(&config.redis_url, &config.queue_prefix)
            .await
            .context("Failed to connect to Redis")?,
    );

    let emails: Queue<EmailJob> =
        Queue::new(EMAIL_QUEUE, store, config.email_queue_settings());

    // Create a shared HTTP client for all sends
    let client = Client::builder()
        .pool_max_idle_per_host(100)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;

    let domain = config
        .mail_domain
        .as_deref()
        .context("MAIL_DOMAIN must be set")?;
    let api_key = config
        .mail_api_key
        .as_deref()
        .context("MAIL_API_KEY must be set")?;

    let transport = HttpMailTransport::new(
        client,
        &config.mail_api_base_url,
        domain,
        api_key,
        &config.mail_from,
    )
    .context("Invalid MAIL_API_BASE_URL")?;

    info!(endpoint = %transport.endpoint(), "mail_transport_ready");
    let transport: Arc<dyn MailTransport> = Arc::new(transport);

    let shutdown = shutdown_channel();
    let mut tasks = Vec::with_capacity(config.worker_concurrency + 1);

    tasks.push(tokio::spawn(run_stalled_checker(
        emails.clone(),
        shutdown.clone(),
    )));

    for _ in 0..config.worker_concurrency {
        let worker = EmailWorker::new(emails.clone(), Arc::clone(&transport))
            .with_poll_interval(config.poll_interval());
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    info!(
        queue = EMAIL_QUEUE,
        workers = config.worker_concurrency,
        "worker_ready"
    );

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "worker_task_panicked");
        }
    }

    info!("worker_shutdown_complete");
    Ok(())
}
