//! Delivery worker for the `email_delivery` queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{idle, with_lock_renewal, DEFAULT_POLL_INTERVAL};
use crate::error::QueueError;
use crate::queue::{EmailJob, FailOutcome, Lease, Queue};
use crate::transport::{validate_recipient, Delivery, MailTransport, SendError};
use crate::util::time::now_ms;

/// Progress reported once the message passed validation and is handed to
/// the transport.
const PROGRESS_SENDING: u8 = 50;

/// Leases email jobs and hands them to the mail transport. Any number of
/// these may run against the same store.
#[derive(Clone)]
pub struct EmailWorker {
    queue: Queue<EmailJob>,
    transport: Arc<dyn MailTransport>,
    poll_interval: Duration,
}

impl EmailWorker {
    pub fn new(queue: Queue<EmailJob>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            queue,
            transport,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll the queue until shutdown is signalled. A job already leased is
    /// always finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue.name(), "email_worker_started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {
                    if idle(&mut shutdown, self.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue.name(), error = %e, "email_worker_store_error");
                    if idle(&mut shutdown, self.poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!(queue = %self.queue.name(), "email_worker_stopped");
    }

    /// Lease and process at most one job. Returns `false` when nothing was
    /// leasable.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        match self.queue.lease().await? {
            Some(lease) => {
                self.process(lease).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send one leased message and commit the outcome.
    pub async fn process(&self, lease: Lease<EmailJob>) -> Result<(), QueueError> {
        let started = Instant::now();
        let attempt = lease.job().attempts_made + 1;

        info!(
            job_id = %lease.id(),
            to = %lease.data().to,
            campaign_id = lease.data().campaign_id.as_deref().unwrap_or(""),
            attempt = attempt,
            "email_job_started"
        );

        let result = with_lock_renewal(&self.queue, &lease, self.deliver(&lease)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(delivery) => {
                info!(
                    job_id = %lease.id(),
                    to = %lease.data().to,
                    message_id = delivery.message_id.as_deref().unwrap_or(""),
                    attempt = attempt,
                    duration_ms = duration_ms,
                    "email_job_completed"
                );
                let receipt = json!({
                    "message_id": delivery.message_id,
                    "delivered_at": now_ms(),
                });
                self.queue.complete(lease, receipt).await
            }
            Err(err) => {
                let job_id = lease.id().to_string();
                let outcome = self
                    .queue
                    .fail(lease, &err.to_string(), err.is_retryable())
                    .await?;
                match outcome {
                    FailOutcome::Retrying {
                        attempts_made,
                        delay,
                    } => warn!(
                        job_id = %job_id,
                        error = %err,
                        attempts_made = attempts_made,
                        retry_in_ms = delay.as_millis() as u64,
                        duration_ms = duration_ms,
                        "email_job_retrying"
                    ),
                    FailOutcome::Failed { attempts_made } => error!(
                        job_id = %job_id,
                        error = %err,
                        attempts_made = attempts_made,
                        retryable = err.is_retryable(),
                        duration_ms = duration_ms,
                        "email_job_failed"
                    ),
                }
                Ok(())
            }
        }
    }

    async fn deliver(&self, lease: &Lease<EmailJob>) -> Result<Delivery, SendError> {
        let email = lease.data();
        validate_recipient(&email.to)?;

        if let Err(e) = self.queue.update_progress(lease, PROGRESS_SENDING).await {
            warn!(job_id = %lease.id(), error = %e, "email_job_progress_failed");
        }

        // A zero timeout means no deadline.
        let timeout_ms = lease.job().opts.timeout_ms;
        if timeout_ms == 0 {
            return self.transport.send(email).await;
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.transport.send(email)).await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Transient(format!(
                "send timed out after {}ms",
                timeout_ms
            ))),
        }
    }
}
