//! Fan-out worker for the `campaign_fanout` queue.
//!
//! One campaign job becomes one email job per deliverable subscriber. Email
//! job ids are derived from (campaign, subscriber), so re-running a campaign
//! (or submitting an overlapping subscriber list) only adds the missing ones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{idle, with_lock_renewal, DEFAULT_POLL_INTERVAL};
use crate::compose::{ComposeError, MessageComposer};
use crate::error::QueueError;
use crate::queue::{CampaignJob, EmailJob, JobOptions, Lease, Queue};
use crate::tracking::sign_tracking_token;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl FanoutError {
    /// Missing campaigns and malformed composer output will not fix
    /// themselves on a retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FanoutError::Compose(ComposeError::CampaignNotFound(_))
                | FanoutError::Compose(ComposeError::InvalidResponse(_))
        )
    }
}

/// Summary stored as the campaign job's result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub campaign_id: String,
    /// Subscriber ids in the request, duplicates included.
    pub requested: usize,
    pub unique: usize,
    /// Unique subscribers the composer returned no message for.
    pub skipped: usize,
    /// Email jobs created by this run.
    pub enqueued: usize,
    /// Email jobs that already existed from an earlier run.
    pub already_queued: usize,
}

/// Stable email job id for one subscriber of one campaign.
///
/// The campaign id is length-prefixed so `("ab", "c")` and `("a", "bc")`
/// hash differently.
pub fn email_job_id(campaign_id: &str, subscriber_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((campaign_id.len() as u64).to_be_bytes());
    hasher.update(campaign_id.as_bytes());
    hasher.update(subscriber_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("email-{}", &digest[..32])
}

/// Drop repeated subscriber ids, keeping first-occurrence order.
pub fn dedupe_subscribers(subscriber_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(subscriber_ids.len());
    subscriber_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[derive(Clone)]
pub struct CampaignWorker {
    campaigns: Queue<CampaignJob>,
    emails: Queue<EmailJob>,
    composer: Arc<dyn MessageComposer>,
    tracking_secret: Option<String>,
    poll_interval: Duration,
}

impl CampaignWorker {
    pub fn new(
        campaigns: Queue<CampaignJob>,
        emails: Queue<EmailJob>,
        composer: Arc<dyn MessageComposer>,
    ) -> Self {
        Self {
            campaigns,
            emails,
            composer,
            tracking_secret: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Attach a signed tracking token to every email this worker creates.
    pub fn with_tracking_secret(mut self, secret: Option<String>) -> Self {
        self.tracking_secret = secret.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.campaigns.name(), "campaign_worker_started");

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
                    error!(queue = %self.campaigns.name(), error = %e, "campaign_worker_store_error");
                    if idle(&mut shutdown, self.poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!(queue = %self.campaigns.name(), "campaign_worker_stopped");
    }

    pub async fn run_once(&self) -> Result<bool, QueueError> {
        match self.campaigns.lease().await? {
            Some(lease) => {
                self.process(lease).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fan one campaign job out. The campaign job completes only once the
    /// bulk enqueue succeeded.
    pub async fn process(&self, lease: Lease<CampaignJob>) -> Result<(), QueueError> {
        let started = Instant::now();
        let priority = lease.job().opts.priority;

        info!(
            job_id = %lease.id(),
            campaign_id = %lease.data().campaign_id,
            subscribers = lease.data().subscriber_ids.len(),
            priority = priority,
            "campaign_fanout_started"
        );

        let result =
            with_lock_renewal(&self.campaigns, &lease, self.fan_out(lease.data(), priority)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(report) => {
                info!(
                    job_id = %lease.id(),
                    campaign_id = %report.campaign_id,
                    unique = report.unique,
                    enqueued = report.enqueued,
                    already_queued = report.already_queued,
                    skipped = report.skipped,
                    duration_ms = duration_ms,
                    "campaign_fanout_complete"
                );
                let result = serde_json::to_value(&report)?;
                self.campaigns.complete(lease, result).await
            }
            Err(err) => {
                let job_id = lease.id().to_string();
                let outcome = self
                    .campaigns
                    .fail(lease, &err.to_string(), err.is_retryable())
                    .await?;
                error!(
                    job_id = %job_id,
                    error = %err,
                    attempts_made = outcome.attempts_made(),
                    terminal = outcome.is_terminal(),
                    duration_ms = duration_ms,
                    "campaign_fanout_failed"
                );
                Ok(())
            }
        }
    }

    /// Compose and bulk-enqueue the email jobs for `campaign`.
    pub async fn fan_out(
        &self,
        campaign: &CampaignJob,
        priority: u32,
    ) -> Result<FanoutReport, FanoutError> {
        let unique = dedupe_subscribers(&campaign.subscriber_ids);
        let mut report = FanoutReport {
            campaign_id: campaign.campaign_id.clone(),
            requested: campaign.subscriber_ids.len(),
            unique: unique.len(),
            ..Default::default()
        };
        if unique.is_empty() {
            return Ok(report);
        }

        let mut composed: HashMap<String, EmailJob> = HashMap::with_capacity(unique.len());
        for message in self.composer.compose(&campaign.campaign_id, &unique).await? {
            let subscriber_id = message.subscriber_id.clone();
            composed
                .entry(subscriber_id)
                .or_insert_with(|| message.into_email_job(&campaign.campaign_id));
        }

        let opts: JobOptions = self.emails.default_options().with_priority(priority);
        let mut jobs = Vec::with_capacity(unique.len());
        for subscriber_id in &unique {
            let Some(mut email) = composed.remove(subscriber_id) else {
                debug!(
                    campaign_id = %campaign.campaign_id,
                    subscriber_id = %subscriber_id,
                    "campaign_subscriber_skipped"
                );
                report.skipped += 1;
                continue;
            };
            let id = email_job_id(&campaign.campaign_id, subscriber_id);
            if let Some(secret) = &self.tracking_secret {
                email.tracking_token = Some(sign_tracking_token(secret, &id));
            }
            jobs.push((id, email, opts));
        }

        let composed_count = jobs.len();
        report.enqueued = self.emails.add_bulk(jobs).await?;
        report.already_queued = composed_count - report.enqueued;
        Ok(report)
    }
}
