//! Producer API: how callers put work on the pipeline.

use tracing::info;

use crate::error::QueueError;
use crate::queue::{CampaignJob, EmailJob, JobOverrides, Queue};

/// Enqueues standalone emails and campaign fan-out requests.
#[derive(Clone, Debug)]
pub struct Producer {
    emails: Queue<EmailJob>,
    campaigns: Queue<CampaignJob>,
}

impl Producer {
    pub fn new(emails: Queue<EmailJob>, campaigns: Queue<CampaignJob>) -> Self {
        Self { emails, campaigns }
    }

    /// Enqueue one email under a caller-chosen id. Re-submitting an id that
    /// is still known to the queue is a no-op and returns `false`.
    pub async fn enqueue_email(
        &self,
        id: &str,
        email: &EmailJob,
        overrides: Option<JobOverrides>,
    ) -> Result<bool, QueueError> {
        ensure_id(id)?;
        let opts = overrides
            .unwrap_or_default()
            .apply(self.emails.default_options());

        let created = self.emails.add(id, email, opts).await?;
        info!(
            job_id = %id,
            to = %email.to,
            priority = opts.priority,
            created = created,
            "email_enqueued"
        );
        Ok(created)
    }

    /// Enqueue many emails in one store operation, all at `priority`.
    /// Returns how many were new.
    pub async fn enqueue_bulk_emails(
        &self,
        emails: Vec<(String, EmailJob)>,
        priority: u32,
    ) -> Result<usize, QueueError> {
        for (id, _) in &emails {
            ensure_id(id)?;
        }
        let opts = self.emails.default_options().with_priority(priority);
        let submitted = emails.len();

        let jobs = emails
            .into_iter()
            .map(|(id, email)| (id, email, opts))
            .collect();
        let created = self.emails.add_bulk(jobs).await?;

        info!(
            submitted = submitted,
            created = created,
            priority = priority,
            "emails_bulk_enqueued"
        );
        Ok(created)
    }

    /// Request delivery of `campaign_id` to `subscriber_ids`. Every call
    /// creates a new campaign job; overlapping subscribers are collapsed at
    /// fan-out time. Returns the campaign job id.
    pub async fn enqueue_campaign(
        &self,
        campaign_id: &str,
        subscriber_ids: Vec<String>,
        priority: Option<u32>,
    ) -> Result<String, QueueError> {
        ensure_id(campaign_id)?;
        let mut opts = self.campaigns.default_options();
        if let Some(priority) = priority {
            opts = opts.with_priority(priority);
        }

        let job_id = format!("campaign-{}-{:016x}", campaign_id, rand::random::<u64>());
        let subscribers = subscriber_ids.len();
        let job = CampaignJob {
            campaign_id: campaign_id.to_string(),
            subscriber_ids,
        };
        self.campaigns.add(job_id.clone(), &job, opts).await?;

        info!(
            job_id = %job_id,
            campaign_id = %campaign_id,
            subscribers = subscribers,
            priority = opts.priority,
            "campaign_enqueued"
        );
        Ok(job_id)
    }
}

fn ensure_id(id: &str) -> Result<(), QueueError> {
    if id.trim().is_empty() {
        return Err(QueueError::Unsupported("job id must not be empty".to_string()));
    }
    Ok(())
}
