//! Monitoring and administrative controls over both queues.
//!
//! Campaign and email jobs live in separate queues, so their stats and failed
//! listings are always reported separately.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::queue::{CampaignJob, EmailJob, Job, JobStatus, Queue, QueueStats};

/// Which of the two pipeline queues an admin call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Email,
    Campaign,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Email => "email",
            QueueKind::Campaign => "campaign",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(QueueKind::Email),
            "campaign" => Ok(QueueKind::Campaign),
            other => Err(QueueError::NotFound(format!("queue {}", other))),
        }
    }
}

/// Snapshot of both queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueOverview {
    pub email: QueueStats,
    pub campaign: QueueStats,
}

/// Run `$body` against the typed queue selected by `$kind`.
macro_rules! on_queue {
    ($admin:expr, $kind:expr, |$q:ident| $body:expr) => {
        match $kind {
            QueueKind::Email => {
                let $q = &$admin.emails;
                $body
            }
            QueueKind::Campaign => {
                let $q = &$admin.campaigns;
                $body
            }
        }
    };
}

#[derive(Clone, Debug)]
pub struct Admin {
    emails: Queue<EmailJob>,
    campaigns: Queue<CampaignJob>,
}

impl Admin {
    pub fn new(emails: Queue<EmailJob>, campaigns: Queue<CampaignJob>) -> Self {
        Self { emails, campaigns }
    }

    /// Any job by id, payload left as JSON.
    pub async fn get_job(&self, kind: QueueKind, id: &str) -> Result<Option<Job>, QueueError> {
        on_queue!(self, kind, |q| q.get_raw_job(id).await)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueOverview, QueueError> {
        let (email, campaign) = tokio::try_join!(self.emails.stats(), self.campaigns.stats())?;
        Ok(QueueOverview { email, campaign })
    }

    pub async fn stats(&self, kind: QueueKind) -> Result<QueueStats, QueueError> {
        on_queue!(self, kind, |q| q.stats().await)
    }

    /// Failed jobs, newest first, ranks `start..=end`.
    pub async fn get_failed_jobs(
        &self,
        kind: QueueKind,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        on_queue!(self, kind, |q| q.failed_jobs(start, end).await)
    }

    /// Force a job back to waiting with a fresh attempt budget.
    pub async fn retry_job(&self, kind: QueueKind, id: &str) -> Result<bool, QueueError> {
        on_queue!(self, kind, |q| q.retry_job(id).await)
    }

    pub async fn retry_all_failed(&self, kind: QueueKind) -> Result<usize, QueueError> {
        on_queue!(self, kind, |q| q.retry_all_failed().await)
    }

    pub async fn remove_job(&self, kind: QueueKind, id: &str) -> Result<bool, QueueError> {
        on_queue!(self, kind, |q| q.remove_job(id).await)
    }

    pub async fn pause(&self, kind: QueueKind) -> Result<(), QueueError> {
        on_queue!(self, kind, |q| q.pause().await)
    }

    pub async fn resume(&self, kind: QueueKind) -> Result<(), QueueError> {
        on_queue!(self, kind, |q| q.resume().await)
    }

    /// Delete `status` jobs (completed or failed) finished more than
    /// `older_than` ago.
    pub async fn clean(
        &self,
        kind: QueueKind,
        older_than: Duration,
        status: JobStatus,
    ) -> Result<usize, QueueError> {
        on_queue!(self, kind, |q| q.clean(older_than, status).await)
    }
}
