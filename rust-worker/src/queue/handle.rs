//! Typed handle over one named queue in a [`QueueStore`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::events::{EventBus, QueueEvent};
use super::job::{
    FailOutcome, Job, JobOptions, JobStatus, NewJob, QueueSettings, QueueStats, StalledJob,
    StalledOutcome,
};
use super::store::QueueStore;
use crate::error::QueueError;

/// A job claimed by [`Queue::lease`]. Holding a lease is the only way to
/// report progress, complete or fail the job.
#[derive(Debug)]
pub struct Lease<T> {
    job: Job<T>,
    token: String,
}

impl<T> Lease<T> {
    pub fn job(&self) -> &Job<T> {
        &self.job
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn data(&self) -> &T {
        &self.job.data
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// One queue: store + name + settings + event bus, speaking payload type `T`.
pub struct Queue<T> {
    name: Arc<str>,
    store: Arc<dyn QueueStore>,
    settings: Arc<QueueSettings>,
    events: EventBus,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            store: Arc::clone(&self.store),
            settings: Arc::clone(&self.settings),
            events: self.events.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &str, store: Arc<dyn QueueStore>, settings: QueueSettings) -> Self {
        Self {
            name: Arc::from(name),
            store,
            settings: Arc::new(settings),
            events: EventBus::new(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Default options for jobs added to this queue.
    pub fn default_options(&self) -> JobOptions {
        self.settings.job_options
    }

    /// Subscribe to lifecycle events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn to_new_job(&self, id: String, data: &T, opts: JobOptions) -> Result<NewJob, QueueError> {
        Ok(NewJob {
            id,
            data: serde_json::to_value(data)?,
            opts,
        })
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Add a job. Returns `false` if a job with this id already exists.
    pub async fn add(
        &self,
        id: impl Into<String>,
        data: &T,
        opts: JobOptions,
    ) -> Result<bool, QueueError> {
        let job = self.to_new_job(id.into(), data, opts)?;
        self.store.enqueue(&self.name, job).await
    }

    /// Add many jobs in one store operation. Returns how many were new.
    pub async fn add_bulk(&self, jobs: Vec<(String, T, JobOptions)>) -> Result<usize, QueueError> {
        let jobs = jobs
            .into_iter()
            .map(|(id, data, opts)| self.to_new_job(id, &data, opts))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.enqueue_bulk(&self.name, jobs).await
    }

    // =========================================================================
    // Worker side
    // =========================================================================

    /// Claim the next job. Jobs whose payload no longer decodes are failed
    /// permanently and skipped.
    pub async fn lease(&self) -> Result<Option<Lease<T>>, QueueError> {
        loop {
            let Some(raw) = self
                .store
                .lease(&self.name, self.settings.lock_duration)
                .await?
            else {
                return Ok(None);
            };

            let id = raw.id.clone();
            let token = raw.lock_token().unwrap_or_default().to_string();
            let stalled_count = raw.stalled_count;

            match raw.decode::<T>() {
                Ok(job) => return Ok(Some(Lease { job, token })),
                Err(e) => {
                    error!(queue = %self.name, job_id = %id, error = %e, "job_payload_invalid");
                    let message = e.to_string();
                    let outcome = self
                        .store
                        .fail(&self.name, &id, &token, &message, false, self.settings.remove_on_fail)
                        .await?;
                    self.emit_failed(&id, &message, outcome, stalled_count);
                }
            }
        }
    }

    pub async fn extend_lock(&self, lease: &Lease<T>) -> Result<(), QueueError> {
        self.store
            .extend_lock(&self.name, lease.id(), &lease.token, self.settings.lock_duration)
            .await
    }

    pub async fn update_progress(&self, lease: &Lease<T>, progress: u8) -> Result<(), QueueError> {
        let progress = progress.min(100);
        self.store
            .update_progress(&self.name, lease.id(), &lease.token, progress)
            .await?;
        self.events.emit(QueueEvent::Progress {
            queue: self.name.to_string(),
            job_id: lease.id().to_string(),
            progress,
        });
        Ok(())
    }

    pub async fn complete(&self, lease: Lease<T>, result: Value) -> Result<(), QueueError> {
        self.store
            .complete(
                &self.name,
                lease.id(),
                &lease.token,
                self.settings.remove_on_complete,
            )
            .await?;
        self.events.emit(QueueEvent::Completed {
            queue: self.name.to_string(),
            job_id: lease.job.id,
            result,
            attempts_made: lease.job.attempts_made,
            stalled_count: lease.job.stalled_count,
        });
        Ok(())
    }

    /// Report a failed attempt. Non-retryable failures skip the backoff and
    /// fail the job immediately.
    pub async fn fail(
        &self,
        lease: Lease<T>,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let outcome = self
            .store
            .fail(
                &self.name,
                lease.id(),
                &lease.token,
                error,
                retryable,
                self.settings.remove_on_fail,
            )
            .await?;
        self.emit_failed(lease.id(), error, outcome, lease.job.stalled_count);
        Ok(outcome)
    }

    fn emit_failed(&self, id: &str, error: &str, outcome: FailOutcome, stalled_count: u32) {
        self.events.emit(QueueEvent::Failed {
            queue: self.name.to_string(),
            job_id: id.to_string(),
            error: error.to_string(),
            attempts_made: outcome.attempts_made(),
            stalled_count,
            terminal: outcome.is_terminal(),
        });
    }

    /// Recover jobs whose worker stopped renewing its lock.
    pub async fn detect_stalled(&self) -> Result<Vec<StalledJob>, QueueError> {
        let stalled = match self
            .store
            .detect_stalled(
                &self.name,
                self.settings.max_stalled_count,
                self.settings.remove_on_fail,
            )
            .await
        {
            Ok(stalled) => stalled,
            Err(e) => {
                self.events.emit(QueueEvent::Error {
                    queue: self.name.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        for job in &stalled {
            warn!(
                queue = %self.name,
                job_id = %job.id,
                stalled_count = job.stalled_count,
                outcome = ?job.outcome,
                "job_stalled"
            );
            self.events.emit(QueueEvent::Stalled {
                queue: self.name.to_string(),
                job_id: job.id.clone(),
                stalled_count: job.stalled_count,
                attempts_made: job.attempts_made,
                outcome: job.outcome,
            });
            if job.outcome == StalledOutcome::Failed {
                self.events.emit(QueueEvent::Failed {
                    queue: self.name.to_string(),
                    job_id: job.id.clone(),
                    error: super::job::STALLED_LIMIT_ERROR.to_string(),
                    attempts_made: job.attempts_made,
                    stalled_count: job.stalled_count,
                    terminal: true,
                });
            }
        }
        Ok(stalled)
    }

    // =========================================================================
    // Admin side
    // =========================================================================

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.store.pause(&self.name).await?;
        info!(queue = %self.name, "queue_paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.store.resume(&self.name).await?;
        info!(queue = %self.name, "queue_resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        self.store.is_paused(&self.name).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job<T>>, QueueError> {
        match self.store.get_job(&self.name, id).await? {
            Some(job) => Ok(Some(job.decode()?)),
            None => Ok(None),
        }
    }

    /// The raw record, even if its payload no longer decodes as `T`.
    pub async fn get_raw_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.store.get_job(&self.name, id).await
    }

    pub async fn remove_job(&self, id: &str) -> Result<bool, QueueError> {
        self.store.remove_job(&self.name, id).await
    }

    pub async fn retry_job(&self, id: &str) -> Result<bool, QueueError> {
        self.store.retry_job(&self.name, id).await
    }

    pub async fn retry_all_failed(&self) -> Result<usize, QueueError> {
        let retried = self.store.retry_all_failed(&self.name).await?;
        info!(queue = %self.name, retried, "failed_jobs_retried");
        Ok(retried)
    }

    /// Failed jobs, newest first, ranks `start..=end`.
    pub async fn failed_jobs(&self, start: usize, end: usize) -> Result<Vec<Job>, QueueError> {
        self.jobs_by_status(JobStatus::Failed, start, end).await
    }

    pub async fn jobs_by_status(
        &self,
        status: JobStatus,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.store
            .jobs_by_status(&self.name, status, start, end)
            .await
    }

    pub async fn clean(&self, older_than: Duration, status: JobStatus) -> Result<usize, QueueError> {
        let removed = self.store.clean(&self.name, older_than, status).await?;
        info!(
            queue = %self.name,
            status = %status,
            older_than_ms = older_than.as_millis() as u64,
            removed,
            "queue_cleaned"
        );
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats(&self.name).await
    }
}
