//! The queue store contract.
//!
//! A store holds any number of named queues. It is the sole authority for job
//! state: every transition below is atomic with respect to concurrent callers,
//! and workers keep nothing durable beyond the lock token of the job they hold.

use std::time::Duration;

use async_trait::async_trait;

use super::job::{FailOutcome, Job, JobStatus, NewJob, QueueStats, Retention, StalledJob};
use crate::error::QueueError;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a waiting job. Returns `false` (and changes nothing) if a job
    /// with the same id already exists.
    async fn enqueue(&self, queue: &str, job: NewJob) -> Result<bool, QueueError>;

    /// Insert many jobs as one store operation, skipping ids that already
    /// exist (including duplicates within `jobs`). Returns how many were added.
    async fn enqueue_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> Result<usize, QueueError>;

    /// Claim the next leasable job: lowest priority value first, then oldest.
    /// Delayed jobs whose not-before time has passed are promoted first.
    /// Returns `None` when the queue is empty or paused.
    async fn lease(&self, queue: &str, lock_duration: Duration) -> Result<Option<Job>, QueueError>;

    /// Push the lock expiry of a held job forward.
    async fn extend_lock(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<(), QueueError>;

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<(), QueueError>;

    /// Move a held job to completed, then evict completed jobs beyond `retention`.
    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        retention: Retention,
    ) -> Result<(), QueueError>;

    /// Record a failed attempt. Retryable failures with attempts left are
    /// delayed per the job's backoff; everything else becomes failed
    /// (or is dropped when `remove_on_fail` is set).
    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        error: &str,
        retryable: bool,
        remove_on_fail: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// Requeue active jobs whose lock has expired, failing those that stalled
    /// more than `max_stalled_count` times. A failed job's record is dropped
    /// when `remove_on_fail` is set.
    async fn detect_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
        remove_on_fail: bool,
    ) -> Result<Vec<StalledJob>, QueueError>;

    async fn pause(&self, queue: &str) -> Result<(), QueueError>;

    async fn resume(&self, queue: &str) -> Result<(), QueueError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError>;

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError>;

    /// Delete a non-active job. Returns `false` if it does not exist.
    async fn remove_job(&self, queue: &str, id: &str) -> Result<bool, QueueError>;

    /// Force a job back to waiting with a fresh attempt budget. Returns
    /// `false` if the job was already waiting.
    async fn retry_job(&self, queue: &str, id: &str) -> Result<bool, QueueError>;

    /// Retry every failed job. Returns how many were requeued.
    async fn retry_all_failed(&self, queue: &str) -> Result<usize, QueueError>;

    /// Jobs in `status`, ranks `start..=end`. Completed and failed jobs are
    /// listed newest first; waiting jobs in lease order.
    async fn jobs_by_status(
        &self,
        queue: &str,
        status: JobStatus,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError>;

    /// Delete completed or failed jobs that finished more than `grace` ago.
    async fn clean(&self, queue: &str, grace: Duration, status: JobStatus)
        -> Result<usize, QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;
}

/// Reject `clean` on statuses that hold live work.
pub(crate) fn ensure_cleanable(status: JobStatus) -> Result<(), QueueError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(QueueError::Unsupported(format!(
            "clean only applies to completed or failed jobs, not {}",
            status
        )))
    }
}
