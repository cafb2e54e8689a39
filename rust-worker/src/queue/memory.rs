//! Process-local queue store.
//!
//! Every queue keeps its records in a hash map plus one index per status, so
//! leasing is a `BTreeSet::pop_first` and `stats()` only reads lengths. All
//! state sits behind one mutex that is never held across an `.await`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::job::{
    new_lock_token, FailOutcome, Job, JobStatus, Lock, NewJob, QueueStats, Retention, StalledJob,
    StalledOutcome, STALLED_LIMIT_ERROR,
};
use super::store::{ensure_cleanable, QueueStore};
use crate::error::QueueError;
use crate::util::time::{duration_ms, now_ms};

/// In-memory [`QueueStore`]. Cheap to construct; share it behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueState>>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// (priority, seq, id)
    waiting: BTreeSet<(u32, u64, String)>,
    /// (available_at, seq, id)
    delayed: BTreeSet<(u64, u64, String)>,
    active: HashSet<String>,
    /// Oldest first.
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    paused: bool,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, new: NewJob, now: u64) -> bool {
        if self.jobs.contains_key(&new.id) {
            return false;
        }
        self.next_seq += 1;
        let job = Job::waiting(new, self.next_seq, now);
        self.waiting
            .insert((job.opts.priority, job.seq, job.id.clone()));
        self.jobs.insert(job.id.clone(), job);
        true
    }

    fn push_waiting(&mut self, id: &str) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.status = JobStatus::Waiting;
            self.waiting
                .insert((job.opts.priority, job.seq, job.id.clone()));
        }
    }

    fn promote_delayed(&mut self, now: u64) {
        while self.delayed.first().is_some_and(|(at, _, _)| *at <= now) {
            if let Some((_, _, id)) = self.delayed.pop_first() {
                self.push_waiting(&id);
            }
        }
    }

    /// Remove a job from whichever status index currently holds it.
    fn unlink(&mut self, id: &str) {
        let Some(job) = self.jobs.get(id) else {
            return;
        };
        match job.status {
            JobStatus::Waiting => {
                self.waiting
                    .remove(&(job.opts.priority, job.seq, job.id.clone()));
            }
            JobStatus::Delayed => {
                self.delayed
                    .remove(&(job.available_at, job.seq, job.id.clone()));
            }
            JobStatus::Active => {
                self.active.remove(id);
            }
            JobStatus::Completed => self.completed.retain(|c| c.as_str() != id),
            JobStatus::Failed => self.failed.retain(|f| f.as_str() != id),
        }
    }

    /// The job, if it is active under `token`.
    fn held_mut(&mut self, id: &str, token: &str) -> Result<&mut Job, QueueError> {
        match self.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Active && job.lock_token() == Some(token) => {
                Ok(job)
            }
            _ => Err(QueueError::LockMismatch(id.to_string())),
        }
    }

    /// Give an unlinked job a fresh attempt budget and make it leasable.
    fn reset_for_retry(&mut self, id: &str, now: u64) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        job.attempts_made = 0;
        job.stalled_count = 0;
        job.progress = 0;
        job.available_at = now;
        job.finished_on = None;
        job.last_error = None;
        job.lock = None;
        self.push_waiting(id);
        true
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, QueueError> {
        self.queues
            .lock()
            .map_err(|_| QueueError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn with_queue<R>(
        &self,
        queue: &str,
        f: impl FnOnce(&mut QueueState) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();
        f(state)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, queue: &str, job: NewJob) -> Result<bool, QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| Ok(state.insert(job, now)))
    }

    async fn enqueue_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> Result<usize, QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            Ok(jobs
                .into_iter()
                .map(|job| state.insert(job, now))
                .filter(|added| *added)
                .count())
        })
    }

    async fn lease(&self, queue: &str, lock_duration: Duration) -> Result<Option<Job>, QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            state.promote_delayed(now);
            if state.paused {
                return Ok(None);
            }
            let Some((_, _, id)) = state.waiting.pop_first() else {
                return Ok(None);
            };
            let Some(job) = state.jobs.get_mut(&id) else {
                return Ok(None);
            };
            job.status = JobStatus::Active;
            job.processed_on = Some(now);
            job.lock = Some(Lock {
                token: new_lock_token(),
                expires_at: now.saturating_add(duration_ms(lock_duration)),
            });
            let leased = job.clone();
            state.active.insert(id);
            Ok(Some(leased))
        })
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<(), QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            let job = state.held_mut(id, token)?;
            if let Some(lock) = job.lock.as_mut() {
                lock.expires_at = now.saturating_add(duration_ms(lock_duration));
            }
            Ok(())
        })
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<(), QueueError> {
        self.with_queue(queue, |state| {
            state.held_mut(id, token)?.progress = progress.min(100);
            Ok(())
        })
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        retention: Retention,
    ) -> Result<(), QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            let job = state.held_mut(id, token)?;
            job.status = JobStatus::Completed;
            job.finished_on = Some(now);
            job.progress = 100;
            job.lock = None;
            state.active.remove(id);

            match retention {
                Retention::RemoveImmediately => {
                    state.jobs.remove(id);
                }
                Retention::KeepAll => state.completed.push_back(id.to_string()),
                Retention::KeepLast(keep) => {
                    state.completed.push_back(id.to_string());
                    while state.completed.len() > keep {
                        if let Some(evicted) = state.completed.pop_front() {
                            state.jobs.remove(&evicted);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        error: &str,
        retryable: bool,
        remove_on_fail: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            let job = state.held_mut(id, token)?;
            job.attempts_made += 1;
            job.lock = None;
            job.last_error = Some(error.to_string());
            let attempts_made = job.attempts_made;

            if retryable && attempts_made < job.opts.attempts {
                let delay = job.opts.backoff.delay_for(attempts_made);
                job.available_at = now.saturating_add(duration_ms(delay));
                let (seq, available_at) = (job.seq, job.available_at);

                state.active.remove(id);
                if delay.is_zero() {
                    state.push_waiting(id);
                } else {
                    if let Some(job) = state.jobs.get_mut(id) {
                        job.status = JobStatus::Delayed;
                    }
                    state.delayed.insert((available_at, seq, id.to_string()));
                }
                return Ok(FailOutcome::Retrying {
                    attempts_made,
                    delay,
                });
            }

            job.status = JobStatus::Failed;
            job.finished_on = Some(now);
            state.active.remove(id);
            if remove_on_fail {
                state.jobs.remove(id);
            } else {
                state.failed.push_back(id.to_string());
            }
            Ok(FailOutcome::Failed { attempts_made })
        })
    }

    async fn detect_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
        remove_on_fail: bool,
    ) -> Result<Vec<StalledJob>, QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            let mut expired: Vec<String> = state
                .active
                .iter()
                .filter(|id| {
                    state
                        .jobs
                        .get(*id)
                        .and_then(|job| job.lock.as_ref())
                        .map_or(true, |lock| lock.expires_at <= now)
                })
                .cloned()
                .collect();
            expired.sort();

            let mut recovered = Vec::with_capacity(expired.len());
            for id in expired {
                state.active.remove(&id);
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                job.stalled_count += 1;
                job.lock = None;
                let stalled_count = job.stalled_count;
                let attempts_made = job.attempts_made;

                let outcome = if stalled_count > max_stalled_count {
                    job.status = JobStatus::Failed;
                    job.finished_on = Some(now);
                    job.last_error = Some(STALLED_LIMIT_ERROR.to_string());
                    if remove_on_fail {
                        state.jobs.remove(&id);
                    } else {
                        state.failed.push_back(id.clone());
                    }
                    StalledOutcome::Failed
                } else {
                    job.status = JobStatus::Waiting;
                    state
                        .waiting
                        .insert((job.opts.priority, job.seq, id.clone()));
                    StalledOutcome::Requeued
                };
                recovered.push(StalledJob {
                    id,
                    stalled_count,
                    attempts_made,
                    outcome,
                });
            }
            Ok(recovered)
        })
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.with_queue(queue, |state| {
            state.paused = true;
            Ok(())
        })
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.with_queue(queue, |state| {
            state.paused = false;
            Ok(())
        })
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.with_queue(queue, |state| Ok(state.paused))
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        self.with_queue(queue, |state| Ok(state.jobs.get(id).cloned()))
    }

    async fn remove_job(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        self.with_queue(queue, |state| {
            match state.jobs.get(id).map(|job| job.status) {
                None => return Ok(false),
                Some(JobStatus::Active) => return Err(QueueError::JobActive(id.to_string())),
                Some(_) => {}
            }
            state.unlink(id);
            state.jobs.remove(id);
            Ok(true)
        })
    }

    async fn retry_job(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            match state.jobs.get(id).map(|job| job.status) {
                None => return Err(QueueError::NotFound(format!("job {}", id))),
                Some(JobStatus::Active) => return Err(QueueError::JobActive(id.to_string())),
                Some(JobStatus::Waiting) => return Ok(false),
                Some(_) => {}
            }
            state.unlink(id);
            Ok(state.reset_for_retry(id, now))
        })
    }

    async fn retry_all_failed(&self, queue: &str) -> Result<usize, QueueError> {
        let now = now_ms();
        self.with_queue(queue, |state| {
            let failed: Vec<String> = state.failed.drain(..).collect();
            Ok(failed
                .iter()
                .filter(|id| state.reset_for_retry(id, now))
                .count())
        })
    }

    async fn jobs_by_status(
        &self,
        queue: &str,
        status: JobStatus,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.with_queue(queue, |state| {
            if start > end {
                return Ok(Vec::new());
            }
            let ids: Vec<&String> = match status {
                JobStatus::Waiting => state.waiting.iter().map(|(_, _, id)| id).collect(),
                JobStatus::Delayed => state.delayed.iter().map(|(_, _, id)| id).collect(),
                JobStatus::Active => {
                    let mut active: Vec<&String> = state.active.iter().collect();
                    active.sort_by_key(|id| state.jobs.get(*id).map(|job| job.seq));
                    active
                }
                JobStatus::Completed => state.completed.iter().rev().collect(),
                JobStatus::Failed => state.failed.iter().rev().collect(),
            };
            let count = end.saturating_sub(start).saturating_add(1);
            Ok(ids
                .into_iter()
                .skip(start)
                .take(count)
                .filter_map(|id| state.jobs.get(id).cloned())
                .collect())
        })
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        status: JobStatus,
    ) -> Result<usize, QueueError> {
        ensure_cleanable(status)?;
        let cutoff = now_ms().saturating_sub(duration_ms(grace));
        self.with_queue(queue, |state| {
            let jobs = &mut state.jobs;
            let list = if status == JobStatus::Completed {
                &mut state.completed
            } else {
                &mut state.failed
            };
            let before = list.len();
            list.retain(|id| {
                let expired = jobs
                    .get(id)
                    .map_or(true, |job| job.finished_on.unwrap_or(0) <= cutoff);
                if expired {
                    jobs.remove(id);
                }
                !expired
            });
            Ok(before - list.len())
        })
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.with_queue(queue, |state| {
            Ok(QueueStats::new(
                state.waiting.len(),
                state.active.len(),
                state.delayed.len(),
                state.completed.len(),
                state.failed.len(),
                state.paused,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::queue::job::{Backoff, JobOptions};

    const Q: &str = "test";
    const LOCK: Duration = Duration::from_secs(30);

    fn new_job(id: &str, priority: u32) -> NewJob {
        NewJob {
            id: id.to_string(),
            data: json!({ "id": id }),
            opts: JobOptions::default().with_priority(priority),
        }
    }

    fn assert_stats_consistent(stats: &QueueStats) {
        assert_eq!(stats.waiting + stats.active + stats.delayed, stats.total);
    }

    async fn lease(store: &MemoryStore) -> Job {
        store.lease(Q, LOCK).await.unwrap().expect("a leasable job")
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.enqueue(Q, new_job("a", 0)).await.unwrap());
        assert!(!store.enqueue(Q, new_job("a", 0)).await.unwrap());

        let added = store
            .enqueue_bulk(Q, vec![new_job("a", 0), new_job("b", 0), new_job("b", 0)])
            .await
            .unwrap();
        assert_eq!(added, 1);

        let stats = store.stats(Q).await.unwrap();
        assert_eq!(stats.waiting, 2);
        assert_stats_consistent(&stats);
    }

    #[tokio::test]
    async fn test_enqueue_does_not_duplicate_active_job() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();
        let job = lease(&store).await;
        assert_eq!(job.status, JobStatus::Active);

        assert!(!store.enqueue(Q, new_job("a", 0)).await.unwrap());
        assert!(store.lease(Q, LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_prefers_low_priority_then_insertion_order() {
        let store = MemoryStore::new();
        store
            .enqueue_bulk(
                Q,
                vec![
                    new_job("late-10", 10),
                    new_job("first-1", 1),
                    new_job("second-1", 1),
                    new_job("urgent-0", 0),
                ],
            )
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = store.lease(Q, LOCK).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec!["urgent-0", "first-1", "second-1", "late-10"]);
    }

    #[tokio::test]
    async fn test_concurrent_leases_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let jobs = (0..200).map(|i| new_job(&format!("job-{}", i), i % 3)).collect();
        store.enqueue_bulk(Q, jobs).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut leased = Vec::new();
                while let Some(job) = store.lease(Q, LOCK).await.unwrap() {
                    leased.push(job.id);
                    tokio::task::yield_now().await;
                }
                leased
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id.clone()), "job {} leased twice", id);
            }
        }
        assert_eq!(seen.len(), 200);

        let stats = store.stats(Q).await.unwrap();
        assert_eq!(stats.active, 200);
        assert_stats_consistent(&stats);
    }

    #[tokio::test]
    async fn test_complete_requires_current_lock() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();
        let job = lease(&store).await;

        let err = store
            .complete(Q, "a", "not-the-token", Retention::KeepAll)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LockMismatch(_)));

        let token = job.lock_token().unwrap().to_string();
        store.complete(Q, "a", &token, Retention::KeepAll).await.unwrap();
        let done = store.get_job(Q, "a").await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);

        // A second commit with the same token is rejected.
        assert!(store.complete(Q, "a", &token, Retention::KeepAll).await.is_err());
    }

    #[tokio::test]
    async fn test_completed_retention_keeps_last_n() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.enqueue(Q, new_job(&format!("j{}", i), 0)).await.unwrap();
        }
        while let Some(job) = store.lease(Q, LOCK).await.unwrap() {
            let token = job.lock_token().unwrap().to_string();
            store
                .complete(Q, &job.id, &token, Retention::KeepLast(2))
                .await
                .unwrap();
        }

        let stats = store.stats(Q).await.unwrap();
        assert_eq!(stats.completed, 2);
        assert!(store.get_job(Q, "j0").await.unwrap().is_none());
        assert!(store.get_job(Q, "j4").await.unwrap().is_some());

        let listed: Vec<String> = store
            .jobs_by_status(Q, JobStatus::Completed, 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(listed, vec!["j4", "j3"]);
    }

    #[tokio::test]
    async fn test_fail_applies_exponential_backoff_then_fails() {
        let store = MemoryStore::new();
        let mut job = new_job("a", 0);
        job.opts = job.opts.with_backoff(Backoff::Exponential { delay: 2000 });
        store.enqueue(Q, job).await.unwrap();

        let leased = lease(&store).await;
        let token = leased.lock_token().unwrap().to_string();
        let outcome = store.fail(Q, "a", &token, "smtp 421", true, false).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempts_made: 1,
                delay: Duration::from_millis(2000)
            }
        );

        let delayed = store.get_job(Q, "a").await.unwrap().unwrap();
        assert_eq!(delayed.status, JobStatus::Delayed);
        assert_eq!(delayed.last_error.as_deref(), Some("smtp 421"));
        assert!(store.lease(Q, LOCK).await.unwrap().is_none());

        let stats = store.stats(Q).await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_stats_consistent(&stats);
    }

    #[tokio::test]
    async fn test_retry_bound_reaches_terminal_failure() {
        let store = MemoryStore::new();
        let mut job = new_job("a", 0);
        job.opts = job
            .opts
            .with_attempts(3)
            .with_backoff(Backoff::Fixed { delay: 0 });
        store.enqueue(Q, job).await.unwrap();

        let mut outcomes = Vec::new();
        while let Some(job) = store.lease(Q, LOCK).await.unwrap() {
            let token = job.lock_token().unwrap().to_string();
            outcomes.push(store.fail(Q, "a", &token, "boom", true, false).await.unwrap());
        }

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2], FailOutcome::Failed { attempts_made: 3 });
        let failed = store.get_job(Q, "a").await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts_made, 3);
        assert!(store.lease(Q, LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_skips_backoff() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();
        let job = lease(&store).await;
        let token = job.lock_token().unwrap().to_string();

        let outcome = store
            .fail(Q, "a", &token, "invalid recipient", false, false)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 1 });
        assert_eq!(store.stats(Q).await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_remove_on_fail_drops_job() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();
        let job = lease(&store).await;
        let token = job.lock_token().unwrap().to_string();

        store.fail(Q, "a", &token, "bad", false, true).await.unwrap();
        assert!(store.get_job(Q, "a").await.unwrap().is_none());
        assert_eq!(store.stats(Q).await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_stalled_job_is_requeued_for_another_worker() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();

        let first = store
            .lease(Q, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert!(store.detect_stalled(Q, 3, false).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let stalled = store.detect_stalled(Q, 3, false).await.unwrap();
        assert_eq!(
            stalled,
            vec![StalledJob {
                id: "a".to_string(),
                stalled_count: 1,
                attempts_made: 0,
                outcome: StalledOutcome::Requeued
            }]
        );

        let second = lease(&store).await;
        assert_eq!(second.id, "a");
        assert_ne!(second.lock_token(), first.lock_token());

        // The original holder lost its claim.
        let err = store
            .complete(Q, "a", first.lock_token().unwrap(), Retention::KeepAll)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LockMismatch(_)));
    }

    #[tokio::test]
    async fn test_extend_lock_prevents_stall() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();
        let job = store
            .lease(Q, Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        let token = job.lock_token().unwrap().to_string();

        store
            .extend_lock(Q, "a", &token, Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.detect_stalled(Q, 3, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stall_limit_escalates_to_failed() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();

        let mut last = Vec::new();
        for _ in 0..2 {
            store.lease(Q, Duration::ZERO).await.unwrap().unwrap();
            last = store.detect_stalled(Q, 1, false).await.unwrap();
        }

        assert_eq!(last[0].outcome, StalledOutcome::Failed);
        assert_eq!(last[0].stalled_count, 2);
        let job = store.get_job(Q, "a").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some(STALLED_LIMIT_ERROR));
    }

    #[tokio::test]
    async fn test_stall_limit_honours_remove_on_fail() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();

        store.lease(Q, Duration::ZERO).await.unwrap().unwrap();
        let recovered = store.detect_stalled(Q, 0, true).await.unwrap();

        assert_eq!(recovered[0].outcome, StalledOutcome::Failed);
        assert!(store.get_job(Q, "a").await.unwrap().is_none());
        let stats = store.stats(Q).await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn test_stalled_job_reports_attempts_made() {
        let store = MemoryStore::new();
        let mut job = new_job("a", 0);
        job.opts = job
            .opts
            .with_attempts(3)
            .with_backoff(Backoff::Fixed { delay: 0 });
        store.enqueue(Q, job).await.unwrap();

        let leased = lease(&store).await;
        store
            .fail(Q, "a", leased.lock_token().unwrap(), "421 busy", true, false)
            .await
            .unwrap();
        store.lease(Q, Duration::ZERO).await.unwrap().unwrap();

        let recovered = store.detect_stalled(Q, 0, false).await.unwrap();
        assert_eq!(recovered[0].attempts_made, 1);
        assert_eq!(recovered[0].outcome, StalledOutcome::Failed);
    }

    #[tokio::test]
    async fn test_pause_stops_leasing_without_losing_jobs() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();

        store.pause(Q).await.unwrap();
        assert!(store.is_paused(Q).await.unwrap());
        assert!(store.lease(Q, LOCK).await.unwrap().is_none());
        assert!(store.stats(Q).await.unwrap().paused);

        store.resume(Q).await.unwrap();
        assert_eq!(lease(&store).await.id, "a");
    }

    #[tokio::test]
    async fn test_remove_job() {
        let store = MemoryStore::new();
        store
            .enqueue_bulk(Q, vec![new_job("a", 0), new_job("b", 0)])
            .await
            .unwrap();
        let active = lease(&store).await;

        let err = store.remove_job(Q, &active.id).await.unwrap_err();
        assert!(matches!(err, QueueError::JobActive(_)));

        assert!(store.remove_job(Q, "b").await.unwrap());
        assert!(!store.remove_job(Q, "b").await.unwrap());
        assert_eq!(store.stats(Q).await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_retry_job_resets_attempts() {
        let store = MemoryStore::new();
        store.enqueue(Q, new_job("a", 0)).await.unwrap();
        let job = lease(&store).await;
        let token = job.lock_token().unwrap().to_string();
        store.fail(Q, "a", &token, "nope", false, false).await.unwrap();

        assert!(store.retry_job(Q, "a").await.unwrap());
        let retried = store.get_job(Q, "a").await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Waiting);
        assert_eq!(retried.attempts_made, 0);
        assert!(retried.last_error.is_none());

        assert!(!store.retry_job(Q, "a").await.unwrap());
        assert!(matches!(
            store.retry_job(Q, "missing").await.unwrap_err(),
            QueueError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_retry_all_failed() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.enqueue(Q, new_job(id, 0)).await.unwrap();
        }
        for _ in 0..2 {
            let job = lease(&store).await;
            let token = job.lock_token().unwrap().to_string();
            store.fail(Q, &job.id, &token, "x", false, false).await.unwrap();
        }

        assert_eq!(store.retry_all_failed(Q).await.unwrap(), 2);
        let stats = store.stats(Q).await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.waiting, 3);
        assert_stats_consistent(&stats);
    }

    #[tokio::test]
    async fn test_clean_removes_old_terminal_jobs() {
        let store = MemoryStore::new();
        store
            .enqueue_bulk(Q, vec![new_job("a", 0), new_job("b", 0)])
            .await
            .unwrap();
        let job = lease(&store).await;
        let token = job.lock_token().unwrap().to_string();
        store.complete(Q, &job.id, &token, Retention::KeepAll).await.unwrap();

        assert_eq!(
            store
                .clean(Q, Duration::from_secs(3600), JobStatus::Completed)
                .await
                .unwrap(),
            0
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            store.clean(Q, Duration::ZERO, JobStatus::Completed).await.unwrap(),
            1
        );
        assert!(store.get_job(Q, "a").await.unwrap().is_none());

        let err = store
            .clean(Q, Duration::ZERO, JobStatus::Waiting)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let store = MemoryStore::new();
        store.enqueue("one", new_job("a", 0)).await.unwrap();
        assert!(store.enqueue("two", new_job("a", 0)).await.unwrap());
        assert!(store.lease("three", LOCK).await.unwrap().is_none());
        assert_eq!(store.stats("one").await.unwrap().waiting, 1);
    }
}
