//! Periodic recovery of jobs whose worker stopped renewing its lock.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::queue::{Queue, StalledOutcome};

/// Scan `queue` every `stalled_interval` until shutdown. Store errors are
/// logged and the scan is retried on the next tick.
pub async fn run_stalled_checker<T>(queue: Queue<T>, mut shutdown: watch::Receiver<bool>)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let period = queue.settings().stalled_interval.max(Duration::from_millis(1));
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        queue = %queue.name(),
        interval_ms = period.as_millis() as u64,
        max_stalled_count = queue.settings().max_stalled_count,
        "stalled_checker_started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue.detect_stalled().await {
                    Ok(jobs) if !jobs.is_empty() => {
                        let failed = jobs
                            .iter()
                            .filter(|j| j.outcome == StalledOutcome::Failed)
                            .count();
                        info!(
                            queue = %queue.name(),
                            requeued = jobs.len() - failed,
                            failed = failed,
                            "stalled_jobs_recovered"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(queue = %queue.name(), error = %e, "stalled_check_failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(queue = %queue.name(), "stalled_checker_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::queue::{EmailJob, JobOptions, JobStatus, MemoryStore, QueueEvent, QueueSettings, EMAIL_QUEUE};

    #[tokio::test]
    async fn test_checker_requeues_abandoned_lease() {
        let settings = QueueSettings {
            lock_duration: Duration::from_millis(20),
            stalled_interval: Duration::from_millis(10),
            ..QueueSettings::email()
        };
        let queue: Queue<EmailJob> = Queue::new(EMAIL_QUEUE, Arc::new(MemoryStore::new()), settings);
        let mut events = queue.subscribe();

        queue
            .add("e1", &EmailJob::new("a@example.com", "hi"), JobOptions::default())
            .await
            .unwrap();
        // Lease and walk away without renewing.
        drop(queue.lease().await.unwrap().unwrap());

        let (tx, rx) = watch::channel(false);
        let checker = tokio::spawn(run_stalled_checker(queue.clone(), rx));
        time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        checker.await.unwrap();

        let job = queue.get_job("e1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.stalled_count, 1);
        assert_eq!(job.attempts_made, 0);

        let mut stalled = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, QueueEvent::Stalled { .. }) {
                stalled += 1;
            }
        }
        assert_eq!(stalled, 1);

        // Another worker can now take it.
        assert!(queue.lease().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checker_stops_when_sender_dropped() {
        let queue: Queue<EmailJob> =
            Queue::new(EMAIL_QUEUE, Arc::new(MemoryStore::new()), QueueSettings::email());
        let (tx, rx) = watch::channel(false);
        let checker = tokio::spawn(run_stalled_checker(queue, rx));
        drop(tx);
        checker.await.unwrap();
    }
}
