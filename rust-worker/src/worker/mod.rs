//! Worker loops: lease → process → commit, coordinated only through the store.

pub mod campaign;
pub mod email;
pub mod stalled;

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::warn;

use crate::queue::{Lease, Queue};

pub use campaign::{dedupe_subscribers, email_job_id, CampaignWorker, FanoutError, FanoutReport};
pub use email::EmailWorker;
pub use stalled::run_stalled_checker;

/// How long an idle worker waits before polling an empty queue again.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drive `work` to completion, renewing the lease's lock every half lock
/// duration so a slow job is not mistaken for a stalled one.
pub async fn with_lock_renewal<T, F>(queue: &Queue<T>, lease: &Lease<T>, work: F) -> F::Output
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    F: Future,
{
    let period = (queue.settings().lock_duration / 2).max(Duration::from_millis(1));
    let mut renew = time::interval_at(Instant::now() + period, period);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = renew.tick() => {
                if let Err(e) = queue.extend_lock(lease).await {
                    warn!(
                        queue = %queue.name(),
                        job_id = %lease.id(),
                        error = %e,
                        "lock_renewal_failed"
                    );
                }
            }
        }
    }
}

/// Wait out `period` unless shutdown is requested first. Returns `true` when
/// the worker should stop.
pub(crate) async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
