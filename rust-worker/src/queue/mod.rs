//! Job queues backed by a shared store.
//!
//! Two queues make up the pipeline:
//!
//! ```text
//! Producer → campaign_fanout → CampaignWorker → email_delivery → EmailWorker → transport
//! ```
//!
//! The store ([`QueueStore`]) owns all job state. [`Queue`] is the typed
//! handle producers, workers and the admin surface go through.

pub mod events;
pub mod handle;
pub mod job;
pub mod memory;
pub mod redis_store;
pub mod store;
pub mod types;

pub use events::{EventBus, QueueEvent};
pub use handle::{Lease, Queue};
pub use job::{
    Backoff, FailOutcome, Job, JobOptions, JobOverrides, JobStatus, NewJob, QueueSettings,
    QueueStats, Retention, StalledJob, StalledOutcome,
};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::QueueStore;
pub use types::{CampaignJob, EmailJob, CAMPAIGN_QUEUE, EMAIL_QUEUE};
