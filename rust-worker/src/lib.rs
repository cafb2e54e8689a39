//! Mailqueue - two-tier email delivery pipeline.
//!
//! This library provides shared modules for the three binaries:
//! - `mailqueue-admin`: HTTP producer and admin API
//! - `mailqueue-fanout`: campaign fan-out worker
//! - `mailqueue-worker`: email delivery workers
//!
//! ## Architecture
//!
//! ```text
//! Producer → campaign_fanout → CampaignWorker → email_delivery → EmailWorker → mail API
//! ```
//!
//! All job state lives in a [`QueueStore`] (Redis in production, in-memory
//! for tests and embedding); workers coordinate only through it.

pub mod admin;
pub mod compose;
pub mod config;
pub mod error;
pub mod producer;
pub mod queue;
pub mod tracking;
pub mod transport;
pub mod util;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use admin::{Admin, QueueKind, QueueOverview};
pub use compose::{ComposeError, ComposedMessage, HttpComposer, MessageComposer};
pub use config::Config;
pub use error::QueueError;
pub use producer::Producer;
pub use queue::{
    CampaignJob, EmailJob, Job, JobOptions, JobStatus, MemoryStore, Queue, QueueEvent,
    QueueSettings, QueueStats, QueueStore, RedisStore, CAMPAIGN_QUEUE, EMAIL_QUEUE,
};
pub use transport::{Delivery, HttpMailTransport, MailTransport, SendError};
pub use web::AppState;
pub use worker::{run_stalled_checker, CampaignWorker, EmailWorker};
