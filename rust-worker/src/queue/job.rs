//! Job records, options and the status state machine shared by every queue.
//!
//! A job moves through:
//!
//! ```text
//! waiting → active → completed
//!             │
//!             ├→ delayed → waiting → …   (retry after backoff)
//!             └→ failed                  (attempts exhausted or permanent error)
//! ```
//!
//! An active job whose lock expires is "stalled" and goes back to waiting,
//! or to failed once it has stalled more than `max_stalled_count` times.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueueError;

/// Default number of delivery attempts for an email job.
pub const DEFAULT_EMAIL_ATTEMPTS: u32 = 3;

/// Campaign fan-out is not retried automatically.
pub const DEFAULT_CAMPAIGN_ATTEMPTS: u32 = 1;

/// Default base delay for exponential backoff, in milliseconds.
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 2000;

/// Default hard deadline for a single processing attempt, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default lock duration, stalled-scan interval and stall limit.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_STALLED_COUNT: u32 = 3;

/// Number of completed jobs kept for inspection before the oldest are evicted.
pub const DEFAULT_KEEP_COMPLETED: usize = 100;

/// Error recorded on a job that stalled too many times.
pub const STALLED_LIMIT_ERROR: &str = "job stalled more than allowable limit";

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    /// Waiting out a backoff delay; becomes `Waiting` once the delay passes.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "delayed" => Ok(JobStatus::Delayed),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::Unsupported(format!("unknown job status '{}'", other))),
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Longest retry delay in milliseconds, the largest integer a Lua number
/// holds exactly.
pub const MAX_BACKOFF_DELAY_MS: u64 = 9_007_199_254_740_991;

/// Delay policy between retries. Delays are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay: u64 },
    /// `delay × 2^(attempts_made - 1)`: 2000, 4000, 8000, … for a 2000ms base.
    Exponential { delay: u64 },
}

impl Backoff {
    /// Delay before the next attempt, given the number of attempts made so far
    /// (including the one that just failed). Capped at [`MAX_BACKOFF_DELAY_MS`].
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { delay } => {
                let exponent = attempts_made.saturating_sub(1);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                delay.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(MAX_BACKOFF_DELAY_MS))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backoff::Fixed { .. } => "fixed",
            Backoff::Exponential { .. } => "exponential",
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        match *self {
            Backoff::Fixed { delay } | Backoff::Exponential { delay } => delay,
        }
    }

    /// Rebuild a policy from its persisted kind and base delay.
    pub fn from_parts(kind: &str, delay: u64) -> Self {
        match kind {
            "fixed" => Backoff::Fixed { delay },
            _ => Backoff::Exponential { delay },
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            delay: DEFAULT_BACKOFF_DELAY_MS,
        }
    }
}

/// Per-job processing options, fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Soft pick-order hint; lower values are leased first.
    pub priority: u32,
    /// Maximum number of attempts (at least 1).
    pub attempts: u32,
    pub backoff: Backoff,
    pub timeout_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            attempts: DEFAULT_EMAIL_ATTEMPTS,
            backoff: Backoff::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Caller-supplied overrides applied on top of a queue's default options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOverrides {
    pub priority: Option<u32>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    #[serde(alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

impl JobOverrides {
    pub fn apply(self, base: JobOptions) -> JobOptions {
        let mut opts = base;
        if let Some(priority) = self.priority {
            opts = opts.with_priority(priority);
        }
        if let Some(attempts) = self.attempts {
            opts = opts.with_attempts(attempts);
        }
        if let Some(backoff) = self.backoff {
            opts = opts.with_backoff(backoff);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            opts = opts.with_timeout_ms(timeout_ms);
        }
        opts
    }
}

/// How many completed jobs a queue retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    KeepAll,
    RemoveImmediately,
    /// Ring buffer of the most recently completed jobs.
    KeepLast(usize),
}

impl Retention {
    /// Parse the `removeOnComplete` setting: `true`, `false` or a count.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Retention::RemoveImmediately),
            "false" => Some(Retention::KeepAll),
            other => other.parse::<usize>().ok().map(|n| match n {
                0 => Retention::RemoveImmediately,
                n => Retention::KeepLast(n),
            }),
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Retention::KeepLast(DEFAULT_KEEP_COMPLETED)
    }
}

/// Queue-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub remove_on_complete: Retention,
    pub remove_on_fail: bool,
    /// Defaults for jobs added without explicit options.
    pub job_options: JobOptions,
}

impl QueueSettings {
    pub fn email() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            stalled_interval: DEFAULT_STALLED_INTERVAL,
            max_stalled_count: DEFAULT_MAX_STALLED_COUNT,
            remove_on_complete: Retention::default(),
            remove_on_fail: false,
            job_options: JobOptions::default(),
        }
    }

    pub fn campaign() -> Self {
        Self {
            job_options: JobOptions::default().with_attempts(DEFAULT_CAMPAIGN_ATTEMPTS),
            ..Self::email()
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::email()
    }
}

// =============================================================================
// Records
// =============================================================================

/// A job submitted to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: String,
    pub data: Value,
    pub opts: JobOptions,
}

/// Exclusive, renewable claim on an active job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub token: String,
    /// Unix epoch milliseconds after which the lock counts as expired.
    pub expires_at: u64,
}

/// A stored job. `T` is the decoded payload type; the store itself works
/// with raw JSON values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job<T = Value> {
    pub id: String,
    pub data: T,
    pub opts: JobOptions,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub progress: u8,
    /// Insertion order within the queue.
    pub seq: u64,
    pub created_at: u64,
    pub processed_on: Option<u64>,
    pub finished_on: Option<u64>,
    /// Not-before time for delayed jobs.
    pub available_at: u64,
    #[serde(skip)]
    pub lock: Option<Lock>,
    pub last_error: Option<String>,
}

impl<T> Job<T> {
    pub fn lock_token(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.token.as_str())
    }

    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> Job<U> {
        Job {
            id: self.id,
            data: f(self.data),
            opts: self.opts,
            status: self.status,
            attempts_made: self.attempts_made,
            stalled_count: self.stalled_count,
            progress: self.progress,
            seq: self.seq,
            created_at: self.created_at,
            processed_on: self.processed_on,
            finished_on: self.finished_on,
            available_at: self.available_at,
            lock: self.lock,
            last_error: self.last_error,
        }
    }
}

impl Job<Value> {
    /// Build a fresh waiting record for a newly enqueued job.
    pub fn waiting(new: NewJob, seq: u64, now: u64) -> Self {
        Job {
            id: new.id,
            data: new.data,
            opts: new.opts,
            status: JobStatus::Waiting,
            attempts_made: 0,
            stalled_count: 0,
            progress: 0,
            seq,
            created_at: now,
            processed_on: None,
            finished_on: None,
            available_at: now,
            lock: None,
            last_error: None,
        }
    }

    /// Decode the raw payload into `U`.
    pub fn decode<U: DeserializeOwned>(mut self) -> Result<Job<U>, QueueError> {
        let raw = std::mem::take(&mut self.data);
        let data = serde_json::from_value(raw)?;
        Ok(self.map_data(|_| data))
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job will be retried once `delay` has passed.
    Retrying { attempts_made: u32, delay: Duration },
    /// The job reached its terminal failed state.
    Failed { attempts_made: u32 },
}

impl FailOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Failed { .. })
    }

    pub fn attempts_made(&self) -> u32 {
        match *self {
            FailOutcome::Retrying { attempts_made, .. } | FailOutcome::Failed { attempts_made } => {
                attempts_made
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StalledOutcome {
    Requeued,
    Failed,
}

/// A job recovered by a stalled-job scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalledJob {
    pub id: String,
    pub stalled_count: u32,
    pub attempts_made: u32,
    pub outcome: StalledOutcome,
}

/// Point-in-time job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Outstanding work: `waiting + active + delayed`.
    pub total: usize,
    pub paused: bool,
}

impl QueueStats {
    pub fn new(
        waiting: usize,
        active: usize,
        delayed: usize,
        completed: usize,
        failed: usize,
        paused: bool,
    ) -> Self {
        Self {
            waiting,
            active,
            delayed,
            completed,
            failed,
            total: waiting + active + delayed,
            paused,
        }
    }
}

/// Random token identifying one lease of a job.
pub fn new_lock_token() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}
