//! Error types shared by the queue store, workers and HTTP layer.

use thiserror::Error;

/// Errors returned by queue store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached or rejected the command.
    #[error("queue store unavailable: {0}")]
    Unavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The caller no longer holds the lock on this job (stalled and re-leased,
    /// already committed, or never leased).
    #[error("job {0} is not locked by this worker")]
    LockMismatch(String),

    /// Active jobs cannot be removed or force-retried mid-flight.
    #[error("job {0} is active and cannot be modified")]
    JobActive(String),

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl QueueError {
    /// Whether the error means the store itself is unhealthy, as opposed to a
    /// problem with a single job.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}
