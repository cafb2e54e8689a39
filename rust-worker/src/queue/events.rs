//! Lifecycle events broadcast to monitoring subscribers.
//!
//! Events are observational only: nothing in the queue reacts to them, and a
//! send with no subscribers is silently dropped. Dropping a receiver
//! unsubscribes it.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::job::StalledOutcome;

/// Buffered events per subscriber before slow receivers start lagging.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Completed {
        queue: String,
        job_id: String,
        result: Value,
        attempts_made: u32,
        stalled_count: u32,
    },
    Failed {
        queue: String,
        job_id: String,
        error: String,
        attempts_made: u32,
        stalled_count: u32,
        /// No further automatic retries will happen.
        terminal: bool,
    },
    Stalled {
        queue: String,
        job_id: String,
        stalled_count: u32,
        attempts_made: u32,
        outcome: StalledOutcome,
    },
    Progress {
        queue: String,
        job_id: String,
        progress: u8,
    },
    /// The store failed during a background operation.
    Error { queue: String, message: String },
}

/// Fan-out point for [`QueueEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: QueueEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
