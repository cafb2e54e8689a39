//! Payload types for the two-tier queue architecture.
//!
//! This module defines the job payloads for:
//! - `campaign_fanout` queue: one job per "send campaign to N subscribers" request
//! - `email_delivery` queue: one job per outbound message

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Queue name for campaign fan-out requests.
pub const CAMPAIGN_QUEUE: &str = "campaign_fanout";

/// Queue name for individual email deliveries.
pub const EMAIL_QUEUE: &str = "email_delivery";

// =============================================================================
// Email Jobs (email_delivery queue)
// =============================================================================

/// A single outbound message, ready for the mail transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    /// Recipient address
    pub to: String,
    /// Sender override; the transport default is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Merge fields already applied by the composer, kept for auditing
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub personalization: Map<String, Value>,
    /// Signed token tying open/click events back to this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_token: Option<String>,
}

impl EmailJob {
    /// Create a standalone email job.
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            from: None,
            subject: subject.into(),
            html: None,
            text: None,
            campaign_id: None,
            subscriber_id: None,
            organization_id: None,
            personalization: Map::new(),
            tracking_token: None,
        }
    }
}

// =============================================================================
// Campaign Jobs (campaign_fanout queue)
// =============================================================================

/// Request to deliver one campaign to a set of subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignJob {
    pub campaign_id: String,
    /// May contain duplicates; fan-out deduplicates them.
    pub subscriber_ids: Vec<String>,
}
