//! Message composition for campaign fan-out.
//!
//! Rendering lives in the CRUD app. Fan-out asks it for one finished message
//! per subscriber and queues whatever comes back.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::queue::EmailJob;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("composer unavailable: {0}")]
    Unavailable(String),

    #[error("campaign {0} not found")]
    CampaignNotFound(String),

    #[error("invalid composer response: {0}")]
    InvalidResponse(String),
}

/// A rendered message for one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub subscriber_id: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub personalization: Map<String, Value>,
}

impl ComposedMessage {
    /// Turn the rendered message into a delivery payload for `campaign_id`.
    pub fn into_email_job(self, campaign_id: &str) -> EmailJob {
        EmailJob {
            to: self.to,
            from: self.from,
            subject: self.subject,
            html: self.html,
            text: self.text,
            campaign_id: Some(campaign_id.to_string()),
            subscriber_id: Some(self.subscriber_id),
            organization_id: self.organization_id,
            personalization: self.personalization,
            tracking_token: None,
        }
    }
}

#[async_trait]
pub trait MessageComposer: Send + Sync {
    /// Render `campaign_id` for each subscriber. Subscribers that should not
    /// receive the campaign (unsubscribed, deleted) are left out of the result.
    async fn compose(
        &self,
        campaign_id: &str,
        subscriber_ids: &[String],
    ) -> Result<Vec<ComposedMessage>, ComposeError>;
}

#[derive(Debug, Serialize)]
struct ComposeRequest<'a> {
    subscriber_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ComposeResponse {
    messages: Vec<ComposedMessage>,
}

/// Composer backed by the CRUD app: `POST {base}/campaigns/{id}/messages`.
#[derive(Debug, Clone)]
pub struct HttpComposer {
    client: Client,
    base: Url,
}

impl HttpComposer {
    pub fn new(client: Client, base_url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            base: Url::parse(base_url)?,
        })
    }

    fn endpoint(&self, campaign_id: &str) -> Result<Url, ComposeError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ComposeError::Unavailable(format!("invalid composer url {}", self.base)))?
            .pop_if_empty()
            .extend(["campaigns", campaign_id, "messages"]);
        Ok(url)
    }
}

#[async_trait]
impl MessageComposer for HttpComposer {
    async fn compose(
        &self,
        campaign_id: &str,
        subscriber_ids: &[String],
    ) -> Result<Vec<ComposedMessage>, ComposeError> {
        let url = self.endpoint(campaign_id)?;

        let response = self
            .client
            .post(url)
            .json(&ComposeRequest { subscriber_ids })
            .send()
            .await
            .map_err(|e| {
                error!(campaign_id = %campaign_id, error = %e, "compose_request_error");
                ComposeError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ComposeError::CampaignNotFound(campaign_id.to_string()));
        }
        if !status.is_success() {
            error!(
                campaign_id = %campaign_id,
                status_code = status.as_u16(),
                "compose_request_rejected"
            );
            return Err(ComposeError::Unavailable(format!(
                "composer returned {}",
                status.as_u16()
            )));
        }

        let body: ComposeResponse = response
            .json()
            .await
            .map_err(|e| ComposeError::InvalidResponse(e.to_string()))?;

        debug!(
            campaign_id = %campaign_id,
            requested = subscriber_ids.len(),
            composed = body.messages.len(),
            "compose_complete"
        );

        Ok(body.messages)
    }
}
