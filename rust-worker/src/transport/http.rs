//! Mailgun-style HTTP transport: `POST {base}/v3/{domain}/messages`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, warn};
use url::Url;

use super::{Delivery, MailTransport, SendError};
use crate::queue::EmailJob;

/// Longest provider error body kept in a failure message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct ProviderReply {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpMailTransport {
    client: Client,
    endpoint: Url,
    api_key: String,
    default_from: String,
}

impl HttpMailTransport {
    pub fn new(
        client: Client,
        base_url: &str,
        domain: &str,
        api_key: &str,
        default_from: &str,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            endpoint: messages_endpoint(base_url, domain)?,
            api_key: api_key.to_string(),
            default_from: default_from.to_string(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn form_fields<'a>(&'a self, email: &'a EmailJob) -> Vec<(&'static str, &'a str)> {
        let mut fields = vec![
            ("from", email.from.as_deref().unwrap_or(self.default_from.as_str())),
            ("to", email.to.as_str()),
            ("subject", email.subject.as_str()),
        ];
        if let Some(html) = &email.html {
            fields.push(("html", html.as_str()));
        }
        if let Some(text) = &email.text {
            fields.push(("text", text.as_str()));
        }
        // Custom variables come back on delivery webhooks.
        if let Some(campaign_id) = &email.campaign_id {
            fields.push(("v:campaign_id", campaign_id.as_str()));
            fields.push(("o:tag", campaign_id.as_str()));
        }
        if let Some(subscriber_id) = &email.subscriber_id {
            fields.push(("v:subscriber_id", subscriber_id.as_str()));
        }
        if let Some(token) = &email.tracking_token {
            fields.push(("v:tracking_token", token.as_str()));
        }
        fields
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, email: &EmailJob) -> Result<Delivery, SendError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .basic_auth("api", Some(&self.api_key))
            .form(&self.form_fields(email))
            .send()
            .await;

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_timeout() {
                    error!(to = %email.to, error = %e, "mail_send_timeout");
                } else if e.is_connect() {
                    error!(to = %email.to, error = %e, "mail_send_connect_error");
                } else {
                    error!(to = %email.to, error = %e, "mail_send_error");
                }
                return Err(if e.is_builder() {
                    SendError::Permanent(e.to_string())
                } else {
                    SendError::Transient(e.to_string())
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            let reply = response.json::<ProviderReply>().await.ok();
            let message_id = reply.and_then(|r| r.id);
            debug!(
                to = %email.to,
                status_code = status.as_u16(),
                message_id = message_id.as_deref().unwrap_or(""),
                "mail_send_accepted"
            );
            return Ok(Delivery { message_id });
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, &body);
        warn!(
            to = %email.to,
            status_code = status.as_u16(),
            retryable = err.is_retryable(),
            "mail_send_rejected"
        );
        Err(err)
    }
}

/// Map a non-2xx provider response onto a send failure.
///
/// Timeouts, throttling and server errors are worth retrying; any other
/// client error means the request itself is wrong.
pub fn classify_status(status: StatusCode, body: &str) -> SendError {
    let body = truncate(body.trim(), MAX_ERROR_BODY);
    let message = if body.is_empty() {
        format!("provider returned {}", status.as_u16())
    } else {
        format!("provider returned {}: {}", status.as_u16(), body)
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SendError::Transient(message)
    } else if status.is_client_error() {
        SendError::Permanent(message)
    } else {
        SendError::Transient(message)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn messages_endpoint(base_url: &str, domain: &str) -> Result<Url, url::ParseError> {
    let mut base = Url::parse(base_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("v3/{}/messages", domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_endpoint() {
        let url = messages_endpoint("https://api.mailgun.net", "mg.example.com").unwrap();
        assert_eq!(url.as_str(), "https://api.mailgun.net/v3/mg.example.com/messages");

        let url = messages_endpoint("http://localhost:9000/mock", "d").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/mock/v3/d/messages");
    }

    #[test]
    fn test_messages_endpoint_invalid_base() {
        assert!(messages_endpoint("not a url", "d").is_err());
    }

    #[test]
    fn test_classify_transient_statuses() {
        for code in [408, 429, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, "").is_retryable(), "{}", code);
        }
    }

    #[test]
    fn test_classify_permanent_statuses() {
        for code in [400, 401, 403, 404, 413] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!classify_status(status, "").is_retryable(), "{}", code);
        }
    }

    #[test]
    fn test_classify_keeps_body_excerpt() {
        let err = classify_status(StatusCode::BAD_REQUEST, "  'to' parameter is not a valid address ");
        assert_eq!(
            err,
            SendError::Permanent(
                "provider returned 400: 'to' parameter is not a valid address".to_string()
            )
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_form_fields() {
        let transport = HttpMailTransport::new(
            Client::new(),
            "https://api.mailgun.net",
            "mg.example.com",
            "key",
            "Listings <listings@example.com>",
        )
        .unwrap();

        let mut email = EmailJob::new("buyer@example.com", "Open house");
        email.text = Some("Sunday 2pm".to_string());
        email.campaign_id = Some("c1".to_string());

        let fields = transport.form_fields(&email);
        assert!(fields.contains(&("from", "Listings <listings@example.com>")));
        assert!(fields.contains(&("text", "Sunday 2pm")));
        assert!(fields.contains(&("v:campaign_id", "c1")));
        assert!(!fields.iter().any(|(k, _)| *k == "html"));
    }
}
