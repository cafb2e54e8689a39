//! Outbound mail transport.
//!
//! The delivery worker only sees [`MailTransport`]; the HTTP provider client
//! lives in [`http`].

pub mod http;

use async_trait::async_trait;
use mailparse::MailAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::EmailJob;

pub use http::HttpMailTransport;

/// Why a send attempt failed. Only transient failures are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Network errors, timeouts, throttling and provider-side errors.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// The provider will never accept this message as-is (bad recipient,
    /// rejected payload, bad credentials).
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// Provider acknowledgement for an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Provider-assigned message id, if the provider returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &EmailJob) -> Result<Delivery, SendError>;
}

/// Check that `to` holds at least one well-formed mailbox.
///
/// Malformed recipients are a permanent failure: retrying cannot fix them.
pub fn validate_recipient(to: &str) -> Result<(), SendError> {
    if to.trim().is_empty() {
        return Err(SendError::Permanent("recipient is empty".to_string()));
    }

    let list = mailparse::addrparse(to)
        .map_err(|e| SendError::Permanent(format!("invalid recipient {:?}: {}", to, e)))?;

    let mut mailboxes = 0;
    for addr in list.iter() {
        match addr {
            MailAddr::Single(info) => {
                check_mailbox(&info.addr)?;
                mailboxes += 1;
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    check_mailbox(&info.addr)?;
                    mailboxes += 1;
                }
            }
        }
    }

    if mailboxes == 0 {
        return Err(SendError::Permanent(format!("no recipient in {:?}", to)));
    }
    Ok(())
}

fn check_mailbox(addr: &str) -> Result<(), SendError> {
    match addr.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(SendError::Permanent(format!("invalid recipient {:?}", addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_recipient_accepts_plain_and_named() {
        assert!(validate_recipient("buyer@example.com").is_ok());
        assert!(validate_recipient("Jane Buyer <jane@example.com>").is_ok());
    }

    #[test]
    fn test_validate_recipient_rejects_empty() {
        let err = validate_recipient("   ").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_recipient_rejects_garbage() {
        let err = validate_recipient("not-an-address").unwrap_err();
        assert!(matches!(err, SendError::Permanent(_)));
    }

    #[test]
    fn test_send_error_retryable() {
        assert!(SendError::Transient("503".to_string()).is_retryable());
        assert!(!SendError::Permanent("400".to_string()).is_retryable());
    }
}
