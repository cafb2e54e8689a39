//! Configuration module for environment variable parsing.
//!
//! Every setting has a default; unparsable values are logged and ignored.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::queue::job::{
    DEFAULT_BACKOFF_DELAY_MS, DEFAULT_EMAIL_ATTEMPTS, DEFAULT_MAX_STALLED_COUNT, DEFAULT_TIMEOUT_MS,
};
use crate::queue::{Backoff, JobOptions, QueueSettings, Retention};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL
    pub redis_url: String,

    /// Key prefix shared by all queues
    pub queue_prefix: String,

    // =========================================================================
    // Workers
    // =========================================================================

    /// Number of concurrent email delivery workers
    pub worker_concurrency: usize,

    /// Number of concurrent campaign fan-out workers
    pub campaign_concurrency: usize,

    /// Idle poll interval for empty queues
    pub poll_interval_ms: u64,

    // =========================================================================
    // Queue behaviour
    // =========================================================================

    /// Max delivery attempts per email
    pub email_attempts: u32,

    pub email_backoff: Backoff,

    /// Hard deadline for one transport call
    pub email_timeout_ms: u64,

    /// Completed-job retention: a count, `true` (drop at once) or `false` (keep all)
    pub remove_on_complete: Retention,

    pub remove_on_fail: bool,

    pub max_stalled_count: u32,

    pub stalled_interval_ms: u64,

    pub lock_duration_ms: u64,

    // =========================================================================
    // Collaborators
    // =========================================================================

    /// Mail provider API root, e.g. https://api.mailgun.net
    pub mail_api_base_url: String,

    pub mail_domain: Option<String>,

    pub mail_api_key: Option<String>,

    /// Sender used when an email does not set one
    pub mail_from: String,

    /// CRUD app root used to render campaign messages
    pub composer_url: Option<String>,

    /// HMAC key for tracking tokens; tracking is off when unset
    pub tracking_secret: Option<String>,

    // =========================================================================
    // Admin API
    // =========================================================================

    /// Port for the admin API to listen on
    pub port: u16,

    /// Shared secret expected in `X-Admin-Token`; auth is off when unset
    pub admin_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),

            queue_prefix: env::var("QUEUE_PREFIX")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| "mailqueue".to_string()),

            worker_concurrency: parse_env("WORKER_CONCURRENCY", 10).max(1),

            campaign_concurrency: parse_env("CAMPAIGN_CONCURRENCY", 1).max(1),

            poll_interval_ms: parse_env("POLL_INTERVAL_MS", 500),

            email_attempts: parse_env("EMAIL_ATTEMPTS", DEFAULT_EMAIL_ATTEMPTS).max(1),

            email_backoff: parse_backoff(
                "EMAIL_BACKOFF_TYPE",
                parse_env("EMAIL_BACKOFF_DELAY_MS", DEFAULT_BACKOFF_DELAY_MS),
            ),

            email_timeout_ms: parse_env("EMAIL_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),

            remove_on_complete: parse_retention("REMOVE_ON_COMPLETE"),

            remove_on_fail: parse_env("REMOVE_ON_FAIL", false),

            max_stalled_count: parse_env("MAX_STALLED_COUNT", DEFAULT_MAX_STALLED_COUNT),

            stalled_interval_ms: parse_env("STALLED_INTERVAL_MS", 30_000),

            lock_duration_ms: parse_env("LOCK_DURATION_MS", 30_000),

            mail_api_base_url: env::var("MAIL_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.mailgun.net".to_string()),

            mail_domain: non_empty("MAIL_DOMAIN"),

            mail_api_key: non_empty("MAIL_API_KEY"),

            mail_from: env::var("MAIL_FROM").unwrap_or_else(|_| "no-reply@localhost".to_string()),

            composer_url: non_empty("COMPOSER_URL"),

            tracking_secret: non_empty("TRACKING_SECRET"),

            port: parse_env("PORT", 8080),

            admin_token: non_empty("ADMIN_TOKEN"),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Settings for the `email_delivery` queue.
    pub fn email_queue_settings(&self) -> QueueSettings {
        QueueSettings {
            lock_duration: Duration::from_millis(self.lock_duration_ms.max(1)),
            stalled_interval: Duration::from_millis(self.stalled_interval_ms.max(1)),
            max_stalled_count: self.max_stalled_count,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
            job_options: JobOptions::default()
                .with_attempts(self.email_attempts)
                .with_backoff(self.email_backoff)
                .with_timeout_ms(self.email_timeout_ms),
        }
    }

    /// Settings for the `campaign_fanout` queue: same lock and stall
    /// handling, a single attempt per campaign job.
    pub fn campaign_queue_settings(&self) -> QueueSettings {
        let email = self.email_queue_settings();
        QueueSettings {
            job_options: QueueSettings::campaign().job_options,
            ..email
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(env_var = name, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read `name` as a string, treating blank values as unset.
fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `exponential` (default) or `fixed`.
fn parse_backoff(name: &str, delay: u64) -> Backoff {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return Backoff::Exponential { delay },
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "exponential" => Backoff::Exponential { delay },
        "fixed" => Backoff::Fixed { delay },
        _ => {
            warn!(env_var = name, value = %raw, "Invalid backoff type, using exponential");
            Backoff::Exponential { delay }
        }
    }
}

/// A count, `true` or `false`.
fn parse_retention(name: &str) -> Retention {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return Retention::default(),
    };

    Retention::parse(raw.trim()).unwrap_or_else(|| {
        warn!(env_var = name, value = %raw, "Invalid retention, using default");
        Retention::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_valid() {
        env::set_var("TEST_PARSE_ENV_VALID", " 42 ");
        assert_eq!(parse_env("TEST_PARSE_ENV_VALID", 0u32), 42);
        env::remove_var("TEST_PARSE_ENV_VALID");
    }

    #[test]
    fn test_parse_env_invalid_uses_default() {
        env::set_var("TEST_PARSE_ENV_INVALID", "lots");
        assert_eq!(parse_env("TEST_PARSE_ENV_INVALID", 7u32), 7);
        env::remove_var("TEST_PARSE_ENV_INVALID");
    }

    #[test]
    fn test_parse_env_default() {
        assert!(!parse_env("NONEXISTENT_VAR_BOOL", false));
    }

    #[test]
    fn test_parse_backoff() {
        env::set_var("TEST_BACKOFF_FIXED", "Fixed");
        assert_eq!(parse_backoff("TEST_BACKOFF_FIXED", 100), Backoff::Fixed { delay: 100 });
        env::remove_var("TEST_BACKOFF_FIXED");

        env::set_var("TEST_BACKOFF_BOGUS", "linear");
        assert_eq!(
            parse_backoff("TEST_BACKOFF_BOGUS", 100),
            Backoff::Exponential { delay: 100 }
        );
        env::remove_var("TEST_BACKOFF_BOGUS");
    }

    #[test]
    fn test_parse_retention() {
        env::set_var("TEST_RETENTION_COUNT", "25");
        assert_eq!(parse_retention("TEST_RETENTION_COUNT"), Retention::KeepLast(25));
        env::remove_var("TEST_RETENTION_COUNT");

        env::set_var("TEST_RETENTION_TRUE", "true");
        assert_eq!(parse_retention("TEST_RETENTION_TRUE"), Retention::RemoveImmediately);
        env::remove_var("TEST_RETENTION_TRUE");

        assert_eq!(parse_retention("NONEXISTENT_RETENTION"), Retention::KeepLast(100));
    }

    #[test]
    fn test_non_empty() {
        env::set_var("TEST_NON_EMPTY_BLANK", "   ");
        assert_eq!(non_empty("TEST_NON_EMPTY_BLANK"), None);
        env::remove_var("TEST_NON_EMPTY_BLANK");
    }

    #[test]
    fn test_queue_settings_share_stall_handling() {
        let config = Config {
            email_attempts: 5,
            lock_duration_ms: 10_000,
            ..Config::from_env()
        };

        let email = config.email_queue_settings();
        let campaign = config.campaign_queue_settings();
        assert_eq!(email.job_options.attempts, 5);
        assert_eq!(campaign.job_options.attempts, 1);
        assert_eq!(email.lock_duration, Duration::from_secs(10));
        assert_eq!(campaign.lock_duration, Duration::from_secs(10));
        assert_eq!(campaign.max_stalled_count, email.max_stalled_count);
    }
}
