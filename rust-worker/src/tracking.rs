//! Tracking tokens for delivered messages.
//!
//! Each fanned-out email carries `hex(HMAC-SHA256(secret, job_id))`. Open and
//! click events ingested elsewhere present the token back, which ties the
//! event to exactly one delivery job without a lookup table.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Sign `job_id` with the tracking secret.
pub fn sign_tracking_token(secret: &str, job_id: &str) -> String {
    // HMAC accepts keys of any length; an empty key only fails verification.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(job_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a token presented for `job_id`.
pub fn verify_tracking_token(secret: &str, job_id: &str, token: &str) -> bool {
    if secret.is_empty() || job_id.is_empty() || token.is_empty() {
        warn!(
            has_secret = !secret.is_empty(),
            has_job_id = !job_id.is_empty(),
            has_token = !token.is_empty(),
            "tracking_token_missing_fields"
        );
        return false;
    }

    let expected = sign_tracking_token(secret, job_id);
    let valid = constant_time_compare(&expected, token);

    if !valid {
        warn!(
            job_id = %job_id,
            actual_length = token.len(),
            "tracking_token_mismatch"
        );
    }

    valid
}

/// Constant-time string comparison.
pub(crate) fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Tracking is on when a non-blank secret is configured.
pub fn is_tracking_enabled(secret: &Option<String>) -> bool {
    secret
        .as_ref()
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic_hex() {
        let a = sign_tracking_token("secret", "email-abc");
        let b = sign_tracking_token("secret", "email-abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_depends_on_secret_and_job() {
        let base = sign_tracking_token("secret", "email-abc");
        assert_ne!(base, sign_tracking_token("other", "email-abc"));
        assert_ne!(base, sign_tracking_token("secret", "email-abd"));
    }

    #[test]
    fn test_verify_round_trip() {
        let token = sign_tracking_token("secret", "email-abc");
        assert!(verify_tracking_token("secret", "email-abc", &token));
        assert!(!verify_tracking_token("secret", "email-xyz", &token));
        assert!(!verify_tracking_token("wrong", "email-abc", &token));
    }

    #[test]
    fn test_verify_missing_fields() {
        assert!(!verify_tracking_token("", "id", "tok"));
        assert!(!verify_tracking_token("secret", "", "tok"));
        assert!(!verify_tracking_token("secret", "id", ""));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn test_is_tracking_enabled() {
        assert!(!is_tracking_enabled(&None));
        assert!(!is_tracking_enabled(&Some("".to_string())));
        assert!(!is_tracking_enabled(&Some("   ".to_string())));
        assert!(is_tracking_enabled(&Some("k".to_string())));
    }
}
