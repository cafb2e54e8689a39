//! Wall-clock helpers. Job timestamps are Unix epoch milliseconds so they can
//! be persisted and compared across processes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Duration as whole milliseconds, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_secs(30)), 30_000);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }
}
