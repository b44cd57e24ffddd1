//! Result retention window.

use crate::types::Timestamp;

/// Results older than this many days are swept.
pub const RETENTION_DAYS: i64 = 7;

/// The fixed retention window as a duration.
pub fn retention_window() -> chrono::Duration {
    chrono::Duration::days(RETENTION_DAYS)
}

/// Results created strictly before the returned instant are expired.
pub fn retention_cutoff(now: Timestamp) -> Timestamp {
    now - retention_window()
}

/// Whether a result created at `created_at` is past retention at `now`.
pub fn is_expired(created_at: Timestamp, now: Timestamp) -> bool {
    created_at < retention_cutoff(now)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[test]
    fn cutoff_is_seven_days_back() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 8, 12, 0, 0).unwrap();
        assert_eq!(retention_cutoff(now), expected);
    }

    #[test]
    fn eight_day_old_result_is_expired() {
        let now = Utc::now();
        assert!(is_expired(now - Duration::days(8), now));
    }

    #[test]
    fn six_day_old_result_is_kept() {
        let now = Utc::now();
        assert!(!is_expired(now - Duration::days(6), now));
    }

    #[test]
    fn exactly_at_cutoff_is_kept() {
        let now = Utc::now();
        assert!(!is_expired(retention_cutoff(now), now));
    }
}
