//! Retry backoff for failed sync and verification attempts.
//!
//! Each failure bumps the row's retry counter and schedules the earliest next
//! attempt (`retry_at` / `verification_retry_at`). The delay grows
//! polynomially with the retry count, with a randomized spread to keep a herd
//! of failures from retrying in lockstep, and is capped:
//!
//! - 1 hour for ordinary sync and verification failures
//! - 4 hours when the record is missing on the primary (the source may simply
//!   not exist yet, so aggressive retries buy nothing)
//!
//! Only the caps are contractual. The curve below the cap is an
//! implementation choice:
//!
//! ```text
//! retry_count  delay (before jitter)
//! -----------  ---------------------
//! 1            16s
//! 2            31s
//! 3            96s
//! 4            271s
//! 5            640s
//! 6            1311s
//! 7            2416s
//! 8+           cap (1h)
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::time::Duration;

/// Ceiling for ordinary sync/verification retries.
pub const RETRY_CAP: Duration = Duration::from_secs(60 * 60);

/// Ceiling for retries of records missing on the primary.
pub const MISSING_ON_PRIMARY_RETRY_CAP: Duration = Duration::from_secs(4 * 60 * 60);

/// Jitter contribution per retry, in seconds. The drawn multiplier is
/// `1..=JITTER_MAX_SECS`, scaled by `retry_count + 1`.
const JITTER_MAX_SECS: u64 = 20;

/// Delay before the next attempt, given how many attempts have failed.
///
/// `retry_count` is the value *after* the increment for the current failure.
/// Saturates internally, so absurd counters cannot overflow.
pub fn retry_delay(retry_count: i32, cap: Duration) -> Duration {
    let n = retry_count.max(0) as u64;
    let poly = n.saturating_pow(4);
    let jitter = rand::thread_rng().gen_range(1..=JITTER_MAX_SECS);
    let spread = jitter.saturating_mul(n.saturating_add(1));
    let secs = poly.saturating_add(15).saturating_add(spread);
    Duration::from_secs(secs).min(cap)
}

/// Cap applicable to a sync failure.
pub fn sync_retry_cap(missing_on_primary: bool) -> Duration {
    if missing_on_primary {
        MISSING_ON_PRIMARY_RETRY_CAP
    } else {
        RETRY_CAP
    }
}

/// Earliest next sync attempt, as a UTC timestamp.
pub fn next_sync_retry_at(retry_count: i32, missing_on_primary: bool) -> DateTime<Utc> {
    let delay = retry_delay(retry_count, sync_retry_cap(missing_on_primary));
    Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero())
}

/// Earliest next verification attempt, as a UTC timestamp.
///
/// Verification always uses the 1-hour cap; missing-on-primary records are
/// never claimed for verification in the first place (they are not synced).
pub fn next_verification_retry_at(retry_count: i32) -> DateTime<Utc> {
    let delay = retry_delay(retry_count, RETRY_CAP);
    Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_with_count() {
        // Jitter makes exact comparison flaky for adjacent counts; compare
        // counts far enough apart that the polynomial term dominates.
        let early = retry_delay(1, RETRY_CAP);
        let late = retry_delay(5, RETRY_CAP);
        assert!(late > early, "delay should grow: {:?} vs {:?}", early, late);
    }

    #[test]
    fn test_retry_delay_caps_at_one_hour() {
        for _ in 0..50 {
            let delay = retry_delay(9999, RETRY_CAP);
            assert_eq!(delay, RETRY_CAP);
        }
    }

    #[test]
    fn test_retry_delay_caps_at_four_hours_for_missing_on_primary() {
        for _ in 0..50 {
            let delay = retry_delay(9999, MISSING_ON_PRIMARY_RETRY_CAP);
            assert_eq!(delay, MISSING_ON_PRIMARY_RETRY_CAP);
        }
    }

    #[test]
    fn test_retry_delay_negative_count_is_safe() {
        let delay = retry_delay(-3, RETRY_CAP);
        assert!(delay >= Duration::from_secs(15));
        assert!(delay <= RETRY_CAP);
    }

    #[test]
    fn test_sync_retry_cap_selection() {
        assert_eq!(sync_retry_cap(false), RETRY_CAP);
        assert_eq!(sync_retry_cap(true), MISSING_ON_PRIMARY_RETRY_CAP);
    }

    #[test]
    fn test_next_sync_retry_at_within_cap_window() {
        let now = Utc::now();
        let at = next_sync_retry_at(9999, false);
        let upper = now + ChronoDuration::minutes(70);
        assert!(at > now);
        assert!(at <= upper, "1h cap exceeded: {}", at);

        let at = next_sync_retry_at(9999, true);
        let upper = now + ChronoDuration::minutes(250);
        assert!(at > now + ChronoDuration::minutes(200));
        assert!(at <= upper, "4h cap exceeded: {}", at);
    }

    #[test]
    fn test_next_verification_retry_at_uses_one_hour_cap() {
        let now = Utc::now();
        let at = next_verification_retry_at(9999);
        assert!(at > now + ChronoDuration::minutes(50));
        assert!(at <= now + ChronoDuration::minutes(70));
    }

    #[test]
    fn test_first_retry_is_short() {
        // retry_count = 1: 1 + 15 + jitter*2 <= 56s
        let delay = retry_delay(1, RETRY_CAP);
        assert!(delay >= Duration::from_secs(18));
        assert!(delay <= Duration::from_secs(56));
    }
}
