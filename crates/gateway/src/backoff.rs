//! Exponential backoff with bounded jitter

use std::time::Duration;

use rand::RngExt;

/// Fraction of the computed delay added as random jitter, at most.
const JITTER_FRACTION: f64 = 0.1;

/// `base * 2^attempt`, saturating instead of overflowing.
pub fn exponential(base: Duration, attempt: u32) -> Duration {
    let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(multiplier).unwrap_or(Duration::MAX)
}

/// Exponential delay clamped to `cap`.
pub fn capped(base: Duration, attempt: u32, cap: Duration) -> Duration {
    exponential(base, attempt).min(cap)
}

/// Add up to 10% random jitter to `delay` without exceeding `cap`.
pub fn with_jitter(delay: Duration, cap: Duration) -> Duration {
    let spread = delay.mul_f64(JITTER_FRACTION);
    let room = cap.saturating_sub(delay).min(spread);
    let room_ms = u64::try_from(room.as_millis()).unwrap_or(u64::MAX);
    if room_ms == 0 {
        return delay.min(cap);
    }
    let jitter_ms = rand::rng().random_range(0..=room_ms);
    (delay + Duration::from_millis(jitter_ms)).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_the_base() {
        let base = Duration::from_secs(1);
        let delays: Vec<_> = (0..5).map(|n| exponential(base, n)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn delays_never_exceed_the_cap() {
        let base = Duration::from_millis(1500);
        let cap = Duration::from_secs(10);
        for attempt in 0..64 {
            assert!(capped(base, attempt, cap) <= cap);
        }
        assert_eq!(capped(base, 2, cap), Duration::from_secs(6));
        assert_eq!(capped(base, 3, cap), cap);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        assert_eq!(
            capped(Duration::from_secs(1), 200, Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn jitter_stays_within_ten_percent_and_cap() {
        let cap = Duration::from_secs(60);
        for _ in 0..200 {
            let d = with_jitter(Duration::from_secs(4), cap);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_millis(4400));
        }
        for _ in 0..50 {
            let d = with_jitter(Duration::from_secs(59), cap);
            assert!(d <= cap);
        }
        assert_eq!(with_jitter(cap, cap), cap);
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(
            with_jitter(Duration::ZERO, Duration::from_secs(60)),
            Duration::ZERO
        );
    }
}
