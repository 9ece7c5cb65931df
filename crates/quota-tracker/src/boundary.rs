//! Reset boundary arithmetic
//!
//! Boundaries are computed in the provider's civil time and converted back to
//! UTC, so a zone's daylight-saving shifts move the UTC instant of "midnight"
//! with it. A civil time that does not exist on a given day (spring-forward
//! gap) resolves to the first valid instant after it. A civil time that occurs
//! twice (fall-back overlap) resolves to the earlier occurrence.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use provider::ResetRule;

/// Longest DST gap we step across, in 30-minute increments.
const GAP_STEPS: i64 = 6;

/// The first reset boundary strictly after `now`, or `None` for rolling
/// providers, which have no fixed boundary.
pub fn next_reset(rule: &ResetRule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match rule {
        ResetRule::Daily { zone, at } => next_daily(*zone, *at, now),
        ResetRule::MonthlyUtc => next_month_start(now),
        ResetRule::Rolling => None,
    }
}

fn next_daily(zone: Tz, at: NaiveTime, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(&zone).date_naive();
    // Yesterday covers `now` sitting inside a repeated hour; two days ahead
    // covers a boundary pushed past midnight by a gap.
    (-1..=2)
        .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
        .filter_map(|day| resolve_local(zone, day, at))
        .find(|boundary| *boundary > now)
}

fn resolve_local(zone: Tz, day: NaiveDate, at: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = day.and_time(at);
    (0..=GAP_STEPS).find_map(|step| {
        zone.from_local_datetime(&(naive + Duration::minutes(30 * step)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    })
}

fn next_month_start(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn pacific() -> ResetRule {
        ResetRule::daily_midnight(chrono_tz::America::Los_Angeles)
    }

    #[test]
    fn pacific_midnight_in_winter_is_0800_utc() {
        // 2025-01-15 10:00 PST
        let now = utc(2025, 1, 15, 18, 0);
        assert_eq!(next_reset(&pacific(), now), Some(utc(2025, 1, 16, 8, 0)));
    }

    #[test]
    fn pacific_midnight_in_summer_is_0700_utc() {
        // 2025-07-04 23:59 PDT
        let now = utc(2025, 7, 5, 6, 59);
        assert_eq!(next_reset(&pacific(), now), Some(utc(2025, 7, 5, 7, 0)));
    }

    #[test]
    fn pacific_boundary_follows_spring_forward() {
        // 2025-03-09 03:00 PDT, an hour after clocks jumped
        let now = utc(2025, 3, 9, 10, 0);
        assert_eq!(next_reset(&pacific(), now), Some(utc(2025, 3, 10, 7, 0)));
        // The evening before, midnight is still PST
        let now = utc(2025, 3, 8, 20, 0);
        assert_eq!(next_reset(&pacific(), now), Some(utc(2025, 3, 9, 8, 0)));
    }

    #[test]
    fn boundary_is_strictly_after_now() {
        let midnight = utc(2025, 1, 16, 8, 0);
        assert_eq!(
            next_reset(&pacific(), midnight),
            Some(utc(2025, 1, 17, 8, 0))
        );
        let just_before = midnight - Duration::seconds(1);
        assert_eq!(next_reset(&pacific(), just_before), Some(midnight));
    }

    #[test]
    fn nonexistent_midnight_moves_to_first_valid_instant() {
        // Sao Paulo skipped 2018-11-04 00:00..01:00 local
        let rule = ResetRule::daily_midnight(chrono_tz::America::Sao_Paulo);
        let now = utc(2018, 11, 3, 15, 0);
        assert_eq!(next_reset(&rule, now), Some(utc(2018, 11, 4, 3, 0)));
    }

    #[test]
    fn repeated_time_resolves_to_earlier_instant() {
        // 01:30 happened twice in Los Angeles on 2025-11-02
        let rule = ResetRule::Daily {
            zone: chrono_tz::America::Los_Angeles,
            at: NaiveTime::from_hms_opt(1, 30, 0).unwrap(),
        };
        let now = utc(2025, 11, 1, 20, 0);
        assert_eq!(next_reset(&rule, now), Some(utc(2025, 11, 2, 8, 30)));
    }

    #[test]
    fn utc_daily_rolls_at_midnight_utc() {
        let rule = ResetRule::daily_midnight(chrono_tz::UTC);
        assert_eq!(
            next_reset(&rule, utc(2025, 6, 30, 23, 59)),
            Some(utc(2025, 7, 1, 0, 0))
        );
    }

    #[test]
    fn monthly_handles_month_lengths_and_year_end() {
        let rule = ResetRule::MonthlyUtc;
        assert_eq!(next_reset(&rule, utc(2025, 1, 31, 12, 0)), Some(utc(2025, 2, 1, 0, 0)));
        assert_eq!(next_reset(&rule, utc(2024, 2, 29, 23, 0)), Some(utc(2024, 3, 1, 0, 0)));
        assert_eq!(next_reset(&rule, utc(2025, 12, 15, 0, 0)), Some(utc(2026, 1, 1, 0, 0)));
        assert_eq!(next_reset(&rule, utc(2025, 4, 1, 0, 0)), Some(utc(2025, 5, 1, 0, 0)));
    }

    #[test]
    fn rolling_has_no_boundary() {
        assert_eq!(next_reset(&ResetRule::Rolling, utc(2025, 1, 1, 0, 0)), None);
    }
}
