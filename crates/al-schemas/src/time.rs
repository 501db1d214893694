use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Post-handoff iteration window: a run completing within this duration after
/// a handoff counts as a post-handoff iteration.
pub const POST_HANDOFF_WINDOW: Duration = Duration::milliseconds(14_400_000);

/// UTC calendar day a timestamp attributes to. All daily aggregates key on
/// this, never local time.
pub fn day(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_uses_utc_calendar_date() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 59).unwrap();
        assert_eq!(day(ts), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[test]
    fn window_is_exactly_four_hours() {
        assert_eq!(POST_HANDOFF_WINDOW, Duration::hours(4));
    }
}
