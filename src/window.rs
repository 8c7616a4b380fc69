use chrono::{DateTime, Duration, LocalResult, NaiveTime, TimeZone, Utc};

/// Period used to scope duplicate lookups and pruning. Rows scrobbled
/// before `start` neither suppress new plays nor survive cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationWindow {
    pub start: DateTime<Utc>,
}

impl ClassificationWindow {
    /// Window that opened at the most recent midnight in `tz`.
    pub fn since_midnight<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> Self {
        let local_date = now.with_timezone(tz).date_naive();
        let midnight = local_date.and_time(NaiveTime::MIN);
        let start = match tz.from_local_datetime(&midnight) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            // Midnight skipped by a DST transition; the day starts an hour later.
            LocalResult::None => match tz.from_local_datetime(&(midnight + Duration::hours(1))) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
                LocalResult::None => now - Duration::hours(24),
            },
        };
        Self { start }
    }

    pub fn rolling(now: DateTime<Utc>, length: Duration) -> Self {
        Self { start: now - length }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn midnight_in_utc() {
        let window = ClassificationWindow::since_midnight(utc("2026-10-18T15:30:00Z"), &Utc);
        assert_eq!(window.start, utc("2026-10-18T00:00:00Z"));
    }

    #[test]
    fn midnight_east_of_utc_lands_on_previous_utc_day() {
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        // 01:00 in UTC+9 on the 19th.
        let window = ClassificationWindow::since_midnight(utc("2026-10-18T16:00:00Z"), &tz);
        assert_eq!(window.start, utc("2026-10-18T15:00:00Z"));
    }

    #[test]
    fn midnight_west_of_utc_uses_local_date() {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        // 22:00 on the 17th in UTC-5, already the 18th in UTC.
        let now = utc("2026-10-18T03:00:00Z");
        let window = ClassificationWindow::since_midnight(now, &tz);
        assert_eq!(window.start, utc("2026-10-17T05:00:00Z"));
        assert!(window.contains(utc("2026-10-17T05:00:00Z")));
        assert!(!window.contains(utc("2026-10-17T04:59:59Z")));
    }

    #[test]
    fn rolling_window_counts_back_from_now() {
        let now = utc("2026-10-18T12:00:00Z");
        let window = ClassificationWindow::rolling(now, Duration::days(7));
        assert_eq!(window.start, utc("2026-10-11T12:00:00Z"));
    }
}
