use std::f64::consts::E;

/// Most recent timestamp handed out, relative to now.
pub const MIN_OFFSET_SECONDS: i64 = 30;

const COLD_START_SPAN_SECONDS: i64 = 24 * 60 * 60;
const HOURLY_SPAN_SECONDS: i64 = 60 * 60;
const FAST_SPAN_SECONDS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadStrategy {
    /// First run of a period: logarithmic over the last day.
    ColdStart,
    /// Logarithmic over the last hour.
    Hourly,
    /// Many plays since a recent run: linear over the last five minutes.
    FastCadence,
}

impl SpreadStrategy {
    pub fn span_seconds(self) -> i64 {
        match self {
            SpreadStrategy::ColdStart => COLD_START_SPAN_SECONDS,
            SpreadStrategy::Hourly => HOURLY_SPAN_SECONDS,
            SpreadStrategy::FastCadence => FAST_SPAN_SECONDS,
        }
    }

    /// Fraction of the span that entry `index` of `count` lies in the past.
    fn fraction(self, index: usize, count: usize) -> f64 {
        if count <= 1 {
            return 0.0;
        }
        let index = index as f64;
        match self {
            SpreadStrategy::FastCadence => index / count as f64,
            SpreadStrategy::ColdStart | SpreadStrategy::Hourly => {
                let ratio = index / (count - 1) as f64;
                (1.0 + ratio * (E - 1.0)).ln()
            }
        }
    }
}

/// Assigns epoch timestamps to `count` plays ordered most recent first.
///
/// The result is strictly decreasing, never later than `now - 30s`, and
/// does not precede `floor` unless there are fewer free seconds than
/// plays, in which case uniqueness wins.
pub fn spread(count: usize, strategy: SpreadStrategy, now: i64, floor: Option<i64>) -> Vec<i64> {
    if count == 0 {
        return Vec::new();
    }
    let latest = now - MIN_OFFSET_SECONDS;
    let needed = i64::try_from(count - 1).unwrap_or(i64::MAX);
    let mut earliest = latest - strategy.span_seconds();
    if let Some(floor) = floor {
        earliest = earliest.max(floor);
    }
    if latest - earliest < needed {
        log::warn!(
            "Only {} seconds available for {count} scrobbles; placing some before the previous run",
            (latest - earliest).max(0)
        );
        earliest = latest - needed;
    }
    let room = (latest - earliest) as f64;

    let mut stamps: Vec<i64> = (0..count)
        .map(|index| latest - (strategy.fraction(index, count) * room).round() as i64)
        .collect();
    for index in 1..count {
        if stamps[index] >= stamps[index - 1] {
            stamps[index] = stamps[index - 1] - 1;
        }
    }
    // Collisions above may have pushed the tail under the floor; lift it back
    // while keeping one second between neighbours.
    for (index, stamp) in stamps.iter_mut().enumerate().rev() {
        let minimum = earliest + (needed - index as i64);
        if *stamp < minimum {
            *stamp = minimum;
        }
    }
    stamps
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_790_000_000;

    fn assert_strictly_decreasing(stamps: &[i64]) {
        for pair in stamps.windows(2) {
            assert!(pair[0] > pair[1], "{} must be later than {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn single_play_is_thirty_seconds_ago() {
        for strategy in [
            SpreadStrategy::ColdStart,
            SpreadStrategy::Hourly,
            SpreadStrategy::FastCadence,
        ] {
            assert_eq!(spread(1, strategy, NOW, None), vec![NOW - 30]);
        }
    }

    #[test]
    fn empty_batch() {
        assert!(spread(0, SpreadStrategy::Hourly, NOW, None).is_empty());
    }

    #[test]
    fn cold_start_spans_the_last_day() {
        let stamps = spread(20, SpreadStrategy::ColdStart, NOW, None);
        assert_strictly_decreasing(&stamps);
        assert_eq!(stamps[0], NOW - 30);
        assert_eq!(*stamps.last().unwrap(), NOW - 30 - COLD_START_SPAN_SECONDS);
    }

    #[test]
    fn logarithmic_gaps_shrink_toward_the_tail() {
        let stamps = spread(10, SpreadStrategy::Hourly, NOW, None);
        assert_strictly_decreasing(&stamps);
        let first_gap = stamps[0] - stamps[1];
        let last_gap = stamps[8] - stamps[9];
        assert!(first_gap > last_gap);
        assert!(stamps[9] >= NOW - 30 - HOURLY_SPAN_SECONDS);
    }

    #[test]
    fn fast_cadence_is_linear_within_five_minutes() {
        let stamps = spread(6, SpreadStrategy::FastCadence, NOW, None);
        assert_strictly_decreasing(&stamps);
        assert_eq!(stamps, vec![NOW - 30, NOW - 80, NOW - 130, NOW - 180, NOW - 230, NOW - 280]);
    }

    #[test]
    fn respects_floor_from_previous_run() {
        let floor = NOW - 600;
        let stamps = spread(8, SpreadStrategy::ColdStart, NOW, Some(floor));
        assert_strictly_decreasing(&stamps);
        assert!(stamps.iter().all(|stamp| *stamp >= floor));
        assert_eq!(*stamps.last().unwrap(), floor);
    }

    #[test]
    fn uniqueness_wins_over_a_tight_floor() {
        let floor = NOW - 32;
        let stamps = spread(5, SpreadStrategy::Hourly, NOW, Some(floor));
        assert_strictly_decreasing(&stamps);
        assert_eq!(stamps[0], NOW - 30);
        assert_eq!(stamps[4], NOW - 34);
    }

    #[test]
    fn dense_linear_batches_stay_unique() {
        let stamps = spread(200, SpreadStrategy::FastCadence, NOW, None);
        assert_eq!(stamps.len(), 200);
        assert_strictly_decreasing(&stamps);
        assert!(stamps[0] <= NOW - 30);
    }

    #[test]
    fn floor_in_the_future_still_produces_unique_past_stamps() {
        let stamps = spread(3, SpreadStrategy::Hourly, NOW, Some(NOW + 100));
        assert_eq!(stamps, vec![NOW - 30, NOW - 31, NOW - 32]);
    }
}
