//! Window computation for continuous queries.
//!
//! All timestamps and durations are nanoseconds since the Unix epoch. Windows are
//! half-open `[start, end)` and aligned to the GROUP BY time() interval (shifted by its
//! offset, when one is given).

use std::fmt;

use chrono::{DateTime, SecondsFormat};

use super::definition::{ContinuousQueryDefinition, ResamplePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// A window is closed once no more points can land in it.
    pub fn is_closed(&self, now: i64) -> bool {
        self.end <= now
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |ts: i64| DateTime::from_timestamp_nanos(ts).to_rfc3339_opts(SecondsFormat::AutoSi, true);
        write!(f, "[{}, {})", render(self.start), render(self.end))
    }
}

/// Windows due for one evaluation of a continuous query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueWindows {
    /// Ascending by start
    pub windows: Vec<Window>,
    /// Windows after the watermark that fell out of the FOR horizon
    pub stale: u64,
    /// Start of the oldest window still eligible
    pub horizon: i64,
}

/// Rounds `timestamp` down to the grid of `interval` shifted by `offset`.
pub fn floor_to(timestamp: i64, interval: i64, offset: i64) -> i64 {
    timestamp - (timestamp - offset).rem_euclid(interval)
}

fn ceil_to(timestamp: i64, interval: i64, offset: i64) -> i64 {
    floor_to(timestamp - 1, interval, offset) + interval
}

/// Returns true if the check cadence allows evaluating the query at `now`.
pub fn should_check(policy: &ResamplePolicy, last_check: Option<i64>, now: i64) -> bool {
    match last_check {
        None => true,
        Some(last) => now >= last.saturating_add(policy.every),
    }
}

/// The marker recorded after a check at `now`.
pub fn check_marker(policy: &ResamplePolicy, now: i64) -> i64 {
    floor_to(now, policy.every, 0)
}

/// Computes the windows due for a check at `now`.
///
/// A window qualifies when its start lies within FOR of the scheduled check time
/// (`last_check + every`, or `now` for a first or reset check) and at least
/// `min(every, interval)` of it has elapsed. With EVERY shorter than the interval this
/// refreshes the window still in progress together with the one before it. However late
/// the check runs, nothing older than FOR before `now` is returned.
///
/// The watermark does not filter windows; it only sizes the stale gap between the last
/// successful window and the horizon.
pub fn due_windows(
    def: &ContinuousQueryDefinition,
    last_check: Option<i64>,
    watermark: Option<i64>,
    now: i64,
) -> DueWindows {
    let interval = def.interval;
    let offset = def.offset;
    let policy = &def.resample;
    let step = policy.every.min(interval);

    let scheduled = last_check.map_or(now, |last| last.saturating_add(policy.every).min(now));
    let oldest_start = ceil_to(scheduled.saturating_sub(policy.for_), interval, offset)
        .max(floor_to(now.saturating_sub(policy.for_), interval, offset));
    let newest_end = floor_to(now.saturating_add(interval - step), interval, offset);

    let mut stale = 0;
    if let Some(watermark) = watermark {
        let next_start = floor_to(watermark, interval, offset);
        if next_start < oldest_start {
            stale = ((oldest_start - next_start) / interval) as u64;
        }
    }

    let mut windows = Vec::new();
    let mut start = oldest_start;
    while start + interval <= newest_end {
        windows.push(Window::new(start, start + interval));
        start += interval;
    }

    DueWindows {
        windows,
        stale,
        horizon: oldest_start,
    }
}
