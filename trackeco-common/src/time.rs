//! Timestamp and day-bucketing utilities
//!
//! Streaks are scored against the deployment's local day, not UTC. The local
//! day is derived from a fixed configured UTC offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Project a UTC instant onto the local calendar day for the given offset
pub fn local_day(instant: DateTime<Utc>, utc_offset_hours: i32) -> NaiveDate {
    let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    instant.with_timezone(&offset).date_naive()
}

/// Relation of a previous activity day to the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayGap {
    SameDay,
    Consecutive,
    Broken,
}

/// Classify the gap between two activity instants in local-day terms
pub fn classify_day_gap(
    previous: DateTime<Utc>,
    current: DateTime<Utc>,
    utc_offset_hours: i32,
) -> DayGap {
    let prev_day = local_day(previous, utc_offset_hours);
    let cur_day = local_day(current, utc_offset_hours);
    if prev_day == cur_day {
        DayGap::SameDay
    } else if prev_day + Duration::days(1) == cur_day {
        DayGap::Consecutive
    } else {
        DayGap::Broken
    }
}
