//! Time-of-day arithmetic and the candidate start grid.
//!
//! Everything here is pure: strings are turned into [`Minutes`] at the
//! boundary, and malformed input never reaches the slot arithmetic.

use chrono::NaiveDate;

use crate::engine::EngineError;
use crate::model::{MINUTES_PER_DAY, Minutes};

/// Parse `HH:MM` or `HH:MM:SS` into minutes since midnight. Seconds are
/// validated and then truncated.
pub fn parse_time(s: &str) -> Result<Minutes, EngineError> {
    let invalid = || EngineError::InvalidTimeFormat(s.to_string());
    let mut parts = s.trim().split(':');
    let hour = parts.next().ok_or_else(invalid)?;
    let minute = parts.next().ok_or_else(invalid)?;
    let second = parts.next();
    if parts.next().is_some() {
        return Err(invalid());
    }

    let field = |f: &str, max: u32| -> Option<u32> {
        if f.is_empty() || f.len() > 2 || !f.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        f.parse::<u32>().ok().filter(|v| *v <= max)
    };

    let h = field(hour, 23).ok_or_else(invalid)?;
    let m = field(minute, 59).ok_or_else(invalid)?;
    if let Some(sec) = second {
        field(sec, 59).ok_or_else(invalid)?;
    }
    Ok(h * 60 + m)
}

/// Parse a calendar day in `YYYY-MM-DD` form.
pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    let s = s.trim();
    // chrono accepts unpadded fields; the wire format does not.
    if s.len() != 10 {
        return Err(EngineError::InvalidDate(s.to_string()));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| EngineError::InvalidDate(s.to_string()))
}

pub fn add_minutes(minutes: Minutes, delta: i32) -> Minutes {
    minutes.saturating_add_signed(delta)
}

/// `19:05` style, zero padded. Minute 1440 renders as `24:00`.
pub fn format_hhmm(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// 12-hour clock for guests, e.g. `7:05 PM`.
pub fn format_for_display(minutes: Minutes) -> String {
    let minutes = minutes % MINUTES_PER_DAY;
    let (h, m) = (minutes / 60, minutes % 60);
    let suffix = if h < 12 { "AM" } else { "PM" };
    let h12 = match h % 12 {
        0 => 12,
        h => h,
    };
    format!("{h12}:{m:02} {suffix}")
}

/// Every start on the `interval` grid from `open` such that a seating of
/// `duration` ends no later than `close`.
pub fn generate_candidate_starts(
    open: Minutes,
    close: Minutes,
    interval: Minutes,
    duration: Minutes,
) -> Vec<Minutes> {
    if duration == 0 || open.saturating_add(duration) > close {
        return Vec::new();
    }
    let last_start = close - duration;
    (open..=last_start).step_by(interval.max(1) as usize).collect()
}

/// Reorder by distance from `preferred`, earlier time first on ties.
pub fn order_by_preference(starts: &mut [Minutes], preferred: Minutes) {
    starts.sort_by_key(|s| (s.abs_diff(preferred), *s));
}
