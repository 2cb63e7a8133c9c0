use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};

use crate::engine::error::EngineError;
use crate::model::Minute;

/// Parse `"HH:MM"` into a minute-of-day. `"24:00"` is accepted as the
/// exclusive end of day; anything past that is malformed.
pub fn to_minutes(s: &str) -> Result<Minute, EngineError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| EngineError::TimeFormat(s.to_string()))?;
    let h: Minute = h
        .parse()
        .map_err(|_| EngineError::TimeFormat(s.to_string()))?;
    let m: Minute = m
        .parse()
        .map_err(|_| EngineError::TimeFormat(s.to_string()))?;
    if !(0..60).contains(&m) || !(0..=24).contains(&h) || (h == 24 && m != 0) {
        return Err(EngineError::TimeFormat(s.to_string()));
    }
    Ok(h * 60 + m)
}

/// Render a minute-of-day as zero-padded `"HH:MM"`. No day wraparound.
pub fn to_hhmm(minute: Minute) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Half-open overlap test on minute ranges.
pub fn overlaps(a_start: Minute, a_end: Minute, b_start: Minute, b_end: Minute) -> bool {
    a_start.max(b_start) < a_end.min(b_end)
}

/// The instant `minute` minutes after UTC midnight of `date`. The whole
/// engine runs in UTC.
pub fn at_date_and_minute(date: NaiveDate, minute: Minute) -> DateTime<Utc> {
    let midnight = Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::MIN));
    midnight + TimeDelta::minutes(minute as i64)
}

/// Minute-of-day of an instant.
pub fn minute_of_day(t: DateTime<Utc>) -> Minute {
    let since_midnight = t.time().signed_duration_since(NaiveTime::MIN);
    since_midnight.num_minutes() as Minute
}
