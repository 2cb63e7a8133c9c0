use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use crate::engine::error::EngineError;
use crate::model::Minute;
use crate::timeutil;

/// A slot may only be booked strictly in the future. On today's date the
/// start minute must be strictly after the current minute-of-day.
pub fn ensure_future(
    date: NaiveDate,
    start_min: Minute,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let today = now.date_naive();
    if date < today {
        return Err(EngineError::PastDate(date));
    }
    if date == today && start_min <= timeutil::minute_of_day(now) {
        return Err(EngineError::PastTime { date, start_min });
    }
    Ok(())
}

/// A session may be cancelled only while its start instant is at least 24
/// hours away. Duration arithmetic on instants, not day counting.
pub fn ensure_cancelable(
    date: NaiveDate,
    start_min: Minute,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let start = timeutil::at_date_and_minute(date, start_min);
    if start - now < TimeDelta::hours(24) {
        return Err(EngineError::LateCancellation { date, start_min });
    }
    Ok(())
}
