use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::Minute;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Caller does not own the purchase they are spending from.
    Ownership(Ulid),
    InsufficientBalance {
        required: i64,
        remaining: i64,
    },
    PastDate(NaiveDate),
    PastTime {
        date: NaiveDate,
        start_min: Minute,
    },
    SlotUnavailable {
        start_min: Minute,
        end_min: Minute,
    },
    LateCancellation {
        date: NaiveDate,
        start_min: Minute,
    },
    FeedbackRejected(&'static str),
    TimeFormat(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Ownership(id) => write!(f, "purchase {id} belongs to another user"),
            EngineError::InsufficientBalance {
                required,
                remaining,
            } => {
                write!(
                    f,
                    "insufficient balance: need {required} minutes, {remaining} remaining"
                )
            }
            EngineError::PastDate(date) => write!(f, "date is in the past: {date}"),
            EngineError::PastTime { date, start_min } => {
                write!(f, "slot start already passed: {date} minute {start_min}")
            }
            EngineError::SlotUnavailable { start_min, end_min } => {
                write!(f, "slot [{start_min}, {end_min}) is not available")
            }
            EngineError::LateCancellation { date, start_min } => {
                write!(
                    f,
                    "session on {date} at minute {start_min} starts within 24 hours"
                )
            }
            EngineError::FeedbackRejected(why) => write!(f, "feedback rejected: {why}"),
            EngineError::TimeFormat(s) => write!(f, "malformed time: {s:?}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
