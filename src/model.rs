use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minute-of-day — the only intra-day time type.
pub type Minute = i32;

/// Every bookable slot is exactly this long.
pub const SLOT_MIN: Minute = 30;

/// Expertise areas clients can book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    Cyber,
    Tax,
    Core,
    Procure,
    Reg,
}

impl Domain {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CYBER" => Some(Domain::Cyber),
            "TAX" => Some(Domain::Tax),
            "CORE" => Some(Domain::Core),
            "PROCURE" => Some(Domain::Procure),
            "REG" => Some(Domain::Reg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Cyber => "CYBER",
            Domain::Tax => "TAX",
            Domain::Core => "CORE",
            Domain::Procure => "PROCURE",
            Domain::Reg => "REG",
        }
    }
}

/// An expert profile. The default daily window applies to any date without an
/// override or manual windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expert {
    pub id: Ulid,
    pub name: String,
    pub domain: Domain,
    /// Currency units per hour.
    pub hourly_rate: i64,
    pub day_start: Minute,
    pub day_end: Minute,
    /// ISO weekday numbers, listing metadata only — slot computation does not
    /// consult this field.
    pub workdays: Vec<u8>,
    pub base_rating: f64,
}

/// Per-date exception to the default window. At most one per (expert, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayOverride {
    pub id: Ulid,
    pub date: NaiveDate,
    pub workday: bool,
    pub day_start: Option<Minute>,
    pub day_end: Option<Minute>,
}

/// Hand-placed window. If any exist for a date they replace both the override
/// and the defaults for that date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualWindow {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start_min: Minute,
    pub end_min: Minute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Upcoming,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Upcoming => "UPCOMING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }
}

/// A booked 30-minute slot, half-open `[start_min, end_min)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub purchase_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub start_min: Minute,
    pub end_min: Minute,
    pub link: String,
    pub status: SessionStatus,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status != SessionStatus::Cancelled
    }

    pub fn duration_min(&self) -> Minute {
        self.end_min - self.start_min
    }
}

/// Prepaid package. Balance is integer minutes, clamped to
/// `0..=package_minutes` — no float hours anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: Ulid,
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub package_minutes: i64,
    pub minutes_remaining: i64,
    /// Charged at purchase time: package hours times the expert's rate.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Purchase {
    pub fn deduct(&mut self, minutes: i64) {
        self.minutes_remaining = (self.minutes_remaining - minutes).max(0);
    }

    pub fn refund(&mut self, minutes: i64) {
        self.minutes_remaining = (self.minutes_remaining + minutes).min(self.package_minutes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Ulid,
    pub purchase_id: Ulid,
    pub user_id: Ulid,
    /// 1..=5
    pub rating: u8,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Ulid,
    pub expert_id: Ulid,
    pub amount: i64,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPayment {
    pub id: Ulid,
    pub user_id: Ulid,
    pub amount: i64,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Everything the engine knows about one expert, guarded by a single lock.
#[derive(Debug, Clone)]
pub struct ExpertState {
    pub profile: Expert,
    /// At most one per date.
    pub overrides: Vec<DayOverride>,
    /// Sorted by (date, start_min).
    pub windows: Vec<ManualWindow>,
    /// Sorted by (date, start_min).
    pub sessions: Vec<Session>,
    pub feedback: Vec<Feedback>,
    pub payouts: Vec<Payout>,
}

impl ExpertState {
    pub fn new(profile: Expert) -> Self {
        Self {
            profile,
            overrides: Vec::new(),
            windows: Vec::new(),
            sessions: Vec::new(),
            feedback: Vec::new(),
            payouts: Vec::new(),
        }
    }

    /// Insert session maintaining sort order by (date, start_min).
    pub fn insert_session(&mut self, session: Session) {
        let key = (session.date, session.start_min);
        let pos = self
            .sessions
            .partition_point(|s| (s.date, s.start_min) <= key);
        self.sessions.insert(pos, session);
    }

    /// Sessions on one date, in start order. Binary search skips other days.
    pub fn sessions_on(&self, date: NaiveDate) -> &[Session] {
        let lo = self.sessions.partition_point(|s| s.date < date);
        let hi = self.sessions.partition_point(|s| s.date <= date);
        &self.sessions[lo..hi]
    }

    pub fn session(&self, id: Ulid) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn session_mut(&mut self, id: Ulid) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Replaces any existing override for the same date.
    pub fn set_override(&mut self, ov: DayOverride) {
        self.overrides.retain(|o| o.date != ov.date);
        self.overrides.push(ov);
    }

    pub fn remove_override(&mut self, id: Ulid) -> Option<DayOverride> {
        let pos = self.overrides.iter().position(|o| o.id == id)?;
        Some(self.overrides.remove(pos))
    }

    pub fn override_for(&self, date: NaiveDate) -> Option<&DayOverride> {
        self.overrides.iter().find(|o| o.date == date)
    }

    /// Insert window maintaining sort order by (date, start_min).
    pub fn add_window(&mut self, w: ManualWindow) {
        let key = (w.date, w.start_min);
        let pos = self
            .windows
            .partition_point(|x| (x.date, x.start_min) <= key);
        self.windows.insert(pos, w);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<ManualWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn windows_for(&self, date: NaiveDate) -> &[ManualWindow] {
        let lo = self.windows.partition_point(|w| w.date < date);
        let hi = self.windows.partition_point(|w| w.date <= date);
        &self.windows[lo..hi]
    }

    /// Mean feedback rating, base_rating when none exists yet.
    pub fn rating(&self) -> f64 {
        if self.feedback.is_empty() {
            return self.profile.base_rating;
        }
        let sum: u32 = self.feedback.iter().map(|f| f.rating as u32).sum();
        sum as f64 / self.feedback.len() as f64
    }
}

/// One slot inside a booking event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedSlot {
    pub id: Ulid,
    pub start_min: Minute,
    pub end_min: Minute,
    pub link: String,
}

/// The event types — flat, no nesting. This is the WAL record format.
/// A whole booking (or cancellation with its refund) is one event, so replay
/// can never observe a half-applied request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ExpertCreated {
        id: Ulid,
        name: String,
        domain: Domain,
        hourly_rate: i64,
        day_start: Minute,
        day_end: Minute,
        workdays: Vec<u8>,
        base_rating: f64,
    },
    OverrideSet {
        id: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        workday: bool,
        day_start: Option<Minute>,
        day_end: Option<Minute>,
    },
    OverrideRemoved {
        id: Ulid,
        expert_id: Ulid,
    },
    WindowAdded {
        id: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        start_min: Minute,
        end_min: Minute,
    },
    WindowRemoved {
        id: Ulid,
        expert_id: Ulid,
    },
    PurchaseCreated {
        id: Ulid,
        user_id: Ulid,
        expert_id: Ulid,
        package_minutes: i64,
        /// Equals `package_minutes` at creation; compaction re-emits the
        /// purchase with the settled balance.
        minutes_remaining: i64,
        amount: i64,
        created_at: DateTime<Utc>,
    },
    SessionsBooked {
        expert_id: Ulid,
        purchase_id: Ulid,
        user_id: Ulid,
        date: NaiveDate,
        slots: Vec<BookedSlot>,
        created_at: DateTime<Utc>,
    },
    SessionCancelled {
        id: Ulid,
        expert_id: Ulid,
        purchase_id: Ulid,
        by_user: Ulid,
        reason: String,
        refund_minutes: i64,
        cancelled_at: DateTime<Utc>,
    },
    SessionCompleted {
        id: Ulid,
        expert_id: Ulid,
    },
    FeedbackSubmitted {
        id: Ulid,
        expert_id: Ulid,
        purchase_id: Ulid,
        user_id: Ulid,
        rating: u8,
        text: String,
        created_at: DateTime<Utc>,
    },
    PayoutRecorded {
        id: Ulid,
        expert_id: Ulid,
        amount: i64,
        note: String,
        created_at: DateTime<Utc>,
    },
    ClientPaymentRecorded {
        id: Ulid,
        user_id: Ulid,
        amount: i64,
        note: String,
        created_at: DateTime<Utc>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub start_min: Minute,
    pub end_min: Minute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpertInfo {
    pub id: Ulid,
    pub name: String,
    pub domain: Domain,
    pub hourly_rate: i64,
    pub day_start: Minute,
    pub day_end: Minute,
    pub rating: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Ulid,
    pub expert_id: Ulid,
    pub purchase_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub start_min: Minute,
    pub end_min: Minute,
    pub status: SessionStatus,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseInfo {
    pub id: Ulid,
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub package_minutes: i64,
    pub minutes_remaining: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarningsInfo {
    pub expert_id: Ulid,
    pub earned: i64,
    pub paid: i64,
    pub due: i64,
}

/// What `book_sessions` hands back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub session_ids: Vec<Ulid>,
    pub minutes_deducted: i64,
    pub minutes_remaining: i64,
}
