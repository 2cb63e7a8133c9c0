use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::timeutil::{at_date_and_minute, overlaps};
use crate::validate;

use super::{slots, Engine, EngineError};

fn meeting_link() -> String {
    format!(
        "https://meet.example.com/{}",
        Ulid::new().to_string().to_lowercase()
    )
}

fn check_minute_bounds(start: Minute, end: Minute) -> Result<(), EngineError> {
    if start < 0 || end > MAX_MINUTE || start >= end {
        return Err(EngineError::LimitExceeded("window out of minute bounds"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_expert(
        &self,
        id: Ulid,
        name: String,
        domain: Domain,
        hourly_rate: i64,
        day_start: Minute,
        day_end: Minute,
        workdays: Vec<u8>,
        base_rating: f64,
    ) -> Result<(), EngineError> {
        if self.experts.len() >= MAX_EXPERTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many experts"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("expert name too long"));
        }
        check_minute_bounds(day_start, day_end)?;
        if self.experts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ExpertCreated {
            id,
            name: name.clone(),
            domain,
            hourly_rate,
            day_start,
            day_end,
            workdays: workdays.clone(),
            base_rating,
        };
        self.wal_append(&event).await?;
        let st = ExpertState::new(Expert {
            id,
            name,
            domain,
            hourly_rate,
            day_start,
            day_end,
            workdays,
            base_rating,
        });
        self.experts.insert(id, Arc::new(RwLock::new(st)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Set the availability exception for one date. Replaces any existing
    /// override for the same (expert, date).
    pub async fn set_override(
        &self,
        id: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        workday: bool,
        day_start: Option<Minute>,
        day_end: Option<Minute>,
    ) -> Result<(), EngineError> {
        for m in [day_start, day_end].into_iter().flatten() {
            if !(0..=MAX_MINUTE).contains(&m) {
                return Err(EngineError::LimitExceeded("window out of minute bounds"));
            }
        }
        if let (Some(s), Some(e)) = (day_start, day_end)
            && s >= e {
                return Err(EngineError::LimitExceeded("window out of minute bounds"));
            }
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let mut guard = st.write().await;

        let event = Event::OverrideSet {
            id,
            expert_id,
            date,
            workday,
            day_start,
            day_end,
        };
        self.persist_and_apply(expert_id, &mut guard, None, &event)
            .await
    }

    pub async fn remove_override(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (expert_id, mut guard) = self.resolve_entity_write(&id).await?;
        let event = Event::OverrideRemoved { id, expert_id };
        self.persist_and_apply(expert_id, &mut guard, None, &event)
            .await?;
        Ok(expert_id)
    }

    /// Add a manual window. Must cover at least one slot.
    pub async fn add_window(
        &self,
        id: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        start_min: Minute,
        end_min: Minute,
    ) -> Result<(), EngineError> {
        check_minute_bounds(start_min, end_min)?;
        if end_min - start_min < SLOT_MIN {
            return Err(EngineError::LimitExceeded("window shorter than one slot"));
        }
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let mut guard = st.write().await;
        if guard.windows_for(date).len() >= MAX_WINDOWS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many windows on date"));
        }

        let event = Event::WindowAdded {
            id,
            expert_id,
            date,
            start_min,
            end_min,
        };
        self.persist_and_apply(expert_id, &mut guard, None, &event)
            .await
    }

    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (expert_id, mut guard) = self.resolve_entity_write(&id).await?;
        let event = Event::WindowRemoved { id, expert_id };
        self.persist_and_apply(expert_id, &mut guard, None, &event)
            .await?;
        Ok(expert_id)
    }

    /// Create a prepaid package. The amount is charged at the expert's
    /// current rate; the balance starts full.
    pub async fn create_purchase(
        &self,
        id: Ulid,
        user_id: Ulid,
        expert_id: Ulid,
        package_hours: i64,
    ) -> Result<i64, EngineError> {
        if !(1..=MAX_PACKAGE_HOURS).contains(&package_hours) {
            return Err(EngineError::LimitExceeded("package hours out of range"));
        }
        if self.purchases.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let hourly_rate = st.read().await.profile.hourly_rate;
        let amount = package_hours * hourly_rate;
        let minutes = package_hours * 60;

        let event = Event::PurchaseCreated {
            id,
            user_id,
            expert_id,
            package_minutes: minutes,
            minutes_remaining: minutes,
            amount,
            created_at: self.clock.now(),
        };
        self.wal_append(&event).await?;
        let p = Purchase {
            id,
            user_id,
            expert_id,
            package_minutes: minutes,
            minutes_remaining: minutes,
            amount,
            created_at: self.clock.now(),
        };
        self.purchases.insert(id, Arc::new(RwLock::new(p)));
        self.notify.send(expert_id, &event);
        Ok(amount)
    }

    /// Book a batch of 30-minute slots against a purchase. All-or-nothing:
    /// the checks run in a fixed order (purchase, ownership, expert,
    /// balance, then per slot: not-past and availability) and any failure
    /// leaves no trace. The whole batch is one WAL event.
    pub async fn book_sessions(
        &self,
        purchase_id: Ulid,
        user_id: Ulid,
        date: NaiveDate,
        requested: &[(Minute, Minute)],
    ) -> Result<BookingReceipt, EngineError> {
        if requested.is_empty() {
            return Err(EngineError::LimitExceeded("empty booking"));
        }
        if requested.len() > MAX_BATCH_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots in one booking"));
        }

        let p_arc = self
            .get_purchase(&purchase_id)
            .ok_or(EngineError::NotFound(purchase_id))?;
        // Owner and expert never change after creation — safe to read before
        // taking the write locks.
        let (owner, expert_id) = {
            let p = p_arc.read().await;
            (p.user_id, p.expert_id)
        };
        if owner != user_id {
            return Err(EngineError::Ownership(purchase_id));
        }
        let st_arc = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;

        // Lock order: expert before purchase, everywhere.
        let mut st = st_arc.write_owned().await;
        let mut purchase = p_arc.write_owned().await;

        let required = requested.len() as i64 * SLOT_MIN as i64;
        if required > purchase.minutes_remaining {
            return Err(EngineError::InsufficientBalance {
                required,
                remaining: purchase.minutes_remaining,
            });
        }

        // Resolve availability once for the whole request.
        let available = slots::bookable_slots(&st, date);
        let now = self.clock.now();
        for &(start, end) in requested {
            validate::ensure_future(date, start, now)?;
            let listed = available
                .iter()
                .any(|s| s.start_min == start && s.end_min == end);
            if !listed {
                return Err(EngineError::SlotUnavailable {
                    start_min: start,
                    end_min: end,
                });
            }
        }
        // A request must not conflict with itself either.
        for i in 0..requested.len() {
            for j in (i + 1)..requested.len() {
                let (a, b) = (requested[i], requested[j]);
                if overlaps(a.0, a.1, b.0, b.1) {
                    return Err(EngineError::SlotUnavailable {
                        start_min: b.0,
                        end_min: b.1,
                    });
                }
            }
        }
        if st.sessions.len() + requested.len() > MAX_SESSIONS_PER_EXPERT {
            return Err(EngineError::LimitExceeded("too many sessions on expert"));
        }

        let slots: Vec<BookedSlot> = requested
            .iter()
            .map(|&(start, end)| BookedSlot {
                id: Ulid::new(),
                start_min: start,
                end_min: end,
                link: meeting_link(),
            })
            .collect();
        let session_ids: Vec<Ulid> = slots.iter().map(|s| s.id).collect();

        let event = Event::SessionsBooked {
            expert_id,
            purchase_id,
            user_id,
            date,
            slots,
            created_at: now,
        };
        self.persist_and_apply(expert_id, &mut st, Some(&mut purchase), &event)
            .await?;

        metrics::counter!(crate::observability::SESSIONS_BOOKED_TOTAL)
            .increment(requested.len() as u64);
        Ok(BookingReceipt {
            session_ids,
            minutes_deducted: required,
            minutes_remaining: purchase.minutes_remaining,
        })
    }

    /// Cancel a session. The 24-hour rule is checked before the idempotency
    /// shortcut, so a late cancel of an already-cancelled session still
    /// errors. Returns the refunded minutes (0 when already cancelled).
    pub async fn cancel_session(
        &self,
        session_id: Ulid,
        by_user: Ulid,
        reason: String,
    ) -> Result<i64, EngineError> {
        if reason.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("cancel reason too long"));
        }
        let (expert_id, mut st) = self.resolve_session_write(&session_id).await?;
        let session = st
            .session(session_id)
            .ok_or(EngineError::NotFound(session_id))?
            .clone();

        let now = self.clock.now();
        validate::ensure_cancelable(session.date, session.start_min, now)?;
        if session.status == SessionStatus::Cancelled {
            return Ok(0);
        }

        let p_arc = self
            .get_purchase(&session.purchase_id)
            .ok_or(EngineError::NotFound(session.purchase_id))?;
        let mut purchase = p_arc.write_owned().await;

        let refund = session.duration_min() as i64;
        let event = Event::SessionCancelled {
            id: session_id,
            expert_id,
            purchase_id: session.purchase_id,
            by_user,
            reason,
            refund_minutes: refund,
            cancelled_at: now,
        };
        self.persist_and_apply(expert_id, &mut st, Some(&mut purchase), &event)
            .await?;

        metrics::counter!(crate::observability::SESSIONS_CANCELLED_TOTAL).increment(1);
        Ok(refund)
    }

    /// Promote one Upcoming session to Completed. Returns false if it was
    /// already settled (lost race with a cancel).
    pub async fn complete_session(&self, session_id: Ulid) -> Result<bool, EngineError> {
        let (expert_id, mut st) = self.resolve_session_write(&session_id).await?;
        let status = st
            .session(session_id)
            .ok_or(EngineError::NotFound(session_id))?
            .status;
        if status != SessionStatus::Upcoming {
            return Ok(false);
        }
        let event = Event::SessionCompleted {
            id: session_id,
            expert_id,
        };
        self.persist_and_apply(expert_id, &mut st, None, &event)
            .await?;
        Ok(true)
    }

    /// Upcoming sessions whose end instant has passed, as (session, expert)
    /// pairs for the background completer.
    pub fn collect_finished_sessions(&self, now: DateTime<Utc>) -> Vec<(Ulid, Ulid)> {
        let mut finished = Vec::new();
        for entry in self.experts.iter() {
            let st = entry.value().clone();
            if let Ok(guard) = st.try_read() {
                for s in &guard.sessions {
                    if s.status == SessionStatus::Upcoming
                        && at_date_and_minute(s.date, s.end_min) <= now
                    {
                        finished.push((s.id, guard.profile.id));
                    }
                }
            }
        }
        finished
    }

    /// Feedback is gated on ownership, an exhausted balance, and no session
    /// of the purchase still pending; one entry per (purchase, user).
    pub async fn submit_feedback(
        &self,
        id: Ulid,
        purchase_id: Ulid,
        user_id: Ulid,
        rating: u8,
        text: String,
    ) -> Result<(), EngineError> {
        if !(1..=5).contains(&rating) {
            return Err(EngineError::FeedbackRejected("rating must be 1..=5"));
        }
        if text.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("feedback text too long"));
        }
        let p_arc = self
            .get_purchase(&purchase_id)
            .ok_or(EngineError::NotFound(purchase_id))?;
        let (owner, expert_id) = {
            let p = p_arc.read().await;
            (p.user_id, p.expert_id)
        };
        if owner != user_id {
            return Err(EngineError::Ownership(purchase_id));
        }
        let st_arc = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let mut st = st_arc.write_owned().await;
        let remaining = p_arc.read().await.minutes_remaining;
        if remaining > 0 {
            return Err(EngineError::FeedbackRejected("package not yet used up"));
        }
        if st
            .sessions
            .iter()
            .any(|s| s.purchase_id == purchase_id && s.status == SessionStatus::Upcoming)
        {
            return Err(EngineError::FeedbackRejected("sessions still upcoming"));
        }
        if st
            .feedback
            .iter()
            .any(|f| f.purchase_id == purchase_id && f.user_id == user_id)
        {
            return Err(EngineError::FeedbackRejected("already submitted"));
        }

        let event = Event::FeedbackSubmitted {
            id,
            expert_id,
            purchase_id,
            user_id,
            rating,
            text,
            created_at: self.clock.now(),
        };
        self.persist_and_apply(expert_id, &mut st, None, &event)
            .await
    }

    pub async fn record_payout(
        &self,
        id: Ulid,
        expert_id: Ulid,
        amount: i64,
        note: String,
    ) -> Result<(), EngineError> {
        if amount <= 0 {
            return Err(EngineError::LimitExceeded("payout must be positive"));
        }
        if note.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let mut guard = st.write().await;
        let event = Event::PayoutRecorded {
            id,
            expert_id,
            amount,
            note,
            created_at: self.clock.now(),
        };
        self.persist_and_apply(expert_id, &mut guard, None, &event)
            .await
    }

    pub async fn record_client_payment(
        &self,
        id: Ulid,
        user_id: Ulid,
        amount: i64,
        note: String,
    ) -> Result<(), EngineError> {
        if amount <= 0 {
            return Err(EngineError::LimitExceeded("payment must be positive"));
        }
        if note.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let created_at = self.clock.now();
        let event = Event::ClientPaymentRecorded {
            id,
            user_id,
            amount,
            note: note.clone(),
            created_at,
        };
        self.wal_append(&event).await?;
        self.client_payments.write().await.push(ClientPayment {
            id,
            user_id,
            amount,
            note,
            created_at,
        });
        Ok(())
    }
}
