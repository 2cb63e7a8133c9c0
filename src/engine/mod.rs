mod booking;
pub mod error;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use slots::{bookable_slots, day_windows};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedExpertState = Arc<RwLock<ExpertState>>;
pub type SharedPurchase = Arc<RwLock<Purchase>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub experts: DashMap<Ulid, SharedExpertState>,
    pub purchases: DashMap<Ulid, SharedPurchase>,
    pub client_payments: RwLock<Vec<ClientPayment>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub clock: Arc<dyn Clock>,
    /// Reverse lookup: session id → expert id
    pub(super) session_to_expert: DashMap<Ulid, Ulid>,
    /// Reverse lookup: override/window id → expert id
    pub(super) entity_to_expert: DashMap<Ulid, Ulid>,
}

/// Apply an event to one expert's state (no locking — caller holds the lock).
/// Purchase-side effects are applied separately via `apply_to_purchase`.
fn apply_to_expert(
    st: &mut ExpertState,
    event: &Event,
    session_map: &DashMap<Ulid, Ulid>,
    entity_map: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::OverrideSet {
            id,
            expert_id,
            date,
            workday,
            day_start,
            day_end,
        } => {
            if let Some(old) = st.override_for(*date) {
                entity_map.remove(&old.id);
            }
            st.set_override(DayOverride {
                id: *id,
                date: *date,
                workday: *workday,
                day_start: *day_start,
                day_end: *day_end,
            });
            entity_map.insert(*id, *expert_id);
        }
        Event::OverrideRemoved { id, .. } => {
            st.remove_override(*id);
            entity_map.remove(id);
        }
        Event::WindowAdded {
            id,
            expert_id,
            date,
            start_min,
            end_min,
        } => {
            st.add_window(ManualWindow {
                id: *id,
                date: *date,
                start_min: *start_min,
                end_min: *end_min,
            });
            entity_map.insert(*id, *expert_id);
        }
        Event::WindowRemoved { id, .. } => {
            st.remove_window(*id);
            entity_map.remove(id);
        }
        Event::SessionsBooked {
            expert_id,
            purchase_id,
            user_id,
            date,
            slots,
            created_at,
        } => {
            for slot in slots {
                st.insert_session(Session {
                    id: slot.id,
                    purchase_id: *purchase_id,
                    user_id: *user_id,
                    date: *date,
                    start_min: slot.start_min,
                    end_min: slot.end_min,
                    link: slot.link.clone(),
                    status: SessionStatus::Upcoming,
                    cancel_reason: None,
                    cancelled_by: None,
                    cancelled_at: None,
                    created_at: *created_at,
                });
                session_map.insert(slot.id, *expert_id);
            }
        }
        Event::SessionCancelled {
            id,
            by_user,
            reason,
            cancelled_at,
            ..
        } => {
            if let Some(s) = st.session_mut(*id) {
                s.status = SessionStatus::Cancelled;
                s.cancel_reason = Some(reason.clone());
                s.cancelled_by = Some(*by_user);
                s.cancelled_at = Some(*cancelled_at);
            }
        }
        Event::SessionCompleted { id, .. } => {
            if let Some(s) = st.session_mut(*id)
                && s.status == SessionStatus::Upcoming {
                    s.status = SessionStatus::Completed;
                }
        }
        Event::FeedbackSubmitted {
            id,
            purchase_id,
            user_id,
            rating,
            text,
            created_at,
            ..
        } => {
            st.feedback.push(Feedback {
                id: *id,
                purchase_id: *purchase_id,
                user_id: *user_id,
                rating: *rating,
                text: text.clone(),
                created_at: *created_at,
            });
        }
        Event::PayoutRecorded {
            id,
            expert_id,
            amount,
            note,
            created_at,
        } => {
            st.payouts.push(Payout {
                id: *id,
                expert_id: *expert_id,
                amount: *amount,
                note: note.clone(),
                created_at: *created_at,
            });
        }
        // Handled at the map level, not here
        Event::ExpertCreated { .. }
        | Event::PurchaseCreated { .. }
        | Event::ClientPaymentRecorded { .. } => {}
    }
}

/// Balance side of a booking or cancellation event.
fn apply_to_purchase(p: &mut Purchase, event: &Event) {
    match event {
        Event::SessionsBooked { slots, .. } => {
            let minutes: i64 = slots.iter().map(|s| (s.end_min - s.start_min) as i64).sum();
            p.deduct(minutes);
        }
        Event::SessionCancelled { refund_minutes, .. } => {
            p.refund(*refund_minutes);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            experts: DashMap::new(),
            purchases: DashMap::new(),
            client_payments: RwLock::new(Vec::new()),
            wal_tx,
            notify,
            clock,
            session_to_expert: DashMap::new(),
            entity_to_expert: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly. Never use blocking_read/blocking_write here
        // because this may run inside an async context (lazy tenant creation).
        for event in &events {
            match event {
                Event::ExpertCreated {
                    id,
                    name,
                    domain,
                    hourly_rate,
                    day_start,
                    day_end,
                    workdays,
                    base_rating,
                } => {
                    let st = ExpertState::new(Expert {
                        id: *id,
                        name: name.clone(),
                        domain: *domain,
                        hourly_rate: *hourly_rate,
                        day_start: *day_start,
                        day_end: *day_end,
                        workdays: workdays.clone(),
                        base_rating: *base_rating,
                    });
                    engine.experts.insert(*id, Arc::new(RwLock::new(st)));
                }
                Event::PurchaseCreated {
                    id,
                    user_id,
                    expert_id,
                    package_minutes,
                    minutes_remaining,
                    amount,
                    created_at,
                } => {
                    let p = Purchase {
                        id: *id,
                        user_id: *user_id,
                        expert_id: *expert_id,
                        package_minutes: *package_minutes,
                        minutes_remaining: *minutes_remaining,
                        amount: *amount,
                        created_at: *created_at,
                    };
                    engine.purchases.insert(*id, Arc::new(RwLock::new(p)));
                }
                Event::ClientPaymentRecorded {
                    id,
                    user_id,
                    amount,
                    note,
                    created_at,
                } => {
                    let mut payments = engine
                        .client_payments
                        .try_write()
                        .expect("replay: uncontended write");
                    payments.push(ClientPayment {
                        id: *id,
                        user_id: *user_id,
                        amount: *amount,
                        note: note.clone(),
                        created_at: *created_at,
                    });
                }
                other => {
                    if let Some(expert_id) = event_expert_id(other)
                        && let Some(entry) = engine.experts.get(&expert_id) {
                            let st_arc = entry.clone();
                            let mut guard =
                                st_arc.try_write().expect("replay: uncontended write");
                            apply_to_expert(
                                &mut guard,
                                other,
                                &engine.session_to_expert,
                                &engine.entity_to_expert,
                            );
                        }
                    // Compacted logs place PurchaseCreated after session events
                    // with the balance already settled; live logs place it first
                    // and the deduct/refund replays here.
                    if let Some(purchase_id) = event_purchase_id(other)
                        && let Some(entry) = engine.purchases.get(&purchase_id) {
                            let p_arc = entry.clone();
                            let mut guard =
                                p_arc.try_write().expect("replay: uncontended write");
                            apply_to_purchase(&mut guard, other);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_expert(&self, id: &Ulid) -> Option<SharedExpertState> {
        self.experts.get(id).map(|e| e.value().clone())
    }

    pub fn get_purchase(&self, id: &Ulid) -> Option<SharedPurchase> {
        self.purchases.get(id).map(|e| e.value().clone())
    }

    pub fn expert_of_session(&self, session_id: &Ulid) -> Option<Ulid> {
        self.session_to_expert.get(session_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call. `purchase` is the guard of
    /// the affected purchase for events that touch a balance.
    pub(super) async fn persist_and_apply(
        &self,
        expert_id: Ulid,
        st: &mut ExpertState,
        purchase: Option<&mut Purchase>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_expert(st, event, &self.session_to_expert, &self.entity_to_expert);
        if let Some(p) = purchase {
            apply_to_purchase(p, event);
        }
        self.notify.send(expert_id, event);
        Ok(())
    }

    /// Lookup session → expert, acquire the expert write lock.
    pub(super) async fn resolve_session_write(
        &self,
        session_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ExpertState>), EngineError> {
        let expert_id = self
            .expert_of_session(session_id)
            .ok_or(EngineError::NotFound(*session_id))?;
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let guard = st.write_owned().await;
        Ok((expert_id, guard))
    }

    /// Lookup override/window → expert, acquire the expert write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ExpertState>), EngineError> {
        let expert_id = self
            .entity_to_expert
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))?;
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let guard = st.write_owned().await;
        Ok((expert_id, guard))
    }

    /// Compact the WAL down to the events needed to recreate current state.
    /// Session events come first and purchases last: `PurchaseCreated`
    /// carries the settled balance, so the replayed bookings must not find a
    /// purchase to deduct from.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.experts.iter() {
            let st_arc = entry.value().clone();
            let guard = st_arc.try_read().expect("compact: uncontended read");

            let p = &guard.profile;
            events.push(Event::ExpertCreated {
                id: p.id,
                name: p.name.clone(),
                domain: p.domain,
                hourly_rate: p.hourly_rate,
                day_start: p.day_start,
                day_end: p.day_end,
                workdays: p.workdays.clone(),
                base_rating: p.base_rating,
            });
            for ov in &guard.overrides {
                events.push(Event::OverrideSet {
                    id: ov.id,
                    expert_id: p.id,
                    date: ov.date,
                    workday: ov.workday,
                    day_start: ov.day_start,
                    day_end: ov.day_end,
                });
            }
            for w in &guard.windows {
                events.push(Event::WindowAdded {
                    id: w.id,
                    expert_id: p.id,
                    date: w.date,
                    start_min: w.start_min,
                    end_min: w.end_min,
                });
            }
            for s in &guard.sessions {
                events.push(Event::SessionsBooked {
                    expert_id: p.id,
                    purchase_id: s.purchase_id,
                    user_id: s.user_id,
                    date: s.date,
                    slots: vec![BookedSlot {
                        id: s.id,
                        start_min: s.start_min,
                        end_min: s.end_min,
                        link: s.link.clone(),
                    }],
                    created_at: s.created_at,
                });
                match s.status {
                    SessionStatus::Cancelled => events.push(Event::SessionCancelled {
                        id: s.id,
                        expert_id: p.id,
                        purchase_id: s.purchase_id,
                        by_user: s.cancelled_by.unwrap_or(s.user_id),
                        reason: s.cancel_reason.clone().unwrap_or_default(),
                        refund_minutes: 0,
                        cancelled_at: s.cancelled_at.unwrap_or(s.created_at),
                    }),
                    SessionStatus::Completed => events.push(Event::SessionCompleted {
                        id: s.id,
                        expert_id: p.id,
                    }),
                    SessionStatus::Upcoming => {}
                }
            }
            for fb in &guard.feedback {
                events.push(Event::FeedbackSubmitted {
                    id: fb.id,
                    expert_id: p.id,
                    purchase_id: fb.purchase_id,
                    user_id: fb.user_id,
                    rating: fb.rating,
                    text: fb.text.clone(),
                    created_at: fb.created_at,
                });
            }
            for po in &guard.payouts {
                events.push(Event::PayoutRecorded {
                    id: po.id,
                    expert_id: p.id,
                    amount: po.amount,
                    note: po.note.clone(),
                    created_at: po.created_at,
                });
            }
        }

        for entry in self.purchases.iter() {
            let p_arc = entry.value().clone();
            let p = p_arc.try_read().expect("compact: uncontended read");
            events.push(Event::PurchaseCreated {
                id: p.id,
                user_id: p.user_id,
                expert_id: p.expert_id,
                package_minutes: p.package_minutes,
                minutes_remaining: p.minutes_remaining,
                amount: p.amount,
                created_at: p.created_at,
            });
        }

        for cp in self.client_payments.read().await.iter() {
            events.push(Event::ClientPaymentRecorded {
                id: cp.id,
                user_id: cp.user_id,
                amount: cp.amount,
                note: cp.note.clone(),
                created_at: cp.created_at,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Expert touched by an event, for replay routing.
fn event_expert_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::OverrideSet { expert_id, .. }
        | Event::OverrideRemoved { expert_id, .. }
        | Event::WindowAdded { expert_id, .. }
        | Event::WindowRemoved { expert_id, .. }
        | Event::SessionsBooked { expert_id, .. }
        | Event::SessionCancelled { expert_id, .. }
        | Event::SessionCompleted { expert_id, .. }
        | Event::FeedbackSubmitted { expert_id, .. }
        | Event::PayoutRecorded { expert_id, .. } => Some(*expert_id),
        Event::ExpertCreated { .. }
        | Event::PurchaseCreated { .. }
        | Event::ClientPaymentRecorded { .. } => None,
    }
}

/// Purchase whose balance an event moves.
fn event_purchase_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SessionsBooked { purchase_id, .. }
        | Event::SessionCancelled { purchase_id, .. } => Some(*purchase_id),
        _ => None,
    }
}
