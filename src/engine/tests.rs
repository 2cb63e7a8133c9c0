use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use super::{Engine, EngineError};
use crate::clock::FixedClock;
use crate::model::*;
use crate::notify::NotifyHub;

// The fixture clock sits on a Saturday morning. 2025-09-07 is the next
// Sunday, 2025-09-08 the next Monday.
const NOW: &str = "2025-09-06T08:00:00Z";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn clock_at(s: &str) -> Arc<FixedClock> {
    Arc::new(FixedClock(s.parse::<DateTime<Utc>>().unwrap()))
}

fn engine_at(path: PathBuf, s: &str) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), clock_at(s)).unwrap()
}

fn test_engine(name: &str) -> Engine {
    engine_at(test_wal_path(name), NOW)
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

/// Expert available every day of the week, 09:00-17:00, 120/h.
async fn setup_expert(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .create_expert(
            id,
            "Nadia".into(),
            Domain::Tax,
            120,
            540,
            1020,
            vec![1, 2, 3, 4, 5, 6, 7],
            4.0,
        )
        .await
        .unwrap();
    id
}

async fn setup_purchase(engine: &Engine, expert_id: Ulid, hours: i64) -> (Ulid, Ulid) {
    let purchase_id = Ulid::new();
    let user_id = Ulid::new();
    engine
        .create_purchase(purchase_id, user_id, expert_id, hours)
        .await
        .unwrap();
    (purchase_id, user_id)
}

// ── Slots & availability ─────────────────────────────────────

#[tokio::test]
async fn default_day_yields_sixteen_slots() {
    let engine = test_engine("default_day.wal");
    let eid = setup_expert(&engine).await;

    let slots = engine.slots_for_date(eid, date("2025-09-08")).await.unwrap();
    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0], SlotInfo { start_min: 540, end_min: 570 });
    assert_eq!(slots[15], SlotInfo { start_min: 990, end_min: 1020 });
}

#[tokio::test]
async fn default_window_applies_every_day() {
    let engine = test_engine("every_day.wal");
    let id = Ulid::new();
    engine
        .create_expert(id, "Iris".into(), Domain::Cyber, 150, 540, 1020, vec![1, 2, 3, 4, 5], 0.0)
        .await
        .unwrap();

    // The workdays list is listing metadata; Sunday still gets the default
    // window, and a manual window replaces it outright.
    let sunday = date("2025-09-07");
    assert_eq!(engine.slots_for_date(id, sunday).await.unwrap().len(), 16);

    engine
        .add_window(Ulid::new(), id, sunday, 600, 660)
        .await
        .unwrap();
    assert_eq!(engine.slots_for_date(id, sunday).await.unwrap().len(), 2);
}

#[tokio::test]
async fn override_closes_and_reshapes_the_day() {
    let engine = test_engine("override_day.wal");
    let eid = setup_expert(&engine).await;
    let monday = date("2025-09-08");

    // Non-workday override closes the day entirely
    let ov = Ulid::new();
    engine
        .set_override(ov, eid, monday, false, None, None)
        .await
        .unwrap();
    assert!(engine.slots_for_date(eid, monday).await.unwrap().is_empty());

    // Replacing override for the same date narrows the window instead
    let ov2 = Ulid::new();
    engine
        .set_override(ov2, eid, monday, true, Some(600), Some(720))
        .await
        .unwrap();
    let slots = engine.slots_for_date(eid, monday).await.unwrap();
    assert_eq!(slots.len(), 4);
    assert_eq!(slots[0].start_min, 600);

    // The replaced override id is gone; the replacement can be removed
    assert!(matches!(
        engine.remove_override(ov).await,
        Err(EngineError::NotFound(_))
    ));
    engine.remove_override(ov2).await.unwrap();
    assert_eq!(engine.slots_for_date(eid, monday).await.unwrap().len(), 16);
}

#[tokio::test]
async fn removed_window_frees_its_slots() {
    let engine = test_engine("remove_window.wal");
    let eid = setup_expert(&engine).await;
    let monday = date("2025-09-08");

    // Manual windows replace the default day entirely
    let wid = Ulid::new();
    engine
        .add_window(wid, eid, monday, 1080, 1140)
        .await
        .unwrap();
    let slots = engine.slots_for_date(eid, monday).await.unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].start_min, 1080);

    engine.remove_window(wid).await.unwrap();
    assert_eq!(engine.slots_for_date(eid, monday).await.unwrap().len(), 16);
}

// ── Purchases ────────────────────────────────────────────────

#[tokio::test]
async fn purchase_amount_is_hours_times_rate() {
    let engine = test_engine("purchase_amount.wal");
    let eid = setup_expert(&engine).await;

    let amount = engine
        .create_purchase(Ulid::new(), Ulid::new(), eid, 4)
        .await
        .unwrap();
    assert_eq!(amount, 480);
}

#[tokio::test]
async fn purchase_rejects_bad_hours_and_duplicates() {
    let engine = test_engine("purchase_bad.wal");
    let eid = setup_expert(&engine).await;

    assert!(matches!(
        engine.create_purchase(Ulid::new(), Ulid::new(), eid, 0).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let pid = Ulid::new();
    engine.create_purchase(pid, Ulid::new(), eid, 1).await.unwrap();
    assert!(matches!(
        engine.create_purchase(pid, Ulid::new(), eid, 1).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

// ── Booking ──────────────────────────────────────────────────

#[tokio::test]
async fn booking_deducts_and_lists_sessions() {
    let engine = test_engine("booking_deducts.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;
    let monday = date("2025-09-08");

    let receipt = engine
        .book_sessions(pid, uid, monday, &[(540, 570), (570, 600)])
        .await
        .unwrap();
    assert_eq!(receipt.session_ids.len(), 2);
    assert_eq!(receipt.minutes_deducted, 60);
    assert_eq!(receipt.minutes_remaining, 0);

    let sessions = engine.get_sessions_by_purchase(pid).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.status == SessionStatus::Upcoming));
    assert!(sessions.iter().all(|s| s.link.starts_with("https://")));

    // Booked slots disappear from the listing
    let slots = engine.slots_for_date(eid, monday).await.unwrap();
    assert_eq!(slots.len(), 14);
    assert!(!slots.iter().any(|s| s.start_min == 540 || s.start_min == 570));
}

#[tokio::test]
async fn booking_rejects_unlisted_slot() {
    let engine = test_engine("booking_unlisted.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    // Off-grid start, even though it fits inside the day window
    let err = engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(555, 585)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable { start_min: 555, .. }));
}

#[tokio::test]
async fn booking_rejects_taken_slot() {
    let engine = test_engine("booking_taken.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 2).await;
    let monday = date("2025-09-08");

    engine
        .book_sessions(pid, uid, monday, &[(540, 570)])
        .await
        .unwrap();
    let err = engine
        .book_sessions(pid, uid, monday, &[(540, 570)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable { .. }));
}

#[tokio::test]
async fn booking_rejects_past_slot_today() {
    let engine = test_engine("booking_past.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    // It is 08:00; minute 480 has already started
    let err = engine
        .book_sessions(pid, uid, date("2025-09-06"), &[(480, 510)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PastTime { start_min: 480, .. }));

    let err = engine
        .book_sessions(pid, uid, date("2025-09-05"), &[(540, 570)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PastDate(_)));
}

#[tokio::test]
async fn balance_is_checked_before_slot_validity() {
    let engine = test_engine("booking_balance_first.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    // Three slots exceed the 60-minute balance; the bogus slot in the
    // request is never reached.
    let err = engine
        .book_sessions(
            pid,
            uid,
            date("2025-09-08"),
            &[(540, 570), (570, 600), (5, 35)],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientBalance { required: 90, remaining: 60 }
    ));
}

#[tokio::test]
async fn batch_must_not_overlap_itself() {
    let engine = test_engine("booking_self_overlap.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    let err = engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570), (540, 570)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable { .. }));

    // Nothing was committed
    let p = engine.get_purchase(&pid).unwrap();
    assert_eq!(p.read().await.minutes_remaining, 60);
    assert!(engine.get_sessions_by_purchase(pid).await.unwrap().is_empty());
}

#[tokio::test]
async fn booking_enforces_ownership() {
    let engine = test_engine("booking_ownership.wal");
    let eid = setup_expert(&engine).await;
    let (pid, _uid) = setup_purchase(&engine, eid, 1).await;

    let err = engine
        .book_sessions(pid, Ulid::new(), date("2025-09-08"), &[(540, 570)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Ownership(_)));

    let err = engine
        .book_sessions(Ulid::new(), Ulid::new(), date("2025-09-08"), &[(540, 570)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn concurrent_bookings_of_same_slot_admit_one() {
    let engine = Arc::new(test_engine("booking_concurrent.wal"));
    let eid = setup_expert(&engine).await;
    let (pid_a, uid_a) = setup_purchase(&engine, eid, 1).await;
    let (pid_b, uid_b) = setup_purchase(&engine, eid, 1).await;
    let monday = date("2025-09-08");

    let e1 = engine.clone();
    let t1 = tokio::spawn(async move {
        e1.book_sessions(pid_a, uid_a, monday, &[(540, 570)]).await
    });
    let e2 = engine.clone();
    let t2 = tokio::spawn(async move {
        e2.book_sessions(pid_b, uid_b, monday, &[(540, 570)]).await
    });

    let (r1, r2) = (t1.await.unwrap(), t2.await.unwrap());
    assert_eq!(r1.is_ok() as u8 + r2.is_ok() as u8, 1);
    assert_eq!(engine.slots_for_date(eid, monday).await.unwrap().len(), 15);
}

// ── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn cancel_refunds_and_frees_the_slot() {
    let engine = test_engine("cancel_refund.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;
    let monday = date("2025-09-08");

    let receipt = engine
        .book_sessions(pid, uid, monday, &[(540, 570)])
        .await
        .unwrap();
    let sid = receipt.session_ids[0];

    let refund = engine
        .cancel_session(sid, uid, "conflict".into())
        .await
        .unwrap();
    assert_eq!(refund, 30);
    let p = engine.get_purchase(&pid).unwrap();
    assert_eq!(p.read().await.minutes_remaining, 60);

    let sessions = engine.get_sessions_by_purchase(pid).await.unwrap();
    assert_eq!(sessions[0].status, SessionStatus::Cancelled);

    // The slot is bookable again
    assert_eq!(engine.slots_for_date(eid, monday).await.unwrap().len(), 16);
    engine
        .book_sessions(pid, uid, monday, &[(540, 570)])
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let engine = test_engine("cancel_idempotent.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    let receipt = engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570)])
        .await
        .unwrap();
    let sid = receipt.session_ids[0];

    assert_eq!(engine.cancel_session(sid, uid, String::new()).await.unwrap(), 30);
    assert_eq!(engine.cancel_session(sid, uid, String::new()).await.unwrap(), 0);

    let p = engine.get_purchase(&pid).unwrap();
    assert_eq!(p.read().await.minutes_remaining, 60);
}

#[tokio::test]
async fn cancel_within_24h_is_rejected() {
    let engine = test_engine("cancel_late.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;
    let sunday = date("2025-09-07");

    // Sunday 07:00 is 23 hours away: bookable, but not cancelable
    engine.add_window(Ulid::new(), eid, sunday, 420, 480).await.unwrap();
    let receipt = engine
        .book_sessions(pid, uid, sunday, &[(420, 450)])
        .await
        .unwrap();

    let err = engine
        .cancel_session(receipt.session_ids[0], uid, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LateCancellation { .. }));

    let sessions = engine.get_sessions_by_purchase(pid).await.unwrap();
    assert_eq!(sessions[0].status, SessionStatus::Upcoming);
}

#[tokio::test]
async fn cancel_at_exactly_24h_is_allowed() {
    let engine = test_engine("cancel_boundary.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;
    let sunday = date("2025-09-07");

    // Sunday 08:00 starts exactly 24 hours from the fixture clock
    engine.add_window(Ulid::new(), eid, sunday, 480, 540).await.unwrap();
    let receipt = engine
        .book_sessions(pid, uid, sunday, &[(480, 510)])
        .await
        .unwrap();
    assert_eq!(
        engine
            .cancel_session(receipt.session_ids[0], uid, String::new())
            .await
            .unwrap(),
        30
    );
}

#[tokio::test]
async fn late_cancel_of_cancelled_session_still_errors() {
    let path = test_wal_path("cancel_late_idempotent.wal");
    let (sid, uid) = {
        let engine = engine_at(path.clone(), NOW);
        let eid = setup_expert(&engine).await;
        let (pid, uid) = setup_purchase(&engine, eid, 1).await;
        let receipt = engine
            .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570)])
            .await
            .unwrap();
        let sid = receipt.session_ids[0];
        engine.cancel_session(sid, uid, String::new()).await.unwrap();
        (sid, uid)
    };

    // Replay the same WAL with the clock 15 minutes before the slot: the
    // deadline check fires before the already-cancelled shortcut.
    let engine = engine_at(path, "2025-09-08T08:45:00Z");
    let err = engine
        .cancel_session(sid, uid, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LateCancellation { .. }));
}

// ── Completion & earnings ────────────────────────────────────

#[tokio::test]
async fn earnings_follow_completed_minutes_and_payouts() {
    let engine = test_engine("earnings.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    let receipt = engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570), (570, 600)])
        .await
        .unwrap();
    for sid in &receipt.session_ids {
        assert!(engine.complete_session(*sid).await.unwrap());
    }

    // 60 completed minutes at 120/h
    let earnings = engine.earnings().await;
    assert_eq!(earnings.len(), 1);
    assert_eq!(earnings[0].earned, 120);
    assert_eq!(earnings[0].paid, 0);
    assert_eq!(earnings[0].due, 120);

    engine
        .record_payout(Ulid::new(), eid, 50, "partial".into())
        .await
        .unwrap();
    let earnings = engine.earnings().await;
    assert_eq!(earnings[0].paid, 50);
    assert_eq!(earnings[0].due, 70);

    // Overpayment never drives the due amount negative
    engine
        .record_payout(Ulid::new(), eid, 200, "bonus".into())
        .await
        .unwrap();
    let earnings = engine.earnings().await;
    assert_eq!(earnings[0].paid, 250);
    assert_eq!(earnings[0].due, 0);
}

#[tokio::test]
async fn cancelled_sessions_earn_nothing() {
    let engine = test_engine("earnings_cancelled.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    let receipt = engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570)])
        .await
        .unwrap();
    engine
        .cancel_session(receipt.session_ids[0], uid, String::new())
        .await
        .unwrap();

    let earnings = engine.earnings().await;
    assert_eq!(earnings[0].earned, 0);
}

// ── Feedback ─────────────────────────────────────────────────

#[tokio::test]
async fn feedback_is_gated_until_package_is_settled() {
    let engine = test_engine("feedback_gate.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    // Balance still full
    let err = engine
        .submit_feedback(Ulid::new(), pid, uid, 5, "great".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::FeedbackRejected(_)));

    let receipt = engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570), (570, 600)])
        .await
        .unwrap();

    // Balance exhausted but sessions still upcoming
    let err = engine
        .submit_feedback(Ulid::new(), pid, uid, 5, "great".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::FeedbackRejected(_)));

    for sid in &receipt.session_ids {
        engine.complete_session(*sid).await.unwrap();
    }
    engine
        .submit_feedback(Ulid::new(), pid, uid, 5, "great".into())
        .await
        .unwrap();

    // One entry per purchase and user
    let err = engine
        .submit_feedback(Ulid::new(), pid, uid, 4, "again".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::FeedbackRejected(_)));
}

#[tokio::test]
async fn feedback_validates_rating_and_ownership() {
    let engine = test_engine("feedback_validate.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    assert!(matches!(
        engine.submit_feedback(Ulid::new(), pid, uid, 0, String::new()).await,
        Err(EngineError::FeedbackRejected(_))
    ));
    assert!(matches!(
        engine.submit_feedback(Ulid::new(), pid, uid, 6, String::new()).await,
        Err(EngineError::FeedbackRejected(_))
    ));
    assert!(matches!(
        engine
            .submit_feedback(Ulid::new(), pid, Ulid::new(), 5, String::new())
            .await,
        Err(EngineError::Ownership(_))
    ));
}

#[tokio::test]
async fn rating_falls_back_to_base_until_feedback_arrives() {
    let engine = test_engine("rating.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 1).await;

    let experts = engine.list_experts().await;
    assert_eq!(experts[0].rating, 4.0);

    let receipt = engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570), (570, 600)])
        .await
        .unwrap();
    for sid in &receipt.session_ids {
        engine.complete_session(*sid).await.unwrap();
    }
    engine
        .submit_feedback(Ulid::new(), pid, uid, 5, String::new())
        .await
        .unwrap();

    let experts = engine.list_experts().await;
    assert_eq!(experts[0].rating, 5.0);
}

// ── Queries ──────────────────────────────────────────────────

#[tokio::test]
async fn sessions_and_purchases_are_queryable_by_user() {
    let engine = test_engine("user_queries.wal");
    let eid = setup_expert(&engine).await;
    let (pid, uid) = setup_purchase(&engine, eid, 2).await;
    let (_other_pid, other_uid) = setup_purchase(&engine, eid, 1).await;

    engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570), (600, 630)])
        .await
        .unwrap();

    let sessions = engine.get_sessions_by_user(uid).await;
    assert_eq!(sessions.len(), 2);
    assert!(sessions[0].start_min < sessions[1].start_min);
    assert!(engine.get_sessions_by_user(other_uid).await.is_empty());

    let purchases = engine.get_purchases_by_user(uid).await;
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].minutes_remaining, 60);
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test]
async fn replay_rebuilds_full_state() {
    let path = test_wal_path("replay.wal");
    let (eid, pid, uid, cancelled, completed) = {
        let engine = engine_at(path.clone(), NOW);
        let eid = setup_expert(&engine).await;
        let (pid, uid) = setup_purchase(&engine, eid, 2).await;
        engine
            .set_override(Ulid::new(), eid, date("2025-09-09"), false, None, None)
            .await
            .unwrap();
        engine
            .add_window(Ulid::new(), eid, date("2025-09-10"), 600, 660)
            .await
            .unwrap();
        let receipt = engine
            .book_sessions(
                pid,
                uid,
                date("2025-09-08"),
                &[(540, 570), (570, 600), (600, 630)],
            )
            .await
            .unwrap();
        engine
            .cancel_session(receipt.session_ids[0], uid, "moved".into())
            .await
            .unwrap();
        engine.complete_session(receipt.session_ids[1]).await.unwrap();
        engine
            .record_client_payment(Ulid::new(), uid, 240, "invoice 17".into())
            .await
            .unwrap();
        (eid, pid, uid, receipt.session_ids[0], receipt.session_ids[1])
    };

    let engine = engine_at(path, NOW);
    let p = engine.get_purchase(&pid).unwrap();
    assert_eq!(p.read().await.minutes_remaining, 60);

    let sessions = engine.get_sessions_by_purchase(pid).await.unwrap();
    assert_eq!(sessions.len(), 3);
    let by_id = |id: Ulid| sessions.iter().find(|s| s.id == id).unwrap().clone();
    assert_eq!(by_id(cancelled).status, SessionStatus::Cancelled);
    assert_eq!(by_id(completed).status, SessionStatus::Completed);

    // Override and window replayed too
    assert!(engine.slots_for_date(eid, date("2025-09-09")).await.unwrap().is_empty());
    assert_eq!(engine.slots_for_date(eid, date("2025-09-10")).await.unwrap().len(), 2);
    // Cancelled slot is free again, the other two still block
    let slots = engine.slots_for_date(eid, date("2025-09-08")).await.unwrap();
    assert_eq!(slots.len(), 14);

    assert_eq!(engine.client_payments.read().await.len(), 1);
    assert_eq!(engine.client_payments.read().await[0].user_id, uid);

    // Replayed state accepts new writes
    engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570)])
        .await
        .unwrap();
}

#[tokio::test]
async fn compaction_preserves_state_and_resets_counter() {
    let path = test_wal_path("compact.wal");
    let (pid, uid, eid) = {
        let engine = engine_at(path.clone(), NOW);
        let eid = setup_expert(&engine).await;
        let (pid, uid) = setup_purchase(&engine, eid, 1).await;
        let receipt = engine
            .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570), (570, 600)])
            .await
            .unwrap();
        engine
            .cancel_session(receipt.session_ids[0], uid, String::new())
            .await
            .unwrap();
        engine.complete_session(receipt.session_ids[1]).await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (pid, uid, eid)
    };

    // A fresh engine over the compacted log sees identical state, in
    // particular the purchase balance (30 spent, 30 refunded).
    let engine = engine_at(path, NOW);
    let p = engine.get_purchase(&pid).unwrap();
    assert_eq!(p.read().await.minutes_remaining, 30);

    let sessions = engine.get_sessions_by_purchase(pid).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(
        sessions.iter().filter(|s| s.status == SessionStatus::Cancelled).count(),
        1
    );
    assert_eq!(
        sessions.iter().filter(|s| s.status == SessionStatus::Completed).count(),
        1
    );

    let slots = engine.slots_for_date(eid, date("2025-09-08")).await.unwrap();
    assert_eq!(slots.len(), 15);

    // And it still accepts writes afterwards
    engine
        .book_sessions(pid, uid, date("2025-09-08"), &[(540, 570)])
        .await
        .unwrap();
}
