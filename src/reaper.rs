use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that promotes sessions to Completed once their end
/// instant has passed.
pub async fn run_completer(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let now = engine.clock.now();
        let finished = engine.collect_finished_sessions(now);
        for (session_id, _expert_id) in finished {
            match engine.complete_session(session_id).await {
                Ok(true) => info!("completed session {session_id}"),
                Ok(false) => {}
                Err(e) => {
                    // May have been cancelled in the meantime
                    tracing::debug!("completer skip {session_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            info!("compacting WAL ({appends} appends since last compaction)");
            if let Err(e) = engine.compact_wal().await {
                tracing::error!("compaction failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::notify::NotifyHub;
    use crate::model::Domain;
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn clock_at(s: &str) -> Arc<FixedClock> {
        Arc::new(FixedClock(s.parse::<DateTime<Utc>>().unwrap()))
    }

    #[tokio::test]
    async fn completer_collects_past_sessions() {
        let path = test_wal_path("completer_collect.wal");
        let notify = Arc::new(NotifyHub::new());
        let clock = clock_at("2025-09-06T08:00:00Z");
        let engine = Arc::new(Engine::new(path, notify, clock.clone()).unwrap());

        let expert_id = Ulid::new();
        engine
            .create_expert(
                expert_id,
                "Nadia".into(),
                Domain::Tax,
                120,
                540,
                1020,
                vec![1, 2, 3, 4, 5, 6],
                4.0,
            )
            .await
            .unwrap();
        let purchase_id = Ulid::new();
        let user_id = Ulid::new();
        engine
            .create_purchase(purchase_id, user_id, expert_id, 1)
            .await
            .unwrap();

        // Book the 09:00 slot for later today; nothing has finished yet.
        let date = "2025-09-06".parse().unwrap();
        let receipt = engine
            .book_sessions(purchase_id, user_id, date, &[(540, 570)])
            .await
            .unwrap();
        assert!(engine
            .collect_finished_sessions(clock.now())
            .is_empty());

        // After the slot's end the session shows up and completes once.
        let later = "2025-09-06T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let finished = engine.collect_finished_sessions(later);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, receipt.session_ids[0]);
        assert_eq!(finished[0].1, expert_id);

        assert!(engine.complete_session(finished[0].0).await.unwrap());
        assert!(engine.collect_finished_sessions(later).is_empty());
        // Second completion attempt is a settled no-op.
        assert!(!engine.complete_session(finished[0].0).await.unwrap());
    }
}
