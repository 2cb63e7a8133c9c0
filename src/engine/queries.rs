use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{slots, Engine, EngineError};

impl Engine {
    /// Open 30-minute slots for one expert on one date.
    pub async fn slots_for_date(
        &self,
        expert_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let guard = st.read().await;
        Ok(slots::bookable_slots(&guard, date))
    }

    /// All experts with their computed rating, in id order.
    pub async fn list_experts(&self) -> Vec<ExpertInfo> {
        let mut out = Vec::with_capacity(self.experts.len());
        for entry in self.experts.iter() {
            let st = entry.value().clone();
            let guard = st.read().await;
            let p = &guard.profile;
            out.push(ExpertInfo {
                id: p.id,
                name: p.name.clone(),
                domain: p.domain,
                hourly_rate: p.hourly_rate,
                day_start: p.day_start,
                day_end: p.day_end,
                rating: guard.rating(),
            });
        }
        out.sort_by_key(|e| e.id);
        out
    }

    pub async fn get_sessions_by_purchase(
        &self,
        purchase_id: Ulid,
    ) -> Result<Vec<SessionInfo>, EngineError> {
        let p_arc = self
            .get_purchase(&purchase_id)
            .ok_or(EngineError::NotFound(purchase_id))?;
        let expert_id = p_arc.read().await.expert_id;
        let st = self
            .get_expert(&expert_id)
            .ok_or(EngineError::NotFound(expert_id))?;
        let guard = st.read().await;
        Ok(guard
            .sessions
            .iter()
            .filter(|s| s.purchase_id == purchase_id)
            .map(|s| session_info(expert_id, s))
            .collect())
    }

    pub async fn get_sessions_by_user(&self, user_id: Ulid) -> Vec<SessionInfo> {
        let mut out = Vec::new();
        for entry in self.experts.iter() {
            let st = entry.value().clone();
            let guard = st.read().await;
            let expert_id = guard.profile.id;
            out.extend(
                guard
                    .sessions
                    .iter()
                    .filter(|s| s.user_id == user_id)
                    .map(|s| session_info(expert_id, s)),
            );
        }
        out.sort_by_key(|s| (s.date, s.start_min, s.id));
        out
    }

    pub async fn get_purchases_by_user(&self, user_id: Ulid) -> Vec<PurchaseInfo> {
        let mut out = Vec::new();
        for entry in self.purchases.iter() {
            let p_arc = entry.value().clone();
            let p = p_arc.read().await;
            if p.user_id == user_id {
                out.push(PurchaseInfo {
                    id: p.id,
                    user_id: p.user_id,
                    expert_id: p.expert_id,
                    package_minutes: p.package_minutes,
                    minutes_remaining: p.minutes_remaining,
                    amount: p.amount,
                });
            }
        }
        out.sort_by_key(|p| p.id);
        out
    }

    /// Per-expert settlement: completed minutes at the hourly rate, minus
    /// recorded payouts, due clamped at zero.
    pub async fn earnings(&self) -> Vec<EarningsInfo> {
        let mut out = Vec::with_capacity(self.experts.len());
        for entry in self.experts.iter() {
            let st = entry.value().clone();
            let guard = st.read().await;
            let completed_minutes: i64 = guard
                .sessions
                .iter()
                .filter(|s| s.status == SessionStatus::Completed)
                .map(|s| s.duration_min() as i64)
                .sum();
            let earned = completed_minutes * guard.profile.hourly_rate / 60;
            let paid: i64 = guard.payouts.iter().map(|p| p.amount).sum();
            out.push(EarningsInfo {
                expert_id: guard.profile.id,
                earned,
                paid,
                due: (earned - paid).max(0),
            });
        }
        out.sort_by_key(|e| e.expert_id);
        out
    }
}

fn session_info(expert_id: Ulid, s: &Session) -> SessionInfo {
    SessionInfo {
        id: s.id,
        expert_id,
        purchase_id: s.purchase_id,
        user_id: s.user_id,
        date: s.date,
        start_min: s.start_min,
        end_min: s.end_min,
        status: s.status,
        link: s.link.clone(),
    }
}
