use chrono::NaiveDate;

use crate::model::*;
use crate::timeutil::overlaps;

// ── Slot Computation ─────────────────────────────────────────────

/// Candidate windows for a date. One explicit precedence chain:
/// manual windows replace everything; an override replaces the defaults
/// (field by field, non-workday closes the day); otherwise the defaults.
pub fn day_windows(state: &ExpertState, date: NaiveDate) -> Vec<(Minute, Minute)> {
    let manual = state.windows_for(date);
    if !manual.is_empty() {
        return manual.iter().map(|w| (w.start_min, w.end_min)).collect();
    }
    if let Some(ov) = state.override_for(date) {
        if !ov.workday {
            return Vec::new();
        }
        let start = ov.day_start.unwrap_or(state.profile.day_start);
        let end = ov.day_end.unwrap_or(state.profile.day_end);
        return vec![(start, end)];
    }
    vec![(state.profile.day_start, state.profile.day_end)]
}

/// The 30-minute slots still open on a date: slice each candidate window
/// into consecutive slots (a trailing remainder under 30 minutes is
/// dropped), drop any slot overlapping a non-cancelled session, sort by
/// start. Overlapping manual windows may produce the same slot twice —
/// both copies are kept.
pub fn bookable_slots(state: &ExpertState, date: NaiveDate) -> Vec<SlotInfo> {
    let taken: Vec<(Minute, Minute)> = state
        .sessions_on(date)
        .iter()
        .filter(|s| s.is_active())
        .map(|s| (s.start_min, s.end_min))
        .collect();

    let mut out = Vec::new();
    for (w_start, w_end) in day_windows(state, date) {
        let mut cur = w_start;
        while cur + SLOT_MIN <= w_end {
            let free = !taken
                .iter()
                .any(|&(s, e)| overlaps(cur, cur + SLOT_MIN, s, e));
            if free {
                out.push(SlotInfo {
                    start_min: cur,
                    end_min: cur + SLOT_MIN,
                });
            }
            cur += SLOT_MIN;
        }
    }
    out.sort_by_key(|s| s.start_min);
    out
}
