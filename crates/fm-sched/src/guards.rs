//! Churn guard and failure quarantine.
//!
//! Both guards read recent dispatch history for one bead. The churn guard
//! trips on volume (too many dispatches in the last hour); the quarantine
//! trips on consecutive failures. When a quarantine-grade failure streak is
//! present the churn escalation is suppressed in favor of the quarantine
//! event.

use chrono::{DateTime, Duration, Utc};
use fm_core::types::{Bead, BeadType, Dispatch};

pub const CHURN_WINDOW_MINS: i64 = 60;
pub const CHURN_THRESHOLD: usize = 6;
pub const CHURN_BLOCK_MINS: i64 = 20;

pub const QUARANTINE_WINDOW_MINS: i64 = 45;
pub const QUARANTINE_THRESHOLD: usize = 3;
pub const QUARANTINE_LOG_MINS: i64 = 10;

pub fn churn_window() -> Duration {
    Duration::minutes(CHURN_WINDOW_MINS)
}

pub fn quarantine_window() -> Duration {
    Duration::minutes(QUARANTINE_WINDOW_MINS)
}

/// Dispatches inside the churn window that count toward churn.
pub fn churn_count(recent: &[Dispatch]) -> usize {
    recent.iter().filter(|d| d.status.is_churn_relevant()).count()
}

/// Whether the bead has hit the churn threshold.
pub fn churn_tripped(recent: &[Dispatch]) -> bool {
    churn_count(recent) >= CHURN_THRESHOLD
}

/// Length of the most recent consecutive-failure streak. `recent` must be
/// ordered most recent first; non-terminal rows are ignored, and the streak
/// stops at the first terminal dispatch that is not failure-like.
pub fn failure_streak(recent: &[Dispatch]) -> usize {
    let mut streak = 0;
    for d in recent {
        if !d.status.is_terminal() {
            continue;
        }
        if d.status.is_failure_like() {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}

/// Whether the bead's recent history warrants quarantine.
pub fn quarantine_tripped(recent_in_window: &[Dispatch]) -> bool {
    failure_streak(recent_in_window) >= QUARANTINE_THRESHOLD
}

// ---------------------------------------------------------------------------
// Churn escalation bug
// ---------------------------------------------------------------------------

pub fn churn_escalation_title(bead_id: &str, count: usize) -> String {
    format!("Auto: churn guard blocked bead {bead_id} ({count} dispatches/{CHURN_WINDOW_MINS}m)")
}

/// Title prefix the dedupe matches on, count-independent.
pub fn churn_escalation_prefix(bead_id: &str) -> String {
    format!("Auto: churn guard blocked bead {bead_id}")
}

/// An escalation bug already covers this bead when an active bug with the
/// title prefix and a discovery link to the bead exists, or a closed one was
/// active within the churn window. The discovery link may be a typed
/// `discovered-from` dependency or a legacy `depends_on` entry.
pub fn escalation_dup_exists(beads: &[Bead], bead_id: &str, now: DateTime<Utc>) -> bool {
    let prefix = churn_escalation_prefix(bead_id);
    beads.iter().any(|b| {
        if b.bead_type != BeadType::Bug || !b.title.starts_with(&prefix) {
            return false;
        }
        if !b.discovery_targets().contains(&bead_id) {
            return false;
        }
        b.is_active() || now.signed_duration_since(b.inactive_since()) <= churn_window()
    })
}
