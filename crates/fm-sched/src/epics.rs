//! Epic breakdown synthesis and auto-close.
//!
//! Epics are never dispatched directly. Instead a breakdown task is
//! auto-created per epic on an interval, asking a worker to split the epic
//! into executable beads. Stale breakdowns close themselves once the epic is
//! closed or already has executable children.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use fm_core::types::{Bead, BeadType, WorkflowStage, DEP_DISCOVERED_FROM};

const BREAKDOWN_PREFIX: &str = "Auto: break down epic ";

pub fn breakdown_title(epic_id: &str) -> String {
    format!("{BREAKDOWN_PREFIX}{epic_id} into executable bug/task beads")
}

pub fn breakdown_description(epic: &Bead) -> String {
    format!(
        "Split epic {id} ({title}) into independently executable bug/task \
         beads with estimates and acceptance criteria. Close this task once \
         the children exist.",
        id = epic.id,
        title = epic.title,
    )
}

/// A breakdown task belongs to an epic only when its title carries the epic
/// id. Malformed titles are left alone rather than guessed at.
pub fn is_breakdown_of(bead: &Bead, epic_id: &str) -> bool {
    bead.bead_type == BeadType::Task
        && bead.title.starts_with(BREAKDOWN_PREFIX)
        && bead.title.contains(epic_id)
}

fn is_child_of(bead: &Bead, epic_id: &str) -> bool {
    bead.parent.as_deref() == Some(epic_id)
        || bead
            .dependencies
            .iter()
            .any(|d| d.dep_type == DEP_DISCOVERED_FROM && d.target == epic_id)
}

pub fn epic_has_executable_children(beads: &[Bead], epic_id: &str) -> bool {
    beads
        .iter()
        .any(|b| b.bead_type.is_executable() && is_child_of(b, epic_id) && !is_breakdown_of(b, epic_id))
}

/// Open epics due for a breakdown task: none exists yet (open or in
/// progress), and the per-epic interval has elapsed since the last synthesis.
pub fn epics_to_break_down<'a>(
    beads: &'a [Bead],
    memo: &HashMap<String, DateTime<Utc>>,
    interval_hours: i64,
    now: DateTime<Utc>,
) -> Vec<&'a Bead> {
    beads
        .iter()
        .filter(|b| b.bead_type == BeadType::Epic && b.is_active())
        .filter(|epic| {
            !beads
                .iter()
                .any(|b| b.is_active() && is_breakdown_of(b, &epic.id))
        })
        .filter(|epic| {
            memo.get(&epic.id)
                .map(|last| now.signed_duration_since(*last) >= Duration::hours(interval_hours))
                .unwrap_or(true)
        })
        .collect()
}

/// Breakdown tasks that should auto-close, paired with their epic: the epic
/// is closed, or it is open with executable children while the breakdown sits
/// in `stage:qa`.
pub fn breakdowns_to_auto_close<'a>(beads: &'a [Bead]) -> Vec<(&'a Bead, &'a Bead)> {
    let mut out = Vec::new();
    for epic in beads.iter().filter(|b| b.bead_type == BeadType::Epic) {
        for task in beads
            .iter()
            .filter(|b| b.is_active() && is_breakdown_of(b, &epic.id))
        {
            let epic_closed = !epic.is_active();
            let superseded = epic.is_active()
                && epic_has_executable_children(beads, &epic.id)
                && task.workflow_stage() == Some(WorkflowStage::Qa);
            if epic_closed || superseded {
                out.push((task, epic));
            }
        }
    }
    out
}
