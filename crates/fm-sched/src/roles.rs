use fm_core::types::{Bead, BeadType, Role, WorkflowStage};

// ---------------------------------------------------------------------------
// Role inference
// ---------------------------------------------------------------------------

/// What to do with a candidate bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleDecision {
    /// Dispatch under this role.
    Dispatch(Role),
    /// Handled internally (DoD stage) — no dispatch.
    Internal,
    /// Not dispatchable (done, epic, unrecognized).
    Skip,
}

/// Infer the processing role for a bead.
///
/// Stage labels win: the advanced-most `stage:*` label maps through the
/// workflow table, ties broken by highest stage order. Without a stage label,
/// keyword heuristics over the joined lowercase labels decide. Epics are
/// never dispatched.
pub fn infer_role(bead: &Bead) -> RoleDecision {
    if bead.bead_type == BeadType::Epic {
        return RoleDecision::Skip;
    }

    if let Some(stage) = bead.workflow_stage() {
        return stage_decision(stage);
    }

    RoleDecision::Dispatch(keyword_role(&bead.joined_labels_lower()))
}

/// Workflow-stage-driven variant used behind the rollout flag: the persisted
/// stage pointer replaces the label scan.
pub fn infer_role_from_stage(stage: WorkflowStage) -> RoleDecision {
    stage_decision(stage)
}

fn stage_decision(stage: WorkflowStage) -> RoleDecision {
    match stage {
        WorkflowStage::Dod => RoleDecision::Internal,
        WorkflowStage::Done => RoleDecision::Skip,
        other => match other.role() {
            Some(role) => RoleDecision::Dispatch(role),
            None => RoleDecision::Skip,
        },
    }
}

fn keyword_role(labels: &str) -> Role {
    if labels.contains("review") || labels.contains("test") || labels.contains("qa") {
        Role::Reviewer
    } else if labels.contains("deploy") || labels.contains("ops") || labels.contains("ci") {
        Role::Ops
    } else {
        Role::Coder
    }
}
