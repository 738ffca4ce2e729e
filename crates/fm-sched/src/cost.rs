//! Cost-control policy: spark-first routing, per-bead caps, and stage
//! attempt limits.
//!
//! Three layers evaluate in order. The global spark force rewrites tiers
//! rather than blocking; the per-bead cap and the stage attempt limit block
//! dispatch outright.

use fm_core::config::CostControlConfig;
use fm_core::types::{Bead, Role, Tier, WorkflowStage};

// ---------------------------------------------------------------------------
// Inputs & decision
// ---------------------------------------------------------------------------

/// Everything the policy needs, gathered by the scheduler from the store.
#[derive(Debug, Clone)]
pub struct CostInputs<'a> {
    pub bead: &'a Bead,
    pub role: Role,
    /// Tier the complexity detector asked for.
    pub desired: Tier,
    /// Retry count of the dispatch being routed (0 for fresh work).
    pub retries: u32,
    pub retry_escalation_attempt: u32,
    pub weekly_usage_pct: f64,
    pub spend_today_usd: f64,
    pub bead_cost_usd: f64,
    pub stage_attempts: u64,
    /// A stage cooldown set by a previous attempt-limit block is still live.
    pub stage_cooldown_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostBlock {
    PerBeadCap,
    StageAttemptLimit,
    StageCooldown,
}

impl CostBlock {
    pub fn reason(&self) -> &'static str {
        match self {
            CostBlock::PerBeadCap => "per_bead_cost_cap",
            CostBlock::StageAttemptLimit => "stage_attempt_limit",
            CostBlock::StageCooldown => "stage_cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostDecision {
    Proceed(Tier),
    Block(CostBlock),
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

pub fn evaluate(cfg: &CostControlConfig, inp: &CostInputs<'_>) -> CostDecision {
    let spark_forced = inp.weekly_usage_pct >= cfg.force_spark_at_weekly_pct
        || inp.spend_today_usd >= cfg.daily_cost_cap_usd;

    if inp.bead_cost_usd >= cfg.per_bead_cost_cap_usd {
        return CostDecision::Block(CostBlock::PerBeadCap);
    }

    if inp.stage_cooldown_active {
        return CostDecision::Block(CostBlock::StageCooldown);
    }
    if inp.stage_attempts > cfg.per_bead_stage_attempt_limit as u64 {
        return CostDecision::Block(CostBlock::StageAttemptLimit);
    }

    if !spark_forced {
        return CostDecision::Proceed(inp.desired);
    }

    // Spark-first: routine work runs at fast. Retries step up one tier once
    // they hit the escalation attempt; fresh work escalates only on the
    // recognized signals.
    if inp.retries > 0 {
        let tier = if inp.retries >= inp.retry_escalation_attempt {
            Tier::Fast.step_up().unwrap_or(Tier::Fast)
        } else {
            Tier::Fast
        };
        return CostDecision::Proceed(tier);
    }

    if escalation_allowed(cfg, inp) {
        CostDecision::Proceed(inp.desired)
    } else {
        CostDecision::Proceed(Tier::Fast)
    }
}

/// Escalation above `fast` under spark-first routing: a long estimate, a
/// risky review, or a complexity verdict that already said premium.
fn escalation_allowed(cfg: &CostControlConfig, inp: &CostInputs<'_>) -> bool {
    if inp.desired == Tier::Premium {
        return true;
    }
    if inp.bead.estimate_minutes >= cfg.complexity_escalation_minutes
        && inp.bead.estimate_minutes > 0
    {
        return true;
    }
    let reviewing = inp.role == Role::Reviewer
        || inp.bead.workflow_stage() == Some(WorkflowStage::Review);
    if reviewing {
        let labels = inp.bead.joined_labels_lower();
        if cfg
            .risky_review_markers
            .iter()
            .any(|m| labels.contains(&m.to_lowercase()))
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fm_core::types::{BeadStatus, BeadType};

    fn bead(estimate: i64, labels: &[&str]) -> Bead {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Bead {
            id: "b-1".into(),
            title: "t".into(),
            description: String::new(),
            status: BeadStatus::Open,
            bead_type: BeadType::Task,
            priority: 0,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            estimate_minutes: estimate,
            acceptance: None,
            design: None,
            depends_on: vec![],
            parent: None,
            dependencies: vec![],
            created_at: t,
            updated_at: t,
            closed_at: None,
            assignee: None,
        }
    }

    fn inputs<'a>(bead: &'a Bead) -> CostInputs<'a> {
        CostInputs {
            bead,
            role: Role::Coder,
            desired: Tier::Balanced,
            retries: 0,
            retry_escalation_attempt: 2,
            weekly_usage_pct: 0.0,
            spend_today_usd: 0.0,
            bead_cost_usd: 0.0,
            stage_attempts: 0,
            stage_cooldown_active: false,
        }
    }

    #[test]
    fn unconstrained_work_keeps_desired_tier() {
        let b = bead(60, &[]);
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inputs(&b)),
            CostDecision::Proceed(Tier::Balanced)
        );
    }

    #[test]
    fn daily_cap_forces_fast() {
        let cfg = CostControlConfig {
            daily_cost_cap_usd: 1.0,
            ..CostControlConfig::default()
        };
        let b = bead(60, &[]);
        let mut inp = inputs(&b);
        inp.spend_today_usd = 1.5;
        assert_eq!(evaluate(&cfg, &inp), CostDecision::Proceed(Tier::Fast));
    }

    #[test]
    fn weekly_pct_forces_fast() {
        let b = bead(60, &[]);
        let mut inp = inputs(&b);
        inp.weekly_usage_pct = 85.0;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Proceed(Tier::Fast)
        );
    }

    #[test]
    fn long_estimate_escalates_despite_spark() {
        let b = bead(120, &[]);
        let mut inp = inputs(&b);
        inp.weekly_usage_pct = 85.0;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Proceed(Tier::Balanced)
        );
    }

    #[test]
    fn risky_review_escalates_despite_spark() {
        let b = bead(10, &["stage:review", "security"]);
        let mut inp = inputs(&b);
        inp.role = Role::Reviewer;
        inp.weekly_usage_pct = 85.0;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Proceed(Tier::Balanced)
        );
    }

    #[test]
    fn premium_complexity_survives_spark() {
        let b = bead(10, &["architecture"]);
        let mut inp = inputs(&b);
        inp.desired = Tier::Premium;
        inp.weekly_usage_pct = 85.0;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Proceed(Tier::Premium)
        );
    }

    #[test]
    fn early_retry_stays_fast_then_steps_up() {
        let b = bead(10, &[]);
        let mut inp = inputs(&b);
        inp.weekly_usage_pct = 85.0;
        inp.retries = 1;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Proceed(Tier::Fast)
        );
        inp.retries = 2;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Proceed(Tier::Balanced)
        );
    }

    #[test]
    fn per_bead_cap_blocks() {
        let b = bead(10, &[]);
        let mut inp = inputs(&b);
        inp.bead_cost_usd = 10.0;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Block(CostBlock::PerBeadCap)
        );
    }

    #[test]
    fn stage_attempt_limit_blocks_over_limit_only() {
        let b = bead(10, &[]);
        let mut inp = inputs(&b);
        inp.stage_attempts = 4;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Proceed(Tier::Balanced)
        );
        inp.stage_attempts = 5;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Block(CostBlock::StageAttemptLimit)
        );
    }

    #[test]
    fn live_stage_cooldown_blocks() {
        let b = bead(10, &[]);
        let mut inp = inputs(&b);
        inp.stage_cooldown_active = true;
        assert_eq!(
            evaluate(&CostControlConfig::default(), &inp),
            CostDecision::Block(CostBlock::StageCooldown)
        );
    }
}
