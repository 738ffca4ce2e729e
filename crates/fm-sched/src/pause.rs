//! System-pause decision evaluated before each tick.
//!
//! Two independent triggers halt new dispatch work while reconciliation
//! continues: spend crossing the daily cap (`token_waste`) and aggregated
//! failure-like dispatches crossing the per-window threshold (`churn`).
//! Token-waste takes precedence when both fire.

use chrono::{DateTime, Utc};
use fm_core::config::{CostControlConfig, HealthConfig};
use fm_core::store::{Store, StoreResult};

use crate::guards;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    TokenWaste,
    Churn,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::TokenWaste => "token_waste",
            PauseReason::Churn => "churn",
        }
    }
}

pub async fn decide_system_pause(
    store: &Store,
    cost: &CostControlConfig,
    health: &HealthConfig,
    now: DateTime<Utc>,
) -> StoreResult<Option<PauseReason>> {
    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);
    let spend_today = store.sum_cost_since(day_start).await?;
    if spend_today >= cost.daily_cost_cap_usd {
        return Ok(Some(PauseReason::TokenWaste));
    }

    let failures = store
        .failure_like_count_since(now - guards::churn_window())
        .await?;
    if failures >= health.pause_churn_threshold {
        return Ok(Some(PauseReason::Churn));
    }

    Ok(None)
}
