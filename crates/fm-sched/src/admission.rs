//! Concurrency controller: admission control for capacity-bounded roles and
//! the persisted overflow queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fm_core::clock::Clock;
use fm_core::config::{HealthConfig, LimitsConfig};
use fm_core::store::{Store, StoreResult};
use fm_core::types::{DispatchStatus, OverflowItem, Role};
use tokio::sync::Mutex;
use tracing::{error, warn};

// ---------------------------------------------------------------------------
// Decision & snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed,
    RoleLimit,
    GlobalLimit,
    UnknownRole,
    StateUnavailable,
}

impl AdmissionDecision {
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionDecision::Allowed => "allowed",
            AdmissionDecision::RoleLimit => "role_limit",
            AdmissionDecision::GlobalLimit => "global_limit",
            AdmissionDecision::UnknownRole => "unknown_role",
            AdmissionDecision::StateUnavailable => "state_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub active_coders: usize,
    pub active_reviewers: usize,
    pub active_total: usize,
    pub max_coders: usize,
    pub max_reviewers: usize,
    pub max_total: usize,
    pub queue_depth: usize,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertLevel {
    Warning,
    Critical,
}

const ALERT_SUPPRESS_MINS: i64 = 5;

pub struct ConcurrencyController {
    limits: LimitsConfig,
    health: HealthConfig,
    store: Arc<Store>,
    clock: Clock,
    /// Edge-trigger memo: last alert per (role, level).
    alerts: Mutex<HashMap<(Role, AlertLevel), DateTime<Utc>>>,
}

impl ConcurrencyController {
    pub fn new(limits: LimitsConfig, health: HealthConfig, store: Arc<Store>, clock: Clock) -> Self {
        Self {
            limits,
            health,
            store,
            clock,
            alerts: Mutex::new(HashMap::new()),
        }
    }

    /// Current utilization of the capacity-bounded roles.
    pub async fn snapshot(&self) -> StoreResult<AdmissionSnapshot> {
        let running = self.store.list_by_status(DispatchStatus::Running).await?;
        let active_coders = running
            .iter()
            .filter(|d| Role::from_agent_id(&d.agent_id) == Some(Role::Coder))
            .count();
        let active_reviewers = running
            .iter()
            .filter(|d| Role::from_agent_id(&d.agent_id) == Some(Role::Reviewer))
            .count();
        let queue_depth = self.store.load_overflow().await?.len();
        Ok(AdmissionSnapshot {
            active_coders,
            active_reviewers,
            active_total: active_coders + active_reviewers,
            max_coders: self.limits.max_concurrent_coders,
            max_reviewers: self.limits.max_concurrent_reviewers,
            max_total: self.limits.max_concurrent_total,
            queue_depth,
        })
    }

    /// Admission check for one role. A pure read apart from the alert
    /// timestamps. The global cap is checked before the role cap.
    pub async fn check_admission(&self, role: Role) -> (AdmissionDecision, AdmissionSnapshot) {
        let snapshot = match self.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "admission state unavailable");
                return (AdmissionDecision::StateUnavailable, AdmissionSnapshot::default());
            }
        };

        let decision = decide(&snapshot, role);
        self.maybe_alert(role, &snapshot).await;
        (decision, snapshot)
    }

    /// Queue work denied admission. Idempotent per `(bead, role)`: the queue
    /// id of an already-enqueued pair is returned unchanged.
    pub async fn enqueue(
        &self,
        bead_id: &str,
        project: &str,
        role: Role,
        agent_id: &str,
        priority: i64,
        reason: &str,
    ) -> StoreResult<i64> {
        self.store
            .insert_overflow(
                bead_id,
                project,
                role,
                agent_id,
                priority,
                self.clock.now(),
                reason,
            )
            .await
    }

    /// Dequeue up to `n` items whose role now has capacity, preserving queue
    /// order. Capacity granted earlier in the same call counts against later
    /// items. Items without capacity stay queued with a bumped attempt count.
    pub async fn try_dequeue(&self, n: usize) -> StoreResult<Vec<OverflowItem>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let snapshot = self.snapshot().await?;
        let queue = self.store.load_overflow().await?;

        let mut granted = Vec::new();
        let mut extra_coders = 0;
        let mut extra_reviewers = 0;

        for item in queue {
            if granted.len() == n {
                break;
            }
            let projected = AdmissionSnapshot {
                active_coders: snapshot.active_coders + extra_coders,
                active_reviewers: snapshot.active_reviewers + extra_reviewers,
                active_total: snapshot.active_total + extra_coders + extra_reviewers,
                ..snapshot
            };
            if decide(&projected, item.role) == AdmissionDecision::Allowed {
                match item.role {
                    Role::Coder => extra_coders += 1,
                    Role::Reviewer => extra_reviewers += 1,
                    _ => {}
                }
                self.store.delete_overflow(item.id).await?;
                granted.push(item);
            } else {
                self.store.bump_overflow_attempts(item.id).await?;
            }
        }
        Ok(granted)
    }

    pub async fn queue_depth(&self) -> StoreResult<usize> {
        Ok(self.store.load_overflow().await?.len())
    }

    /// Utilization alerts: suppressed with an empty queue (full utilization
    /// without backlog is healthy), edge-triggered per role within a 5-minute
    /// window.
    async fn maybe_alert(&self, role: Role, snapshot: &AdmissionSnapshot) {
        if snapshot.queue_depth == 0 || snapshot.max_total == 0 {
            return;
        }
        let pct = snapshot.active_total as f64 / snapshot.max_total as f64 * 100.0;
        let level = if pct >= self.health.concurrency_critical_pct {
            AlertLevel::Critical
        } else if pct >= self.health.concurrency_warning_pct {
            AlertLevel::Warning
        } else {
            return;
        };

        let now = self.clock.now();
        let mut alerts = self.alerts.lock().await;
        let recent = alerts
            .get(&(role, level))
            .map(|last| now.signed_duration_since(*last) < Duration::minutes(ALERT_SUPPRESS_MINS))
            .unwrap_or(false);
        if recent {
            return;
        }
        alerts.insert((role, level), now);
        warn!(
            role = %role,
            utilization_pct = pct,
            queue_depth = snapshot.queue_depth,
            level = ?level,
            "concurrency utilization alert"
        );
    }
}

fn decide(snapshot: &AdmissionSnapshot, role: Role) -> AdmissionDecision {
    if snapshot.active_total >= snapshot.max_total {
        return AdmissionDecision::GlobalLimit;
    }
    match role {
        Role::Coder => {
            if snapshot.active_coders >= snapshot.max_coders {
                AdmissionDecision::RoleLimit
            } else {
                AdmissionDecision::Allowed
            }
        }
        Role::Reviewer => {
            if snapshot.active_reviewers >= snapshot.max_reviewers {
                AdmissionDecision::RoleLimit
            } else {
                AdmissionDecision::Allowed
            }
        }
        // Recognized but not capacity-bounded.
        _ => AdmissionDecision::Allowed,
    }
}

/// Admission keyed on an agent id; an unparseable role suffix is reported as
/// such rather than defaulting to a cap.
pub fn role_for_admission(agent_id: &str) -> Result<Role, AdmissionDecision> {
    Role::from_agent_id(agent_id).ok_or(AdmissionDecision::UnknownRole)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fm_core::types::{NewDispatch, Tier};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn controller(max_coders: usize, max_total: usize) -> (ConcurrencyController, Arc<Store>) {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let (clock, _) = Clock::manual(t0());
        let limits = LimitsConfig {
            max_concurrent_coders: max_coders,
            max_concurrent_reviewers: 2,
            max_concurrent_total: max_total,
        };
        let ctrl = ConcurrencyController::new(limits, HealthConfig::default(), store.clone(), clock);
        (ctrl, store)
    }

    async fn running(store: &Store, bead: &str, agent: &str) {
        store
            .record_dispatch(NewDispatch {
                bead_id: bead.into(),
                project: "p1".into(),
                agent_id: agent.into(),
                provider: "standard".into(),
                tier: Tier::Fast,
                pid: None,
                session_name: String::new(),
                prompt: String::new(),
                log_path: None,
                base_branch: None,
                branch: None,
                backend: "headless_cli".into(),
                dispatched_at: t0(),
                retries: 0,
                labels: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn allows_under_caps() {
        let (ctrl, _store) = controller(2, 4).await;
        let (decision, snapshot) = ctrl.check_admission(Role::Coder).await;
        assert_eq!(decision, AdmissionDecision::Allowed);
        assert_eq!(snapshot.active_total, 0);
    }

    #[tokio::test]
    async fn role_limit_hits_before_global() {
        let (ctrl, store) = controller(1, 4).await;
        running(&store, "b-1", "p1-coder").await;
        let (decision, snapshot) = ctrl.check_admission(Role::Coder).await;
        assert_eq!(decision, AdmissionDecision::RoleLimit);
        assert_eq!(snapshot.active_coders, 1);
        // Reviewers still fit.
        let (decision, _) = ctrl.check_admission(Role::Reviewer).await;
        assert_eq!(decision, AdmissionDecision::Allowed);
    }

    #[tokio::test]
    async fn global_limit_wins_over_role_limit() {
        let (ctrl, store) = controller(3, 2).await;
        running(&store, "b-1", "p1-coder").await;
        running(&store, "b-2", "p2-reviewer").await;
        let (decision, _) = ctrl.check_admission(Role::Coder).await;
        assert_eq!(decision, AdmissionDecision::GlobalLimit);
    }

    #[tokio::test]
    async fn uncapped_roles_pass_when_global_has_room() {
        let (ctrl, store) = controller(0, 4).await;
        running(&store, "b-1", "p1-coder").await;
        let (decision, _) = ctrl.check_admission(Role::Planner).await;
        assert_eq!(decision, AdmissionDecision::Allowed);
    }

    #[tokio::test]
    async fn check_admission_is_a_pure_read() {
        let (ctrl, _store) = controller(2, 4).await;
        let (_, before) = ctrl.check_admission(Role::Coder).await;
        let (_, after) = ctrl.check_admission(Role::Coder).await;
        assert_eq!(before, after);
        assert_eq!(ctrl.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_bead_role() {
        let (ctrl, _store) = controller(2, 4).await;
        let a = ctrl
            .enqueue("b-1", "p1", Role::Coder, "p1-coder", 1, "role_limit")
            .await
            .unwrap();
        let b = ctrl
            .enqueue("b-1", "p1", Role::Coder, "p1-coder", 1, "role_limit")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(ctrl.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn try_dequeue_respects_freed_capacity() {
        let (ctrl, _store) = controller(1, 4).await;
        ctrl.enqueue("b-1", "p1", Role::Coder, "p1-coder", 0, "role_limit")
            .await
            .unwrap();
        ctrl.enqueue("b-2", "p1", Role::Coder, "p1-coder", 1, "role_limit")
            .await
            .unwrap();

        // One coder slot free: only the head item comes out.
        let granted = ctrl.try_dequeue(2).await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].bead_id, "b-1");
        assert_eq!(ctrl.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn try_dequeue_skips_saturated_roles() {
        let (ctrl, store) = controller(1, 4).await;
        running(&store, "b-0", "p1-coder").await;
        ctrl.enqueue("b-1", "p1", Role::Coder, "p1-coder", 0, "role_limit")
            .await
            .unwrap();
        ctrl.enqueue("b-2", "p1", Role::Reviewer, "p1-reviewer", 1, "role_limit")
            .await
            .unwrap();

        let granted = ctrl.try_dequeue(2).await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].role, Role::Reviewer);
        // The coder item stays queued with a bumped attempt counter.
        let remaining = store.load_overflow().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].bead_id, "b-1");
        assert_eq!(remaining[0].attempts, 1);
    }

    #[test]
    fn unknown_agent_suffix_is_reported() {
        assert_eq!(
            role_for_admission("p1-chef").unwrap_err(),
            AdmissionDecision::UnknownRole
        );
        assert_eq!(role_for_admission("p1-coder").unwrap(), Role::Coder);
    }
}
