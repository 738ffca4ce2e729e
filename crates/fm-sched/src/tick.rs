//! The tick engine: one `run_tick` call reconciles running dispatches,
//! processes retries, sweeps health, and turns ready beads into supervised
//! dispatches under every guard.
//!
//! A tick never runs concurrently with itself (one driver task owns it) and
//! holds no durable state of its own — the store is the source of truth, and
//! the only cross-tick memory is the anti-log-spam memos behind the
//! scheduler's mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fm_beads::{BeadService, CreateBead, DependencyIndex};
use fm_core::clock::Clock;
use fm_core::config::{Config, ProjectConfig, ProviderConfig};
use fm_core::lease::LeaseFile;
use fm_core::store::{Store, StoreResult};
use fm_core::types::{
    agent_id, health_events, Bead, BeadType, Dispatch, DispatchStage, DispatchStatus,
    LifecycleEvent, LifecycleKind, NewDispatch, Role, Tier, WorkflowStage,
};
use fm_session::tmux::TmuxBackend;
use fm_session::{BackendRegistry, WorkerBackend};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionDecision, ConcurrencyController};
use crate::complexity::detect_complexity;
use crate::cost::{self, CostBlock, CostDecision, CostInputs};
use crate::dod;
use crate::epics;
use crate::guards;
use crate::limiter::ProviderPicker;
use crate::night;
use crate::notifier::LifecycleNotifier;
use crate::pause::{self, PauseReason};
use crate::prompt::build_prompt;
use crate::retry::{retry_verdict, RetryVerdict};
use crate::review_merge::{MergePass, PullRequestHost};
use crate::roles::{infer_role, infer_role_from_stage, RoleDecision};
use crate::shutdown::ShutdownSignal;
use crate::supervisor::{event_for, stage_from_labels, ReconcileReport, Supervisor};

const CLAIM_TTL_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Ceremony hook
// ---------------------------------------------------------------------------

/// External cadence subsystem (sprint planning, review, retro). The tick only
/// drains it; ceremony content lives elsewhere.
#[async_trait]
pub trait CeremonyHook: Send + Sync {
    async fn run_ceremonies(&self) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Memos — bounded in-memory anti-spam state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Memos {
    /// bead -> blocked until
    churn_block: HashMap<String, DateTime<Utc>>,
    /// bead -> last quarantine event
    quarantine_logged: HashMap<String, DateTime<Utc>>,
    /// epic -> last breakdown synthesis
    epic_breakup: HashMap<String, DateTime<Utc>>,
    /// (project, bead, role, stage, reason) -> last block log
    dispatch_block_log: HashMap<String, DateTime<Utc>>,
    /// "bead:role" -> cooldown until
    stage_cooldown: HashMap<String, DateTime<Utc>>,
    /// dispatch ids already flagged stuck
    stuck_logged: HashSet<i64>,
}

// ---------------------------------------------------------------------------
// Tick report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub pause: Option<&'static str>,
    pub lease_lost: bool,
    pub reconcile: ReconcileReport,
    pub retries_dispatched: usize,
    pub dispatched: usize,
    pub overflow_dispatched: usize,
    pub deferred: usize,
    pub blocked: usize,
    pub store_error: bool,
}

impl TickReport {
    pub fn total_dispatched(&self) -> usize {
        self.retries_dispatched + self.dispatched + self.overflow_dispatched
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    cfg: Config,
    store: Arc<Store>,
    clock: Clock,
    beads: Arc<dyn BeadService>,
    backends: Arc<BackendRegistry>,
    picker: ProviderPicker,
    admission: ConcurrencyController,
    supervisor: Supervisor,
    notifier: Arc<LifecycleNotifier>,
    ceremonies: Option<Arc<dyn CeremonyHook>>,
    pr_host: Option<Arc<dyn PullRequestHost>>,
    merge_pass: Option<MergePass>,
    /// The concrete tmux backend, kept alongside the registry for the
    /// session-enumeration sweeps only it can answer.
    tmux: Option<Arc<TmuxBackend>>,
    lease: Option<Arc<LeaseFile>>,
    shutdown: ShutdownSignal,
    memos: Mutex<Memos>,
}

/// Everything the scheduler is built from; the daemon wires this up once.
pub struct SchedulerParts {
    pub cfg: Config,
    pub store: Arc<Store>,
    pub clock: Clock,
    pub beads: Arc<dyn BeadService>,
    pub backends: Arc<BackendRegistry>,
    pub notifier: Arc<LifecycleNotifier>,
    pub ceremonies: Option<Arc<dyn CeremonyHook>>,
    pub pr_host: Option<Arc<dyn PullRequestHost>>,
    pub tmux: Option<Arc<TmuxBackend>>,
    pub lease: Option<Arc<LeaseFile>>,
    pub shutdown: ShutdownSignal,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts) -> Self {
        let picker = ProviderPicker::new(parts.cfg.providers.clone(), parts.cfg.rate.clone());
        let admission = ConcurrencyController::new(
            parts.cfg.limits.clone(),
            parts.cfg.health.clone(),
            parts.store.clone(),
            parts.clock.clone(),
        );
        let supervisor = Supervisor::new(
            parts.store.clone(),
            parts.backends.clone(),
            parts.beads.clone(),
            parts.notifier.clone(),
            parts.cfg.projects.clone(),
            parts.cfg.retry.clone(),
            parts.clock.clone(),
        );
        let merge_pass = parts
            .pr_host
            .clone()
            .map(|host| MergePass::new(host, parts.beads.clone()));
        Self {
            cfg: parts.cfg,
            store: parts.store,
            clock: parts.clock,
            beads: parts.beads,
            backends: parts.backends,
            picker,
            admission,
            supervisor,
            notifier: parts.notifier,
            ceremonies: parts.ceremonies,
            pr_host: parts.pr_host,
            merge_pass,
            tmux: parts.tmux,
            lease: parts.lease,
            shutdown: parts.shutdown,
            memos: Mutex::new(Memos::default()),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn admission(&self) -> &ConcurrencyController {
        &self.admission
    }

    /// One atomic logical step of the orchestrator.
    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = self.clock.now();

        // --- Phase 1: pause / leader check ---
        if let Some(lease) = &self.lease {
            if let Err(e) = lease.renew(now) {
                warn!(error = %e, "leader lease refresh failed, passive tick");
                report.lease_lost = true;
                return report;
            }
        }

        let mut dispatch_allowed = !self.cfg.scheduler.paused;
        if self.cfg.scheduler.paused {
            report.pause = Some("operator");
        } else {
            match pause::decide_system_pause(&self.store, &self.cfg.cost_control, &self.cfg.health, now)
                .await
            {
                Ok(Some(reason)) => {
                    info!(reason = reason.as_str(), "system pause active");
                    self.log_system_pause(reason, now).await;
                    report.pause = Some(reason.as_str());
                    dispatch_allowed = false;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "system pause decision failed, aborting tick");
                    report.store_error = true;
                    return report;
                }
            }
        }

        // --- Phase 2: reconcile running dispatches ---
        match self.supervisor.reconcile().await {
            Ok(r) => report.reconcile = r,
            Err(e) => {
                error!(error = %e, "reconcile failed, aborting tick");
                report.store_error = true;
                return report;
            }
        }
        if self.shutdown.is_shutting_down() {
            return report;
        }

        let budget = self.cfg.scheduler.max_per_tick;

        // --- Phase 3: pending retries ---
        if dispatch_allowed {
            match self.process_retries(budget, now).await {
                Ok(n) => report.retries_dispatched = n,
                Err(e) => {
                    error!(error = %e, "retry pass failed, aborting tick");
                    report.store_error = true;
                    return report;
                }
            }
        }
        if self.shutdown.is_shutting_down() {
            return report;
        }

        // --- Phase 4: health sweep ---
        if let Err(e) = self.health_sweep(now).await {
            warn!(error = %e, "health sweep failed");
        }

        // --- Phase 5: ready-set assembly ---
        let project_beads = self.assemble_ready_sets(now).await;

        // --- Phase 6/7: candidate iteration + overflow dequeue ---
        if dispatch_allowed {
            let remaining = budget.saturating_sub(report.retries_dispatched);
            let (fresh, deferred, blocked) = self
                .dispatch_candidates(&project_beads, remaining, now)
                .await;
            report.dispatched = fresh;
            report.deferred = deferred;
            report.blocked = blocked;

            let remaining = remaining.saturating_sub(fresh);
            report.overflow_dispatched = self
                .drain_overflow(&project_beads, remaining, now)
                .await;
        }

        // --- Phase 8: ceremony sweep ---
        if let Some(hook) = &self.ceremonies {
            if let Err(e) = hook.run_ceremonies().await {
                warn!(error = %e, "ceremony sweep failed");
            }
        }

        // --- Phase 9: merge pass + DoD sweep ---
        self.merge_sweep(&project_beads).await;
        self.dod_sweep(&project_beads).await;

        info!(
            dispatched = report.dispatched,
            retries = report.retries_dispatched,
            overflow = report.overflow_dispatched,
            still_running = report.reconcile.still_running,
            pause = ?report.pause,
            "tick finished"
        );
        report
    }

    // -----------------------------------------------------------------------
    // Phase 3: retries
    // -----------------------------------------------------------------------

    async fn process_retries(&self, budget: usize, now: DateTime<Utc>) -> StoreResult<usize> {
        let pending = self.store.list_by_status(DispatchStatus::PendingRetry).await?;
        let mut dispatched = 0;

        for old in pending {
            if dispatched >= budget || self.shutdown.is_shutting_down() {
                break;
            }
            match retry_verdict(&old, &self.cfg.retry, now) {
                RetryVerdict::NotYet => continue,
                RetryVerdict::Exhausted => {
                    self.store
                        .complete_dispatch(
                            old.id,
                            DispatchStatus::Failed,
                            DispatchStage::Failed,
                            now,
                            old.exit_code,
                            old.duration_s,
                        )
                        .await?;
                    self.store
                        .append_health_event(
                            health_events::RETRY_EXHAUSTED,
                            &format!("dispatch {} exhausted its retry budget", old.id),
                            Some(old.id),
                            Some(&old.bead_id),
                            now,
                        )
                        .await?;
                    self.notifier
                        .emit(event_for(&old, LifecycleKind::DispatchFailed, None))
                        .await;
                }
                RetryVerdict::Go => {
                    let Some(project) = self.cfg.project(&old.project).filter(|p| p.enabled)
                    else {
                        continue;
                    };
                    if self.store.has_running_dispatch(&old.bead_id).await? {
                        continue;
                    }
                    if self.store.running_for_agent(&old.agent_id).await?.is_some() {
                        continue;
                    }

                    let retries = old.retries + 1;
                    let tier = match self.retry_tier(&old, retries, now).await? {
                        Some(tier) => tier,
                        None => continue,
                    };
                    let role = Role::from_agent_id(&old.agent_id).unwrap_or(Role::Coder);
                    let Some(provider) = self.picker.pick(&self.store, tier, role, now).await?
                    else {
                        debug!(bead_id = %old.bead_id, "no provider budget for retry, deferring");
                        continue;
                    };

                    match self
                        .launch(
                            project,
                            &old.bead_id,
                            &old.agent_id,
                            &provider,
                            tier,
                            old.prompt.clone(),
                            old.branch.clone(),
                            old.labels.clone(),
                            retries,
                            now,
                        )
                        .await
                    {
                        Ok(new_id) => {
                            self.store.mark_retried(old.id).await?;
                            dispatched += 1;
                            info!(
                                old_dispatch = old.id,
                                new_dispatch = new_id,
                                bead_id = %old.bead_id,
                                retries,
                                "dispatch retried"
                            );
                            if let Ok(Some(new_row)) = self.store.get_dispatch(new_id).await {
                                self.notifier
                                    .emit(event_for(&new_row, LifecycleKind::DispatchRetried, None))
                                    .await;
                            }
                        }
                        Err(e) => {
                            warn!(bead_id = %old.bead_id, error = %e, "retry launch failed");
                        }
                    }
                }
            }
        }
        Ok(dispatched)
    }

    /// Tier for a retry: the original tier, run through cost control with the
    /// bumped retry count. `None` means blocked.
    async fn retry_tier(
        &self,
        old: &Dispatch,
        retries: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Tier>> {
        // Cost control needs a bead-shaped view; labels were snapshotted at
        // dispatch time.
        let bead = Bead {
            id: old.bead_id.clone(),
            title: String::new(),
            description: String::new(),
            status: fm_core::types::BeadStatus::Open,
            bead_type: BeadType::Task,
            priority: 0,
            labels: old.labels.clone(),
            estimate_minutes: 0,
            acceptance: None,
            design: None,
            depends_on: vec![],
            parent: None,
            dependencies: vec![],
            created_at: old.dispatched_at,
            updated_at: old.dispatched_at,
            closed_at: None,
            assignee: None,
        };
        let role = Role::from_agent_id(&old.agent_id).unwrap_or(Role::Coder);
        match self.cost_decision(&bead, role, old.tier, retries, now).await? {
            CostDecision::Proceed(tier) => Ok(Some(tier)),
            CostDecision::Block(block) => {
                self.log_cost_block(&old.project, &bead, role, block, now).await;
                Ok(None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 4: health sweep
    // -----------------------------------------------------------------------

    async fn health_sweep(&self, now: DateTime<Utc>) -> StoreResult<()> {
        let running = self.store.list_by_status(DispatchStatus::Running).await?;
        let stuck_cutoff = now - Duration::minutes(self.cfg.scheduler.stuck_timeout_mins);

        let mut memos = self.memos.lock().await;
        for d in &running {
            if d.dispatched_at < stuck_cutoff && memos.stuck_logged.insert(d.id) {
                warn!(
                    dispatch_id = d.id,
                    bead_id = %d.bead_id,
                    dispatched_at = %d.dispatched_at,
                    "dispatch stuck past timeout"
                );
                self.store
                    .append_health_event(
                        health_events::DISPATCH_STUCK,
                        &format!(
                            "dispatch {} for bead {} running since {}",
                            d.id, d.bead_id, d.dispatched_at
                        ),
                        Some(d.id),
                        Some(&d.bead_id),
                        now,
                    )
                    .await?;
            }
        }
        drop(memos);

        // Zombie sessions: live tmux sessions with our prefix but no store row.
        if let Some(tmux) = &self.tmux {
            let known: HashSet<&str> = running
                .iter()
                .map(|d| d.session_name.as_str())
                .filter(|s| !s.is_empty())
                .collect();
            if let Ok(sessions) = tmux.list_sessions().await {
                for session in sessions {
                    if !known.contains(session.as_str()) {
                        warn!(session = %session, "killing zombie worker session");
                        tmux.kill_session(&session).await.ok();
                        self.store
                            .append_health_event(
                                health_events::ZOMBIE_SESSION_KILLED,
                                &format!("zombie session {session} had no dispatch row"),
                                None,
                                None,
                                now,
                            )
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase 5: ready-set assembly
    // -----------------------------------------------------------------------

    async fn assemble_ready_sets(&self, now: DateTime<Utc>) -> Vec<(String, Vec<Bead>)> {
        let mut out = Vec::new();
        for project in self.cfg.enabled_projects() {
            match self.beads.list(&project.beads_dir).await {
                Ok(beads) => {
                    self.synthesize_epics(project, &beads, now).await;
                    self.auto_close_breakdowns(project, &beads, now).await;
                    out.push((project.id.clone(), beads));
                }
                Err(e) => {
                    warn!(project = %project.id, error = %e, "bead list failed, skipping project");
                }
            }
        }
        out
    }

    async fn synthesize_epics(
        &self,
        project: &ProjectConfig,
        beads: &[Bead],
        now: DateTime<Utc>,
    ) {
        let due: Vec<(String, String, String)> = {
            let memos = self.memos.lock().await;
            epics::epics_to_break_down(
                beads,
                &memos.epic_breakup,
                self.cfg.scheduler.epic_breakdown_interval_hours,
                now,
            )
            .iter()
            .map(|epic| {
                (
                    epic.id.clone(),
                    epics::breakdown_title(&epic.id),
                    epics::breakdown_description(epic),
                )
            })
            .collect()
        };

        for (epic_id, title, description) in due {
            let req = CreateBead {
                title,
                bead_type: BeadType::Task,
                priority: 1,
                description,
                deps: vec![format!("discovered-from:{epic_id}")],
            };
            match self.beads.create(&project.beads_dir, req).await {
                Ok(id) => {
                    info!(epic_id = %epic_id, breakdown = %id, "epic breakdown task created");
                    self.memos
                        .lock()
                        .await
                        .epic_breakup
                        .insert(epic_id.clone(), now);
                }
                Err(e) => warn!(epic_id = %epic_id, error = %e, "breakdown creation failed"),
            }
        }
    }

    async fn auto_close_breakdowns(
        &self,
        project: &ProjectConfig,
        beads: &[Bead],
        now: DateTime<Utc>,
    ) {
        for (task, epic) in epics::breakdowns_to_auto_close(beads) {
            match self
                .beads
                .close(&project.beads_dir, &task.id, Some("epic breakdown superseded"))
                .await
            {
                Ok(()) => {
                    info!(task_id = %task.id, epic_id = %epic.id, "stale epic breakdown closed");
                    self.store
                        .append_health_event(
                            health_events::EPIC_BREAKDOWN_AUTO_CLOSED,
                            &format!("breakdown {} auto-closed for epic {}", task.id, epic.id),
                            None,
                            Some(&task.id),
                            now,
                        )
                        .await
                        .ok();
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "breakdown auto-close failed"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 6: candidate iteration
    // -----------------------------------------------------------------------

    async fn dispatch_candidates(
        &self,
        project_beads: &[(String, Vec<Bead>)],
        budget: usize,
        now: DateTime<Utc>,
    ) -> (usize, usize, usize) {
        let mut dispatched = 0;
        let mut deferred = 0;
        let mut blocked = 0;
        if budget == 0 {
            return (0, 0, 0);
        }

        let index = DependencyIndex::build(project_beads);

        for (project_id, beads) in project_beads {
            let Some(project) = self.cfg.project(project_id) else {
                continue;
            };
            let mut candidates: Vec<&Bead> = beads
                .iter()
                .filter(|b| b.status == fm_core::types::BeadStatus::Open)
                .filter(|b| index.is_ready(project_id, b))
                .collect();
            candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

            for bead in candidates {
                if dispatched >= budget || self.shutdown.is_shutting_down() {
                    return (dispatched, deferred, blocked);
                }
                let bead = match self.beads.enrich(&project.beads_dir, &bead.id).await {
                    Ok(enriched) => enriched,
                    Err(_) => bead.clone(),
                };
                match self
                    .consider_candidate(project, &bead, beads, true, now)
                    .await
                {
                    CandidateOutcome::Dispatched => dispatched += 1,
                    CandidateOutcome::Deferred => deferred += 1,
                    CandidateOutcome::Blocked => blocked += 1,
                    CandidateOutcome::Skipped => {}
                }
            }
        }
        (dispatched, deferred, blocked)
    }

    async fn consider_candidate(
        &self,
        project: &ProjectConfig,
        bead: &Bead,
        project_bead_set: &[Bead],
        allow_enqueue: bool,
        now: DateTime<Utc>,
    ) -> CandidateOutcome {
        // 1. Night mode.
        if self.cfg.scheduler.night_mode {
            let hour = night::local_hour(now, self.cfg.scheduler.local_utc_offset_mins);
            if night::night_blocks(bead.bead_type, hour) {
                debug!(bead_id = %bead.id, hour, "deferred by night mode");
                return CandidateOutcome::Deferred;
            }
        }

        // 2. Already dispatched.
        if bead.is_ceremony() {
            match self.ceremony_already_running(&bead.id).await {
                Ok(true) => return CandidateOutcome::Skipped,
                Ok(false) => {}
                Err(_) => return CandidateOutcome::Skipped,
            }
        }
        match self.store.has_active_dispatch(&bead.id).await {
            Ok(true) => return CandidateOutcome::Skipped,
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "active-dispatch check failed");
                return CandidateOutcome::Skipped;
            }
        }

        // 3. Churn guard.
        match self.churn_gate(project, bead, project_bead_set, now).await {
            Ok(true) => return CandidateOutcome::Blocked,
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "churn guard failed");
                return CandidateOutcome::Skipped;
            }
        }

        // 4. Role inference.
        let decision = if self.cfg.scheduler.workflow_execution {
            match self.store.get_bead_stage(&project.id, &bead.id).await {
                Ok(Some(stage)) => infer_role_from_stage(stage),
                _ => infer_role(bead),
            }
        } else {
            infer_role(bead)
        };
        let role = match decision {
            RoleDecision::Dispatch(role) => role,
            RoleDecision::Internal | RoleDecision::Skip => return CandidateOutcome::Skipped,
        };
        let agent = agent_id(&project.id, role);

        // 5. Cooldown.
        let cooldown_start = now - Duration::minutes(self.cfg.scheduler.dispatch_cooldown_mins);
        match self.store.completed_since(&bead.id, &agent, cooldown_start).await {
            Ok(true) => {
                debug!(bead_id = %bead.id, agent = %agent, "in dispatch cooldown");
                return CandidateOutcome::Deferred;
            }
            Ok(false) => {}
            Err(_) => return CandidateOutcome::Skipped,
        }

        // 6. Failure quarantine.
        match self.quarantine_gate(bead, now).await {
            Ok(true) => return CandidateOutcome::Blocked,
            Ok(false) => {}
            Err(_) => return CandidateOutcome::Skipped,
        }

        // 7. Structure gate.
        if role.is_capacity_bounded() {
            let failures = dod::structure_failures(bead, project);
            if !failures.is_empty() {
                debug!(bead_id = %bead.id, ?failures, "rejected by structure gate");
                return CandidateOutcome::Blocked;
            }
        }

        // 8. Agent busy (store row, then live backend session).
        match self.store.running_for_agent(&agent).await {
            Ok(Some(_)) => return CandidateOutcome::Deferred,
            Ok(None) => {}
            Err(_) => return CandidateOutcome::Skipped,
        }
        if self.agent_has_live_session(&agent).await {
            debug!(agent = %agent, "live session without store row, deferring");
            return CandidateOutcome::Deferred;
        }

        // 9. Admission control.
        if role.is_capacity_bounded() {
            let (decision, snapshot) = self.admission.check_admission(role).await;
            match decision {
                AdmissionDecision::Allowed => {}
                AdmissionDecision::RoleLimit | AdmissionDecision::GlobalLimit => {
                    if allow_enqueue {
                        if let Err(e) = self
                            .admission
                            .enqueue(
                                &bead.id,
                                &project.id,
                                role,
                                &agent,
                                bead.priority,
                                decision.reason(),
                            )
                            .await
                        {
                            warn!(error = %e, "overflow enqueue failed");
                        }
                        self.store
                            .append_health_event(
                                health_events::CAPACITY_DENY,
                                &format!(
                                    "bead {} denied: {} (coders {}/{}, reviewers {}/{}, total {}/{})",
                                    bead.id,
                                    decision.reason(),
                                    snapshot.active_coders,
                                    snapshot.max_coders,
                                    snapshot.active_reviewers,
                                    snapshot.max_reviewers,
                                    snapshot.active_total,
                                    snapshot.max_total,
                                ),
                                None,
                                Some(&bead.id),
                                now,
                            )
                            .await
                            .ok();
                    }
                    return CandidateOutcome::Deferred;
                }
                AdmissionDecision::UnknownRole | AdmissionDecision::StateUnavailable => {
                    return CandidateOutcome::Skipped;
                }
            }
        }

        // 10. Complexity + cost control.
        let desired = detect_complexity(bead);
        let tier = match self.cost_decision(bead, role, desired, 0, now).await {
            Ok(CostDecision::Proceed(tier)) => tier,
            Ok(CostDecision::Block(block)) => {
                self.log_cost_block(&project.id, bead, role, block, now).await;
                return CandidateOutcome::Blocked;
            }
            Err(_) => return CandidateOutcome::Skipped,
        };

        // 11. Provider pick.
        let provider = match self.picker.pick(&self.store, tier, role, now).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                debug!(bead_id = %bead.id, tier = %tier, "no provider budget, deferring");
                return CandidateOutcome::Deferred;
            }
            Err(_) => return CandidateOutcome::Skipped,
        };

        // 12. Claim ownership.
        match self
            .beads
            .claim(&project.beads_dir, &bead.id, &agent, CLAIM_TTL_SECS)
            .await
        {
            Ok(true) => {
                self.store.upsert_claim(&bead.id, &agent, now).await.ok();
            }
            Ok(false) => {
                debug!(bead_id = %bead.id, "claim contended, skipping");
                return CandidateOutcome::Skipped;
            }
            Err(e) => {
                warn!(bead_id = %bead.id, error = %e, "claim failed");
                return CandidateOutcome::Skipped;
            }
        }

        // 13. Prompt (with reviewer PR diff under branch workflow).
        let branch = project
            .branch_workflow
            .then(|| format!("feature/{}", bead.id));
        let pr_diff = if role == Role::Reviewer && project.branch_workflow {
            self.fetch_pr_diff(project, branch.as_deref().unwrap_or_default())
                .await
        } else {
            None
        };
        let prompt = build_prompt(role, bead, project, pr_diff.as_deref());

        // 14-16. Dispatch, record, notify.
        match self
            .launch(
                project,
                &bead.id,
                &agent,
                &provider,
                provider.tier,
                prompt,
                branch,
                bead.labels.clone(),
                0,
                now,
            )
            .await
        {
            Ok(id) => {
                info!(
                    dispatch_id = id,
                    bead_id = %bead.id,
                    agent = %agent,
                    provider = %provider.name,
                    tier = %provider.tier,
                    "dispatch started"
                );
                CandidateOutcome::Dispatched
            }
            Err(e) => {
                warn!(bead_id = %bead.id, error = %e, "dispatch failed");
                self.beads
                    .release_claim(&project.beads_dir, &bead.id, &agent)
                    .await
                    .ok();
                self.store.release_claim(&bead.id).await.ok();
                CandidateOutcome::Skipped
            }
        }
    }

    /// Live-session check straight at the backend, independent of store rows.
    async fn agent_has_live_session(&self, agent: &str) -> bool {
        let Some(tmux) = &self.tmux else {
            return false;
        };
        let needle = format!("-{agent}-");
        match tmux.list_sessions().await {
            Ok(sessions) => sessions.iter().any(|s| s.contains(&needle)),
            Err(_) => false,
        }
    }

    /// Ceremony beads are deduplicated exclusively by their `ceremony-` id
    /// prefix against the running set.
    async fn ceremony_already_running(&self, bead_id: &str) -> StoreResult<bool> {
        let running = self.store.list_by_status(DispatchStatus::Running).await?;
        Ok(running
            .iter()
            .any(|d| d.bead_id.eq_ignore_ascii_case(bead_id)))
    }

    async fn fetch_pr_diff(&self, project: &ProjectConfig, branch: &str) -> Option<String> {
        let host = self.pr_host.as_ref()?;
        let pr = host.pr_for_branch(&project.id, branch).await.ok()??;
        host.diff(&project.id, pr.number).await.ok()
    }

    // -----------------------------------------------------------------------
    // Guard helpers
    // -----------------------------------------------------------------------

    /// Returns true when the bead is churn-blocked this tick.
    async fn churn_gate(
        &self,
        project: &ProjectConfig,
        bead: &Bead,
        project_bead_set: &[Bead],
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        {
            let mut memos = self.memos.lock().await;
            if let Some(until) = memos.churn_block.get(&bead.id) {
                if *until > now {
                    return Ok(true);
                }
                memos.churn_block.remove(&bead.id);
            }
        }

        let recent = self
            .store
            .dispatches_for_bead_since(&bead.id, now - guards::churn_window())
            .await?;
        if !guards::churn_tripped(&recent) {
            return Ok(false);
        }

        let count = guards::churn_count(&recent);
        self.memos
            .lock()
            .await
            .churn_block
            .insert(bead.id.clone(), now + Duration::minutes(guards::CHURN_BLOCK_MINS));

        // A quarantine-grade failure streak supersedes the churn escalation.
        let in_quarantine_window: Vec<Dispatch> = recent
            .iter()
            .filter(|d| d.dispatched_at >= now - guards::quarantine_window())
            .cloned()
            .collect();
        if guards::quarantine_tripped(&in_quarantine_window) {
            self.emit_quarantine_event(&bead.id, now).await;
            return Ok(true);
        }

        warn!(bead_id = %bead.id, count, "churn guard blocked bead");
        self.store
            .append_health_event(
                health_events::BEAD_CHURN_BLOCKED,
                &format!("bead {} blocked after {count} dispatches in the last hour", bead.id),
                None,
                Some(&bead.id),
                now,
            )
            .await?;

        if !guards::escalation_dup_exists(project_bead_set, &bead.id, now) {
            let req = CreateBead {
                title: guards::churn_escalation_title(&bead.id, count),
                bead_type: BeadType::Bug,
                priority: 1,
                description: format!(
                    "The churn guard blocked bead {} after {count} dispatches inside \
                     {} minutes. Investigate why the work keeps bouncing.",
                    bead.id,
                    guards::CHURN_WINDOW_MINS,
                ),
                deps: vec![format!("discovered-from:{}", bead.id)],
            };
            match self.beads.create(&project.beads_dir, req).await {
                Ok(id) => info!(bead_id = %bead.id, escalation = %id, "churn escalation bug created"),
                Err(e) => warn!(bead_id = %bead.id, error = %e, "escalation bug creation failed"),
            }
        }
        Ok(true)
    }

    /// Returns true when the bead is quarantined.
    async fn quarantine_gate(&self, bead: &Bead, now: DateTime<Utc>) -> StoreResult<bool> {
        let recent = self
            .store
            .dispatches_for_bead_since(&bead.id, now - guards::quarantine_window())
            .await?;
        if !guards::quarantine_tripped(&recent) {
            return Ok(false);
        }
        self.emit_quarantine_event(&bead.id, now).await;
        Ok(true)
    }

    /// One `bead_quarantined` event per bead per 10 minutes.
    async fn emit_quarantine_event(&self, bead_id: &str, now: DateTime<Utc>) {
        {
            let mut memos = self.memos.lock().await;
            let recent = memos
                .quarantine_logged
                .get(bead_id)
                .map(|last| now.signed_duration_since(*last)
                    < Duration::minutes(guards::QUARANTINE_LOG_MINS))
                .unwrap_or(false);
            if recent {
                return;
            }
            memos.quarantine_logged.insert(bead_id.to_string(), now);
        }
        warn!(bead_id, "bead quarantined after consecutive failures");
        self.store
            .append_health_event(
                health_events::BEAD_QUARANTINED,
                &format!("bead {bead_id} quarantined after consecutive failures"),
                None,
                Some(bead_id),
                now,
            )
            .await
            .ok();
    }

    // -----------------------------------------------------------------------
    // Cost helpers
    // -----------------------------------------------------------------------

    async fn cost_decision(
        &self,
        bead: &Bead,
        role: Role,
        desired: Tier,
        retries: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<CostDecision> {
        let weekly_usage_pct = self.picker.weekly_usage_pct(&self.store, now).await?;
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        let spend_today_usd = self.store.sum_cost_since(day_start).await?;
        let bead_cost_usd = self.store.sum_cost_for_bead(&bead.id).await?;
        let window_start =
            now - Duration::minutes(self.cfg.cost_control.stage_attempt_window_mins);
        let stage_attempts = self
            .store
            .stage_attempts_since(&bead.id, role, window_start)
            .await?;
        let stage_cooldown_active = {
            let mut memos = self.memos.lock().await;
            let key = stage_key(&bead.id, role);
            match memos.stage_cooldown.get(&key) {
                Some(until) if *until > now => true,
                Some(_) => {
                    memos.stage_cooldown.remove(&key);
                    false
                }
                None => false,
            }
        };

        let decision = cost::evaluate(
            &self.cfg.cost_control,
            &CostInputs {
                bead,
                role,
                desired,
                retries,
                retry_escalation_attempt: self.cfg.retry.escalation_attempt,
                weekly_usage_pct,
                spend_today_usd,
                bead_cost_usd,
                stage_attempts,
                stage_cooldown_active,
            },
        );

        if decision == CostDecision::Block(CostBlock::StageAttemptLimit) {
            self.memos.lock().await.stage_cooldown.insert(
                stage_key(&bead.id, role),
                now + Duration::minutes(self.cfg.cost_control.stage_cooldown_mins),
            );
        }
        Ok(decision)
    }

    /// One `dispatch_blocked_cost_control` health event and one lifecycle
    /// `dispatch_blocked` per `(project, bead, role, stage, reason)` within
    /// the block-log window.
    async fn log_cost_block(
        &self,
        project: &str,
        bead: &Bead,
        role: Role,
        block: CostBlock,
        now: DateTime<Utc>,
    ) {
        let stage = bead
            .workflow_stage()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "none".into());
        let key = format!("{project}:{}:{role}:{stage}:{}", bead.id, block.reason());
        {
            let mut memos = self.memos.lock().await;
            let window = Duration::minutes(self.cfg.cost_control.block_log_window_mins);
            let recent = memos
                .dispatch_block_log
                .get(&key)
                .map(|last| now.signed_duration_since(*last) < window)
                .unwrap_or(false);
            if recent {
                return;
            }
            memos.dispatch_block_log.insert(key, now);
        }

        warn!(bead_id = %bead.id, reason = block.reason(), "dispatch blocked by cost control");
        self.store
            .append_health_event(
                health_events::DISPATCH_BLOCKED_COST_CONTROL,
                &format!("bead {} blocked: {}", bead.id, block.reason()),
                None,
                Some(&bead.id),
                now,
            )
            .await
            .ok();
        self.notifier
            .emit(LifecycleEvent {
                project: project.to_string(),
                bead_id: bead.id.clone(),
                dispatch_id: None,
                event: LifecycleKind::DispatchBlocked,
                workflow_stage: bead.workflow_stage(),
                dispatch_stage: None,
                status: None,
                agent: agent_id(project, role),
                provider: String::new(),
                tier: None,
                exit_code: None,
                duration_s: None,
                note: Some(block.reason().to_string()),
            })
            .await;
    }

    async fn log_system_pause(&self, reason: PauseReason, now: DateTime<Utc>) {
        self.store
            .append_health_event(
                health_events::SYSTEM_PAUSED,
                &format!("system pause active: {}", reason.as_str()),
                None,
                None,
                now,
            )
            .await
            .ok();
    }

    // -----------------------------------------------------------------------
    // Phase 7: overflow dequeue
    // -----------------------------------------------------------------------

    async fn drain_overflow(
        &self,
        project_beads: &[(String, Vec<Bead>)],
        budget: usize,
        now: DateTime<Utc>,
    ) -> usize {
        // Prune items that were dispatched through the fresh-candidate path.
        if let Ok(queue) = self.store.load_overflow().await {
            for item in queue {
                if matches!(self.store.has_active_dispatch(&item.bead_id).await, Ok(true)) {
                    self.store.delete_overflow(item.id).await.ok();
                }
            }
        }
        if budget == 0 {
            return 0;
        }
        let items = match self.admission.try_dequeue(budget).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "overflow dequeue failed");
                return 0;
            }
        };

        let mut dispatched = 0;
        for item in items {
            let Some(project) = self.cfg.project(&item.project) else {
                continue;
            };
            let Some((_, beads)) = project_beads.iter().find(|(id, _)| *id == item.project)
            else {
                continue;
            };
            let Some(bead) = beads.iter().find(|b| b.id == item.bead_id) else {
                debug!(bead_id = %item.bead_id, "overflow item no longer in ready set, dropping");
                continue;
            };
            // A fresh candidate pass, but denial does not re-enqueue.
            if self
                .consider_candidate(project, bead, beads, false, now)
                .await
                == CandidateOutcome::Dispatched
            {
                dispatched += 1;
            }
        }
        dispatched
    }

    // -----------------------------------------------------------------------
    // Phase 9: merge pass + DoD sweep
    // -----------------------------------------------------------------------

    async fn merge_sweep(&self, project_beads: &[(String, Vec<Bead>)]) {
        let Some(pass) = &self.merge_pass else {
            return;
        };
        for (project_id, beads) in project_beads {
            let Some(project) = self.cfg.project(project_id) else {
                continue;
            };
            if !project.branch_workflow {
                continue;
            }
            for bead in beads
                .iter()
                .filter(|b| b.is_active() && b.workflow_stage() == Some(WorkflowStage::Review))
            {
                if !self.reviewer_finished(bead).await {
                    continue;
                }
                let branch = format!("feature/{}", bead.id);
                match pass.run(project, bead, &branch).await {
                    Ok(outcome) => {
                        debug!(bead_id = %bead.id, ?outcome, "merge pass finished")
                    }
                    Err(e) => warn!(bead_id = %bead.id, error = %e, "merge pass failed"),
                }
            }
        }
    }

    async fn reviewer_finished(&self, bead: &Bead) -> bool {
        let dispatches = match self.store.dispatches_for_bead(&bead.id).await {
            Ok(d) => d,
            Err(_) => return false,
        };
        dispatches
            .iter()
            .find(|d| d.agent_id.ends_with("-reviewer"))
            .map(|d| d.status == DispatchStatus::Completed)
            .unwrap_or(false)
    }

    async fn dod_sweep(&self, project_beads: &[(String, Vec<Bead>)]) {
        for (project_id, beads) in project_beads {
            let Some(project) = self.cfg.project(project_id) else {
                continue;
            };
            for bead in beads
                .iter()
                .filter(|b| b.is_active() && b.workflow_stage() == Some(WorkflowStage::Dod))
            {
                let report = dod::run_checks(project).await;
                if report.passed {
                    info!(bead_id = %bead.id, "dod checks passed, closing bead");
                    self.beads
                        .close(&project.beads_dir, &bead.id, Some("definition of done met"))
                        .await
                        .ok();
                } else {
                    warn!(
                        bead_id = %bead.id,
                        failures = ?report.failures,
                        "dod checks failed, returning bead to coding"
                    );
                    let mut labels: Vec<String> = bead
                        .labels
                        .iter()
                        .filter(|l| !l.starts_with("stage:"))
                        .cloned()
                        .collect();
                    labels.push(WorkflowStage::Coding.label());
                    self.beads
                        .set_labels(&project.beads_dir, &bead.id, &labels)
                        .await
                        .ok();
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Dispatch a worker and record the row. On record failure the worker is
    /// killed so no orphan survives without a store row.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        project: &ProjectConfig,
        bead_id: &str,
        agent: &str,
        provider: &ProviderConfig,
        tier: Tier,
        prompt: String,
        branch: Option<String>,
        labels: Vec<String>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Result<i64, String> {
        let backend = self
            .backends
            .for_tier(tier)
            .ok_or_else(|| format!("no backend routed for tier {tier}"))?;

        let handle = backend
            .dispatch(
                agent,
                &prompt,
                &provider.model,
                &provider.thinking_level,
                &project.workspace,
            )
            .await
            .map_err(|e| e.to_string())?;

        let record = NewDispatch {
            bead_id: bead_id.to_string(),
            project: project.id.clone(),
            agent_id: agent.to_string(),
            provider: provider.model.clone(),
            tier,
            pid: handle.pid,
            session_name: handle.session_name.clone(),
            prompt,
            log_path: None,
            base_branch: branch.is_some().then(|| project.base_branch.clone()),
            branch,
            backend: handle.backend.clone(),
            dispatched_at: now,
            retries,
            labels: labels.clone(),
        };

        let id = match self.store.record_dispatch(record).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "dispatch record failed, terminating worker");
                backend.kill(&handle).await.ok();
                backend.cleanup(&handle).await.ok();
                return Err(e.to_string());
            }
        };

        if provider.authed {
            self.store
                .record_authed_dispatch(&provider.name, agent, bead_id, now)
                .await
                .ok();
        }

        self.notifier
            .emit(LifecycleEvent {
                project: project.id.clone(),
                bead_id: bead_id.to_string(),
                dispatch_id: Some(id),
                event: LifecycleKind::DispatchStarted,
                workflow_stage: stage_from_labels(&labels),
                dispatch_stage: Some(DispatchStage::Running),
                status: Some(DispatchStatus::Running),
                agent: agent.to_string(),
                provider: provider.model.clone(),
                tier: Some(tier),
                exit_code: None,
                duration_s: None,
                note: None,
            })
            .await;
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    Dispatched,
    Deferred,
    Blocked,
    Skipped,
}

fn stage_key(bead_id: &str, role: Role) -> String {
    format!("{bead_id}:{role}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LifecycleNotifier;
    use crate::testutil::{bead, project, t0, MemoryBeads, RecordingSink, ScriptedBackend};
    use fm_core::clock::ManualClock;
    use fm_core::config::NotifierConfig;
    use fm_core::types::BeadStatus;
    use fm_session::backend::WorkerState;

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<Store>,
        beads: Arc<MemoryBeads>,
        backend: Arc<ScriptedBackend>,
        sink: Arc<RecordingSink>,
        clock: ManualClock,
    }

    async fn fixture(tweak: impl FnOnce(&mut Config)) -> Fixture {
        let mut cfg = Config::default();
        cfg.scheduler.local_utc_offset_mins = Some(0);
        cfg.projects = vec![project("p1", 1)];
        tweak(&mut cfg);

        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let backend = ScriptedBackend::new("scripted");
        let mut registry = BackendRegistry::new();
        registry.register(backend.clone());
        for tier in [Tier::Fast, Tier::Balanced, Tier::Premium] {
            registry.route(tier, "scripted");
        }
        let beads = MemoryBeads::new();
        let sink = RecordingSink::new();
        let (clock, handle) = Clock::manual(t0());
        let notifier = Arc::new(LifecycleNotifier::new(
            sink.clone(),
            None,
            NotifierConfig::default(),
            clock.clone(),
        ));

        let scheduler = Scheduler::new(SchedulerParts {
            cfg,
            store: store.clone(),
            clock,
            beads: beads.clone(),
            backends: Arc::new(registry),
            notifier,
            ceremonies: None,
            pr_host: None,
            tmux: None,
            lease: None,
            shutdown: ShutdownSignal::new(),
        });

        Fixture {
            scheduler,
            store,
            beads,
            backend,
            sink,
            clock: handle,
        }
    }

    async fn seed_terminal_dispatch(
        store: &Store,
        bead_id: &str,
        agent: &str,
        status: DispatchStatus,
        dispatched_at: DateTime<Utc>,
    ) -> i64 {
        let id = store
            .record_dispatch(NewDispatch {
                bead_id: bead_id.into(),
                project: "p1".into(),
                agent_id: agent.into(),
                provider: "sonnet".into(),
                tier: Tier::Balanced,
                pid: Some(1),
                session_name: String::new(),
                prompt: "seeded".into(),
                log_path: None,
                base_branch: None,
                branch: None,
                backend: "scripted".into(),
                dispatched_at,
                retries: 0,
                labels: vec![],
            })
            .await
            .unwrap();
        let stage = if status == DispatchStatus::Failed {
            DispatchStage::Failed
        } else {
            DispatchStage::Completed
        };
        store
            .complete_dispatch(id, status, stage, dispatched_at, Some(0), Some(10))
            .await
            .unwrap();
        id
    }

    fn health_count(events: &[fm_core::types::HealthEvent], event_type: &str) -> usize {
        events.iter().filter(|e| e.event_type == event_type).count()
    }

    // --- Scenario: happy path ---

    #[tokio::test]
    async fn happy_path_dispatches_coder_and_reviewer() {
        let f = fixture(|_| {}).await;
        f.beads
            .seed(
                "/b/p1",
                vec![
                    bead("t-1", BeadType::Task, &["stage:ready"]),
                    bead("t-2", BeadType::Task, &["stage:review"]),
                ],
            )
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 2);

        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert_eq!(running.len(), 2);
        let agents: Vec<&str> = running.iter().map(|d| d.agent_id.as_str()).collect();
        assert!(agents.contains(&"p1-coder"));
        assert!(agents.contains(&"p1-reviewer"));

        let snapshot = f.scheduler.admission().snapshot().await.unwrap();
        assert_eq!(snapshot.active_coders, 1);
        assert_eq!(snapshot.active_reviewers, 1);

        let kinds = f.sink.kinds();
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == LifecycleKind::DispatchStarted)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn rerun_with_frozen_time_dispatches_nothing_new() {
        let f = fixture(|_| {}).await;
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        let first = f.scheduler.run_tick().await;
        assert_eq!(first.total_dispatched(), 1);
        let second = f.scheduler.run_tick().await;
        assert_eq!(second.total_dispatched(), 0);
        assert_eq!(
            f.store.list_by_status(DispatchStatus::Running).await.unwrap().len(),
            1
        );
    }

    // --- Scenario: cross-project dependency ---

    #[tokio::test]
    async fn cross_project_dependency_gates_candidates() {
        let f = fixture(|cfg| {
            cfg.projects = vec![project("alpha", 1), project("beta", 2)];
        })
        .await;

        let mut closed = bead("alpha-1", BeadType::Task, &[]);
        closed.status = BeadStatus::Closed;
        f.beads.seed("/b/alpha", vec![closed]).await;

        let mut beta1 = bead("beta-1", BeadType::Task, &["stage:ready"]);
        beta1.depends_on = vec!["alpha-1".into()];
        let mut beta2 = bead("beta-2", BeadType::Task, &["stage:ready"]);
        beta2.depends_on = vec!["alpha-99".into()];
        f.beads.seed("/b/beta", vec![beta1, beta2]).await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 1);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert_eq!(running[0].bead_id, "beta-1");
    }

    // --- Scenario: rate-limit fallback ---

    #[tokio::test]
    async fn exhausted_authed_provider_walks_to_free_tier() {
        let f = fixture(|cfg| {
            cfg.rate.window_5h_cap = 1;
            cfg.rate.weekly_cap = 100;
            cfg.providers = vec![
                fm_core::config::ProviderConfig {
                    name: "standard".into(),
                    model: "sonnet".into(),
                    tier: Tier::Balanced,
                    authed: true,
                    thinking_level: "medium".into(),
                },
                fm_core::config::ProviderConfig {
                    name: "free".into(),
                    model: "local-small".into(),
                    tier: Tier::Fast,
                    authed: false,
                    thinking_level: "low".into(),
                },
            ];
        })
        .await;
        // Burn the 5h budget of the only balanced provider.
        f.store
            .record_authed_dispatch("standard", "p1-coder", "b-x", t0())
            .await
            .unwrap();

        let mut b = bead("t-1", BeadType::Task, &["stage:ready"]);
        b.estimate_minutes = 60; // balanced complexity
        f.beads.seed("/b/p1", vec![b]).await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 1);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert_eq!(running[0].provider, "local-small");
        assert_eq!(running[0].tier, Tier::Fast);
    }

    // --- Scenario: churn escalation ---

    #[tokio::test]
    async fn churn_guard_blocks_and_escalates_once() {
        let f = fixture(|_| {}).await;
        for _ in 0..6 {
            seed_terminal_dispatch(
                &f.store,
                "t-1",
                "p1-coder",
                DispatchStatus::Completed,
                t0() - Duration::minutes(10),
            )
            .await;
        }
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.blocked, 1);

        let created = f.beads.created.lock().await;
        assert_eq!(created.len(), 1);
        assert!(created[0]
            .1
            .title
            .starts_with("Auto: churn guard blocked bead t-1"));
        assert_eq!(created[0].1.bead_type, BeadType::Bug);
        drop(created);

        let events = f
            .store
            .health_events_since(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(health_count(&events, health_events::BEAD_CHURN_BLOCKED), 1);

        // Second tick inside the block window: the memo holds the bead and no
        // duplicate escalation bug appears (the bug itself may dispatch).
        f.scheduler.run_tick().await;
        assert_eq!(f.beads.created.lock().await.len(), 1);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert!(running.iter().all(|d| d.bead_id != "t-1"));
        let events = f
            .store
            .health_events_since(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(health_count(&events, health_events::BEAD_CHURN_BLOCKED), 1);
    }

    // --- Scenario: quarantine beats churn ---

    #[tokio::test]
    async fn quarantine_suppresses_churn_escalation() {
        let f = fixture(|_| {}).await;
        for _ in 0..3 {
            seed_terminal_dispatch(
                &f.store,
                "t-1",
                "p1-coder",
                DispatchStatus::Failed,
                t0() - Duration::minutes(20),
            )
            .await;
        }
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 0);

        let events = f
            .store
            .health_events_since(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(health_count(&events, health_events::BEAD_QUARANTINED), 1);
        assert_eq!(health_count(&events, health_events::BEAD_CHURN_BLOCKED), 0);
        assert!(f.beads.created.lock().await.is_empty());
    }

    #[tokio::test]
    async fn churn_with_failure_streak_emits_quarantine_not_escalation() {
        let f = fixture(|_| {}).await;
        for _ in 0..3 {
            seed_terminal_dispatch(
                &f.store,
                "t-1",
                "p1-coder",
                DispatchStatus::Completed,
                t0() - Duration::minutes(50),
            )
            .await;
        }
        for _ in 0..3 {
            seed_terminal_dispatch(
                &f.store,
                "t-1",
                "p1-coder",
                DispatchStatus::Failed,
                t0() - Duration::minutes(5),
            )
            .await;
        }
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        f.scheduler.run_tick().await;

        let events = f
            .store
            .health_events_since(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(health_count(&events, health_events::BEAD_QUARANTINED), 1);
        assert_eq!(health_count(&events, health_events::BEAD_CHURN_BLOCKED), 0);
        assert!(f.beads.created.lock().await.is_empty());
    }

    // --- Night mode ---

    #[tokio::test]
    async fn night_mode_defers_features_but_not_tasks() {
        let f = fixture(|_| {}).await;
        f.clock.set(t0().date_naive().and_hms_opt(22, 0, 0).unwrap().and_utc());
        f.beads
            .seed(
                "/b/p1",
                vec![
                    bead("f-1", BeadType::Feature, &["stage:ready"]),
                    bead("t-1", BeadType::Task, &["stage:ready"]),
                ],
            )
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 1);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert_eq!(running[0].bead_id, "t-1");
    }

    // --- MaxPerTick + project priority ---

    #[tokio::test]
    async fn max_per_tick_caps_dispatches_in_priority_order() {
        let f = fixture(|cfg| {
            cfg.scheduler.max_per_tick = 2;
            cfg.projects = vec![project("p2", 2), project("p1", 1), project("p3", 3)];
        })
        .await;
        for p in ["p1", "p2", "p3"] {
            f.beads
                .seed(
                    &format!("/b/{p}"),
                    vec![bead(&format!("{p}-t"), BeadType::Task, &["stage:ready"])],
                )
                .await;
        }

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 2);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        let beads_running: Vec<&str> = running.iter().map(|d| d.bead_id.as_str()).collect();
        assert!(beads_running.contains(&"p1-t"));
        assert!(beads_running.contains(&"p2-t"));
    }

    // --- Admission denial -> overflow ---

    #[tokio::test]
    async fn admission_denial_enqueues_exactly_once() {
        let f = fixture(|cfg| {
            cfg.limits.max_concurrent_coders = 0;
        })
        .await;
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        f.scheduler.run_tick().await;
        f.scheduler.run_tick().await;

        let queue = f.store.load_overflow().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].bead_id, "t-1");
        assert_eq!(queue[0].role, Role::Coder);
        assert_eq!(queue[0].reason, "role_limit");

        let events = f
            .store
            .health_events_since(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert!(health_count(&events, health_events::CAPACITY_DENY) >= 1);
    }

    #[tokio::test]
    async fn freed_capacity_lets_queued_work_through() {
        let f = fixture(|cfg| {
            cfg.limits.max_concurrent_coders = 1;
            cfg.projects = vec![project("p1", 1), project("p2", 2)];
        })
        .await;
        f.beads
            .seed("/b/p1", vec![bead("a-1", BeadType::Task, &["stage:ready"])])
            .await;
        f.beads
            .seed("/b/p2", vec![bead("z-1", BeadType::Task, &["stage:ready"])])
            .await;

        let first = f.scheduler.run_tick().await;
        assert_eq!(first.dispatched, 1);
        assert_eq!(f.store.load_overflow().await.unwrap().len(), 1);

        // The running coder finishes; its slot frees up next tick.
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        let pid = running[0].pid.unwrap();
        f.backend.set_state(
            &format!("pid:{pid}"),
            WorkerState::Exited {
                code: 0,
                output_path: None,
            },
        );
        f.clock.advance(Duration::minutes(5));

        let second = f.scheduler.run_tick().await;
        assert_eq!(second.total_dispatched(), 1);
        assert!(f.store.load_overflow().await.unwrap().is_empty());
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].bead_id, "z-1");
    }

    // --- Cost control ---

    #[tokio::test]
    async fn per_bead_cost_cap_blocks_with_single_log() {
        let f = fixture(|_| {}).await;
        let id = seed_terminal_dispatch(
            &f.store,
            "t-1",
            "p1-coder",
            DispatchStatus::Completed,
            t0() - Duration::hours(2),
        )
        .await;
        f.store
            .record_dispatch_cost(id, 0, 0, 10.0, t0() - Duration::hours(2))
            .await
            .unwrap();
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        f.scheduler.run_tick().await;
        f.scheduler.run_tick().await;

        let events = f
            .store
            .health_events_since(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(
            health_count(&events, health_events::DISPATCH_BLOCKED_COST_CONTROL),
            1
        );
        let blocked_events = f
            .sink
            .kinds()
            .iter()
            .filter(|k| **k == LifecycleKind::DispatchBlocked)
            .count();
        assert_eq!(blocked_events, 1);
    }

    // --- System pause ---

    #[tokio::test]
    async fn token_waste_pause_stops_dispatch_but_reconciles() {
        let f = fixture(|cfg| {
            cfg.cost_control.daily_cost_cap_usd = 1.0;
        })
        .await;
        let id = seed_terminal_dispatch(
            &f.store,
            "old",
            "p1-coder",
            DispatchStatus::Completed,
            t0() - Duration::hours(1),
        )
        .await;
        f.store
            .record_dispatch_cost(id, 0, 0, 1.5, t0() - Duration::hours(1))
            .await
            .unwrap();
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.pause, Some("token_waste"));
        assert_eq!(report.total_dispatched(), 0);
        assert!(f.store.list_by_status(DispatchStatus::Running).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn operator_pause_still_drains_dod() {
        let f = fixture(|cfg| {
            cfg.scheduler.paused = true;
            cfg.projects = vec![ProjectConfig {
                dod_commands: vec!["true".into()],
                ..project("p1", 1)
            }];
        })
        .await;
        f.beads
            .seed(
                "/b/p1",
                vec![
                    bead("t-1", BeadType::Task, &["stage:ready"]),
                    bead("d-1", BeadType::Task, &["stage:dod"]),
                ],
            )
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.pause, Some("operator"));
        assert_eq!(report.total_dispatched(), 0);
        assert_eq!(f.beads.closed.lock().await.as_slice(), ["d-1"]);
    }

    // --- Retry engine ---

    #[tokio::test]
    async fn failed_dispatch_retries_with_original_prompt_after_backoff() {
        let f = fixture(|_| {}).await;
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        let first = f.scheduler.run_tick().await;
        assert_eq!(first.dispatched, 1);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        let d = &running[0];
        let original_prompt = d.prompt.clone();
        f.backend.set_state(
            &format!("pid:{}", d.pid.unwrap()),
            WorkerState::Exited {
                code: 3,
                output_path: None,
            },
        );

        // Tick 2: reconcile marks pending_retry; backoff not yet elapsed.
        let second = f.scheduler.run_tick().await;
        assert_eq!(second.reconcile.retry_queued, 1);
        assert_eq!(second.retries_dispatched, 0);
        assert_eq!(
            f.store
                .list_by_status(DispatchStatus::PendingRetry)
                .await
                .unwrap()
                .len(),
            1
        );

        // Tick 3 after the backoff window: the retry launches.
        f.clock.advance(Duration::seconds(61));
        let third = f.scheduler.run_tick().await;
        assert_eq!(third.retries_dispatched, 1);

        let old = f.store.get_dispatch(d.id).await.unwrap().unwrap();
        assert_eq!(old.status, DispatchStatus::Retried);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].retries, 1);
        assert_eq!(running[0].prompt, original_prompt);
        assert!(f.sink.kinds().contains(&LifecycleKind::DispatchRetried));
    }

    // --- Structure gate ---

    #[tokio::test]
    async fn structure_gate_rejects_unestimated_coder_work() {
        let f = fixture(|cfg| {
            cfg.projects = vec![ProjectConfig {
                require_estimate: true,
                ..project("p1", 1)
            }];
        })
        .await;
        let mut no_estimate = bead("t-1", BeadType::Task, &["stage:ready"]);
        no_estimate.estimate_minutes = 0;
        let mut estimated = bead("t-2", BeadType::Task, &["stage:ready"]);
        estimated.estimate_minutes = 30;
        f.beads.seed("/b/p1", vec![no_estimate, estimated]).await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 1);
        let running = f.store.list_by_status(DispatchStatus::Running).await.unwrap();
        assert_eq!(running[0].bead_id, "t-2");
    }

    // --- Epics ---

    #[tokio::test]
    async fn epics_synthesize_breakdowns_and_never_dispatch() {
        let f = fixture(|_| {}).await;
        f.beads
            .seed("/b/p1", vec![bead("e-1", BeadType::Epic, &["stage:ready"])])
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.dispatched, 0, "epics are never dispatched");

        let created = f.beads.created.lock().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.title, epics::breakdown_title("e-1"));
        assert_eq!(created[0].1.deps, vec!["discovered-from:e-1".to_string()]);
    }

    #[tokio::test]
    async fn claim_contention_skips_candidate() {
        let f = fixture(|_| {}).await;
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;
        f.beads.deny_claim("t-1").await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.total_dispatched(), 0);
        assert!(f.store.list_by_status(DispatchStatus::Running).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cooldown_defers_redispatch_of_completed_pair() {
        let f = fixture(|_| {}).await;
        seed_terminal_dispatch(
            &f.store,
            "t-1",
            "p1-coder",
            DispatchStatus::Completed,
            t0() - Duration::minutes(5),
        )
        .await;
        f.beads
            .seed("/b/p1", vec![bead("t-1", BeadType::Task, &["stage:ready"])])
            .await;

        let report = f.scheduler.run_tick().await;
        assert_eq!(report.total_dispatched(), 0);

        // Past the cooldown the pair is eligible again.
        f.clock.advance(Duration::minutes(11));
        let report = f.scheduler.run_tick().await;
        assert_eq!(report.total_dispatched(), 1);
    }
}
