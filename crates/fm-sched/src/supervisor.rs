//! Dispatch supervision: polls live dispatches through their backend,
//! captures exit and output, classifies terminal-output failures, records
//! costs, and queues retries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fm_beads::BeadService;
use fm_core::clock::Clock;
use fm_core::config::{ProjectConfig, RetryConfig};
use fm_core::store::Store;
use fm_core::types::{
    health_events, Dispatch, DispatchStage, DispatchStatus, LifecycleEvent, LifecycleKind,
    QualityScore, Role, WorkflowStage,
};
use fm_session::backend::{WorkerBackend, WorkerHandle, WorkerState};
use fm_session::BackendRegistry;
use tracing::{error, info, warn};

use crate::classifier;
use crate::notifier::LifecycleNotifier;
use crate::shutdown::ShutdownSignal;
use crate::usage;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("store: {0}")]
    Store(#[from] tokio_rusqlite::Error),
    #[error("dispatch not found: {0}")]
    DispatchNotFound(i64),
    #[error("backend missing: {0}")]
    BackendMissing(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub still_running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retry_queued: usize,
    pub needs_check: usize,
}

pub struct Supervisor {
    store: Arc<Store>,
    backends: Arc<BackendRegistry>,
    beads: Arc<dyn BeadService>,
    notifier: Arc<LifecycleNotifier>,
    projects: HashMap<String, ProjectConfig>,
    retry: RetryConfig,
    clock: Clock,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        backends: Arc<BackendRegistry>,
        beads: Arc<dyn BeadService>,
        notifier: Arc<LifecycleNotifier>,
        projects: Vec<ProjectConfig>,
        retry: RetryConfig,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            backends,
            beads,
            notifier,
            projects: projects.into_iter().map(|p| (p.id.clone(), p)).collect(),
            retry,
            clock,
        }
    }

    /// One reconciliation pass over every `running` dispatch.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let running = self.store.list_by_status(DispatchStatus::Running).await?;
        let mut report = ReconcileReport::default();

        for dispatch in running {
            let Some(backend) = self.backend_for(&dispatch) else {
                warn!(
                    dispatch_id = dispatch.id,
                    backend = %dispatch.backend,
                    "no backend registered for running dispatch"
                );
                continue;
            };
            let handle = handle_for(&dispatch);

            let state = match backend.status(&handle).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(dispatch_id = dispatch.id, error = %e, "backend status failed");
                    continue;
                }
            };

            match state {
                WorkerState::Running => report.still_running += 1,
                WorkerState::Exited { code, .. } => {
                    if code == 0 {
                        match self.finish_success(&dispatch, &*backend, &handle).await? {
                            SuccessOutcome::Completed => report.completed += 1,
                            SuccessOutcome::FlaggedFailed { retry_queued } => {
                                if retry_queued {
                                    report.retry_queued += 1;
                                } else {
                                    report.failed += 1;
                                }
                            }
                        }
                    } else {
                        let output = backend.capture_output(&handle).await.unwrap_or_default();
                        if self.finish_failure(&dispatch, code, &output).await? {
                            report.retry_queued += 1;
                        } else {
                            report.failed += 1;
                        }
                    }
                    backend.cleanup(&handle).await.ok();
                }
                WorkerState::Gone => {
                    self.finish_vanished(
                        &dispatch,
                        classifier::CAT_SESSION_DISAPPEARED,
                        "worker session disappeared before reporting an exit",
                    )
                    .await?;
                    report.needs_check += 1;
                }
                WorkerState::Unknown => {
                    self.finish_vanished(
                        &dispatch,
                        classifier::CAT_UNKNOWN_EXIT,
                        "worker child vanished without a recorded exit status",
                    )
                    .await?;
                    report.needs_check += 1;
                }
            }
        }
        Ok(report)
    }

    /// Operator-issued cancel: kill the worker, record `cancelled` with the
    /// conventional exit code 0, duration measured from dispatch start.
    pub async fn cancel_dispatch(&self, id: i64) -> Result<()> {
        let dispatch = self
            .store
            .get_dispatch(id)
            .await?
            .ok_or(SupervisorError::DispatchNotFound(id))?;

        if dispatch.status == DispatchStatus::Running {
            if let Some(backend) = self.backend_for(&dispatch) {
                let handle = handle_for(&dispatch);
                backend.kill(&handle).await.ok();
                backend.cleanup(&handle).await.ok();
            }
        }

        let now = self.clock.now();
        let duration = duration_since(&dispatch, now);
        self.store
            .complete_dispatch(
                id,
                DispatchStatus::Cancelled,
                DispatchStage::Cancelled,
                now,
                Some(0),
                Some(duration),
            )
            .await?;
        info!(dispatch_id = id, "dispatch cancelled");
        self.notifier
            .emit(event_for(&dispatch, LifecycleKind::DispatchCancelled, None))
            .await;
        Ok(())
    }

    /// Poll the store until no dispatch is `running` or shutdown triggers.
    pub async fn wait_for_running(
        &self,
        poll: std::time::Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<usize> {
        let mut rx = shutdown.subscribe();
        loop {
            let remaining = self.store.list_by_status(DispatchStatus::Running).await?.len();
            if remaining == 0 {
                return Ok(0);
            }
            if shutdown.is_shutting_down() {
                return Ok(remaining);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = rx.recv() => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn finish_success(
        &self,
        dispatch: &Dispatch,
        backend: &dyn WorkerBackend,
        handle: &WorkerHandle,
    ) -> Result<SuccessOutcome> {
        let output = backend.capture_output(handle).await.unwrap_or_default();

        if let Some(flag) = classifier::classify_terminal_output(&output) {
            // Exit 0 but the worker's request was rejected upstream.
            let retry_queued = self.finish_flagged(dispatch, &flag).await?;
            return Ok(SuccessOutcome::FlaggedFailed { retry_queued });
        }

        let now = self.clock.now();
        let duration = duration_since(dispatch, now);
        let tokens = usage::parse_usage(&output);
        let cost = usage::cost_usd(dispatch.tier, tokens);

        self.store
            .complete_dispatch(
                dispatch.id,
                DispatchStatus::Completed,
                DispatchStage::Completed,
                now,
                Some(0),
                Some(duration),
            )
            .await?;
        self.store
            .record_dispatch_cost(dispatch.id, tokens.input_tokens, tokens.output_tokens, cost, now)
            .await?;

        info!(
            dispatch_id = dispatch.id,
            bead_id = %dispatch.bead_id,
            duration_s = duration,
            cost_usd = cost,
            "dispatch completed"
        );

        self.record_quality(dispatch, 1.0, now).await;
        self.ops_to_dod_hook(dispatch, now).await;
        self.notifier
            .emit(event_for(dispatch, LifecycleKind::DispatchCompleted, None))
            .await;
        Ok(SuccessOutcome::Completed)
    }

    /// Per-dispatch quality signal used to disqualify providers per role.
    async fn record_quality(&self, dispatch: &Dispatch, score: f64, at: DateTime<Utc>) {
        let role = Role::from_agent_id(&dispatch.agent_id).unwrap_or(Role::Coder);
        self.store
            .insert_quality_score(&QualityScore {
                dispatch_id: dispatch.id,
                provider: dispatch.provider.clone(),
                role,
                score,
                at,
            })
            .await
            .ok();
    }

    async fn finish_flagged(
        &self,
        dispatch: &Dispatch,
        flag: &classifier::FailureFlag,
    ) -> Result<bool> {
        let retry_queued = self.fail_or_queue_retry(dispatch, Some(0)).await?;
        self.store
            .set_failure_diagnosis(dispatch.id, &flag.category, &flag.summary)
            .await?;
        warn!(
            dispatch_id = dispatch.id,
            category = %flag.category,
            "completed dispatch flagged as failed by output classifier"
        );
        Ok(retry_queued)
    }

    async fn finish_failure(&self, dispatch: &Dispatch, code: i32, output: &str) -> Result<bool> {
        let retry_queued = self.fail_or_queue_retry(dispatch, Some(code)).await?;
        if let Some(flag) = classifier::diagnose_failure(output) {
            self.store
                .set_failure_diagnosis(dispatch.id, &flag.category, &flag.summary)
                .await?;
            self.store
                .append_health_event(
                    health_events::DISPATCH_DIAGNOSED,
                    &format!("dispatch {} failed: {}", dispatch.id, flag.summary),
                    Some(dispatch.id),
                    Some(&dispatch.bead_id),
                    self.clock.now(),
                )
                .await?;
        }
        Ok(retry_queued)
    }

    /// Mark the dispatch failed, or queue it for retry while budget remains.
    async fn fail_or_queue_retry(&self, dispatch: &Dispatch, code: Option<i32>) -> Result<bool> {
        let now = self.clock.now();
        self.record_quality(dispatch, 0.0, now).await;
        if dispatch.retries < self.retry.max_retries {
            self.store
                .complete_dispatch(
                    dispatch.id,
                    DispatchStatus::PendingRetry,
                    DispatchStage::Failed,
                    now,
                    code,
                    Some(duration_since(dispatch, now)),
                )
                .await?;
            self.notifier
                .emit(event_for(dispatch, LifecycleKind::DispatchRetryQueued, None))
                .await;
            Ok(true)
        } else {
            self.store
                .complete_dispatch(
                    dispatch.id,
                    DispatchStatus::Failed,
                    DispatchStage::Failed,
                    now,
                    code,
                    Some(duration_since(dispatch, now)),
                )
                .await?;
            self.store
                .append_health_event(
                    health_events::RETRY_EXHAUSTED,
                    &format!(
                        "dispatch {} failed terminally after {} retries",
                        dispatch.id, dispatch.retries
                    ),
                    Some(dispatch.id),
                    Some(&dispatch.bead_id),
                    now,
                )
                .await?;
            self.notifier
                .emit(event_for(dispatch, LifecycleKind::DispatchFailed, None))
                .await;
            Ok(false)
        }
    }

    async fn finish_vanished(
        &self,
        dispatch: &Dispatch,
        category: &str,
        summary: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        self.record_quality(dispatch, 0.0, now).await;
        self.store
            .complete_dispatch(
                dispatch.id,
                DispatchStatus::Failed,
                DispatchStage::FailedNeedsCheck,
                now,
                None,
                Some(duration_since(dispatch, now)),
            )
            .await?;
        self.store
            .set_failure_diagnosis(dispatch.id, category, summary)
            .await?;
        self.store
            .append_health_event(
                category,
                &format!("dispatch {} for bead {}: {summary}", dispatch.id, dispatch.bead_id),
                Some(dispatch.id),
                Some(&dispatch.bead_id),
                now,
            )
            .await?;
        warn!(
            dispatch_id = dispatch.id,
            bead_id = %dispatch.bead_id,
            category,
            "dispatch needs operator check"
        );
        self.notifier
            .emit(event_for(
                dispatch,
                LifecycleKind::DispatchFailed,
                Some(summary.to_string()),
            ))
            .await;
        Ok(())
    }

    /// An ops dispatch finishing for a bead in `stage:qa` advances the bead
    /// into the DoD stage.
    async fn ops_to_dod_hook(&self, dispatch: &Dispatch, now: DateTime<Utc>) {
        if !dispatch.agent_id.ends_with("-ops") {
            return;
        }
        if stage_from_labels(&dispatch.labels) != Some(WorkflowStage::Qa) {
            return;
        }
        let Some(project) = self.projects.get(&dispatch.project) else {
            return;
        };
        let mut labels: Vec<String> = dispatch
            .labels
            .iter()
            .filter(|l| !l.starts_with("stage:"))
            .cloned()
            .collect();
        labels.push(WorkflowStage::Dod.label());
        if let Err(e) = self
            .beads
            .set_labels(&project.beads_dir, &dispatch.bead_id, &labels)
            .await
        {
            warn!(bead_id = %dispatch.bead_id, error = %e, "ops-to-dod label update failed");
            return;
        }
        self.store
            .set_bead_stage(&dispatch.project, &dispatch.bead_id, WorkflowStage::Dod, now)
            .await
            .ok();
        info!(bead_id = %dispatch.bead_id, "bead advanced to dod stage");
    }

    fn backend_for(&self, dispatch: &Dispatch) -> Option<Arc<dyn WorkerBackend>> {
        self.backends
            .get(&dispatch.backend)
            .or_else(|| self.backends.for_tier(dispatch.tier))
    }
}

enum SuccessOutcome {
    Completed,
    FlaggedFailed { retry_queued: bool },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn handle_for(dispatch: &Dispatch) -> WorkerHandle {
    WorkerHandle {
        pid: dispatch.pid,
        session_name: dispatch.session_name.clone(),
        backend: dispatch.backend.clone(),
    }
}

fn duration_since(dispatch: &Dispatch, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(dispatch.dispatched_at)
        .num_seconds()
        .max(0)
}

pub fn stage_from_labels(labels: &[String]) -> Option<WorkflowStage> {
    labels
        .iter()
        .filter_map(|l| l.strip_prefix("stage:"))
        .filter_map(WorkflowStage::parse)
        .max_by_key(|s| s.order())
}

pub fn event_for(dispatch: &Dispatch, kind: LifecycleKind, note: Option<String>) -> LifecycleEvent {
    LifecycleEvent {
        project: dispatch.project.clone(),
        bead_id: dispatch.bead_id.clone(),
        dispatch_id: Some(dispatch.id),
        event: kind,
        workflow_stage: stage_from_labels(&dispatch.labels),
        dispatch_stage: Some(dispatch.stage),
        status: Some(dispatch.status),
        agent: dispatch.agent_id.clone(),
        provider: dispatch.provider.clone(),
        tier: Some(dispatch.tier),
        exit_code: dispatch.exit_code,
        duration_s: dispatch.duration_s,
        note,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
