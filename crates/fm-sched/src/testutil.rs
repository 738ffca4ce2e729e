//! Shared fixtures for fm-sched unit tests.
#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use fm_beads::cli::{BeadCliError, Result as CliResult};
use fm_beads::{BeadService, CreateBead};
use fm_core::config::ProjectConfig;
use fm_core::types::{Bead, BeadStatus, BeadType};
use fm_session::backend::{Result as BackendResult, WorkerBackend, WorkerHandle, WorkerState};
use tokio::sync::Mutex;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn bead(id: &str, bead_type: BeadType, labels: &[&str]) -> Bead {
    Bead {
        id: id.into(),
        title: format!("bead {id}"),
        description: String::new(),
        status: BeadStatus::Open,
        bead_type,
        priority: 1,
        labels: labels.iter().map(|s| s.to_string()).collect(),
        estimate_minutes: 0,
        acceptance: None,
        design: None,
        depends_on: vec![],
        parent: None,
        dependencies: vec![],
        created_at: t0(),
        updated_at: t0(),
        closed_at: None,
        assignee: None,
    }
}

pub fn project(id: &str, priority: i64) -> ProjectConfig {
    ProjectConfig {
        id: id.into(),
        enabled: true,
        priority,
        // A real directory: DoD commands run with this as their cwd.
        workspace: "/tmp".into(),
        beads_dir: format!("/b/{id}"),
        branch_workflow: false,
        base_branch: "main".into(),
        require_estimate: false,
        require_acceptance: false,
        dod_commands: vec![],
        coverage_min: None,
        cadence_hours: None,
    }
}

// ---------------------------------------------------------------------------
// MemoryBeads — in-memory BeadService keyed by beads_dir
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBeads {
    pub beads: Mutex<HashMap<String, Vec<Bead>>>,
    pub created: Mutex<Vec<(String, CreateBead)>>,
    pub closed: Mutex<Vec<String>>,
    pub label_updates: Mutex<Vec<(String, Vec<String>)>>,
    pub claim_denied: Mutex<Vec<String>>,
    next_id: Mutex<u64>,
}

impl MemoryBeads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn seed(&self, beads_dir: &str, beads: Vec<Bead>) {
        self.beads.lock().await.insert(beads_dir.to_string(), beads);
    }

    pub async fn deny_claim(&self, bead_id: &str) {
        self.claim_denied.lock().await.push(bead_id.to_string());
    }
}

#[async_trait]
impl BeadService for MemoryBeads {
    async fn list(&self, beads_dir: &str) -> CliResult<Vec<Bead>> {
        Ok(self
            .beads
            .lock()
            .await
            .get(beads_dir)
            .cloned()
            .unwrap_or_default())
    }

    async fn enrich(&self, beads_dir: &str, id: &str) -> CliResult<Bead> {
        self.beads
            .lock()
            .await
            .get(beads_dir)
            .and_then(|beads| beads.iter().find(|b| b.id == id).cloned())
            .ok_or_else(|| BeadCliError::Parse(format!("no bead {id}")))
    }

    async fn create(&self, beads_dir: &str, req: CreateBead) -> CliResult<String> {
        let mut next = self.next_id.lock().await;
        *next += 1;
        let id = format!("auto-{}", *next);
        self.created
            .lock()
            .await
            .push((beads_dir.to_string(), req.clone()));
        let mut beads = self.beads.lock().await;
        let entry = beads.entry(beads_dir.to_string()).or_default();
        let mut created = bead(&id, req.bead_type, &[]);
        created.title = req.title;
        created.priority = req.priority;
        entry.push(created);
        Ok(id)
    }

    async fn close(&self, _beads_dir: &str, id: &str, _reason: Option<&str>) -> CliResult<()> {
        self.closed.lock().await.push(id.to_string());
        Ok(())
    }

    async fn set_labels(&self, _beads_dir: &str, id: &str, labels: &[String]) -> CliResult<()> {
        self.label_updates
            .lock()
            .await
            .push((id.to_string(), labels.to_vec()));
        Ok(())
    }

    async fn claim(
        &self,
        _beads_dir: &str,
        id: &str,
        _owner: &str,
        _ttl_secs: u64,
    ) -> CliResult<bool> {
        Ok(!self.claim_denied.lock().await.contains(&id.to_string()))
    }

    async fn release_claim(&self, _beads_dir: &str, _id: &str, _owner: &str) -> CliResult<()> {
        Ok(())
    }

    async fn heartbeat_claim(&self, _beads_dir: &str, _id: &str, _owner: &str) -> CliResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend — worker backend with scripted states and outputs
// ---------------------------------------------------------------------------

pub struct ScriptedBackend {
    name: String,
    pub states: DashMap<String, WorkerState>,
    pub outputs: DashMap<String, String>,
    pub killed: DashMap<String, bool>,
    next_pid: std::sync::atomic::AtomicU32,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            states: DashMap::new(),
            outputs: DashMap::new(),
            killed: DashMap::new(),
            next_pid: std::sync::atomic::AtomicU32::new(1000),
        })
    }

    fn key(handle: &WorkerHandle) -> String {
        if handle.session_name.is_empty() {
            format!("pid:{}", handle.pid.unwrap_or(0))
        } else {
            handle.session_name.clone()
        }
    }

    pub fn set_state(&self, key: &str, state: WorkerState) {
        self.states.insert(key.to_string(), state);
    }

    pub fn set_output(&self, key: &str, output: &str) {
        self.outputs.insert(key.to_string(), output.to_string());
    }
}

#[async_trait]
impl WorkerBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(
        &self,
        _agent: &str,
        _prompt: &str,
        _model: &str,
        _thinking_level: &str,
        _work_dir: &str,
    ) -> BackendResult<WorkerHandle> {
        let pid = self
            .next_pid
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let handle = WorkerHandle {
            pid: Some(pid),
            session_name: String::new(),
            backend: self.name.clone(),
        };
        self.states
            .insert(Self::key(&handle), WorkerState::Running);
        Ok(handle)
    }

    async fn status(&self, handle: &WorkerHandle) -> BackendResult<WorkerState> {
        Ok(self
            .states
            .get(&Self::key(handle))
            .map(|s| s.clone())
            .unwrap_or(WorkerState::Unknown))
    }

    async fn capture_output(&self, handle: &WorkerHandle) -> BackendResult<String> {
        Ok(self
            .outputs
            .get(&Self::key(handle))
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn kill(&self, handle: &WorkerHandle) -> BackendResult<()> {
        self.killed.insert(Self::key(handle), true);
        Ok(())
    }

    async fn cleanup(&self, _handle: &WorkerHandle) -> BackendResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingSink — lifecycle sink capturing events
// ---------------------------------------------------------------------------

use crate::notifier::{LifecycleSink, SinkError};
use fm_core::types::{LifecycleEvent, LifecycleKind};

#[derive(Default)]
pub struct RecordingSink {
    pub events: std::sync::Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<LifecycleKind> {
        self.events.lock().unwrap().iter().map(|e| e.event).collect()
    }
}

#[async_trait]
impl LifecycleSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
