//! Headless child-process worker backend.
//!
//! Workers run as plain child processes with stdout/stderr redirected to an
//! output file. A monitor task per child records the exit code into a shared
//! process-state map; the supervisor reads liveness from that map. A pid that
//! is absent from the map yields `Unknown` — the child vanished without a
//! recorded exit.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::backend::{worker_args, BackendError, Result, WorkerBackend, WorkerHandle, WorkerState};

pub const HEADLESS_BACKEND: &str = "headless_cli";

#[derive(Debug, Clone)]
enum ChildState {
    Running { output_path: String },
    Exited { code: i32, output_path: String },
}

pub struct HeadlessBackend {
    worker_bin: String,
    output_dir: PathBuf,
    states: Arc<DashMap<u32, ChildState>>,
}

impl HeadlessBackend {
    pub fn new(worker_bin: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            output_dir: output_dir.into(),
            states: Arc::new(DashMap::new()),
        }
    }

    fn output_path(&self, agent: &str, pid: u32) -> PathBuf {
        self.output_dir.join(format!("{agent}-{pid}.log"))
    }
}

#[async_trait]
impl WorkerBackend for HeadlessBackend {
    fn name(&self) -> &str {
        HEADLESS_BACKEND
    }

    async fn dispatch(
        &self,
        agent: &str,
        prompt: &str,
        model: &str,
        thinking_level: &str,
        work_dir: &str,
    ) -> Result<WorkerHandle> {
        std::fs::create_dir_all(&self.output_dir)?;

        // Spawn first to learn the pid, then name the output file after it.
        let tmp_path = self.output_dir.join(format!("{agent}-pending.log"));
        let out_file = std::fs::File::create(&tmp_path)?;
        let err_file = out_file.try_clone()?;

        let mut child = tokio::process::Command::new(&self.worker_bin)
            .args(worker_args(prompt, model, thinking_level))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out_file))
            .stderr(Stdio::from(err_file))
            .spawn()
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| BackendError::SpawnFailed("child exited before pid read".into()))?;

        let final_path = self.output_path(agent, pid);
        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            warn!(error = %e, "failed to rename worker output file");
        }
        let output_path = final_path.to_string_lossy().to_string();

        self.states.insert(
            pid,
            ChildState::Running {
                output_path: output_path.clone(),
            },
        );

        // Monitor: record the exit code when the child finishes.
        let states = self.states.clone();
        let monitor_path = output_path.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(pid, error = %e, "wait on worker child failed");
                    -1
                }
            };
            states.insert(
                pid,
                ChildState::Exited {
                    code,
                    output_path: monitor_path,
                },
            );
            debug!(pid, code, "worker child exited");
        });

        Ok(WorkerHandle {
            pid: Some(pid),
            session_name: String::new(),
            backend: HEADLESS_BACKEND.to_string(),
        })
    }

    async fn status(&self, handle: &WorkerHandle) -> Result<WorkerState> {
        let pid = match handle.pid {
            Some(pid) => pid,
            None => return Ok(WorkerState::Unknown),
        };
        match self.states.get(&pid).map(|s| s.clone()) {
            Some(ChildState::Running { .. }) => Ok(WorkerState::Running),
            Some(ChildState::Exited { code, output_path }) => Ok(WorkerState::Exited {
                code,
                output_path: Some(output_path),
            }),
            None => Ok(WorkerState::Unknown),
        }
    }

    async fn capture_output(&self, handle: &WorkerHandle) -> Result<String> {
        let pid = handle
            .pid
            .ok_or_else(|| BackendError::General("handle has no pid".into()))?;
        let path = match self.states.get(&pid).map(|s| s.clone()) {
            Some(ChildState::Running { output_path })
            | Some(ChildState::Exited { output_path, .. }) => output_path,
            None => return Err(BackendError::General(format!("no state for pid {pid}"))),
        };
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        if let Some(pid) = handle.pid {
            terminate(pid);
        }
        Ok(())
    }

    async fn cleanup(&self, handle: &WorkerHandle) -> Result<()> {
        if let Some(pid) = handle.pid {
            self.states.remove(&pid);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: SIGTERM to a pid we spawned; a stale pid is a harmless ESRCH.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HeadlessBackend {
        let dir = std::env::temp_dir().join(format!("fm-headless-{}", std::process::id()));
        HeadlessBackend::new("/bin/sh", dir)
    }

    #[tokio::test]
    async fn unknown_pid_reports_unknown() {
        let b = backend();
        let handle = WorkerHandle {
            pid: Some(999_999),
            session_name: String::new(),
            backend: HEADLESS_BACKEND.into(),
        };
        assert_eq!(b.status(&handle).await.unwrap(), WorkerState::Unknown);
    }

    #[tokio::test]
    async fn handle_without_pid_reports_unknown() {
        let b = backend();
        let handle = WorkerHandle {
            pid: None,
            session_name: String::new(),
            backend: HEADLESS_BACKEND.into(),
        };
        assert_eq!(b.status(&handle).await.unwrap(), WorkerState::Unknown);
    }
}
