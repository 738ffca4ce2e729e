//! Terminal-multiplexer worker backend.
//!
//! Each dispatch becomes a detached tmux session named
//! `<prefix>-<agent>-<n>` with `remain-on-exit` set so the pane (and its
//! exit status) survives until the supervisor has read it. Liveness is read
//! from `#{pane_dead}` / `#{pane_dead_status}`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::{worker_args, BackendError, Result, WorkerBackend, WorkerHandle, WorkerState};

pub const TMUX_BACKEND: &str = "tmux";

pub struct TmuxBackend {
    /// Session-name prefix; the zombie sweep keys off it.
    prefix: String,
    /// Worker CLI binary launched inside the session.
    worker_bin: String,
    counter: AtomicU64,
}

impl TmuxBackend {
    pub fn new(prefix: impl Into<String>, worker_bin: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            worker_bin: worker_bin.into(),
            counter: AtomicU64::new(1),
        }
    }

    pub fn session_prefix(&self) -> &str {
        &self.prefix
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(BackendError::Io)
    }

    /// All live session names carrying our prefix. Used by the health sweep
    /// to find zombie sessions with no store row.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let out = self
            .tmux(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !out.status.success() {
            // No server running means no sessions.
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with(&self.prefix))
            .map(str::to_string)
            .collect())
    }

    pub async fn kill_session(&self, session: &str) -> Result<()> {
        let out = self.tmux(&["kill-session", "-t", session]).await?;
        if !out.status.success() {
            warn!(session, "tmux kill-session failed");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerBackend for TmuxBackend {
    fn name(&self) -> &str {
        TMUX_BACKEND
    }

    async fn dispatch(
        &self,
        agent: &str,
        prompt: &str,
        model: &str,
        thinking_level: &str,
        work_dir: &str,
    ) -> Result<WorkerHandle> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let session = format!("{}-{}-{}", self.prefix, agent, n);

        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            session.clone(),
            "-c".into(),
            work_dir.into(),
            self.worker_bin.clone(),
        ];
        args.extend(worker_args(prompt, model, thinking_level));

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.tmux(&arg_refs).await?;
        if !out.status.success() {
            return Err(BackendError::SpawnFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }

        // Keep the dead pane around so the exit status can be read later.
        let set = self
            .tmux(&["set-option", "-t", &session, "remain-on-exit", "on"])
            .await?;
        if !set.status.success() {
            warn!(session, "failed to set remain-on-exit");
        }

        debug!(session, agent, "tmux session dispatched");
        Ok(WorkerHandle {
            pid: None,
            session_name: session,
            backend: TMUX_BACKEND.to_string(),
        })
    }

    async fn status(&self, handle: &WorkerHandle) -> Result<WorkerState> {
        let session = handle.session_name.as_str();
        let has = self.tmux(&["has-session", "-t", session]).await?;
        if !has.status.success() {
            return Ok(WorkerState::Gone);
        }

        let panes = self
            .tmux(&["list-panes", "-t", session, "-F", "#{pane_dead} #{pane_dead_status}"])
            .await?;
        if !panes.status.success() {
            return Ok(WorkerState::Gone);
        }

        let text = String::from_utf8_lossy(&panes.stdout);
        let first = text.lines().next().unwrap_or("").trim();
        let mut parts = first.split_whitespace();
        match parts.next() {
            Some("1") => {
                let code = parts.next().and_then(|s| s.parse::<i32>().ok()).unwrap_or(-1);
                Ok(WorkerState::Exited {
                    code,
                    output_path: None,
                })
            }
            Some(_) => Ok(WorkerState::Running),
            None => Ok(WorkerState::Gone),
        }
    }

    async fn capture_output(&self, handle: &WorkerHandle) -> Result<String> {
        let out = self
            .tmux(&["capture-pane", "-p", "-t", &handle.session_name, "-S", "-"])
            .await?;
        if !out.status.success() {
            return Err(BackendError::SessionNotFound(handle.session_name.clone()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        self.kill_session(&handle.session_name).await
    }

    async fn cleanup(&self, handle: &WorkerHandle) -> Result<()> {
        // The dead pane is the only backend-side resource.
        self.kill_session(&handle.session_name).await
    }
}
