use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("backend error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

// ---------------------------------------------------------------------------
// Handle & state
// ---------------------------------------------------------------------------

/// Opaque handle to one launched worker. The tmux backend fills
/// `session_name`; the headless backend leaves it empty and fills `pid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    pub session_name: String,
    pub backend: String,
}

/// Liveness of a worker as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Exited {
        code: i32,
        output_path: Option<String>,
    },
    /// The terminal session disappeared without reporting an exit.
    Gone,
    /// The child vanished without a recorded exit status.
    Unknown,
}

// ---------------------------------------------------------------------------
// WorkerBackend trait
// ---------------------------------------------------------------------------

/// Uniform dispatch/status/kill/cleanup contract every worker backend
/// implements. Registered under the names `tmux` and `headless_cli`.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Launch a worker for `agent` with the verbatim `prompt`.
    async fn dispatch(
        &self,
        agent: &str,
        prompt: &str,
        model: &str,
        thinking_level: &str,
        work_dir: &str,
    ) -> Result<WorkerHandle>;

    async fn status(&self, handle: &WorkerHandle) -> Result<WorkerState>;

    /// Captured output of the worker: the pane scrollback for tmux, the
    /// redirected output file for the headless backend.
    async fn capture_output(&self, handle: &WorkerHandle) -> Result<String>;

    async fn kill(&self, handle: &WorkerHandle) -> Result<()>;

    /// Release backend-side resources for a finished worker.
    async fn cleanup(&self, handle: &WorkerHandle) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Worker command line
// ---------------------------------------------------------------------------

/// Argument vector for the worker CLI, shared by both backends.
///
/// The worker binary takes the prompt via `-p` and skips interactive
/// approval; model and thinking level are passed through as flags.
pub fn worker_args(prompt: &str, model: &str, thinking_level: &str) -> Vec<String> {
    vec![
        "--dangerously-skip-permissions".into(),
        "--model".into(),
        model.into(),
        "--thinking".into(),
        thinking_level.into(),
        "-p".into(),
        prompt.into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_args_carry_prompt_verbatim() {
        let args = worker_args("fix the bug\nwith newline", "sonnet", "medium");
        assert_eq!(args.last().map(String::as_str), Some("fix the bug\nwith newline"));
        assert!(args.contains(&"sonnet".to_string()));
    }
}
