//! Subprocess plumbing for the external bead tool.
//!
//! The orchestrator never touches bead files directly; every read and
//! mutation shells out to the bead CLI. The runner is a trait so higher
//! layers can be exercised against canned outputs.

use std::path::Path;

use async_trait::async_trait;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BeadCliError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bead CLI exited {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("parse: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, BeadCliError>;

// ---------------------------------------------------------------------------
// CliRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs one bead-CLI invocation in the given beads directory.
#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(&self, beads_dir: &Path, args: &[&str]) -> Result<CliOutput>;
}

// ---------------------------------------------------------------------------
// BeadTool — the real subprocess runner
// ---------------------------------------------------------------------------

pub struct BeadTool {
    program: String,
}

impl BeadTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for BeadTool {
    fn default() -> Self {
        Self::new("beads")
    }
}

#[async_trait]
impl CliRunner for BeadTool {
    async fn run(&self, beads_dir: &Path, args: &[&str]) -> Result<CliOutput> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .current_dir(beads_dir)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        // Stderr is diagnostic only; a non-zero exit is the failure signal.
        if !stderr.trim().is_empty() {
            warn!(program = %self.program, args = ?args, stderr = %stderr.trim(), "bead CLI stderr");
        }
        if exit_code != 0 {
            return Err(BeadCliError::NonZeroExit {
                code: exit_code,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CliOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
