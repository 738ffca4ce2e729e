//! Typed bead operations over the CLI.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fm_core::types::{Bead, BeadType};

use crate::cli::{BeadCliError, CliRunner, Result};

// ---------------------------------------------------------------------------
// BeadService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreateBead {
    pub title: String,
    pub bead_type: BeadType,
    pub priority: i64,
    pub description: String,
    /// `discovered-from:<id>` style dependency specs passed through verbatim.
    pub deps: Vec<String>,
}

/// The bead operations the scheduler needs. Implemented over the external
/// CLI in production and in memory for tests.
#[async_trait]
pub trait BeadService: Send + Sync {
    /// All beads in the project's beads directory.
    async fn list(&self, beads_dir: &str) -> Result<Vec<Bead>>;

    /// Fetch one bead with acceptance, design, and estimate populated.
    async fn enrich(&self, beads_dir: &str, id: &str) -> Result<Bead>;

    /// Create a bead; returns the assigned id.
    async fn create(&self, beads_dir: &str, req: CreateBead) -> Result<String>;

    async fn close(&self, beads_dir: &str, id: &str, reason: Option<&str>) -> Result<()>;

    async fn set_labels(&self, beads_dir: &str, id: &str, labels: &[String]) -> Result<()>;

    /// Acquire the per-bead claim lease. `false` means another agent holds it.
    async fn claim(&self, beads_dir: &str, id: &str, owner: &str, ttl_secs: u64) -> Result<bool>;

    async fn release_claim(&self, beads_dir: &str, id: &str, owner: &str) -> Result<()>;

    /// Refresh the claim heartbeat so the lease does not expire mid-dispatch.
    async fn heartbeat_claim(&self, beads_dir: &str, id: &str, owner: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// CliBeadService
// ---------------------------------------------------------------------------

pub struct CliBeadService {
    runner: Arc<dyn CliRunner>,
}

impl CliBeadService {
    pub fn new(runner: Arc<dyn CliRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl BeadService for CliBeadService {
    async fn list(&self, beads_dir: &str) -> Result<Vec<Bead>> {
        let out = self
            .runner
            .run(Path::new(beads_dir), &["list", "--json"])
            .await?;
        parse_beads(&out.stdout)
    }

    async fn enrich(&self, beads_dir: &str, id: &str) -> Result<Bead> {
        let out = self
            .runner
            .run(Path::new(beads_dir), &["show", id, "--json"])
            .await?;
        parse_bead(&out.stdout)
    }

    async fn create(&self, beads_dir: &str, req: CreateBead) -> Result<String> {
        let priority = req.priority.to_string();
        let mut args: Vec<&str> = vec![
            "create",
            &req.title,
            req.bead_type.as_str(),
            &priority,
            &req.description,
        ];
        for dep in &req.deps {
            args.push(dep);
        }
        let out = self.runner.run(Path::new(beads_dir), &args).await?;
        let id = out.stdout.trim().to_string();
        if id.is_empty() {
            return Err(BeadCliError::Parse("create returned no bead id".into()));
        }
        Ok(id)
    }

    async fn close(&self, beads_dir: &str, id: &str, reason: Option<&str>) -> Result<()> {
        let mut args = vec!["close", id];
        let reason_arg;
        if let Some(r) = reason {
            reason_arg = format!("--reason={r}");
            args.push(&reason_arg);
        }
        self.runner.run(Path::new(beads_dir), &args).await?;
        Ok(())
    }

    async fn set_labels(&self, beads_dir: &str, id: &str, labels: &[String]) -> Result<()> {
        let csv = labels.join(",");
        self.runner
            .run(Path::new(beads_dir), &["update", id, "--set-labels", &csv])
            .await?;
        Ok(())
    }

    async fn claim(&self, beads_dir: &str, id: &str, owner: &str, ttl_secs: u64) -> Result<bool> {
        let ttl = format!("--ttl={ttl_secs}");
        match self
            .runner
            .run(Path::new(beads_dir), &["claim", "acquire", id, owner, &ttl])
            .await
        {
            Ok(_) => Ok(true),
            // A contended lease is a normal outcome, not an error.
            Err(BeadCliError::NonZeroExit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn release_claim(&self, beads_dir: &str, id: &str, owner: &str) -> Result<()> {
        self.runner
            .run(Path::new(beads_dir), &["claim", "release", id, owner])
            .await?;
        Ok(())
    }

    async fn heartbeat_claim(&self, beads_dir: &str, id: &str, owner: &str) -> Result<()> {
        self.runner
            .run(Path::new(beads_dir), &["claim", "heartbeat", id, owner])
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Stdout parsing tolerates trailing whitespace and blank lines.
fn parse_beads(stdout: &str) -> Result<Vec<Bead>> {
    serde_json::from_str(stdout.trim()).map_err(|e| BeadCliError::Parse(e.to_string()))
}

fn parse_bead(stdout: &str) -> Result<Bead> {
    serde_json::from_str(stdout.trim()).map_err(|e| BeadCliError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CliOutput;
    use std::sync::Mutex;

    /// Scripted runner: pops one canned output per call, recording args.
    struct ScriptedRunner {
        outputs: Mutex<Vec<Result<CliOutput>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<Result<CliOutput>>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn ok(stdout: &str) -> Result<CliOutput> {
            Ok(CliOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    #[async_trait]
    impl CliRunner for ScriptedRunner {
        async fn run(&self, _beads_dir: &Path, args: &[&str]) -> Result<CliOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                ScriptedRunner::ok("")
            } else {
                outputs.remove(0)
            }
        }
    }

    const BEAD_JSON: &str = r#"
    [{
        "id": "b-1",
        "title": "Fix flaky login test",
        "status": "open",
        "type": "bug",
        "priority": 1,
        "labels": ["stage:coding"],
        "created_at": "2026-03-01T10:00:00Z",
        "updated_at": "2026-03-01T11:00:00Z"
    }]
    "#;

    #[tokio::test]
    async fn list_parses_with_trailing_whitespace() {
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::ok(&format!(
            "{BEAD_JSON}\n\n  "
        ))]));
        let svc = CliBeadService::new(runner);
        let beads = svc.list("/b").await.unwrap();
        assert_eq!(beads.len(), 1);
        assert_eq!(beads[0].id, "b-1");
        assert_eq!(beads[0].estimate_minutes, 0);
    }

    #[tokio::test]
    async fn create_returns_trimmed_id() {
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::ok("b-42\n")]));
        let svc = CliBeadService::new(runner.clone());
        let id = svc
            .create(
                "/b",
                CreateBead {
                    title: "Auto: break down epic e-1 into executable bug/task beads".into(),
                    bead_type: BeadType::Task,
                    priority: 1,
                    description: "desc".into(),
                    deps: vec!["discovered-from:e-1".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(id, "b-42");
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0][0], "create");
        assert!(calls[0].contains(&"discovered-from:e-1".to_string()));
    }

    #[tokio::test]
    async fn contended_claim_is_false_not_error() {
        let runner = Arc::new(ScriptedRunner::new(vec![Err(BeadCliError::NonZeroExit {
            code: 1,
            stderr: "claim held by p2-coder".into(),
        })]));
        let svc = CliBeadService::new(runner);
        let got = svc.claim("/b", "b-1", "p1-coder", 300).await.unwrap();
        assert!(!got);
    }
}
