//! Definition-of-done execution.
//!
//! Per project, an ordered list of shell commands runs in the workspace with
//! a 10-minute timeout each. Output is truncated to 2000 bytes per command.
//! An optional coverage minimum is parsed from the combined output.

use std::time::Duration;

use fm_core::config::ProjectConfig;
use fm_core::types::Bead;
use tracing::{info, warn};

pub const COMMAND_TIMEOUT_SECS: u64 = 600;
pub const OUTPUT_CAP_BYTES: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, Clone, Default)]
pub struct DodReport {
    pub passed: bool,
    pub results: Vec<CommandResult>,
    pub failures: Vec<String>,
    pub coverage: Option<f64>,
}

/// Run every configured DoD command in order. Commands keep running after a
/// failure so the report covers the whole list.
pub async fn run_checks(project: &ProjectConfig) -> DodReport {
    let mut report = DodReport {
        passed: true,
        ..DodReport::default()
    };

    for command in &project.dod_commands {
        let result = run_command(command, &project.workspace).await;
        if result.exit_code != 0 {
            report.passed = false;
            report
                .failures
                .push(format!("{command}: exit {}", result.exit_code));
        }
        if let Some(cov) = parse_coverage(&result.output) {
            report.coverage = Some(cov);
        }
        report.results.push(result);
    }

    if let Some(min) = project.coverage_min {
        match report.coverage {
            Some(cov) if cov < min => {
                report.passed = false;
                report
                    .failures
                    .push(format!("coverage {cov:.1}% below minimum {min:.1}%"));
            }
            None => {
                report.passed = false;
                report.failures.push("coverage not reported".to_string());
            }
            _ => {}
        }
    }

    info!(
        project = %project.id,
        passed = report.passed,
        failures = report.failures.len(),
        "dod checks finished"
    );
    report
}

async fn run_command(command: &str, workspace: &str) -> CommandResult {
    let fut = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .output();

    match tokio::time::timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), fut).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandResult {
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                output: truncate(&text, OUTPUT_CAP_BYTES),
            }
        }
        Ok(Err(e)) => {
            warn!(command, error = %e, "dod command failed to start");
            CommandResult {
                command: command.to_string(),
                exit_code: -1,
                output: e.to_string(),
            }
        }
        Err(_) => CommandResult {
            command: command.to_string(),
            exit_code: -1,
            output: format!("timed out after {COMMAND_TIMEOUT_SECS}s"),
        },
    }
}

/// Parse `coverage: NN.N% of statements` from command output.
pub fn parse_coverage(output: &str) -> Option<f64> {
    for line in output.lines() {
        let Some(idx) = line.find("coverage:") else {
            continue;
        };
        let rest = line[idx + "coverage:".len()..].trim_start();
        let Some(pct_end) = rest.find('%') else {
            continue;
        };
        if let Ok(value) = rest[..pct_end].trim().parse::<f64>() {
            if rest[pct_end..].contains("of statements") {
                return Some(value);
            }
        }
    }
    None
}

fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Bead-level structural requirements enforced before coder/reviewer
/// dispatch.
pub fn structure_failures(bead: &Bead, project: &ProjectConfig) -> Vec<String> {
    let mut out = Vec::new();
    if project.require_estimate && bead.estimate_minutes <= 0 {
        out.push("missing estimate".to_string());
    }
    if project.require_acceptance
        && bead.acceptance.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        out.push("missing acceptance".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fm_core::types::{BeadStatus, BeadType};

    fn project(dod_commands: Vec<String>, coverage_min: Option<f64>) -> ProjectConfig {
        ProjectConfig {
            id: "p1".into(),
            enabled: true,
            priority: 1,
            workspace: "/tmp".into(),
            beads_dir: "/tmp".into(),
            branch_workflow: false,
            base_branch: "main".into(),
            require_estimate: true,
            require_acceptance: true,
            dod_commands,
            coverage_min,
            cadence_hours: None,
        }
    }

    #[test]
    fn coverage_parses_expected_format() {
        assert_eq!(
            parse_coverage("ok\ncoverage: 81.4% of statements\n"),
            Some(81.4)
        );
        assert_eq!(parse_coverage("coverage: 81.4% of lines"), None);
        assert_eq!(parse_coverage("no coverage here"), None);
    }

    #[test]
    fn truncation_caps_output() {
        let long = "x".repeat(5000);
        assert_eq!(truncate(&long, OUTPUT_CAP_BYTES).len(), OUTPUT_CAP_BYTES);
        assert_eq!(truncate("short", OUTPUT_CAP_BYTES), "short");
    }

    #[test]
    fn structure_gate_reports_missing_fields() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let bead = Bead {
            id: "b-1".into(),
            title: "t".into(),
            description: String::new(),
            status: BeadStatus::Open,
            bead_type: BeadType::Task,
            priority: 0,
            labels: vec![],
            estimate_minutes: 0,
            acceptance: Some("  ".into()),
            design: None,
            depends_on: vec![],
            parent: None,
            dependencies: vec![],
            created_at: t,
            updated_at: t,
            closed_at: None,
            assignee: None,
        };
        let fails = structure_failures(&bead, &project(vec![], None));
        assert_eq!(fails.len(), 2);
    }

    #[tokio::test]
    async fn passing_and_failing_commands_are_reported() {
        let p = project(vec!["true".into(), "false".into()], None);
        let report = run_checks(&p).await;
        assert!(!report.passed);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].exit_code, 0);
        assert_ne!(report.results[1].exit_code, 0);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn coverage_minimum_gates_the_report() {
        let p = project(
            vec!["echo 'coverage: 42.0% of statements'".into()],
            Some(80.0),
        );
        let report = run_checks(&p).await;
        assert!(!report.passed);
        assert_eq!(report.coverage, Some(42.0));
    }
}
