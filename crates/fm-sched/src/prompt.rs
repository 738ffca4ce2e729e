//! Role-aware prompt composition.

use fm_core::config::ProjectConfig;
use fm_core::types::{Bead, Role};

/// Build the prompt handed verbatim to the worker. Reviewers get the PR diff
/// appended when the project runs a branch workflow and a diff is available.
pub fn build_prompt(
    role: Role,
    bead: &Bead,
    project: &ProjectConfig,
    pr_diff: Option<&str>,
) -> String {
    let id = &bead.id;
    let title = &bead.title;
    let desc = if bead.description.is_empty() {
        "No description"
    } else {
        &bead.description
    };
    let workspace = &project.workspace;

    let mut prompt = match role {
        Role::Scrum => format!(
            "Groom this backlog item: confirm it is actionable, add missing \
             estimate and acceptance criteria, and advance its stage.\n\
             Bead: {id} — {title}\nDescription: {desc}"
        ),
        Role::Planner => format!(
            "Plan the implementation of this bead. Break it into steps, name \
             the files to modify, and record the approach in the design \
             field.\nBead: {id} — {title}\nDescription: {desc}"
        ),
        Role::Coder => format!(
            "Implement this bead in the workspace. Work incrementally and \
             keep the tests green.\nBead: {id} — {title}\n\
             Description: {desc}\nWorkspace: {workspace}"
        ),
        Role::Reviewer => format!(
            "Review the implementation of this bead. Check correctness \
             against the acceptance criteria, run the tests, and leave \
             actionable findings.\nBead: {id} — {title}\nWorkspace: {workspace}"
        ),
        Role::Ops => format!(
            "Verify this bead operationally: run the deployment checks in \
             the workspace and confirm the change is safe to ship.\n\
             Bead: {id} — {title}\nWorkspace: {workspace}"
        ),
    };

    if let Some(acceptance) = &bead.acceptance {
        prompt.push_str(&format!("\nAcceptance: {acceptance}"));
    }
    if let Some(design) = &bead.design {
        if role == Role::Coder {
            prompt.push_str(&format!("\nDesign: {design}"));
        }
    }
    if role == Role::Reviewer && project.branch_workflow {
        if let Some(diff) = pr_diff {
            prompt.push_str(&format!("\n\nPull request diff:\n{diff}"));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fm_core::types::{BeadStatus, BeadType};

    fn project(branch_workflow: bool) -> ProjectConfig {
        ProjectConfig {
            id: "p1".into(),
            enabled: true,
            priority: 1,
            workspace: "/w/p1".into(),
            beads_dir: "/w/p1/.beads".into(),
            branch_workflow,
            base_branch: "main".into(),
            require_estimate: false,
            require_acceptance: false,
            dod_commands: vec![],
            coverage_min: None,
            cadence_hours: None,
        }
    }

    fn bead() -> Bead {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Bead {
            id: "b-1".into(),
            title: "Add pagination".into(),
            description: "API returns everything at once".into(),
            status: BeadStatus::Open,
            bead_type: BeadType::Feature,
            priority: 1,
            labels: vec![],
            estimate_minutes: 45,
            acceptance: Some("pages of 50".into()),
            design: None,
            depends_on: vec![],
            parent: None,
            dependencies: vec![],
            created_at: t,
            updated_at: t,
            closed_at: None,
            assignee: None,
        }
    }

    #[test]
    fn coder_prompt_names_workspace_and_acceptance() {
        let p = build_prompt(Role::Coder, &bead(), &project(false), None);
        assert!(p.contains("b-1"));
        assert!(p.contains("/w/p1"));
        assert!(p.contains("pages of 50"));
    }

    #[test]
    fn reviewer_diff_only_under_branch_workflow() {
        let with = build_prompt(Role::Reviewer, &bead(), &project(true), Some("+ line"));
        assert!(with.contains("Pull request diff"));
        let without = build_prompt(Role::Reviewer, &bead(), &project(false), Some("+ line"));
        assert!(!without.contains("Pull request diff"));
    }
}
