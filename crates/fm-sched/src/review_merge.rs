//! Approved-PR merge pass.
//!
//! After a reviewer dispatch finishes for a bead in review under a branch
//! workflow, the pass consults the pull-request host: an open PR with an
//! approved review decision is merged exactly once. Post-merge checks decide
//! whether the bead closes or the merge is reverted and the bead returns to
//! coding.

use std::sync::Arc;

use async_trait::async_trait;
use fm_beads::BeadService;
use fm_core::config::ProjectConfig;
use fm_core::types::{Bead, WorkflowStage};
use tracing::{info, warn};

use crate::dod;

// ---------------------------------------------------------------------------
// Pull-request host contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
    pub state: String,
    pub review_decision: String,
}

impl PrInfo {
    pub fn is_mergeable(&self) -> bool {
        self.state == "open" && self.review_decision == "APPROVED"
    }
}

#[async_trait]
pub trait PullRequestHost: Send + Sync {
    async fn pr_for_branch(&self, project: &str, branch: &str)
        -> Result<Option<PrInfo>, String>;

    async fn diff(&self, project: &str, number: u64) -> Result<String, String>;

    /// Merge the PR; returns the merge commit SHA.
    async fn merge(&self, project: &str, number: u64) -> Result<String, String>;

    async fn revert(&self, project: &str, sha: &str) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Merge pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merged and post-merge checks passed; the bead is closed.
    Merged { sha: String },
    /// Merged, checks failed, merge reverted; the bead went back to coding.
    MergedThenReverted { sha: String },
    /// No open+approved PR — nothing to do.
    NotApproved,
    NoPullRequest,
}

pub struct MergePass {
    host: Arc<dyn PullRequestHost>,
    beads: Arc<dyn BeadService>,
}

impl MergePass {
    pub fn new(host: Arc<dyn PullRequestHost>, beads: Arc<dyn BeadService>) -> Self {
        Self { host, beads }
    }

    pub async fn run(
        &self,
        project: &ProjectConfig,
        bead: &Bead,
        branch: &str,
    ) -> Result<MergeOutcome, String> {
        let Some(pr) = self.host.pr_for_branch(&project.id, branch).await? else {
            return Ok(MergeOutcome::NoPullRequest);
        };
        if !pr.is_mergeable() {
            return Ok(MergeOutcome::NotApproved);
        }

        // Merge exactly once; the post-merge verdict only decides what
        // happens to the merge commit afterwards.
        let sha = self.host.merge(&project.id, pr.number).await?;
        info!(bead_id = %bead.id, pr = pr.number, sha = %sha, "approved PR merged");

        let report = dod::run_checks(project).await;
        if report.passed {
            self.beads
                .close(&project.beads_dir, &bead.id, Some("merged"))
                .await
                .map_err(|e| e.to_string())?;
            return Ok(MergeOutcome::Merged { sha });
        }

        warn!(
            bead_id = %bead.id,
            sha = %sha,
            failures = ?report.failures,
            "post-merge checks failed, reverting"
        );
        self.host.revert(&project.id, &sha).await?;
        self.set_stage(project, bead, WorkflowStage::Coding).await?;
        Ok(MergeOutcome::MergedThenReverted { sha })
    }

    async fn set_stage(
        &self,
        project: &ProjectConfig,
        bead: &Bead,
        stage: WorkflowStage,
    ) -> Result<(), String> {
        let mut labels: Vec<String> = bead
            .labels
            .iter()
            .filter(|l| !l.starts_with("stage:"))
            .cloned()
            .collect();
        labels.push(stage.label());
        self.beads
            .set_labels(&project.beads_dir, &bead.id, &labels)
            .await
            .map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
