use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BeadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    Closed,
    InProgress,
    Cancelled,
}

impl BeadStatus {
    /// A bead only satisfies a dependency edge once it is closed.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, BeadStatus::Closed)
    }
}

// ---------------------------------------------------------------------------
// BeadType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadType {
    Task,
    Bug,
    Feature,
    Epic,
}

impl BeadType {
    /// Executable types are the ones an epic breakdown is expected to produce.
    pub fn is_executable(&self) -> bool {
        matches!(self, BeadType::Task | BeadType::Bug | BeadType::Feature)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BeadType::Task => "task",
            BeadType::Bug => "bug",
            BeadType::Feature => "feature",
            BeadType::Epic => "epic",
        }
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Scrum,
    Planner,
    Coder,
    Reviewer,
    Ops,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Scrum => "scrum",
            Role::Planner => "planner",
            Role::Coder => "coder",
            Role::Reviewer => "reviewer",
            Role::Ops => "ops",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "scrum" => Some(Role::Scrum),
            "planner" => Some(Role::Planner),
            "coder" => Some(Role::Coder),
            "reviewer" => Some(Role::Reviewer),
            "ops" => Some(Role::Ops),
            _ => None,
        }
    }

    /// Parse the role from the trailing `-<role>` suffix of an agent id
    /// (`myproject-coder` -> `Coder`).
    pub fn from_agent_id(agent_id: &str) -> Option<Role> {
        let suffix = agent_id.rsplit('-').next()?;
        Role::parse(suffix)
    }

    /// Only coder and reviewer dispatches count against concurrency caps.
    pub fn is_capacity_bounded(&self) -> bool {
        matches!(self, Role::Coder | Role::Reviewer)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent id under which a dispatch runs: `<project>-<role>`.
pub fn agent_id(project: &str, role: Role) -> String {
    format!("{project}-{role}")
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Balanced,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Balanced => "balanced",
            Tier::Premium => "premium",
        }
    }

    /// One tier cheaper, or `None` at the floor.
    pub fn step_down(&self) -> Option<Tier> {
        match self {
            Tier::Premium => Some(Tier::Balanced),
            Tier::Balanced => Some(Tier::Fast),
            Tier::Fast => None,
        }
    }

    /// One tier up, or `None` at the ceiling.
    pub fn step_up(&self) -> Option<Tier> {
        match self {
            Tier::Fast => Some(Tier::Balanced),
            Tier::Balanced => Some(Tier::Premium),
            Tier::Premium => None,
        }
    }

    /// The tier walk used by the provider picker: the downgrade chain from
    /// `self` first, then the remaining tiers upward.
    pub fn walk(&self) -> Vec<Tier> {
        let mut out = Vec::with_capacity(3);
        let mut cur = Some(*self);
        while let Some(t) = cur {
            out.push(t);
            cur = t.step_down();
        }
        let mut up = self.step_up();
        while let Some(t) = up {
            out.push(t);
            up = t.step_up();
        }
        out
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkflowStage
// ---------------------------------------------------------------------------

/// Position of a bead in the workflow, carried as a `stage:<name>` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Backlog,
    Planning,
    Ready,
    Coding,
    Review,
    Qa,
    Dod,
    Done,
}

impl WorkflowStage {
    pub fn order(&self) -> u8 {
        match self {
            WorkflowStage::Backlog => 0,
            WorkflowStage::Planning => 1,
            WorkflowStage::Ready => 2,
            WorkflowStage::Coding => 3,
            WorkflowStage::Review => 4,
            WorkflowStage::Qa => 5,
            WorkflowStage::Dod => 6,
            WorkflowStage::Done => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Backlog => "backlog",
            WorkflowStage::Planning => "planning",
            WorkflowStage::Ready => "ready",
            WorkflowStage::Coding => "coding",
            WorkflowStage::Review => "review",
            WorkflowStage::Qa => "qa",
            WorkflowStage::Dod => "dod",
            WorkflowStage::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<WorkflowStage> {
        match s {
            "backlog" => Some(WorkflowStage::Backlog),
            "planning" => Some(WorkflowStage::Planning),
            "ready" => Some(WorkflowStage::Ready),
            "coding" => Some(WorkflowStage::Coding),
            "review" => Some(WorkflowStage::Review),
            "qa" => Some(WorkflowStage::Qa),
            "dod" => Some(WorkflowStage::Dod),
            "done" => Some(WorkflowStage::Done),
            _ => None,
        }
    }

    /// The processing role that handles a bead sitting in this stage.
    /// `Dod` is handled internally (no dispatch) and `Done` means skip;
    /// both return `None`.
    pub fn role(&self) -> Option<Role> {
        match self {
            WorkflowStage::Backlog => Some(Role::Scrum),
            WorkflowStage::Planning => Some(Role::Planner),
            WorkflowStage::Ready | WorkflowStage::Coding => Some(Role::Coder),
            WorkflowStage::Review => Some(Role::Reviewer),
            WorkflowStage::Qa => Some(Role::Ops),
            WorkflowStage::Dod | WorkflowStage::Done => None,
        }
    }

    pub fn label(&self) -> String {
        format!("stage:{}", self.as_str())
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Typed bead dependencies
// ---------------------------------------------------------------------------

pub const DEP_DISCOVERED_FROM: &str = "discovered-from";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadDependency {
    #[serde(rename = "type")]
    pub dep_type: String,
    pub target: String,
}

impl BeadDependency {
    pub fn discovered_from(target: impl Into<String>) -> Self {
        Self {
            dep_type: DEP_DISCOVERED_FROM.to_string(),
            target: target.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// Unit of work owned by the external bead CLI. The orchestrator reads beads
/// via list/show and mutates them via create/close/update/claim calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: BeadStatus,
    #[serde(rename = "type")]
    pub bead_type: BeadType,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Estimate in minutes; 0 means no estimate recorded.
    #[serde(default)]
    pub estimate_minutes: i64,
    #[serde(default)]
    pub acceptance: Option<String>,
    #[serde(default)]
    pub design: Option<String>,
    /// Dependency ids, each either local (`b-12`) or qualified (`proj:b-12`).
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<BeadDependency>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignee: Option<String>,
}

impl Bead {
    /// The advanced-most `stage:*` label, if any.
    pub fn workflow_stage(&self) -> Option<WorkflowStage> {
        self.labels
            .iter()
            .filter_map(|l| l.strip_prefix("stage:"))
            .filter_map(WorkflowStage::parse)
            .max_by_key(|s| s.order())
    }

    /// All labels joined and lowercased, for keyword heuristics.
    pub fn joined_labels_lower(&self) -> String {
        self.labels.join(" ").to_lowercase()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Ceremony beads are deduplicated purely by this id prefix.
    pub fn is_ceremony(&self) -> bool {
        self.id.starts_with("ceremony-")
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, BeadStatus::Open | BeadStatus::InProgress)
    }

    /// Typed `discovered-from` targets plus legacy `depends_on` ids. The
    /// escalation dedupe must recognize either encoding.
    pub fn discovery_targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .dependencies
            .iter()
            .filter(|d| d.dep_type == DEP_DISCOVERED_FROM)
            .map(|d| d.target.as_str())
            .collect();
        out.extend(self.depends_on.iter().map(String::as_str));
        out
    }

    /// Best-effort "when did this bead stop being active": closed-at, then
    /// updated-at, then created-at.
    pub fn inactive_since(&self) -> DateTime<Utc> {
        self.closed_at.unwrap_or(if self.updated_at > self.created_at {
            self.updated_at
        } else {
            self.created_at
        })
    }
}

// ---------------------------------------------------------------------------
// DispatchStatus / DispatchStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Running,
    Completed,
    Failed,
    PendingRetry,
    Retried,
    Cancelled,
    Interrupted,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchStatus::Running | DispatchStatus::PendingRetry)
    }

    /// Statuses that count toward churn accounting.
    pub fn is_churn_relevant(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Running
                | DispatchStatus::Completed
                | DispatchStatus::Failed
                | DispatchStatus::Cancelled
                | DispatchStatus::PendingRetry
                | DispatchStatus::Retried
                | DispatchStatus::Interrupted
        )
    }

    /// Statuses that extend a consecutive-failure streak.
    pub fn is_failure_like(&self) -> bool {
        matches!(self, DispatchStatus::Failed | DispatchStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    Running,
    Completed,
    Failed,
    FailedNeedsCheck,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Persistent record of one launched worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    /// Monotonically assigned by the store.
    pub id: i64,
    pub bead_id: String,
    pub project: String,
    /// `<project>-<role>` identity the worker runs under.
    pub agent_id: String,
    /// Provider model name.
    pub provider: String,
    pub tier: Tier,
    pub pid: Option<u32>,
    /// Empty for child-process backends.
    pub session_name: String,
    /// Verbatim prompt, reused on retry.
    pub prompt: String,
    pub log_path: Option<String>,
    pub base_branch: Option<String>,
    pub branch: Option<String>,
    pub backend: String,
    pub status: DispatchStatus,
    pub stage: DispatchStage,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub duration_s: Option<i64>,
    pub retries: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub failure_category: Option<String>,
    pub failure_summary: Option<String>,
    /// Bead labels at dispatch time.
    pub labels: Vec<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
}

/// Everything needed to insert a fresh dispatch row; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewDispatch {
    pub bead_id: String,
    pub project: String,
    pub agent_id: String,
    pub provider: String,
    pub tier: Tier,
    pub pid: Option<u32>,
    pub session_name: String,
    pub prompt: String,
    pub log_path: Option<String>,
    pub base_branch: Option<String>,
    pub branch: Option<String>,
    pub backend: String,
    pub dispatched_at: DateTime<Utc>,
    pub retries: u32,
    pub labels: Vec<String>,
}

// ---------------------------------------------------------------------------
// HealthEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub id: i64,
    pub event_type: String,
    pub details: String,
    pub dispatch_id: Option<i64>,
    pub bead_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Well-known health event types appended by guards, supervisor, and the
/// retry engine.
pub mod health_events {
    pub const BEAD_CHURN_BLOCKED: &str = "bead_churn_blocked";
    pub const BEAD_QUARANTINED: &str = "bead_quarantined";
    pub const DISPATCH_BLOCKED_COST_CONTROL: &str = "dispatch_blocked_cost_control";
    pub const DISPATCH_STUCK: &str = "dispatch_stuck";
    pub const ZOMBIE_SESSION_KILLED: &str = "zombie_session_killed";
    pub const EPIC_BREAKDOWN_AUTO_CLOSED: &str = "epic_breakdown_auto_closed";
    pub const DISPATCH_DIAGNOSED: &str = "dispatch_diagnosed";
    pub const CAPACITY_DENY: &str = "capacity_deny";
    pub const RETRY_EXHAUSTED: &str = "retry_exhausted";
    pub const SYSTEM_PAUSED: &str = "system_paused";
}

// ---------------------------------------------------------------------------
// ClaimLease
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimLease {
    pub bead_id: String,
    pub owner: String,
    pub heartbeat_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// OverflowItem
// ---------------------------------------------------------------------------

/// Work that passed every guard but was denied admission this tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowItem {
    pub id: i64,
    pub bead_id: String,
    pub project: String,
    pub role: Role,
    pub agent_id: String,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Sprint planning marker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintTrigger {
    Scheduled,
    Threshold,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprintMarker {
    pub project: String,
    pub last_run: DateTime<Utc>,
    pub trigger: SprintTrigger,
}

// ---------------------------------------------------------------------------
// QualityScore
// ---------------------------------------------------------------------------

/// Per-dispatch quality signal used to disqualify providers per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    pub dispatch_id: i64,
    pub provider: String,
    pub role: Role,
    pub score: f64,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

/// Closed set of lifecycle event names emitted per dispatch state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    DispatchStarted,
    DispatchCompleted,
    DispatchFailed,
    DispatchRetryQueued,
    DispatchRetried,
    DispatchCancelled,
    DispatchInterrupted,
    DispatchStatusChanged,
    DispatchBlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub project: String,
    pub bead_id: String,
    pub dispatch_id: Option<i64>,
    pub event: LifecycleKind,
    pub workflow_stage: Option<WorkflowStage>,
    pub dispatch_stage: Option<DispatchStage>,
    pub status: Option<DispatchStatus>,
    pub agent: String,
    pub provider: String,
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
