use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::Tier;

/// Top-level configuration loaded from `~/.foreman/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub cost_control: CostControlConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub chief: ChiefConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    /// Load config from `~/.foreman/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
            .join("config.toml")
    }

    /// Enabled projects sorted ascending by priority (lower = more important),
    /// id as tiebreak.
    pub fn enabled_projects(&self) -> Vec<&ProjectConfig> {
        let mut out: Vec<&ProjectConfig> = self.projects.iter().filter(|p| p.enabled).collect();
        out.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn project(&self, id: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.id == id)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on fresh dispatches recorded per tick.
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Running dispatches older than this are flagged stuck.
    #[serde(default = "default_stuck_timeout")]
    pub stuck_timeout_mins: i64,
    /// A `(bead, agent)` pair must not redispatch within this window after
    /// completing.
    #[serde(default = "default_cooldown")]
    pub dispatch_cooldown_mins: i64,
    #[serde(default = "default_epic_interval")]
    pub epic_breakdown_interval_hours: i64,
    #[serde(default = "default_true")]
    pub night_mode: bool,
    /// Rollout flag: infer candidate roles from persisted workflow stage
    /// pointers instead of stage labels.
    #[serde(default)]
    pub workflow_execution: bool,
    /// Operator-issued pause; ceremonies and DoD still drain.
    #[serde(default)]
    pub paused: bool,
    /// Fixed UTC offset (minutes) for night-mode hours; host-local when
    /// unset.
    #[serde(default)]
    pub local_utc_offset_mins: Option<i32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_per_tick: default_max_per_tick(),
            tick_interval_secs: default_tick_interval(),
            stuck_timeout_mins: default_stuck_timeout(),
            dispatch_cooldown_mins: default_cooldown(),
            epic_breakdown_interval_hours: default_epic_interval(),
            night_mode: true,
            workflow_execution: false,
            paused: false,
            local_utc_offset_mins: None,
        }
    }
}

fn default_max_per_tick() -> usize {
    5
}
fn default_tick_interval() -> u64 {
    30
}
fn default_stuck_timeout() -> i64 {
    60
}
fn default_cooldown() -> i64 {
    10
}
fn default_epic_interval() -> i64 {
    6
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_coders")]
    pub max_concurrent_coders: usize,
    #[serde(default = "default_max_reviewers")]
    pub max_concurrent_reviewers: usize,
    #[serde(default = "default_max_total")]
    pub max_concurrent_total: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_coders: default_max_coders(),
            max_concurrent_reviewers: default_max_reviewers(),
            max_concurrent_total: default_max_total(),
        }
    }
}

fn default_max_coders() -> usize {
    3
}
fn default_max_reviewers() -> usize {
    2
}
fn default_max_total() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: i64,
    #[serde(default = "default_backoff_max")]
    pub max_delay_secs: i64,
    /// Retries below this attempt stay at `fast` under spark-first routing.
    #[serde(default = "default_escalation_attempt")]
    pub escalation_attempt: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            max_delay_secs: default_backoff_max(),
            escalation_attempt: default_escalation_attempt(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> i64 {
    60
}
fn default_backoff_max() -> i64 {
    1800
}
fn default_escalation_attempt() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Authed dispatches allowed per provider inside the rolling 5 h window.
    #[serde(default = "default_window5h_cap")]
    pub window_5h_cap: u64,
    /// Authed dispatches allowed per provider inside the rolling 7 d window.
    #[serde(default = "default_weekly_cap")]
    pub weekly_cap: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_5h_cap: default_window5h_cap(),
            weekly_cap: default_weekly_cap(),
        }
    }
}

fn default_window5h_cap() -> u64 {
    40
}
fn default_weekly_cap() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostControlConfig {
    #[serde(default = "default_daily_cap")]
    pub daily_cost_cap_usd: f64,
    #[serde(default = "default_bead_cap")]
    pub per_bead_cost_cap_usd: f64,
    /// Weekly authed usage percentage at which every dispatch is forced to
    /// `fast`.
    #[serde(default = "default_force_spark_pct")]
    pub force_spark_at_weekly_pct: f64,
    #[serde(default = "default_stage_attempts")]
    pub per_bead_stage_attempt_limit: u32,
    #[serde(default = "default_stage_window")]
    pub stage_attempt_window_mins: i64,
    #[serde(default = "default_stage_cooldown")]
    pub stage_cooldown_mins: i64,
    /// Estimates at or above this may escalate above `fast` even under
    /// spark-first routing.
    #[serde(default = "default_escalation_minutes")]
    pub complexity_escalation_minutes: i64,
    /// Label markers that make a review risky enough to escalate.
    #[serde(default = "default_risky_markers")]
    pub risky_review_markers: Vec<String>,
    /// One block log per `(project, bead, role, stage, reason)` inside this
    /// window.
    #[serde(default = "default_block_log_window")]
    pub block_log_window_mins: i64,
}

impl Default for CostControlConfig {
    fn default() -> Self {
        Self {
            daily_cost_cap_usd: default_daily_cap(),
            per_bead_cost_cap_usd: default_bead_cap(),
            force_spark_at_weekly_pct: default_force_spark_pct(),
            per_bead_stage_attempt_limit: default_stage_attempts(),
            stage_attempt_window_mins: default_stage_window(),
            stage_cooldown_mins: default_stage_cooldown(),
            complexity_escalation_minutes: default_escalation_minutes(),
            risky_review_markers: default_risky_markers(),
            block_log_window_mins: default_block_log_window(),
        }
    }
}

fn default_daily_cap() -> f64 {
    25.0
}
fn default_bead_cap() -> f64 {
    10.0
}
fn default_force_spark_pct() -> f64 {
    80.0
}
fn default_stage_attempts() -> u32 {
    4
}
fn default_stage_window() -> i64 {
    120
}
fn default_stage_cooldown() -> i64 {
    45
}
fn default_escalation_minutes() -> i64 {
    90
}
fn default_risky_markers() -> Vec<String> {
    vec!["security".into(), "migration".into(), "auth".into()]
}
fn default_block_log_window() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_warning_pct")]
    pub concurrency_warning_pct: f64,
    #[serde(default = "default_critical_pct")]
    pub concurrency_critical_pct: f64,
    /// Failure-like dispatches inside the churn window that trip a system
    /// pause.
    #[serde(default = "default_pause_churn_threshold")]
    pub pause_churn_threshold: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            concurrency_warning_pct: default_warning_pct(),
            concurrency_critical_pct: default_critical_pct(),
            pause_churn_threshold: default_pause_churn_threshold(),
        }
    }
}

fn default_warning_pct() -> f64 {
    80.0
}
fn default_critical_pct() -> f64 {
    95.0
}
fn default_pause_churn_threshold() -> u64 {
    20
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChiefConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub require_approved_plan: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.foreman/foreman.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_min_backoff")]
    pub min_backoff_secs: i64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: i64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            min_backoff_secs: default_min_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_min_backoff() -> i64 {
    30
}
fn default_max_backoff() -> i64 {
    900
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower = more important.
    #[serde(default = "default_project_priority")]
    pub priority: i64,
    pub workspace: String,
    pub beads_dir: String,
    #[serde(default)]
    pub branch_workflow: bool,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub require_estimate: bool,
    #[serde(default)]
    pub require_acceptance: bool,
    /// Ordered shell commands run in the workspace for DoD checks.
    #[serde(default)]
    pub dod_commands: Vec<String>,
    /// Minimum statement coverage percentage, parsed from test output.
    #[serde(default)]
    pub coverage_min: Option<f64>,
    /// Per-project override of the sprint-planning cadence, in hours.
    #[serde(default)]
    pub cadence_hours: Option<i64>,
}

fn default_project_priority() -> i64 {
    100
}
fn default_base_branch() -> String {
    "main".into()
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Model identifier passed to the worker backend.
    pub model: String,
    pub tier: Tier,
    /// Authed providers count against the 5 h and weekly windows; free-tier
    /// ones do not.
    #[serde(default = "default_true")]
    pub authed: bool,
    #[serde(default = "default_thinking")]
    pub thinking_level: String,
}

fn default_thinking() -> String {
    "medium".into()
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "spark".into(),
            model: "haiku".into(),
            tier: Tier::Fast,
            authed: true,
            thinking_level: "low".into(),
        },
        ProviderConfig {
            name: "standard".into(),
            model: "sonnet".into(),
            tier: Tier::Balanced,
            authed: true,
            thinking_level: "medium".into(),
        },
        ProviderConfig {
            name: "frontier".into(),
            model: "opus".into(),
            tier: Tier::Premium,
            authed: true,
            thinking_level: "high".into(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
