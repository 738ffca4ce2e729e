use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use crate::types::{
    ClaimLease, Dispatch, DispatchStage, DispatchStatus, HealthEvent, NewDispatch, OverflowItem,
    QualityScore, Role, SprintMarker, SprintTrigger, Tier, WorkflowStage,
};

/// Async SQLite-backed database of record for dispatches, health events,
/// claim leases, the overflow queue, rate/cost accounting, and cadence
/// markers. Every mutation is an idempotent update keyed by dispatch id or
/// by `(project, bead, role)`.
pub struct Store {
    conn: Connection,
}

pub type StoreResult<T> = Result<T, tokio_rusqlite::Error>;

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn ts_parse(raw: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA temp_store=MEMORY;

                    CREATE TABLE IF NOT EXISTS dispatches (
                        id               INTEGER PRIMARY KEY AUTOINCREMENT,
                        bead_id          TEXT NOT NULL,
                        project          TEXT NOT NULL,
                        agent_id         TEXT NOT NULL,
                        provider         TEXT NOT NULL,
                        tier             TEXT NOT NULL,
                        pid              INTEGER,
                        session_name     TEXT NOT NULL DEFAULT '',
                        prompt           TEXT NOT NULL,
                        log_path         TEXT,
                        base_branch      TEXT,
                        branch           TEXT,
                        backend          TEXT NOT NULL,
                        status           TEXT NOT NULL,
                        stage            TEXT NOT NULL,
                        dispatched_at    TEXT NOT NULL,
                        completed_at     TEXT,
                        exit_code        INTEGER,
                        duration_s       INTEGER,
                        retries          INTEGER NOT NULL DEFAULT 0,
                        input_tokens     INTEGER NOT NULL DEFAULT 0,
                        output_tokens    INTEGER NOT NULL DEFAULT 0,
                        cost             REAL NOT NULL DEFAULT 0,
                        failure_category TEXT,
                        failure_summary  TEXT,
                        labels           TEXT NOT NULL DEFAULT '[]',
                        pr_url           TEXT,
                        pr_number        INTEGER
                    );

                    CREATE INDEX IF NOT EXISTS idx_dispatches_status ON dispatches(status);
                    CREATE INDEX IF NOT EXISTS idx_dispatches_bead   ON dispatches(bead_id);
                    CREATE INDEX IF NOT EXISTS idx_dispatches_agent  ON dispatches(agent_id);

                    CREATE TABLE IF NOT EXISTS health_events (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        event_type  TEXT NOT NULL,
                        details     TEXT NOT NULL,
                        dispatch_id INTEGER,
                        bead_id     TEXT,
                        at          TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_health_type ON health_events(event_type);

                    CREATE TABLE IF NOT EXISTS claim_leases (
                        bead_id      TEXT PRIMARY KEY,
                        owner        TEXT NOT NULL,
                        heartbeat_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS overflow_queue (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        bead_id     TEXT NOT NULL,
                        project     TEXT NOT NULL,
                        role        TEXT NOT NULL,
                        agent_id    TEXT NOT NULL,
                        priority    INTEGER NOT NULL,
                        enqueued_at TEXT NOT NULL,
                        attempts    INTEGER NOT NULL DEFAULT 0,
                        reason      TEXT NOT NULL,
                        UNIQUE(bead_id, role)
                    );

                    CREATE TABLE IF NOT EXISTS bead_stages (
                        project    TEXT NOT NULL,
                        bead_id    TEXT NOT NULL,
                        stage      TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        PRIMARY KEY (project, bead_id)
                    );

                    CREATE TABLE IF NOT EXISTS sprint_planning_runs (
                        project  TEXT PRIMARY KEY,
                        last_run TEXT NOT NULL,
                        trigger  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS quality_scores (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        dispatch_id INTEGER NOT NULL,
                        provider    TEXT NOT NULL,
                        role        TEXT NOT NULL,
                        score       REAL NOT NULL,
                        at          TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS rate_events (
                        id       INTEGER PRIMARY KEY AUTOINCREMENT,
                        provider TEXT NOT NULL,
                        agent_id TEXT NOT NULL,
                        bead_id  TEXT NOT NULL,
                        at       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_rate_provider ON rate_events(provider, at);

                    CREATE TABLE IF NOT EXISTS cost_events (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        dispatch_id   INTEGER NOT NULL,
                        bead_id       TEXT NOT NULL,
                        project       TEXT NOT NULL,
                        input_tokens  INTEGER NOT NULL,
                        output_tokens INTEGER NOT NULL,
                        cost          REAL NOT NULL,
                        at            TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_cost_at ON cost_events(at);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Dispatches
    // -----------------------------------------------------------------------

    /// Insert a fresh dispatch row with `status=running, stage=running` and
    /// return its monotonically assigned id.
    pub async fn record_dispatch(&self, new: NewDispatch) -> StoreResult<i64> {
        let tier = enum_to_sql(&new.tier);
        let status = enum_to_sql(&DispatchStatus::Running);
        let stage = enum_to_sql(&DispatchStage::Running);
        let dispatched_at = ts(new.dispatched_at);
        let labels = serde_json::to_string(&new.labels).expect("serialize labels");
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO dispatches (bead_id, project, agent_id, provider, tier, pid,
                        session_name, prompt, log_path, base_branch, branch, backend, status,
                        stage, dispatched_at, retries, labels)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                    rusqlite::params![
                        new.bead_id,
                        new.project,
                        new.agent_id,
                        new.provider,
                        tier,
                        new.pid,
                        new.session_name,
                        new.prompt,
                        new.log_path,
                        new.base_branch,
                        new.branch,
                        new.backend,
                        status,
                        stage,
                        dispatched_at,
                        new.retries,
                        labels,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn get_dispatch(&self, id: i64) -> StoreResult<Option<Dispatch>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{DISPATCH_SELECT} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_dispatch(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn list_by_status(&self, status: DispatchStatus) -> StoreResult<Vec<Dispatch>> {
        let status = enum_to_sql(&status);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{DISPATCH_SELECT} WHERE status = ?1 ORDER BY id ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![status])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_dispatch(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Dispatches for a bead newer than `since`, most recent first.
    pub async fn dispatches_for_bead_since(
        &self,
        bead_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Dispatch>> {
        let bead_id = bead_id.to_string();
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{DISPATCH_SELECT} WHERE bead_id = ?1 AND dispatched_at >= ?2
                     ORDER BY dispatched_at DESC, id DESC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![bead_id, since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_dispatch(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// All dispatches for a bead, most recent first.
    pub async fn dispatches_for_bead(&self, bead_id: &str) -> StoreResult<Vec<Dispatch>> {
        self.dispatches_for_bead_since(bead_id, DateTime::<Utc>::MIN_UTC)
            .await
    }

    /// True when a `running` row exists for the bead.
    pub async fn has_running_dispatch(&self, bead_id: &str) -> StoreResult<bool> {
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM dispatches
                         WHERE bead_id = ?1 AND status = 'running'",
                    )?
                    .query_row(rusqlite::params![bead_id], |r| r.get(0))?;
                Ok(n > 0)
            })
            .await
    }

    /// True when a `running` or `pending_retry` row exists for the bead.
    pub async fn has_active_dispatch(&self, bead_id: &str) -> StoreResult<bool> {
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM dispatches
                         WHERE bead_id = ?1 AND status IN ('running', 'pending_retry')",
                    )?
                    .query_row(rusqlite::params![bead_id], |r| r.get(0))?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn running_for_agent(&self, agent_id: &str) -> StoreResult<Option<Dispatch>> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{DISPATCH_SELECT} WHERE agent_id = ?1 AND status = 'running' LIMIT 1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![agent_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_dispatch(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// True when the `(bead, agent)` pair successfully completed a dispatch
    /// after `since`. Failure outcomes do not start a cooldown; the guards
    /// own those.
    pub async fn completed_since(
        &self,
        bead_id: &str,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let bead_id = bead_id.to_string();
        let agent_id = agent_id.to_string();
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM dispatches
                         WHERE bead_id = ?1 AND agent_id = ?2 AND status = 'completed'
                           AND completed_at IS NOT NULL AND completed_at >= ?3",
                    )?
                    .query_row(rusqlite::params![bead_id, agent_id, since], |r| r.get(0))?;
                Ok(n > 0)
            })
            .await
    }

    /// Count dispatches for `(bead, role)` newer than `since`, regardless of
    /// outcome. The role matches on the trailing agent-id suffix.
    pub async fn stage_attempts_since(
        &self,
        bead_id: &str,
        role: Role,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let bead_id = bead_id.to_string();
        let suffix = format!("%-{}", role.as_str());
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM dispatches
                         WHERE bead_id = ?1 AND agent_id LIKE ?2 AND dispatched_at >= ?3",
                    )?
                    .query_row(rusqlite::params![bead_id, suffix, since], |r| r.get(0))?;
                Ok(n)
            })
            .await
    }

    /// Move a `running` row to a terminal status. Idempotent: a row that has
    /// already left `running` is not touched again.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_dispatch(
        &self,
        id: i64,
        status: DispatchStatus,
        stage: DispatchStage,
        completed_at: DateTime<Utc>,
        exit_code: Option<i32>,
        duration_s: Option<i64>,
    ) -> StoreResult<bool> {
        let status = enum_to_sql(&status);
        let stage = enum_to_sql(&stage);
        let completed_at = ts(completed_at);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE dispatches
                     SET status = ?2, stage = ?3, completed_at = ?4, exit_code = ?5,
                         duration_s = ?6
                     WHERE id = ?1 AND status IN ('running', 'pending_retry')",
                    rusqlite::params![id, status, stage, completed_at, exit_code, duration_s],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Flag a `running` row for retry.
    pub async fn mark_pending_retry(&self, id: i64, completed_at: DateTime<Utc>) -> StoreResult<bool> {
        let completed_at = ts(completed_at);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE dispatches
                     SET status = 'pending_retry', stage = 'failed', completed_at = ?2
                     WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![id, completed_at],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Mark a `pending_retry` row as superseded by a fresh dispatch. The only
    /// mutation allowed on an otherwise terminal row.
    pub async fn mark_retried(&self, id: i64) -> StoreResult<bool> {
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE dispatches SET status = 'retried'
                     WHERE id = ?1 AND status = 'pending_retry'",
                    rusqlite::params![id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Persist a failure diagnosis. An already-assigned category is never
    /// overwritten.
    pub async fn set_failure_diagnosis(
        &self,
        id: i64,
        category: &str,
        summary: &str,
    ) -> StoreResult<()> {
        let category = category.to_string();
        let summary = summary.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE dispatches
                     SET failure_category = COALESCE(failure_category, ?2),
                         failure_summary = COALESCE(failure_summary, ?3)
                     WHERE id = ?1",
                    rusqlite::params![id, category, summary],
                )?;
                Ok(())
            })
            .await
    }

    /// Record token usage and cost on the dispatch row and in the daily cost
    /// ledger.
    pub async fn record_dispatch_cost(
        &self,
        id: i64,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let at = ts(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE dispatches
                     SET input_tokens = ?2, output_tokens = ?3, cost = ?4
                     WHERE id = ?1",
                    rusqlite::params![id, input_tokens, output_tokens, cost],
                )?;
                let (bead_id, project): (String, String) = conn
                    .prepare("SELECT bead_id, project FROM dispatches WHERE id = ?1")?
                    .query_row(rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?)))?;
                conn.execute(
                    "INSERT INTO cost_events (dispatch_id, bead_id, project, input_tokens,
                        output_tokens, cost, at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![id, bead_id, project, input_tokens, output_tokens, cost, at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_pr(&self, id: i64, url: &str, number: u64) -> StoreResult<()> {
        let url = url.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE dispatches SET pr_url = ?2, pr_number = ?3 WHERE id = ?1",
                    rusqlite::params![id, url, number],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn sum_cost_for_bead(&self, bead_id: &str) -> StoreResult<f64> {
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                let total: f64 = conn
                    .prepare(
                        "SELECT COALESCE(SUM(cost), 0) FROM dispatches WHERE bead_id = ?1",
                    )?
                    .query_row(rusqlite::params![bead_id], |r| r.get(0))?;
                Ok(total)
            })
            .await
    }

    /// Spend recorded in the cost ledger at or after `since`.
    pub async fn sum_cost_since(&self, since: DateTime<Utc>) -> StoreResult<f64> {
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let total: f64 = conn
                    .prepare("SELECT COALESCE(SUM(cost), 0) FROM cost_events WHERE at >= ?1")?
                    .query_row(rusqlite::params![since], |r| r.get(0))?;
                Ok(total)
            })
            .await
    }

    /// Failure-like dispatches completed after `since`, across all beads.
    pub async fn failure_like_count_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM dispatches
                         WHERE status IN ('failed', 'cancelled')
                           AND completed_at IS NOT NULL AND completed_at >= ?1",
                    )?
                    .query_row(rusqlite::params![since], |r| r.get(0))?;
                Ok(n)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Rate windows
    // -----------------------------------------------------------------------

    pub async fn record_authed_dispatch(
        &self,
        provider: &str,
        agent_id: &str,
        bead_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let provider = provider.to_string();
        let agent_id = agent_id.to_string();
        let bead_id = bead_id.to_string();
        let at = ts(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO rate_events (provider, agent_id, bead_id, at)
                     VALUES (?1,?2,?3,?4)",
                    rusqlite::params![provider, agent_id, bead_id, at],
                )?;
                Ok(())
            })
            .await
    }

    /// Authed dispatches for a provider at or after `since`; entries older
    /// than the weekly window are lazily purged on the way.
    pub async fn authed_count_since(
        &self,
        provider: &str,
        since: DateTime<Utc>,
        purge_before: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let provider = provider.to_string();
        let since = ts(since);
        let purge_before = ts(purge_before);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM rate_events WHERE at < ?1",
                    rusqlite::params![purge_before],
                )?;
                let n: u64 = conn
                    .prepare("SELECT COUNT(*) FROM rate_events WHERE provider = ?1 AND at >= ?2")?
                    .query_row(rusqlite::params![provider, since], |r| r.get(0))?;
                Ok(n)
            })
            .await
    }

    /// Total authed dispatches across providers at or after `since`.
    pub async fn authed_total_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare("SELECT COUNT(*) FROM rate_events WHERE at >= ?1")?
                    .query_row(rusqlite::params![since], |r| r.get(0))?;
                Ok(n)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Health events
    // -----------------------------------------------------------------------

    pub async fn append_health_event(
        &self,
        event_type: &str,
        details: &str,
        dispatch_id: Option<i64>,
        bead_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let event_type = event_type.to_string();
        let details = details.to_string();
        let bead_id = bead_id.map(str::to_string);
        let at = ts(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO health_events (event_type, details, dispatch_id, bead_id, at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![event_type, details, dispatch_id, bead_id, at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn health_events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<HealthEvent>> {
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, event_type, details, dispatch_id, bead_id, at
                     FROM health_events WHERE at >= ?1 ORDER BY id ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let at_raw: String = row.get(5)?;
                    out.push(HealthEvent {
                        id: row.get(0)?,
                        event_type: row.get(1)?,
                        details: row.get(2)?,
                        dispatch_id: row.get(3)?,
                        bead_id: row.get(4)?,
                        at: ts_parse(&at_raw),
                    });
                }
                Ok(out)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Claim leases
    // -----------------------------------------------------------------------

    pub async fn upsert_claim(
        &self,
        bead_id: &str,
        owner: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let bead_id = bead_id.to_string();
        let owner = owner.to_string();
        let heartbeat_at = ts(heartbeat_at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO claim_leases (bead_id, owner, heartbeat_at)
                     VALUES (?1,?2,?3)
                     ON CONFLICT(bead_id) DO UPDATE SET
                        owner = excluded.owner, heartbeat_at = excluded.heartbeat_at",
                    rusqlite::params![bead_id, owner, heartbeat_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_claim(&self, bead_id: &str) -> StoreResult<Option<ClaimLease>> {
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT bead_id, owner, heartbeat_at FROM claim_leases WHERE bead_id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![bead_id])?;
                match rows.next()? {
                    Some(row) => {
                        let hb: String = row.get(2)?;
                        Ok(Some(ClaimLease {
                            bead_id: row.get(0)?,
                            owner: row.get(1)?,
                            heartbeat_at: ts_parse(&hb),
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn release_claim(&self, bead_id: &str) -> StoreResult<()> {
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM claim_leases WHERE bead_id = ?1",
                    rusqlite::params![bead_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Remove leases whose heartbeat is older than `cutoff`; they are
    /// reclaimable by any agent.
    pub async fn purge_expired_claims(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = ts(cutoff);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM claim_leases WHERE heartbeat_at < ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(n)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Overflow queue persistence
    // -----------------------------------------------------------------------

    /// Insert an overflow item, deduplicated on `(bead, role)`. Returns the
    /// queue id — the existing one when the item was already enqueued.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_overflow(
        &self,
        bead_id: &str,
        project: &str,
        role: Role,
        agent_id: &str,
        priority: i64,
        enqueued_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<i64> {
        let bead_id = bead_id.to_string();
        let project = project.to_string();
        let role_s = enum_to_sql(&role);
        let agent_id = agent_id.to_string();
        let enqueued_at = ts(enqueued_at);
        let reason = reason.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO overflow_queue (bead_id, project, role, agent_id, priority,
                        enqueued_at, attempts, reason)
                     VALUES (?1,?2,?3,?4,?5,?6,0,?7)
                     ON CONFLICT(bead_id, role) DO NOTHING",
                    rusqlite::params![bead_id, project, role_s, agent_id, priority, enqueued_at, reason],
                )?;
                let id: i64 = conn
                    .prepare("SELECT id FROM overflow_queue WHERE bead_id = ?1 AND role = ?2")?
                    .query_row(rusqlite::params![bead_id, role_s], |r| r.get(0))?;
                Ok(id)
            })
            .await
    }

    /// Full queue in dispatch order: priority asc, enqueued-at asc, bead id asc.
    pub async fn load_overflow(&self) -> StoreResult<Vec<OverflowItem>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, bead_id, project, role, agent_id, priority, enqueued_at,
                            attempts, reason
                     FROM overflow_queue
                     ORDER BY priority ASC, enqueued_at ASC, bead_id ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let role_raw: String = row.get(3)?;
                    let enq: String = row.get(6)?;
                    out.push(OverflowItem {
                        id: row.get(0)?,
                        bead_id: row.get(1)?,
                        project: row.get(2)?,
                        role: enum_from_sql(&role_raw),
                        agent_id: row.get(4)?,
                        priority: row.get(5)?,
                        enqueued_at: ts_parse(&enq),
                        attempts: row.get(7)?,
                        reason: row.get(8)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete_overflow(&self, id: i64) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM overflow_queue WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn bump_overflow_attempts(&self, id: i64) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE overflow_queue SET attempts = attempts + 1 WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Bead stage pointers (workflow-execution rollout)
    // -----------------------------------------------------------------------

    pub async fn set_bead_stage(
        &self,
        project: &str,
        bead_id: &str,
        stage: WorkflowStage,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let project = project.to_string();
        let bead_id = bead_id.to_string();
        let stage = enum_to_sql(&stage);
        let at = ts(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO bead_stages (project, bead_id, stage, updated_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(project, bead_id) DO UPDATE SET
                        stage = excluded.stage, updated_at = excluded.updated_at",
                    rusqlite::params![project, bead_id, stage, at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_bead_stage(
        &self,
        project: &str,
        bead_id: &str,
    ) -> StoreResult<Option<WorkflowStage>> {
        let project = project.to_string();
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT stage FROM bead_stages WHERE project = ?1 AND bead_id = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![project, bead_id])?;
                match rows.next()? {
                    Some(row) => {
                        let raw: String = row.get(0)?;
                        Ok(Some(enum_from_sql(&raw)))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Sprint planning markers
    // -----------------------------------------------------------------------

    pub async fn upsert_sprint_marker(&self, marker: &SprintMarker) -> StoreResult<()> {
        let project = marker.project.clone();
        let last_run = ts(marker.last_run);
        let trigger = enum_to_sql(&marker.trigger);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sprint_planning_runs (project, last_run, trigger)
                     VALUES (?1,?2,?3)
                     ON CONFLICT(project) DO UPDATE SET
                        last_run = excluded.last_run, trigger = excluded.trigger",
                    rusqlite::params![project, last_run, trigger],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_sprint_marker(&self, project: &str) -> StoreResult<Option<SprintMarker>> {
        let project = project.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project, last_run, trigger FROM sprint_planning_runs
                     WHERE project = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project])?;
                match rows.next()? {
                    Some(row) => {
                        let last_run: String = row.get(1)?;
                        let trigger: String = row.get(2)?;
                        Ok(Some(SprintMarker {
                            project: row.get(0)?,
                            last_run: ts_parse(&last_run),
                            trigger: enum_from_sql::<SprintTrigger>(&trigger),
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Quality scores
    // -----------------------------------------------------------------------

    pub async fn insert_quality_score(&self, score: &QualityScore) -> StoreResult<()> {
        let provider = score.provider.clone();
        let role = enum_to_sql(&score.role);
        let dispatch_id = score.dispatch_id;
        let value = score.score;
        let at = ts(score.at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO quality_scores (dispatch_id, provider, role, score, at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![dispatch_id, provider, role, value, at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn quality_samples_since(
        &self,
        provider: &str,
        role: Role,
        since: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let provider = provider.to_string();
        let role = enum_to_sql(&role);
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let n: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM quality_scores
                         WHERE provider = ?1 AND role = ?2 AND at >= ?3",
                    )?
                    .query_row(rusqlite::params![provider, role, since], |r| r.get(0))?;
                Ok(n)
            })
            .await
    }

    /// Mean quality for `(provider, role)` at or after `since`; `None` with no
    /// samples.
    pub async fn mean_quality_since(
        &self,
        provider: &str,
        role: Role,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<f64>> {
        let provider = provider.to_string();
        let role = enum_to_sql(&role);
        let since = ts(since);
        self.conn
            .call(move |conn| {
                let mean: Option<f64> = conn
                    .prepare(
                        "SELECT AVG(score) FROM quality_scores
                         WHERE provider = ?1 AND role = ?2 AND at >= ?3",
                    )?
                    .query_row(rusqlite::params![provider, role, since], |r| r.get(0))?;
                Ok(mean)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const DISPATCH_SELECT: &str = "SELECT id, bead_id, project, agent_id, provider, tier, pid,
    session_name, prompt, log_path, base_branch, branch, backend, status, stage,
    dispatched_at, completed_at, exit_code, duration_s, retries, input_tokens,
    output_tokens, cost, failure_category, failure_summary, labels, pr_url, pr_number
    FROM dispatches";

fn row_to_dispatch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dispatch> {
    let tier_raw: String = row.get(5)?;
    let pid_raw: Option<i64> = row.get(6)?;
    let status_raw: String = row.get(13)?;
    let stage_raw: String = row.get(14)?;
    let dispatched_raw: String = row.get(15)?;
    let completed_raw: Option<String> = row.get(16)?;
    let labels_raw: String = row.get(25)?;

    Ok(Dispatch {
        id: row.get(0)?,
        bead_id: row.get(1)?,
        project: row.get(2)?,
        agent_id: row.get(3)?,
        provider: row.get(4)?,
        tier: enum_from_sql::<Tier>(&tier_raw),
        pid: pid_raw.map(|p| p as u32),
        session_name: row.get(7)?,
        prompt: row.get(8)?,
        log_path: row.get(9)?,
        base_branch: row.get(10)?,
        branch: row.get(11)?,
        backend: row.get(12)?,
        status: enum_from_sql::<DispatchStatus>(&status_raw),
        stage: enum_from_sql::<DispatchStage>(&stage_raw),
        dispatched_at: ts_parse(&dispatched_raw),
        completed_at: completed_raw.map(|s| ts_parse(&s)),
        exit_code: row.get(17)?,
        duration_s: row.get(18)?,
        retries: row.get(19)?,
        input_tokens: row.get(20)?,
        output_tokens: row.get(21)?,
        cost: row.get(22)?,
        failure_category: row.get(23)?,
        failure_summary: row.get(24)?,
        labels: serde_json::from_str(&labels_raw).expect("valid labels json"),
        pr_url: row.get(26)?,
        pr_number: row.get(27)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn new_dispatch(bead: &str, agent: &str) -> NewDispatch {
        NewDispatch {
            bead_id: bead.into(),
            project: "p1".into(),
            agent_id: agent.into(),
            provider: "standard".into(),
            tier: Tier::Balanced,
            pid: Some(4242),
            session_name: String::new(),
            prompt: "do the thing".into(),
            log_path: None,
            base_branch: None,
            branch: None,
            backend: "headless_cli".into(),
            dispatched_at: t0(),
            retries: 0,
            labels: vec!["stage:coding".into()],
        }
    }

    #[tokio::test]
    async fn record_and_fetch_round_trip() {
        let store = Store::new_in_memory().await.unwrap();
        let id = store.record_dispatch(new_dispatch("b-1", "p1-coder")).await.unwrap();
        let d = store.get_dispatch(id).await.unwrap().unwrap();
        assert_eq!(d.bead_id, "b-1");
        assert_eq!(d.status, DispatchStatus::Running);
        assert_eq!(d.stage, DispatchStage::Running);
        assert_eq!(d.labels, vec!["stage:coding".to_string()]);
    }

    #[tokio::test]
    async fn dispatch_ids_are_monotonic() {
        let store = Store::new_in_memory().await.unwrap();
        let a = store.record_dispatch(new_dispatch("b-1", "p1-coder")).await.unwrap();
        let b = store.record_dispatch(new_dispatch("b-2", "p1-reviewer")).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let store = Store::new_in_memory().await.unwrap();
        let id = store.record_dispatch(new_dispatch("b-1", "p1-coder")).await.unwrap();
        let first = store
            .complete_dispatch(id, DispatchStatus::Completed, DispatchStage::Completed, t0(), Some(0), Some(60))
            .await
            .unwrap();
        let second = store
            .complete_dispatch(id, DispatchStatus::Failed, DispatchStage::Failed, t0(), Some(1), Some(61))
            .await
            .unwrap();
        assert!(first);
        assert!(!second, "terminal row must not transition twice");
        let d = store.get_dispatch(id).await.unwrap().unwrap();
        assert_eq!(d.status, DispatchStatus::Completed);
    }

    #[tokio::test]
    async fn retried_only_from_pending_retry() {
        let store = Store::new_in_memory().await.unwrap();
        let id = store.record_dispatch(new_dispatch("b-1", "p1-coder")).await.unwrap();
        assert!(!store.mark_retried(id).await.unwrap());
        assert!(store.mark_pending_retry(id, t0()).await.unwrap());
        assert!(store.mark_retried(id).await.unwrap());
        let d = store.get_dispatch(id).await.unwrap().unwrap();
        assert_eq!(d.status, DispatchStatus::Retried);
    }

    #[tokio::test]
    async fn failure_category_is_never_overwritten() {
        let store = Store::new_in_memory().await.unwrap();
        let id = store.record_dispatch(new_dispatch("b-1", "p1-coder")).await.unwrap();
        store.set_failure_diagnosis(id, "oom", "ran out of memory").await.unwrap();
        store.set_failure_diagnosis(id, "timeout", "other").await.unwrap();
        let d = store.get_dispatch(id).await.unwrap().unwrap();
        assert_eq!(d.failure_category.as_deref(), Some("oom"));
        assert_eq!(d.failure_summary.as_deref(), Some("ran out of memory"));
    }

    #[tokio::test]
    async fn active_dispatch_covers_pending_retry() {
        let store = Store::new_in_memory().await.unwrap();
        let id = store.record_dispatch(new_dispatch("b-1", "p1-coder")).await.unwrap();
        assert!(store.has_active_dispatch("b-1").await.unwrap());
        store.mark_pending_retry(id, t0()).await.unwrap();
        assert!(store.has_active_dispatch("b-1").await.unwrap());
        store.mark_retried(id).await.unwrap();
        assert!(!store.has_active_dispatch("b-1").await.unwrap());
    }

    #[tokio::test]
    async fn overflow_dedupes_on_bead_and_role() {
        let store = Store::new_in_memory().await.unwrap();
        let a = store
            .insert_overflow("b-1", "p1", Role::Coder, "p1-coder", 2, t0(), "role_limit")
            .await
            .unwrap();
        let b = store
            .insert_overflow("b-1", "p1", Role::Coder, "p1-coder", 2, t0(), "role_limit")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.load_overflow().await.unwrap().len(), 1);

        // Same bead under another role is a distinct queue entry.
        let c = store
            .insert_overflow("b-1", "p1", Role::Reviewer, "p1-reviewer", 2, t0(), "role_limit")
            .await
            .unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn overflow_order_is_priority_then_age_then_bead() {
        let store = Store::new_in_memory().await.unwrap();
        let later = t0() + chrono::Duration::minutes(5);
        store.insert_overflow("b-z", "p1", Role::Coder, "p1-coder", 1, later, "r").await.unwrap();
        store.insert_overflow("b-a", "p1", Role::Coder, "p1-coder", 1, later, "r").await.unwrap();
        store.insert_overflow("b-m", "p1", Role::Coder, "p1-coder", 0, later, "r").await.unwrap();
        store.insert_overflow("b-q", "p1", Role::Coder, "p1-coder", 1, t0(), "r").await.unwrap();
        let ids: Vec<String> = store
            .load_overflow()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.bead_id)
            .collect();
        assert_eq!(ids, vec!["b-m", "b-q", "b-a", "b-z"]);
    }

    #[tokio::test]
    async fn claims_expire_by_heartbeat() {
        let store = Store::new_in_memory().await.unwrap();
        store.upsert_claim("b-1", "p1-coder", t0()).await.unwrap();
        let purged = store
            .purge_expired_claims(t0() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_claim("b-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cost_accounting_rolls_up() {
        let store = Store::new_in_memory().await.unwrap();
        let id = store.record_dispatch(new_dispatch("b-1", "p1-coder")).await.unwrap();
        store.record_dispatch_cost(id, 1000, 500, 0.75, t0()).await.unwrap();
        assert!((store.sum_cost_for_bead("b-1").await.unwrap() - 0.75).abs() < f64::EPSILON);
        assert!((store.sum_cost_since(t0()).await.unwrap() - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rate_window_counts_and_purges() {
        let store = Store::new_in_memory().await.unwrap();
        store.record_authed_dispatch("standard", "p1-coder", "b-1", t0()).await.unwrap();
        store
            .record_authed_dispatch("standard", "p1-coder", "b-2", t0() - chrono::Duration::days(8))
            .await
            .unwrap();
        let n = store
            .authed_count_since(
                "standard",
                t0() - chrono::Duration::hours(5),
                t0() - chrono::Duration::days(7),
            )
            .await
            .unwrap();
        assert_eq!(n, 1);
        // The 8-day-old entry was purged alongside the count.
        assert_eq!(store.authed_total_since(DateTime::<Utc>::MIN_UTC).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sprint_marker_upserts() {
        let store = Store::new_in_memory().await.unwrap();
        store
            .upsert_sprint_marker(&SprintMarker {
                project: "p1".into(),
                last_run: t0(),
                trigger: SprintTrigger::Scheduled,
            })
            .await
            .unwrap();
        store
            .upsert_sprint_marker(&SprintMarker {
                project: "p1".into(),
                last_run: t0() + chrono::Duration::hours(1),
                trigger: SprintTrigger::Manual,
            })
            .await
            .unwrap();
        let m = store.get_sprint_marker("p1").await.unwrap().unwrap();
        assert_eq!(m.trigger, SprintTrigger::Manual);
    }
}
