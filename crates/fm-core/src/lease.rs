//! Leader lease for single-scheduler-per-database coordination.
//!
//! One scheduler process may actively dispatch against a given database. The
//! lease is a JSON lockfile acquired before the first tick, renewed on every
//! tick, and released on clean shutdown. Without the lease the scheduler runs
//! in passive mode (reconciliation and health only).
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lockfile.
//! If two schedulers race, exactly one wins the create — the loser gets
//! `AlreadyExists` and can check whether the winner is still alive.
//!
//! ## Stale lease recovery
//!
//! A lease is stale when its holder PID is dead (`kill(pid, 0)` fails) or the
//! recorded heartbeat is older than the TTL. Stale leases are removed
//! automatically so a crashed scheduler never wedges the fleet.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Heartbeats older than this make a lease reclaimable.
pub const LEASE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub pid: u32,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Result of trying to acquire the lease.
pub enum LeaseAcquire {
    /// We created the lockfile — we are the leader.
    Acquired,
    /// Another live scheduler holds the lease.
    HeldByOther(LeaderLease),
    /// Stale lease was cleaned up — retry.
    StaleRemoved,
}

/// Filesystem-backed leader lease keyed on a fixed path.
pub struct LeaseFile {
    path: PathBuf,
    holder: String,
}

impl LeaseFile {
    /// Canonical lease path: `~/.foreman/scheduler.lock`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".foreman")
            .join("scheduler.lock")
    }

    pub fn new(path: impl Into<PathBuf>, holder: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            holder: holder.into(),
        }
    }

    /// Try to exclusively create and write the lease file.
    pub fn acquire(&self, now: DateTime<Utc>) -> std::io::Result<LeaseAcquire> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lease = LeaderLease {
            pid: std::process::id(),
            holder: self.holder.clone(),
            acquired_at: now,
            heartbeat_at: now,
        };

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL — fails if the file exists
            .open(&self.path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(&lease)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(LeaseAcquire::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match self.read() {
                    Some(existing) if lease_is_live(&existing, now) => {
                        Ok(LeaseAcquire::HeldByOther(existing))
                    }
                    _ => {
                        tracing::info!("removing stale scheduler lease");
                        self.remove();
                        Ok(LeaseAcquire::StaleRemoved)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Acquire with one automatic retry after stale cleanup. `Err` means
    /// another scheduler is running or I/O failed; callers fall back to
    /// passive mode.
    pub fn acquire_or_passive(&self, now: DateTime<Utc>) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire(now) {
                Ok(LeaseAcquire::Acquired) => return Ok(()),
                Ok(LeaseAcquire::HeldByOther(existing)) => {
                    return Err(format!(
                        "scheduler lease held by {} (pid={}, heartbeat={})",
                        existing.holder, existing.pid, existing.heartbeat_at
                    ));
                }
                Ok(LeaseAcquire::StaleRemoved) if attempt == 0 => {
                    tracing::info!("stale lease removed, retrying acquire");
                    continue;
                }
                Ok(LeaseAcquire::StaleRemoved) => {
                    return Err("failed to acquire lease after stale cleanup".into());
                }
                Err(e) => return Err(format!("lease I/O error: {e}")),
            }
        }
        Err("lease acquire failed".into())
    }

    /// Refresh the heartbeat. Fails when we no longer hold the lease (file
    /// missing or owned by another pid) — the caller must drop to passive
    /// mode.
    pub fn renew(&self, now: DateTime<Utc>) -> Result<(), String> {
        let mut lease = self
            .read()
            .ok_or_else(|| "lease file missing".to_string())?;
        if lease.pid != std::process::id() {
            return Err(format!("lease taken over by pid {}", lease.pid));
        }
        lease.heartbeat_at = now;
        let json = serde_json::to_string_pretty(&lease).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, json).map_err(|e| e.to_string())
    }

    /// Read the lease file. Returns `None` if missing or unparseable.
    pub fn read(&self) -> Option<LeaderLease> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Release on clean shutdown. Only removes a lease we actually hold.
    pub fn release(&self) {
        if let Some(lease) = self.read() {
            if lease.pid == std::process::id() {
                self.remove();
            }
        }
    }

    fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lease_is_live(lease: &LeaderLease, now: DateTime<Utc>) -> bool {
    pid_alive(lease.pid) && now.signed_duration_since(lease.heartbeat_at) < Duration::seconds(LEASE_TTL_SECS)
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // On non-Unix platforms, assume alive (conservative — avoids accidental cleanup).
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lease(name: &str) -> LeaseFile {
        let dir = std::env::temp_dir().join(format!("fm-lease-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        LeaseFile::new(dir.join("scheduler.lock"), "test-holder")
    }

    #[test]
    fn acquire_then_renew_then_release() {
        let lease = temp_lease("basic");
        let now = Utc::now();
        assert!(lease.acquire_or_passive(now).is_ok());
        assert!(lease.renew(now + Duration::seconds(30)).is_ok());
        let read = lease.read().unwrap();
        assert_eq!(read.pid, std::process::id());
        lease.release();
        assert!(lease.read().is_none());
    }

    #[test]
    fn second_acquire_from_same_live_pid_is_rejected() {
        let lease = temp_lease("double");
        let now = Utc::now();
        assert!(lease.acquire_or_passive(now).is_ok());
        // Our own pid is alive, so the second acquire sees a live holder.
        assert!(lease.acquire_or_passive(now).is_err());
        lease.release();
    }

    #[test]
    fn expired_heartbeat_is_reclaimed() {
        let lease = temp_lease("stale");
        let then = Utc::now() - Duration::seconds(LEASE_TTL_SECS * 2);
        assert!(lease.acquire_or_passive(then).is_ok());
        // Heartbeat is past the TTL, so a new acquire reclaims it.
        assert!(lease.acquire_or_passive(Utc::now()).is_ok());
        lease.release();
    }

    #[test]
    fn renew_fails_without_file() {
        let lease = temp_lease("gone");
        assert!(lease.renew(Utc::now()).is_err());
    }
}
