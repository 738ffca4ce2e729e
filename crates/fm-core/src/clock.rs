use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Clock — injectable "now" source
// ---------------------------------------------------------------------------

/// Shared now-source handed to every component at construction so tests can
/// freeze and advance time deterministically.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl Clock {
    /// Wall-clock time.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(Utc::now),
        }
    }

    /// A clock pinned to `start`, plus a handle to move it.
    pub fn manual(start: DateTime<Utc>) -> (Self, ManualClock) {
        let state = Arc::new(Mutex::new(start));
        let handle = ManualClock {
            state: state.clone(),
        };
        let clock = Self {
            inner: Arc::new(move || *state.lock().unwrap_or_else(|e| e.into_inner())),
        };
        (clock, handle)
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.inner)()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}

/// Mutation handle for a manual clock.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn set(&self, to: DateTime<Utc>) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}
