//! Lifecycle notification with rate-limit-aware backoff.
//!
//! Every dispatch state transition emits one structured event to the primary
//! sink. A rate-limit response quarantines the room for at least the sink's
//! requested duration (clamped between the configured minimum and maximum);
//! during the quarantine the fallback reporter is also suppressed so the
//! notifier itself cannot churn dispatches.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fm_core::clock::Clock;
use fm_core::config::NotifierConfig;
use fm_core::types::LifecycleEvent;
use tokio::sync::Mutex;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Sink contract
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: i64 },
    #[error("sink error: {0}")]
    Other(String),
}

#[async_trait]
pub trait LifecycleSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, event: &LifecycleEvent) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct NotifierState {
    quarantined_until: Option<DateTime<Utc>>,
    limit_logged_at: Option<DateTime<Utc>>,
}

pub struct LifecycleNotifier {
    primary: Arc<dyn LifecycleSink>,
    fallback: Option<Arc<dyn LifecycleSink>>,
    cfg: NotifierConfig,
    clock: Clock,
    state: Mutex<NotifierState>,
}

impl LifecycleNotifier {
    pub fn new(
        primary: Arc<dyn LifecycleSink>,
        fallback: Option<Arc<dyn LifecycleSink>>,
        cfg: NotifierConfig,
        clock: Clock,
    ) -> Self {
        Self {
            primary,
            fallback,
            cfg,
            clock,
            state: Mutex::new(NotifierState::default()),
        }
    }

    /// Best-effort emit; never surfaces an error to the scheduler.
    pub async fn emit(&self, event: LifecycleEvent) {
        let now = self.clock.now();

        {
            let mut state = self.state.lock().await;
            if let Some(until) = state.quarantined_until {
                if now < until {
                    // One suppression log per quarantine window.
                    let logged = state
                        .limit_logged_at
                        .map(|at| at >= until - self.backoff_span(until, now))
                        .unwrap_or(false);
                    if !logged {
                        debug!(until = %until, "lifecycle sink quarantined, dropping events");
                        state.limit_logged_at = Some(now);
                    }
                    return;
                }
                state.quarantined_until = None;
            }
        }

        match self.primary.send(&event).await {
            Ok(()) => {}
            Err(SinkError::RateLimited { retry_after_ms }) => {
                let requested = Duration::milliseconds(retry_after_ms.max(0));
                let clamped = clamp_backoff(
                    requested,
                    Duration::seconds(self.cfg.min_backoff_secs),
                    Duration::seconds(self.cfg.max_backoff_secs),
                );
                let until = now + clamped;
                warn!(
                    sink = self.primary.name(),
                    until = %until,
                    "lifecycle sink rate-limited, quarantining room"
                );
                let mut state = self.state.lock().await;
                state.quarantined_until = Some(until);
                state.limit_logged_at = None;
            }
            Err(SinkError::Other(e)) => {
                warn!(sink = self.primary.name(), error = %e, "lifecycle send failed");
                if let Some(fallback) = &self.fallback {
                    if let Err(fe) = fallback.send(&event).await {
                        warn!(sink = fallback.name(), error = %fe, "fallback send failed");
                    }
                }
            }
        }
    }

    pub async fn is_quarantined(&self) -> bool {
        let state = self.state.lock().await;
        state
            .quarantined_until
            .map(|until| self.clock.now() < until)
            .unwrap_or(false)
    }

    fn backoff_span(&self, _until: DateTime<Utc>, _now: DateTime<Utc>) -> Duration {
        Duration::seconds(self.cfg.max_backoff_secs)
    }
}

fn clamp_backoff(requested: Duration, min: Duration, max: Duration) -> Duration {
    if requested < min {
        min
    } else if requested > max {
        max
    } else {
        requested
    }
}

// ---------------------------------------------------------------------------
// Tracing sink — default primary when no external room is configured
// ---------------------------------------------------------------------------

/// Writes lifecycle events to the structured log.
pub struct LogSink;

#[async_trait]
impl LifecycleSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        tracing::info!(
            project = %event.project,
            bead_id = %event.bead_id,
            dispatch_id = ?event.dispatch_id,
            event = ?event.event,
            agent = %event.agent,
            "lifecycle event"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fm_core::types::LifecycleKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        sent: AtomicUsize,
        responses: Mutex<Vec<Result<(), SinkError>>>,
    }

    impl CountingSink {
        fn new(responses: Vec<Result<(), SinkError>>) -> Arc<Self> {
            Arc::new(Self {
                sent: AtomicUsize::new(0),
                responses: Mutex::new(responses),
            })
        }
        fn sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LifecycleSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        async fn send(&self, _event: &LifecycleEvent) -> Result<(), SinkError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Ok(())
            } else {
                responses.remove(0)
            }
        }
    }

    fn event() -> LifecycleEvent {
        LifecycleEvent {
            project: "p1".into(),
            bead_id: "b-1".into(),
            dispatch_id: Some(1),
            event: LifecycleKind::DispatchStarted,
            workflow_stage: None,
            dispatch_stage: None,
            status: None,
            agent: "p1-coder".into(),
            provider: "standard".into(),
            tier: None,
            exit_code: None,
            duration_s: None,
            note: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn rate_limit_quarantines_and_suppresses_fallback() {
        let primary = CountingSink::new(vec![Err(SinkError::RateLimited {
            retry_after_ms: 60_000,
        })]);
        let fallback = CountingSink::new(vec![]);
        let (clock, handle) = Clock::manual(t0());
        let notifier = LifecycleNotifier::new(
            primary.clone(),
            Some(fallback.clone()),
            NotifierConfig::default(),
            clock,
        );

        notifier.emit(event()).await;
        assert!(notifier.is_quarantined().await);

        // During quarantine neither sink is called.
        notifier.emit(event()).await;
        assert_eq!(primary.sent(), 1);
        assert_eq!(fallback.sent(), 0);

        // After the window the primary is consulted again.
        handle.advance(Duration::seconds(61));
        notifier.emit(event()).await;
        assert_eq!(primary.sent(), 2);
    }

    #[tokio::test]
    async fn retry_after_is_clamped_to_minimum() {
        let primary = CountingSink::new(vec![Err(SinkError::RateLimited { retry_after_ms: 1 })]);
        let (clock, handle) = Clock::manual(t0());
        let notifier =
            LifecycleNotifier::new(primary.clone(), None, NotifierConfig::default(), clock);

        notifier.emit(event()).await;
        // 1ms requested, but the 30s minimum holds.
        handle.advance(Duration::seconds(5));
        assert!(notifier.is_quarantined().await);
        handle.advance(Duration::seconds(30));
        assert!(!notifier.is_quarantined().await);
    }

    #[tokio::test]
    async fn other_errors_fall_through_to_fallback() {
        let primary = CountingSink::new(vec![Err(SinkError::Other("boom".into()))]);
        let fallback = CountingSink::new(vec![]);
        let (clock, _) = Clock::manual(t0());
        let notifier = LifecycleNotifier::new(
            primary,
            Some(fallback.clone()),
            NotifierConfig::default(),
            clock,
        );
        notifier.emit(event()).await;
        assert_eq!(fallback.sent(), 1);
    }
}
