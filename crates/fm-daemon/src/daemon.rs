use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fm_sched::{Scheduler, ShutdownSignal};
use tracing::{info, warn};

/// The foreman background daemon: one driver task runs the scheduler tick on
/// an interval until the shutdown signal fires. Ticks never overlap — the
/// loop owns the scheduler exclusively.
pub struct Daemon {
    scheduler: Arc<Scheduler>,
    shutdown: ShutdownSignal,
    tick_interval: Duration,
}

impl Daemon {
    pub fn new(scheduler: Arc<Scheduler>, shutdown: ShutdownSignal, tick_interval: Duration) -> Self {
        Self {
            scheduler,
            shutdown,
            tick_interval,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the tick loop until shutdown (blocking).
    pub async fn run(&self) -> Result<()> {
        info!(
            tick_interval_secs = self.tick_interval.as_secs(),
            "daemon starting tick loop"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        // Consume the immediate first tick so the loop doesn't fire at t=0
        // before signal handlers are in place.
        interval.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.scheduler.run_tick().await;
                    if report.lease_lost {
                        warn!("leader lease lost, scheduler is passive");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping tick loop");
                    break;
                }
            }
        }

        // Workers keep running; report what is still in flight.
        let remaining = self
            .scheduler
            .supervisor()
            .wait_for_running(Duration::from_millis(50), &self.shutdown)
            .await
            .unwrap_or(0);
        if remaining > 0 {
            info!(remaining, "leaving running dispatches to the next leader");
        }
        info!("daemon stopped");
        Ok(())
    }
}
