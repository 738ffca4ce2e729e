//! foreman daemon — acquires the leader lease, wires the store, backends,
//! and bead CLI together, and drives the scheduler tick loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fm_beads::{BeadTool, CliBeadService};
use fm_core::clock::Clock;
use fm_core::config::Config;
use fm_core::lease::LeaseFile;
use fm_core::store::Store;
use fm_core::types::Tier;
use fm_sched::notifier::{LifecycleNotifier, LogSink};
use fm_sched::{Scheduler, SchedulerParts, ShutdownSignal};
use fm_session::headless::HeadlessBackend;
use fm_session::tmux::TmuxBackend;
use fm_session::BackendRegistry;
use tracing::{info, warn};

mod daemon;
mod telemetry;

use daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const SESSION_PREFIX: &str = "fm";

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("FOREMAN_LOG_JSON").is_ok() {
        telemetry::init_logging_json("fm-daemon", "info");
    } else {
        telemetry::init_logging("fm-daemon", "info");
    }

    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "foreman daemon starting");

    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let data_dir = std::path::Path::new(&home).join(".foreman");
    std::fs::create_dir_all(&data_dir).ok();

    let mut config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });
    if config.store.path.starts_with("~/") {
        config.store.path = config.store.path.replacen('~', &home, 1);
    }

    let clock = Clock::system();

    // --- Leader lease: without it we run passive (reconcile + health only). ---
    let lease = Arc::new(LeaseFile::new(
        LeaseFile::default_path(),
        format!("fm-daemon@{}", hostname()),
    ));
    let leading = match lease.acquire_or_passive(clock.now()) {
        Ok(()) => {
            info!("leader lease acquired");
            true
        }
        Err(e) => {
            warn!(error = %e, "leader lease unavailable, entering passive mode");
            enter_passive_mode(&mut config);
            false
        }
    };

    let store = Arc::new(
        Store::new(&config.store.path)
            .await
            .context("failed to open store database")?,
    );

    // --- Backends: tmux for interactive tiers, headless for fast work. ---
    let worker_bin =
        std::env::var("FOREMAN_WORKER_BIN").unwrap_or_else(|_| "claude".to_string());
    let tmux = Arc::new(TmuxBackend::new(SESSION_PREFIX, worker_bin.clone()));
    let headless = Arc::new(HeadlessBackend::new(
        worker_bin,
        data_dir.join("worker-logs"),
    ));
    let mut registry = BackendRegistry::new();
    registry.register(tmux.clone());
    registry.register(headless);
    registry.route(Tier::Premium, "tmux");
    registry.route(Tier::Balanced, "tmux");
    registry.route(Tier::Fast, "headless_cli");

    let bead_program =
        std::env::var("FOREMAN_BEADS_BIN").unwrap_or_else(|_| "beads".to_string());
    let beads = Arc::new(CliBeadService::new(Arc::new(BeadTool::new(bead_program))));

    let notifier = Arc::new(LifecycleNotifier::new(
        Arc::new(LogSink),
        None,
        config.notifier.clone(),
        clock.clone(),
    ));

    let shutdown = ShutdownSignal::new();
    let tick_interval = Duration::from_secs(config.scheduler.tick_interval_secs);

    let scheduler = Arc::new(Scheduler::new(SchedulerParts {
        cfg: config,
        store,
        clock: clock.clone(),
        beads,
        backends: Arc::new(registry),
        notifier,
        ceremonies: None,
        pr_host: None,
        tmux: Some(tmux),
        lease: leading.then(|| lease.clone()),
        shutdown: shutdown.clone(),
    }));

    // Ctrl-C triggers cooperative shutdown; running workers are not killed.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger();
            }
        });
    }

    let daemon = Daemon::new(scheduler, shutdown, tick_interval);
    daemon.run().await?;

    if leading {
        lease.release();
        info!("leader lease released");
    }
    Ok(())
}

/// Passive mode keeps reconciliation and health sweeps but dispatches
/// nothing.
fn enter_passive_mode(config: &mut Config) {
    config.scheduler.paused = true;
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}
