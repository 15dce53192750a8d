//! Testbay scheduler binary.
//!
//! Loads the fleet and device policy, then runs the scheduling loop until
//! interrupted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use testbay_scheduler::{
    BroadcastNotifier, DictionaryPolicy, FleetSeed, MemoryFleetStore, Scheduler,
    SchedulerConfig, SchedulerDaemon, TracingAuditLog,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("testbay_scheduler=info".parse()?),
        )
        .init();

    info!("Testbay scheduler starting");

    let config = SchedulerConfig::load()?;
    info!(
        interval_secs = config.tick.interval.as_secs(),
        ping_timeout_secs = config.tick.ping_timeout.as_secs(),
        "Configuration loaded"
    );

    // Fleet
    let store = MemoryFleetStore::new();
    if let Some(path) = &config.fleet.seed_file {
        let seed = FleetSeed::load(path)?;
        seed.apply(&store).await?;
        info!(
            path = %path.display(),
            devices = seed.devices.len(),
            jobs = seed.jobs.len(),
            "Fleet loaded"
        );
    }

    // Device policy
    let policy = Arc::new(DictionaryPolicy::new(config.health_check_submitter.as_str()));
    if let Some((devices_dir, health_checks_dir)) = config.policy.dirs() {
        policy.reload(devices_dir, health_checks_dir)?;
        info!(devices_dir = %devices_dir.display(), "Device policy loaded");
    }

    let notifier = Arc::new(BroadcastNotifier::new(
        config.events.topic_prefix.as_str(),
        config.events.capacity,
    ));
    let notifications = notifier.subscribe();

    let mut scheduler = Scheduler::new(
        Arc::new(store),
        policy.clone(),
        notifier,
        Arc::new(TracingAuditLog),
    )
    .with_system_actor(config.health_check_submitter.as_str());
    if let Some(seed) = config.tick.seed {
        scheduler = scheduler.with_seed(seed);
    }

    let mut daemon = SchedulerDaemon::new(Arc::new(scheduler), notifications, &config.tick)?;
    if let Some((devices_dir, health_checks_dir)) = config.policy.dirs() {
        daemon = daemon.with_policy_reload(policy, devices_dir, health_checks_dir);
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    daemon.run(cancel).await;
    Ok(())
}
