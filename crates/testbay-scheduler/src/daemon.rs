//! Tick loop.
//!
//! Runs a tick at least every `interval` and earlier when fleet events
//! arrive. Events received between ticks narrow the next health-check pass
//! to the device types they touched.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TickConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::Notification;
use crate::policy::DictionaryPolicy;
use crate::scheduler::{Scheduler, TickReport};

struct PolicySource {
    policy: Arc<DictionaryPolicy>,
    devices_dir: PathBuf,
    health_checks_dir: PathBuf,
}

/// Drives a [`Scheduler`] until cancelled.
pub struct SchedulerDaemon {
    scheduler: Arc<Scheduler>,
    notifications: broadcast::Receiver<Notification>,
    interval: Duration,
    ping_timeout: chrono::Duration,
    policy: Option<PolicySource>,
}

impl SchedulerDaemon {
    /// Creates a daemon listening for fleet events on `notifications`.
    pub fn new(
        scheduler: Arc<Scheduler>,
        notifications: broadcast::Receiver<Notification>,
        tick: &TickConfig,
    ) -> SchedulerResult<Self> {
        let ping_timeout = chrono::Duration::from_std(tick.ping_timeout)
            .map_err(|e| SchedulerError::Internal(format!("ping timeout out of range: {e}")))?;
        Ok(Self {
            scheduler,
            notifications,
            interval: tick.interval,
            ping_timeout,
            policy: None,
        })
    }

    /// Reloads `policy` from the given directories before every tick.
    #[must_use]
    pub fn with_policy_reload(
        mut self,
        policy: Arc<DictionaryPolicy>,
        devices_dir: impl Into<PathBuf>,
        health_checks_dir: impl Into<PathBuf>,
    ) -> Self {
        self.policy = Some(PolicySource {
            policy,
            devices_dir: devices_dir.into(),
            health_checks_dir: health_checks_dir.into(),
        });
        self
    }

    /// Runs one tick: reloads the policy, moves silent workers offline and
    /// schedules the devices of the remaining ones.
    pub async fn tick(&self, activity: &BTreeSet<String>) -> SchedulerResult<TickReport> {
        self.reload_policy().await;
        let workers = self
            .scheduler
            .check_workers(Utc::now(), self.ping_timeout)
            .await?;
        self.scheduler.schedule(activity, &workers).await
    }

    async fn reload_policy(&self) {
        let Some(source) = &self.policy else {
            return;
        };
        let policy = Arc::clone(&source.policy);
        let devices_dir = source.devices_dir.clone();
        let health_checks_dir = source.health_checks_dir.clone();
        let result =
            tokio::task::spawn_blocking(move || policy.reload(&devices_dir, &health_checks_dir))
                .await;
        match result {
            Ok(Ok(())) => {}
            // The previous dictionaries stay in place.
            Ok(Err(err)) => warn!(error = %err, "device policy reload failed"),
            Err(err) => error!(error = %err, "device policy reload panicked"),
        }
    }

    /// Runs the tick loop until the cancellation token is triggered.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "scheduler daemon started");

        let mut activity = BTreeSet::new();
        loop {
            match self.tick(&activity).await {
                Ok(report) if report.is_idle() => debug!("nothing to do"),
                Ok(_) => {}
                Err(err) => error!(error = %err, "scheduling tick failed"),
            }
            activity.clear();

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("scheduler daemon shutting down");
                    break;
                }

                () = tokio::time::sleep(self.interval) => {}

                received = self.notifications.recv() => {
                    match received {
                        Ok(notification) => {
                            collect_activity(&mut activity, &notification);
                            self.drain(&mut activity);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            // Some device types may be missing; check them all.
                            warn!(skipped, "fleet events lagged");
                            activity.clear();
                        }
                        Err(RecvError::Closed) => {
                            warn!("fleet event channel closed");
                            tokio::select! {
                                () = cancel.cancelled() => break,
                                () = tokio::time::sleep(self.interval) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("scheduler daemon stopped");
    }

    fn drain(&mut self, activity: &mut BTreeSet<String>) {
        loop {
            match self.notifications.try_recv() {
                Ok(notification) => collect_activity(activity, &notification),
                Err(TryRecvError::Lagged(_)) => {
                    activity.clear();
                    return;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return,
            }
        }
    }
}

impl std::fmt::Debug for SchedulerDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerDaemon")
            .field("interval", &self.interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("reloads_policy", &self.policy.is_some())
            .finish_non_exhaustive()
    }
}

fn collect_activity(activity: &mut BTreeSet<String>, notification: &Notification) {
    if let Some(device_type) = notification.event.activity_device_type() {
        activity.insert(device_type.to_owned());
    }
}
