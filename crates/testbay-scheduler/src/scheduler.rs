//! Scheduling tick orchestration.
//!
//! A tick runs, in order: a worker capacity snapshot, the health-check pass,
//! the job matching pass with multi-node reconciliation, the closure of
//! cancellations that never reached a device, and the queue-timeout reaper.
//! Every device, group or job is handled in its own short unit of work, so a
//! failure is contained to the row that caused it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{error, info, info_span, Instrument};

use crate::capacity::WorkerLoad;
use crate::error::SchedulerResult;
use crate::events::{AuditLog, EventSink};
use crate::machine::Transition;
use crate::model::{DeviceHealth, JobHealth, JobId, WorkerHealth, WorkerState};
use crate::policy::DevicePolicy;
use crate::store::{FleetStore, UnitOfWork};
use crate::transitions;

/// Default submitter of injected health checks and actor of automated audit
/// entries.
pub const DEFAULT_SYSTEM_ACTOR: &str = "lava-health";

/// Idle devices that may take ordinary jobs this tick, keyed by device type.
pub type AvailableDevices = BTreeMap<String, Vec<String>>;

/// A job placed on a device by the matching pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Placed job.
    pub job_id: JobId,
    /// Device hostname.
    pub device: String,
    /// True when the job was reserved as part of a multi-node group.
    pub multinode: bool,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Devices that received a health check, keyed by device type.
    pub health_checks: BTreeMap<String, Vec<String>>,
    /// Devices offered to the matching pass, keyed by device type.
    pub available: AvailableDevices,
    /// Jobs placed by the matching pass.
    pub assignments: Vec<Assignment>,
    /// Multi-node groups released to their dispatchers.
    pub released_groups: Vec<String>,
    /// Jobs closed after being canceled before placement.
    pub closed: Vec<JobId>,
    /// Jobs canceled for exceeding their queue timeout.
    pub expired: Vec<JobId>,
}

impl TickReport {
    /// Returns true when the tick changed nothing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.health_checks.is_empty()
            && self.assignments.is_empty()
            && self.released_groups.is_empty()
            && self.closed.is_empty()
            && self.expired.is_empty()
    }
}

/// The fleet scheduler.
pub struct Scheduler {
    pub(crate) store: Arc<dyn FleetStore>,
    pub(crate) policy: Arc<dyn DevicePolicy>,
    events: Arc<dyn EventSink>,
    audit: Arc<dyn AuditLog>,
    rng: Mutex<SmallRng>,
    pinned_seed: bool,
    pub(crate) system_actor: String,
}

impl Scheduler {
    /// Creates a scheduler with a randomly seeded device shuffle.
    #[must_use]
    pub fn new(
        store: Arc<dyn FleetStore>,
        policy: Arc<dyn DevicePolicy>,
        events: Arc<dyn EventSink>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            store,
            policy,
            events,
            audit,
            rng: Mutex::new(SmallRng::from_entropy()),
            pinned_seed: false,
            system_actor: DEFAULT_SYSTEM_ACTOR.to_owned(),
        }
    }

    /// Pins the device shuffle to a seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(SmallRng::seed_from_u64(seed));
        self.pinned_seed = true;
        self
    }

    /// Sets the submitter of health checks and actor of automated audit entries.
    #[must_use]
    pub fn with_system_actor(mut self, actor: impl Into<String>) -> Self {
        self.system_actor = actor.into();
        self
    }

    /// Shuffles in place with the scheduler's RNG.
    pub(crate) fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng.lock());
    }

    fn reseed(&self) {
        if !self.pinned_seed {
            *self.rng.lock() = SmallRng::from_entropy();
        }
    }

    pub(crate) async fn begin(&self) -> SchedulerResult<UnitOfWork> {
        UnitOfWork::begin(self.store.as_ref()).await
    }

    /// Commits on success, rolls back on error.
    pub(crate) async fn settle<T>(
        &self,
        uow: UnitOfWork,
        result: SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        match result {
            Ok(value) => {
                uow.commit(self.events.as_ref(), self.audit.as_ref()).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = uow.rollback().await {
                    error!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Reads the load of the given workers.
    pub async fn worker_load(&self, workers: &[String]) -> SchedulerResult<WorkerLoad> {
        let mut uow = self.begin().await?;
        let result = WorkerLoad::snapshot(&mut *uow, workers).await;
        self.settle(uow, result).await
    }

    /// Runs one tick now.
    ///
    /// `device_types_with_activity` narrows the health-check pass; an empty
    /// set means every visible type. Only devices of `workers` are
    /// considered.
    pub async fn schedule(
        &self,
        device_types_with_activity: &BTreeSet<String>,
        workers: &[String],
    ) -> SchedulerResult<TickReport> {
        self.schedule_at(device_types_with_activity, workers, Utc::now())
            .await
    }

    /// Runs one tick as of `now`.
    pub async fn schedule_at(
        &self,
        device_types_with_activity: &BTreeSet<String>,
        workers: &[String],
        now: DateTime<Utc>,
    ) -> SchedulerResult<TickReport> {
        let span = info_span!(
            "tick",
            workers = workers.len(),
            activity = device_types_with_activity.len()
        );
        async {
            self.reseed();
            let mut load = self.worker_load(workers).await?;

            let health = self
                .schedule_health_checks(&mut load, device_types_with_activity, workers, now)
                .await?;
            let assignments = self.schedule_jobs(&mut load, &health.available, workers).await?;
            let released_groups = self.transition_multinode_jobs().await?;
            let closed = self.close_abandoned_cancellations(now).await?;
            let expired = self.check_queue_timeouts(now).await?;

            let report = TickReport {
                health_checks: health.scheduled,
                available: health.available,
                assignments,
                released_groups,
                closed,
                expired,
            };
            info!(
                health_checks = report.health_checks.values().map(Vec::len).sum::<usize>(),
                assignments = report.assignments.len(),
                released = report.released_groups.len(),
                expired = report.expired.len(),
                "tick done"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Reserves an idle device for a multi-node sub-job.
    pub async fn go_state_scheduling(
        &self,
        job_id: JobId,
        device: &str,
    ) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::go_state_scheduling(&mut uow, job_id, device).await;
        self.settle(uow, result).await
    }

    /// Places a single-node job on a device, or releases a reserved
    /// multi-node sub-job when `device` is `None`.
    pub async fn go_state_scheduled(
        &self,
        job_id: JobId,
        device: Option<&str>,
    ) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::go_state_scheduled(&mut uow, job_id, device).await;
        self.settle(uow, result).await
    }

    /// The dispatcher started the job.
    pub async fn go_state_running(&self, job_id: JobId) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::go_state_running(&mut uow, job_id, Utc::now()).await;
        self.settle(uow, result).await
    }

    /// Requests cancellation of a job.
    pub async fn go_state_canceling(&self, job_id: JobId) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::go_state_canceling(&mut uow, job_id).await;
        self.settle(uow, result).await
    }

    /// The job ended with the given outcome.
    pub async fn go_state_finished(
        &self,
        job_id: JobId,
        health: JobHealth,
        infrastructure_error: bool,
    ) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::go_state_finished(
            &mut uow,
            job_id,
            health,
            infrastructure_error,
            &self.system_actor,
            Utc::now(),
        )
        .await;
        self.settle(uow, result).await
    }

    /// Admin override of a device's health.
    pub async fn set_device_health(
        &self,
        actor: &str,
        device: &str,
        health: DeviceHealth,
        reason: Option<&str>,
    ) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::set_device_health(&mut uow, device, health, actor, reason).await;
        self.settle(uow, result).await
    }

    /// Changes a worker's health, cascading to its devices.
    pub async fn set_worker_health(
        &self,
        actor: &str,
        worker: &str,
        health: WorkerHealth,
    ) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::set_worker_health(&mut uow, worker, health, actor).await;
        self.settle(uow, result).await
    }

    /// Changes a worker's connectivity.
    pub async fn set_worker_state(
        &self,
        actor: &str,
        worker: &str,
        state: WorkerState,
    ) -> SchedulerResult<Transition> {
        let mut uow = self.begin().await?;
        let result = transitions::set_worker_state(&mut uow, worker, state, actor).await;
        self.settle(uow, result).await
    }

    /// Records a dispatcher ping.
    pub async fn record_worker_ping(&self, worker: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        let mut uow = self.begin().await?;
        let result =
            transitions::record_worker_ping(&mut uow, worker, at, &self.system_actor).await;
        self.settle(uow, result).await
    }

    /// Moves silent workers offline and returns the online, active ones.
    pub async fn check_workers(
        &self,
        now: DateTime<Utc>,
        ping_timeout: Duration,
    ) -> SchedulerResult<Vec<String>> {
        let mut uow = self.begin().await?;
        let result =
            transitions::check_workers(&mut uow, now, ping_timeout, &self.system_actor).await;
        self.settle(uow, result).await
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pinned_seed", &self.pinned_seed)
            .field("system_actor", &self.system_actor)
            .finish_non_exhaustive()
    }
}
