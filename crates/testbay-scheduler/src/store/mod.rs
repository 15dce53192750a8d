//! Fleet storage.
//!
//! The scheduler reaches rows only through a [`FleetTransaction`]. Rows read
//! through a transaction stay locked against other transactions until it
//! commits or rolls back, so every read-then-write sequence is serialised
//! per unit of work. An in-memory backend is provided; a relational backend
//! maps the reads onto `SELECT ... FOR UPDATE`.

mod memory;
mod seed;

pub use memory::MemoryFleetStore;
pub use seed::{DeviceSeed, FleetSeed, JobSeed, WorkerSeed};

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SchedulerResult;
use crate::events::{AuditEntry, AuditLog, EventSink, FleetEvent};
use crate::model::{
    Device, DeviceHealth, DeviceState, DeviceType, JobId, JobState, TestJob, Worker, WorkerHealth,
    WorkerState,
};

/// Filter criteria for listing device types.
#[derive(Debug, Clone, Default)]
pub struct DeviceTypeFilter {
    /// Only types with this visibility.
    pub display: Option<bool>,
    /// Only types with these names.
    pub names: Option<BTreeSet<String>>,
}

impl DeviceTypeFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            display: None,
            names: None,
        }
    }

    /// Only visible types.
    #[must_use]
    pub const fn visible(mut self) -> Self {
        self.display = Some(true);
        self
    }

    /// Only the named types.
    #[must_use]
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true when the device type passes the filter.
    #[must_use]
    pub fn matches(&self, device_type: &DeviceType) -> bool {
        if self.display.is_some_and(|d| d != device_type.display) {
            return false;
        }
        if let Some(ref names) = self.names {
            if !names.contains(&device_type.name) {
                return false;
            }
        }
        true
    }
}

/// Filter criteria for listing workers.
#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    /// Filter by connectivity.
    pub state: Option<WorkerState>,
    /// Filter by health.
    pub health: Option<WorkerHealth>,
}

impl WorkerFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: None,
            health: None,
        }
    }

    /// Filter by connectivity.
    #[must_use]
    pub const fn with_state(mut self, state: WorkerState) -> Self {
        self.state = Some(state);
        self
    }

    /// Filter by health.
    #[must_use]
    pub const fn with_health(mut self, health: WorkerHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Returns true when the worker passes the filter.
    #[must_use]
    pub fn matches(&self, worker: &Worker) -> bool {
        self.state.map_or(true, |s| s == worker.state)
            && self.health.map_or(true, |h| h == worker.health)
    }
}

/// Filter criteria for listing devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Filter by device type name.
    pub device_type: Option<String>,
    /// Filter by occupancy.
    pub state: Option<DeviceState>,
    /// Only devices with one of these healths.
    pub health: Option<Vec<DeviceHealth>>,
    /// Only devices owned by one of these workers.
    pub workers: Option<BTreeSet<String>>,
}

impl DeviceFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            device_type: None,
            state: None,
            health: None,
            workers: None,
        }
    }

    /// Filter by device type.
    #[must_use]
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Filter by occupancy.
    #[must_use]
    pub const fn with_state(mut self, state: DeviceState) -> Self {
        self.state = Some(state);
        self
    }

    /// Only devices with one of the given healths.
    #[must_use]
    pub fn with_health_in(mut self, health: &[DeviceHealth]) -> Self {
        self.health = Some(health.to_vec());
        self
    }

    /// Only devices owned by one of the given workers.
    #[must_use]
    pub fn with_workers<I, S>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workers = Some(workers.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true when the device passes the filter.
    #[must_use]
    pub fn matches(&self, device: &Device) -> bool {
        if let Some(ref device_type) = self.device_type {
            if &device.device_type != device_type {
                return false;
            }
        }
        if self.state.is_some_and(|s| s != device.state) {
            return false;
        }
        if let Some(ref health) = self.health {
            if !health.contains(&device.health) {
                return false;
            }
        }
        if let Some(ref workers) = self.workers {
            if !workers.contains(&device.worker_host) {
                return false;
            }
        }
        true
    }
}

/// Filter criteria for listing test jobs. Results are ordered by id.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs in one of these states; empty means any.
    pub states: Vec<JobState>,
    /// Filter by requested device type.
    pub device_type: Option<String>,
    /// Filter by placed device.
    pub actual_device: Option<String>,
    /// Only jobs without a placed device.
    pub unplaced: bool,
    /// Filter by multi-node group.
    pub target_group: Option<String>,
    /// Filter by health-check flag.
    pub health_check: Option<bool>,
    /// Only jobs started at or after this time.
    pub started_since: Option<DateTime<Utc>>,
}

impl JobFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            states: Vec::new(),
            device_type: None,
            actual_device: None,
            unplaced: false,
            target_group: None,
            health_check: None,
            started_since: None,
        }
    }

    /// Adds an accepted state.
    #[must_use]
    pub fn with_state(mut self, state: JobState) -> Self {
        self.states.push(state);
        self
    }

    /// Filter by requested device type.
    #[must_use]
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Filter by placed device.
    #[must_use]
    pub fn on_device(mut self, hostname: impl Into<String>) -> Self {
        self.actual_device = Some(hostname.into());
        self
    }

    /// Only jobs not bound to a device yet.
    #[must_use]
    pub const fn unplaced(mut self) -> Self {
        self.unplaced = true;
        self
    }

    /// Filter by multi-node group.
    #[must_use]
    pub fn in_group(mut self, target_group: impl Into<String>) -> Self {
        self.target_group = Some(target_group.into());
        self
    }

    /// Filter by health-check flag.
    #[must_use]
    pub const fn with_health_check(mut self, health_check: bool) -> Self {
        self.health_check = Some(health_check);
        self
    }

    /// Only jobs started at or after `since`.
    #[must_use]
    pub const fn started_since(mut self, since: DateTime<Utc>) -> Self {
        self.started_since = Some(since);
        self
    }

    /// Returns true when the job passes the filter.
    #[must_use]
    pub fn matches(&self, job: &TestJob) -> bool {
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        if self.device_type.is_some() && job.requested_device_type != self.device_type {
            return false;
        }
        if self.actual_device.is_some() && job.actual_device != self.actual_device {
            return false;
        }
        if self.unplaced && job.actual_device.is_some() {
            return false;
        }
        if self.target_group.is_some() && job.target_group != self.target_group {
            return false;
        }
        if self.health_check.is_some_and(|h| h != job.health_check) {
            return false;
        }
        if let Some(since) = self.started_since {
            if job.start_time.map_or(true, |start| start < since) {
                return false;
            }
        }
        true
    }
}

/// Backend for fleet records.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Opens a transaction. Implementations may wait for a conflicting
    /// transaction to end.
    async fn begin(&self) -> SchedulerResult<Box<dyn FleetTransaction>>;
}

/// One transaction against the fleet store.
///
/// Rows returned by any read stay locked until the transaction ends. Writes
/// become visible to other transactions only on [`FleetTransaction::commit`].
#[async_trait]
pub trait FleetTransaction: Send {
    /// Device types matching the filter, ordered by name.
    async fn device_types(&mut self, filter: &DeviceTypeFilter) -> SchedulerResult<Vec<DeviceType>>;

    /// Workers matching the filter, ordered by hostname.
    async fn workers(&mut self, filter: &WorkerFilter) -> SchedulerResult<Vec<Worker>>;

    /// Gets a worker by hostname.
    async fn worker(&mut self, hostname: &str) -> SchedulerResult<Option<Worker>>;

    /// Devices matching the filter, ordered by hostname.
    async fn devices(&mut self, filter: &DeviceFilter) -> SchedulerResult<Vec<Device>>;

    /// Gets a device by hostname.
    async fn device(&mut self, hostname: &str) -> SchedulerResult<Option<Device>>;

    /// Jobs matching the filter, ordered by id.
    async fn jobs(&mut self, filter: &JobFilter) -> SchedulerResult<Vec<TestJob>>;

    /// Number of jobs matching the filter.
    async fn count_jobs(&mut self, filter: &JobFilter) -> SchedulerResult<usize> {
        Ok(self.jobs(filter).await?.len())
    }

    /// Gets a job by id.
    async fn job(&mut self, id: JobId) -> SchedulerResult<Option<TestJob>>;

    /// Inserts a new job and returns its assigned id.
    async fn insert_job(&mut self, job: TestJob) -> SchedulerResult<JobId>;

    /// Persists an existing job.
    async fn save_job(&mut self, job: &TestJob) -> SchedulerResult<()>;

    /// Persists an existing device.
    async fn save_device(&mut self, device: &Device) -> SchedulerResult<()>;

    /// Persists an existing worker.
    async fn save_worker(&mut self, worker: &Worker) -> SchedulerResult<()>;

    /// Makes all writes visible and releases the locks.
    async fn commit(self: Box<Self>) -> SchedulerResult<()>;

    /// Discards all writes and releases the locks.
    async fn rollback(self: Box<Self>) -> SchedulerResult<()>;
}

/// A transaction together with the events and audit entries it produced.
///
/// Events and audit entries are published only after a successful commit;
/// a rollback discards them with the writes.
pub struct UnitOfWork {
    tx: Box<dyn FleetTransaction>,
    events: Vec<FleetEvent>,
    audit: Vec<AuditEntry>,
}

impl UnitOfWork {
    /// Opens a unit of work on the store.
    pub async fn begin(store: &dyn FleetStore) -> SchedulerResult<Self> {
        Ok(Self {
            tx: store.begin().await?,
            events: Vec::new(),
            audit: Vec::new(),
        })
    }

    /// Queues an event for publication after commit.
    pub fn emit(&mut self, event: FleetEvent) {
        self.events.push(event);
    }

    /// Queues an audit entry for recording after commit.
    pub fn audit(&mut self, entry: AuditEntry) {
        self.audit.push(entry);
    }

    /// Events queued so far.
    #[must_use]
    pub fn pending_events(&self) -> &[FleetEvent] {
        &self.events
    }

    /// Commits the transaction, then publishes the queued events and audit
    /// entries.
    pub async fn commit(
        self,
        sink: &dyn EventSink,
        audit_log: &dyn AuditLog,
    ) -> SchedulerResult<()> {
        let Self { tx, events, audit } = self;
        tx.commit().await?;
        for entry in &audit {
            audit_log.log_admin_entry(entry);
        }
        for event in events {
            sink.notify(event);
        }
        Ok(())
    }

    /// Rolls back the transaction and drops everything queued.
    pub async fn rollback(self) -> SchedulerResult<()> {
        self.tx.rollback().await
    }
}

impl Deref for UnitOfWork {
    type Target = dyn FleetTransaction;

    fn deref(&self) -> &Self::Target {
        self.tx.as_ref()
    }
}

impl DerefMut for UnitOfWork {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tx.as_mut()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("events", &self.events.len())
            .field("audit", &self.audit.len())
            .finish_non_exhaustive()
    }
}
