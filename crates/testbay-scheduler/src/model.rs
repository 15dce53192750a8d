//! Fleet records: device types, workers, devices and test jobs.
//!
//! These are plain data rows. State and health only change through the
//! functions in [`crate::machine`] and [`crate::transitions`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::{self, JobDefinition};

/// Identifier of a test job.
pub type JobId = u64;

/// Named priority levels. Any other integer is also a valid priority.
pub mod priority {
    /// Low priority.
    pub const LOW: i32 = 0;
    /// Default priority.
    pub const MEDIUM: i32 = 50;
    /// High priority.
    pub const HIGH: i32 = 100;
}

/// How the health-check frequency of a device type is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthDenominator {
    /// One health check every `health_frequency` hours.
    #[default]
    PerHour,
    /// One health check every `health_frequency` ordinary jobs.
    PerJob,
}

/// A class of interchangeable devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    /// Unique name, e.g. `qemu`.
    pub name: String,
    /// Hidden types are never scheduled.
    #[serde(default = "default_true")]
    pub display: bool,
    /// Skip health checks for devices of this type.
    #[serde(default)]
    pub disable_health_check: bool,
    /// Number of hours or jobs between health checks.
    #[serde(default = "default_health_frequency")]
    pub health_frequency: u32,
    /// Unit of `health_frequency`.
    #[serde(default)]
    pub health_denominator: HealthDenominator,
    /// Restricts visibility to owners. Carried, not enforced here.
    #[serde(default)]
    pub owners_only: bool,
}

const fn default_true() -> bool {
    true
}

const fn default_health_frequency() -> u32 {
    24
}

impl DeviceType {
    /// Creates a visible device type with hourly health checks.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display: true,
            disable_health_check: false,
            health_frequency: default_health_frequency(),
            health_denominator: HealthDenominator::PerHour,
            owners_only: false,
        }
    }

    /// Returns true when devices of this type receive periodic health checks.
    #[must_use]
    pub const fn health_checks_enabled(&self) -> bool {
        !self.disable_health_check && self.health_frequency > 0
    }
}

/// Connectivity of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// The worker pings the server.
    Online,
    /// No recent ping.
    Offline,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// Administrative health of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Accepting jobs.
    Active,
    /// Temporarily withdrawn.
    Maintenance,
    /// Permanently withdrawn.
    Retired,
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Maintenance => write!(f, "Maintenance"),
            Self::Retired => write!(f, "Retired"),
        }
    }
}

/// A host machine running a dispatcher for a set of devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique hostname.
    pub hostname: String,
    /// Connectivity.
    pub state: WorkerState,
    /// Administrative health.
    pub health: WorkerHealth,
    /// Maximum number of busy devices, 0 for unlimited.
    #[serde(default)]
    pub job_limit: u32,
    /// Last time the dispatcher pinged the server.
    pub last_ping: DateTime<Utc>,
}

impl Worker {
    /// Creates an online, active worker without a job limit.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: WorkerState::Online,
            health: WorkerHealth::Active,
            job_limit: 0,
            last_ping: Utc::now(),
        }
    }
}

/// Occupancy of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Free for scheduling.
    Idle,
    /// Held by a job that has not started yet.
    Reserved,
    /// Running a job.
    Running,
}

impl DeviceState {
    /// Returns true when a job currently holds the device.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Reserved | Self::Running)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Reserved => write!(f, "Reserved"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Assessed health of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealth {
    /// Last health check passed.
    Good,
    /// Not assessed yet.
    Unknown,
    /// Health checks run continuously until an admin intervenes.
    Looping,
    /// Last health check failed or the configuration is invalid.
    Bad,
    /// Withdrawn by an admin.
    Maintenance,
    /// Permanently withdrawn.
    Retired,
}

impl DeviceHealth {
    /// Healths that may receive ordinary jobs.
    pub const SCHEDULABLE: [Self; 2] = [Self::Good, Self::Unknown];

    /// Healths considered by the health-check pass.
    pub const CHECKABLE: [Self; 3] = [Self::Good, Self::Unknown, Self::Looping];

    /// Returns true when the device may take ordinary jobs.
    #[must_use]
    pub const fn accepts_jobs(self) -> bool {
        matches!(self, Self::Good | Self::Unknown)
    }
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "Good"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Looping => write!(f, "Looping"),
            Self::Bad => write!(f, "Bad"),
            Self::Maintenance => write!(f, "Maintenance"),
            Self::Retired => write!(f, "Retired"),
        }
    }
}

/// A single controllable unit of test hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Unique hostname.
    pub hostname: String,
    /// Name of the device type.
    pub device_type: String,
    /// Hostname of the owning worker.
    pub worker_host: String,
    /// Occupancy.
    pub state: DeviceState,
    /// Assessed health.
    pub health: DeviceHealth,
    /// Capability labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Most recent finished health-check job.
    #[serde(default)]
    pub last_health_report_job: Option<JobId>,
}

impl Device {
    /// Creates an idle device of unknown health.
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        device_type: impl Into<String>,
        worker_host: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            device_type: device_type.into(),
            worker_host: worker_host.into(),
            state: DeviceState::Idle,
            health: DeviceHealth::Unknown,
            tags: BTreeSet::new(),
            last_health_report_job: None,
        }
    }

    /// Returns true when every tag in `tags` is carried by the device.
    #[must_use]
    pub fn satisfies_tags(&self, tags: &BTreeSet<String>) -> bool {
        tags.is_subset(&self.tags)
    }
}

/// Lifecycle state of a job. Variants are ordered; jobs only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a device.
    Submitted,
    /// Holding a device while the rest of its multi-node group is placed.
    Scheduling,
    /// Holding a device, waiting for the dispatcher to start.
    Scheduled,
    /// Executing.
    Running,
    /// Cancellation requested.
    Canceling,
    /// Terminal.
    Finished,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "Submitted"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Running => write!(f, "Running"),
            Self::Canceling => write!(f, "Canceling"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// Outcome of a job, set once when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobHealth {
    /// Not finished.
    Unknown,
    /// Passed.
    Complete,
    /// Failed.
    Incomplete,
    /// Canceled before completion.
    Canceled,
}

impl fmt::Display for JobHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Complete => write!(f, "Complete"),
            Self::Incomplete => write!(f, "Incomplete"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

/// One test execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestJob {
    /// Assigned by the store on insert.
    #[serde(default)]
    pub id: JobId,
    /// User that submitted the job.
    pub submitter: String,
    /// Requested device type.
    #[serde(default)]
    pub requested_device_type: Option<String>,
    /// Device the job was placed on.
    #[serde(default)]
    pub actual_device: Option<String>,
    /// Lifecycle state.
    pub state: JobState,
    /// Outcome.
    pub health: JobHealth,
    /// Higher runs first.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Submission time.
    pub submit_time: DateTime<Utc>,
    /// Time the dispatcher started the job.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Time the job finished.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Tags the device must carry.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Injected health check.
    #[serde(default)]
    pub health_check: bool,
    /// Multi-node group shared by sibling sub-jobs.
    #[serde(default)]
    pub target_group: Option<String>,
    /// Role slot within the target group.
    #[serde(default)]
    pub sub_id: String,
    /// Seconds the job may stay submitted.
    #[serde(default)]
    pub queue_timeout: Option<u64>,
    /// Job body (YAML).
    pub definition: String,
}

const fn default_priority() -> i32 {
    priority::MEDIUM
}

impl TestJob {
    /// Creates a submitted job requesting a device type.
    #[must_use]
    pub fn new(
        submitter: impl Into<String>,
        device_type: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            submitter: submitter.into(),
            requested_device_type: Some(device_type.into()),
            actual_device: None,
            state: JobState::Submitted,
            health: JobHealth::Unknown,
            priority: priority::MEDIUM,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            tags: BTreeSet::new(),
            health_check: false,
            target_group: None,
            sub_id: String::new(),
            queue_timeout: None,
            definition: definition.into(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Adds required tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Places the job in a multi-node group.
    #[must_use]
    pub fn in_group(mut self, target_group: impl Into<String>, sub_id: impl Into<String>) -> Self {
        self.target_group = Some(target_group.into());
        self.sub_id = sub_id.into();
        self
    }

    /// Sets the queue timeout in seconds.
    #[must_use]
    pub const fn with_queue_timeout(mut self, seconds: u64) -> Self {
        self.queue_timeout = Some(seconds);
        self
    }

    /// Overrides the submission time.
    #[must_use]
    pub const fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submit_time = at;
        self
    }

    /// Returns true for sub-jobs of a multi-node group.
    #[must_use]
    pub fn is_multinode(&self) -> bool {
        self.target_group.as_deref().is_some_and(|g| !g.is_empty())
    }

    /// Multi-node role declared in the definition.
    #[must_use]
    pub fn device_role(&self) -> Option<String> {
        if !self.is_multinode() {
            return None;
        }
        JobDefinition::parse(&self.definition)
            .ok()
            .and_then(|d| d.multinode_role().map(ToOwned::to_owned))
    }

    /// Returns true when failure or cancellation of this sub-job must cancel
    /// its siblings.
    #[must_use]
    pub fn essential_role(&self) -> bool {
        if !self.is_multinode()
            || !definition::references_protocol(&self.definition, definition::MULTINODE)
        {
            return false;
        }
        JobDefinition::parse(&self.definition).is_ok_and(|d| d.is_essential())
    }

    /// Returns true for multi-node placeholders that need no physical device.
    #[must_use]
    pub fn is_dynamic_connection(&self) -> bool {
        if !self.is_multinode() || !self.definition.contains(definition::CONNECTION_KEY) {
            return false;
        }
        JobDefinition::parse(&self.definition).is_ok_and(|d| d.is_dynamic_connection())
    }
}
