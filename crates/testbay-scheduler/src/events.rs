//! Fleet change notifications and the admin audit trail.
//!
//! Both are side channels: they are fed only after the unit of work that
//! produced them commits, and a failing subscriber never affects scheduling.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{
    Device, DeviceHealth, DeviceState, JobHealth, JobId, JobState, TestJob, Worker, WorkerHealth,
    WorkerState,
};

/// A committed change to a fleet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetEvent {
    /// Device state or health changed.
    Device {
        /// Device hostname.
        hostname: String,
        /// Device type name.
        device_type: String,
        /// New occupancy.
        state: DeviceState,
        /// New health.
        health: DeviceHealth,
    },
    /// Job state changed.
    Job {
        /// Job id.
        id: JobId,
        /// Requested device type.
        device_type: Option<String>,
        /// Placed device.
        device: Option<String>,
        /// New state.
        state: JobState,
        /// Outcome.
        health: JobHealth,
        /// Injected health check.
        health_check: bool,
    },
    /// Worker state or health changed.
    Worker {
        /// Worker hostname.
        hostname: String,
        /// New connectivity.
        state: WorkerState,
        /// New health.
        health: WorkerHealth,
    },
}

impl FleetEvent {
    /// Event describing the current device row.
    #[must_use]
    pub fn device(device: &Device) -> Self {
        Self::Device {
            hostname: device.hostname.clone(),
            device_type: device.device_type.clone(),
            state: device.state,
            health: device.health,
        }
    }

    /// Event describing the current job row.
    #[must_use]
    pub fn job(job: &TestJob) -> Self {
        Self::Job {
            id: job.id,
            device_type: job.requested_device_type.clone(),
            device: job.actual_device.clone(),
            state: job.state,
            health: job.health,
            health_check: job.health_check,
        }
    }

    /// Event describing the current worker row.
    #[must_use]
    pub fn worker(worker: &Worker) -> Self {
        Self::Worker {
            hostname: worker.hostname.clone(),
            state: worker.state,
            health: worker.health,
        }
    }

    /// Last topic segment.
    #[must_use]
    pub const fn topic_suffix(&self) -> &'static str {
        match self {
            Self::Device { .. } => "device",
            Self::Job { .. } => "testjob",
            Self::Worker { .. } => "worker",
        }
    }

    /// Device type that now has scheduling work, if any.
    ///
    /// A newly submitted job, or a device that became idle with a health
    /// that can take work, makes its type worth a health-check pass.
    #[must_use]
    pub fn activity_device_type(&self) -> Option<&str> {
        match self {
            Self::Job {
                state: JobState::Submitted,
                device_type,
                ..
            } => device_type.as_deref(),
            Self::Device {
                state: DeviceState::Idle,
                health,
                device_type,
                ..
            } if DeviceHealth::CHECKABLE.contains(health) => Some(device_type.as_str()),
            _ => None,
        }
    }
}

/// Receiver of committed fleet events. Delivery is fire-and-forget.
pub trait EventSink: Send + Sync {
    /// Publishes one event.
    fn notify(&self, event: FleetEvent);
}

/// An event with its topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Full topic, e.g. `org.testbay.device`.
    pub topic: String,
    /// Payload.
    pub event: FleetEvent,
}

/// Publishes events on a tokio broadcast channel.
#[derive(Debug)]
pub struct BroadcastNotifier {
    prefix: String,
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    /// Creates a notifier with the given topic prefix and channel capacity.
    #[must_use]
    pub fn new(prefix: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            prefix: prefix.into(),
            sender,
        }
    }

    /// Subscribes to notifications published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastNotifier {
    fn notify(&self, event: FleetEvent) {
        let topic = format!("{}.{}", self.prefix, event.topic_suffix());
        tracing::trace!(%topic, ?event, "fleet event");
        // No subscribers is fine.
        let _ = self.sender.send(Notification { topic, event });
    }
}

/// Row an audit entry is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "hostname", rename_all = "snake_case")]
pub enum AuditSubject {
    /// A device.
    Device(String),
    /// A worker.
    Worker(String),
}

impl fmt::Display for AuditSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(hostname) => write!(f, "device {hostname}"),
            Self::Worker(hostname) => write!(f, "worker {hostname}"),
        }
    }
}

/// One admin audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    /// Row the entry is about.
    pub subject: AuditSubject,
    /// User or automation responsible.
    pub actor: String,
    /// Human-readable change, e.g. `Good → Bad (Invalid device configuration)`.
    pub message: String,
}

impl AuditEntry {
    /// Entry for a device.
    #[must_use]
    pub fn device(hostname: &str, actor: &str, message: impl Into<String>) -> Self {
        Self {
            subject: AuditSubject::Device(hostname.to_owned()),
            actor: actor.to_owned(),
            message: message.into(),
        }
    }

    /// Entry for a worker.
    #[must_use]
    pub fn worker(hostname: &str, actor: &str, message: impl Into<String>) -> Self {
        Self {
            subject: AuditSubject::Worker(hostname.to_owned()),
            actor: actor.to_owned(),
            message: message.into(),
        }
    }
}

/// Formats a state or health change for the audit trail.
#[must_use]
pub fn change_message(
    from: impl fmt::Display,
    to: impl fmt::Display,
    reason: Option<&str>,
) -> String {
    match reason {
        Some(reason) => format!("{from} → {to} ({reason})"),
        None => format!("{from} → {to}"),
    }
}

/// Destination of admin audit entries.
pub trait AuditLog: Send + Sync {
    /// Records one entry.
    fn log_admin_entry(&self, entry: &AuditEntry);
}

/// Writes audit entries to the `testbay_scheduler::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn log_admin_entry(&self, entry: &AuditEntry) {
        tracing::info!(
            target: "testbay_scheduler::audit",
            subject = %entry.subject,
            actor = %entry.actor,
            "{}",
            entry.message
        );
    }
}

/// Keeps audit entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Messages recorded for one subject.
    #[must_use]
    pub fn messages_for(&self, subject: &AuditSubject) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| &e.subject == subject)
            .map(|e| e.message.clone())
            .collect()
    }
}

impl AuditLog for MemoryAuditLog {
    fn log_admin_entry(&self, entry: &AuditEntry) {
        self.entries.lock().push(entry.clone());
    }
}
