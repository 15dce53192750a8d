//! Testbay scheduler - assigns queued test jobs to lab devices.
//!
//! The scheduler is responsible for:
//!
//! - **Health checks**: Injecting periodic health-check jobs and quarantining
//!   devices that fail them
//! - **Job matching**: Placing queued jobs on idle, healthy, compatible devices
//!   by priority, tags and worker capacity
//! - **Multi-node groups**: Reserving devices for every sub-job of a group and
//!   releasing the group only once all of them hold one
//! - **Queue timeouts**: Cancelling jobs that waited too long
//!
//! # Architecture
//!
//! A tick runs several passes over the fleet. Every device, group or job is
//! handled in its own short [`UnitOfWork`], which locks the rows it reads,
//! re-checks its preconditions and commits or rolls back as a whole. Events
//! and audit entries queued inside a unit of work are only published after
//! it commits.
//!
//! Device configuration is consulted through a [`DevicePolicy`], so the
//! passes perform no file I/O.
//!
//! # Example
//!
//! ```ignore
//! use testbay_scheduler::{Scheduler, MemoryFleetStore, DictionaryPolicy};
//!
//! let scheduler = Scheduler::new(store, policy, events, audit);
//! let report = scheduler.schedule(&BTreeSet::new(), &workers).await?;
//! ```

pub mod capacity;
pub mod config;
pub mod daemon;
pub mod definition;
pub mod error;
pub mod events;
pub mod health;
pub mod machine;
pub mod matcher;
pub mod model;
pub mod policy;
pub mod reaper;
pub mod scheduler;
pub mod store;
pub mod transitions;

// Re-export main types
pub use capacity::{WorkerLoad, WorkerSummary};
pub use config::{EventsConfig, FleetConfig, PolicyConfig, SchedulerConfig, TickConfig};
pub use daemon::SchedulerDaemon;
pub use definition::JobDefinition;
pub use error::{SchedulerError, SchedulerResult};
pub use events::{
    AuditEntry, AuditLog, AuditSubject, BroadcastNotifier, EventSink, FleetEvent,
    MemoryAuditLog, Notification, TracingAuditLog,
};
pub use health::HealthCheckPass;
pub use machine::Transition;
pub use model::{
    priority, Device, DeviceHealth, DeviceState, DeviceType, HealthDenominator, JobHealth, JobId,
    JobState, TestJob, Worker, WorkerHealth, WorkerState,
};
pub use policy::{DevicePolicy, DictionaryPolicy};
pub use scheduler::{Assignment, AvailableDevices, Scheduler, TickReport, DEFAULT_SYSTEM_ACTOR};
pub use store::{FleetSeed, FleetStore, FleetTransaction, MemoryFleetStore, UnitOfWork};
