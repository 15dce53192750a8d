//! Common test utilities for scheduler integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use testbay_scheduler::{
    AuditSubject, BroadcastNotifier, Device, DeviceType, DictionaryPolicy, JobHealth, JobId,
    MemoryAuditLog, MemoryFleetStore, Scheduler, TestJob, TickReport, Worker, DEFAULT_SYSTEM_ACTOR,
};

/// In-memory fleet with every collaborator wired together.
pub struct TestFleet {
    pub store: MemoryFleetStore,
    pub policy: Arc<DictionaryPolicy>,
    pub audit: Arc<MemoryAuditLog>,
    pub notifier: Arc<BroadcastNotifier>,
    pub scheduler: Scheduler,
}

impl TestFleet {
    /// Creates an empty fleet with a pinned device shuffle.
    pub fn new() -> Self {
        Self::with_seed(7)
    }

    /// Creates an empty fleet with the given shuffle seed.
    pub fn with_seed(seed: u64) -> Self {
        let store = MemoryFleetStore::new();
        let policy = Arc::new(DictionaryPolicy::new(DEFAULT_SYSTEM_ACTOR));
        let audit = Arc::new(MemoryAuditLog::new());
        let notifier = Arc::new(BroadcastNotifier::new("org.testbay", 1024));
        let scheduler = Scheduler::new(
            Arc::new(store.clone()),
            policy.clone(),
            notifier.clone(),
            audit.clone(),
        )
        .with_seed(seed);
        Self {
            store,
            policy,
            audit,
            notifier,
            scheduler,
        }
    }

    pub async fn add_device_type(&self, device_type: DeviceType) {
        self.store.add_device_type(device_type).await;
    }

    pub async fn add_worker(&self, worker: Worker) {
        self.store.add_worker(worker).await;
    }

    /// Adds a device with a valid dictionary extending its device type.
    pub async fn add_device(&self, device: Device) {
        self.policy.set_dictionary(
            &device.hostname,
            &fixtures::dictionary(&device.device_type),
        );
        self.store.add_device(device).await.unwrap();
    }

    /// Adds a device without registering a dictionary for it.
    pub async fn add_unconfigured_device(&self, device: Device) {
        self.store.add_device(device).await.unwrap();
    }

    pub async fn submit(&self, job: TestJob) -> JobId {
        self.store.submit_job(job).await.unwrap()
    }

    /// Runs a tick over every online, active worker.
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Runs a tick as of `now` over every online, active worker.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let workers = self.workers(now).await;
        self.scheduler
            .schedule_at(&BTreeSet::new(), &workers, now)
            .await
            .unwrap()
    }

    /// Online, active workers; nobody is considered silent.
    pub async fn workers(&self, now: DateTime<Utc>) -> Vec<String> {
        self.scheduler
            .check_workers(now, Duration::days(365))
            .await
            .unwrap()
    }

    pub async fn job(&self, id: JobId) -> TestJob {
        self.store.get_job(id).await.unwrap()
    }

    pub async fn device(&self, hostname: &str) -> Device {
        self.store.get_device(hostname).await.unwrap()
    }

    pub async fn worker(&self, hostname: &str) -> Worker {
        self.store.get_worker(hostname).await.unwrap()
    }

    /// Audit messages recorded for a device.
    pub fn device_log(&self, hostname: &str) -> Vec<String> {
        self.audit
            .messages_for(&AuditSubject::Device(hostname.to_owned()))
    }

    /// Audit messages recorded for a worker.
    pub fn worker_log(&self, hostname: &str) -> Vec<String> {
        self.audit
            .messages_for(&AuditSubject::Worker(hostname.to_owned()))
    }

    /// Starts and completes a job the way a dispatcher would.
    pub async fn run_to_completion(&self, id: JobId, health: JobHealth) {
        assert!(self.scheduler.go_state_running(id).await.unwrap().applied());
        assert!(self
            .scheduler
            .go_state_finished(id, health, false)
            .await
            .unwrap()
            .applied());
    }
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}
