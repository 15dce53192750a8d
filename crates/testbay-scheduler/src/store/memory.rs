//! In-memory fleet store.
//!
//! A transaction holds the store mutex for its whole lifetime, which gives
//! select-for-update isolation. Writes go to a per-transaction write set that
//! reads see on top of the shared rows; commit applies only that set and
//! rollback drops it. Data is lost when the process exits.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{Device, DeviceType, JobId, TestJob, Worker};

use super::{
    DeviceFilter, DeviceTypeFilter, FleetStore, FleetTransaction, JobFilter, WorkerFilter,
};

fn next_job_id(last: JobId) -> SchedulerResult<JobId> {
    last.checked_add(1)
        .ok_or_else(|| SchedulerError::store("job id space exhausted"))
}

#[derive(Debug, Default)]
struct FleetData {
    device_types: BTreeMap<String, DeviceType>,
    workers: BTreeMap<String, Worker>,
    devices: BTreeMap<String, Device>,
    jobs: BTreeMap<JobId, TestJob>,
    last_job_id: JobId,
}

impl FleetData {
    fn insert_job(&mut self, mut job: TestJob) -> SchedulerResult<JobId> {
        let id = next_job_id(self.last_job_id)?;
        job.id = id;
        self.jobs.insert(id, job);
        self.last_job_id = id;
        Ok(id)
    }

    fn apply(&mut self, writes: WriteSet) {
        self.workers.extend(writes.workers);
        self.devices.extend(writes.devices);
        self.jobs.extend(writes.jobs);
        self.last_job_id = self.last_job_id.max(writes.last_job_id);
    }
}

/// Rows changed or inserted by one transaction, keyed like [`FleetData`].
#[derive(Debug, Default)]
struct WriteSet {
    workers: BTreeMap<String, Worker>,
    devices: BTreeMap<String, Device>,
    jobs: BTreeMap<JobId, TestJob>,
    last_job_id: JobId,
}

/// Rows of `base` matching `keep`, with written rows taking precedence, in
/// key order.
fn overlay<'a, K: Ord, V>(
    base: &'a BTreeMap<K, V>,
    written: &'a BTreeMap<K, V>,
    keep: impl Fn(&V) -> bool,
) -> Vec<&'a V> {
    let mut merged: BTreeMap<&K, &V> = base
        .iter()
        .filter(|(k, v)| !written.contains_key(*k) && keep(v))
        .collect();
    merged.extend(written.iter().filter(|(_, v)| keep(v)));
    merged.into_values().collect()
}

fn lookup<'a, K: Ord, V>(
    base: &'a BTreeMap<K, V>,
    written: &'a BTreeMap<K, V>,
    key: &K,
) -> Option<&'a V> {
    written.get(key).or_else(|| base.get(key))
}

/// In-memory fleet store.
#[derive(Debug, Clone, Default)]
pub struct MemoryFleetStore {
    data: Arc<Mutex<FleetData>>,
}

impl MemoryFleetStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a device type.
    pub async fn add_device_type(&self, device_type: DeviceType) {
        let mut data = self.data.lock().await;
        data.device_types.insert(device_type.name.clone(), device_type);
    }

    /// Registers or replaces a worker.
    pub async fn add_worker(&self, worker: Worker) {
        let mut data = self.data.lock().await;
        data.workers.insert(worker.hostname.clone(), worker);
    }

    /// Registers a device.
    ///
    /// The device type and worker must already be registered.
    pub async fn add_device(&self, device: Device) -> SchedulerResult<()> {
        let mut data = self.data.lock().await;
        if !data.device_types.contains_key(&device.device_type) {
            return Err(SchedulerError::DeviceTypeNotFound(device.device_type));
        }
        if !data.workers.contains_key(&device.worker_host) {
            return Err(SchedulerError::WorkerNotFound(device.worker_host));
        }
        data.devices.insert(device.hostname.clone(), device);
        Ok(())
    }

    /// Queues a submitted job and returns its id.
    pub async fn submit_job(&self, job: TestJob) -> SchedulerResult<JobId> {
        self.data.lock().await.insert_job(job)
    }

    /// Snapshot of a device.
    pub async fn get_device(&self, hostname: &str) -> Option<Device> {
        self.data.lock().await.devices.get(hostname).cloned()
    }

    /// Snapshot of a worker.
    pub async fn get_worker(&self, hostname: &str) -> Option<Worker> {
        self.data.lock().await.workers.get(hostname).cloned()
    }

    /// Snapshot of a job.
    pub async fn get_job(&self, id: JobId) -> Option<TestJob> {
        self.data.lock().await.jobs.get(&id).cloned()
    }

    /// Snapshot of every job matching the filter, ordered by id.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Vec<TestJob> {
        let data = self.data.lock().await;
        data.jobs.values().filter(|j| filter.matches(j)).cloned().collect()
    }

    /// Snapshot of every device, ordered by hostname.
    pub async fn list_devices(&self) -> Vec<Device> {
        self.data.lock().await.devices.values().cloned().collect()
    }
}

#[async_trait]
impl FleetStore for MemoryFleetStore {
    async fn begin(&self) -> SchedulerResult<Box<dyn FleetTransaction>> {
        let guard = Arc::clone(&self.data).lock_owned().await;
        let writes = WriteSet {
            last_job_id: guard.last_job_id,
            ..WriteSet::default()
        };
        Ok(Box::new(MemoryTransaction { guard, writes }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<FleetData>,
    writes: WriteSet,
}

#[async_trait]
impl FleetTransaction for MemoryTransaction {
    async fn device_types(
        &mut self,
        filter: &DeviceTypeFilter,
    ) -> SchedulerResult<Vec<DeviceType>> {
        Ok(self
            .guard
            .device_types
            .values()
            .filter(|dt| filter.matches(dt))
            .cloned()
            .collect())
    }

    async fn workers(&mut self, filter: &WorkerFilter) -> SchedulerResult<Vec<Worker>> {
        let rows = overlay(&self.guard.workers, &self.writes.workers, |w| filter.matches(w));
        Ok(rows.into_iter().cloned().collect())
    }

    async fn worker(&mut self, hostname: &str) -> SchedulerResult<Option<Worker>> {
        let key = hostname.to_owned();
        Ok(lookup(&self.guard.workers, &self.writes.workers, &key).cloned())
    }

    async fn devices(&mut self, filter: &DeviceFilter) -> SchedulerResult<Vec<Device>> {
        let rows = overlay(&self.guard.devices, &self.writes.devices, |d| filter.matches(d));
        Ok(rows.into_iter().cloned().collect())
    }

    async fn device(&mut self, hostname: &str) -> SchedulerResult<Option<Device>> {
        let key = hostname.to_owned();
        Ok(lookup(&self.guard.devices, &self.writes.devices, &key).cloned())
    }

    async fn jobs(&mut self, filter: &JobFilter) -> SchedulerResult<Vec<TestJob>> {
        let rows = overlay(&self.guard.jobs, &self.writes.jobs, |j| filter.matches(j));
        Ok(rows.into_iter().cloned().collect())
    }

    async fn count_jobs(&mut self, filter: &JobFilter) -> SchedulerResult<usize> {
        Ok(overlay(&self.guard.jobs, &self.writes.jobs, |j| filter.matches(j)).len())
    }

    async fn job(&mut self, id: JobId) -> SchedulerResult<Option<TestJob>> {
        Ok(lookup(&self.guard.jobs, &self.writes.jobs, &id).cloned())
    }

    async fn insert_job(&mut self, mut job: TestJob) -> SchedulerResult<JobId> {
        let id = next_job_id(self.writes.last_job_id)?;
        job.id = id;
        self.writes.jobs.insert(id, job);
        self.writes.last_job_id = id;
        Ok(id)
    }

    async fn save_job(&mut self, job: &TestJob) -> SchedulerResult<()> {
        if lookup(&self.guard.jobs, &self.writes.jobs, &job.id).is_none() {
            return Err(SchedulerError::JobNotFound(job.id));
        }
        self.writes.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn save_device(&mut self, device: &Device) -> SchedulerResult<()> {
        if !self.guard.devices.contains_key(&device.hostname) {
            return Err(SchedulerError::DeviceNotFound(device.hostname.clone()));
        }
        self.writes
            .devices
            .insert(device.hostname.clone(), device.clone());
        Ok(())
    }

    async fn save_worker(&mut self, worker: &Worker) -> SchedulerResult<()> {
        if !self.guard.workers.contains_key(&worker.hostname) {
            return Err(SchedulerError::WorkerNotFound(worker.hostname.clone()));
        }
        self.writes
            .workers
            .insert(worker.hostname.clone(), worker.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> SchedulerResult<()> {
        let Self { mut guard, writes } = *self;
        guard.apply(writes);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SchedulerResult<()> {
        Ok(())
    }
}
