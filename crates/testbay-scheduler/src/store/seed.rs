//! Fleet seed files.
//!
//! A seed file describes the device types, workers, devices and queued jobs
//! loaded into an in-memory store at start-up:
//!
//! ```yaml
//! device_types:
//!   - name: panda
//!     health_frequency: 24
//! workers:
//!   - hostname: worker-1
//!     job_limit: 2
//! devices:
//!   - hostname: panda-01
//!     device_type: panda
//!     worker: worker-1
//!     tags: [usb]
//! jobs:
//!   - submitter: alice
//!     device_type: panda
//!     definition: "job_name: smoke"
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::SchedulerResult;
use crate::model::{priority, Device, DeviceHealth, DeviceType, TestJob, Worker, WorkerHealth};

use super::MemoryFleetStore;

/// Contents of a seed file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetSeed {
    /// Device types.
    pub device_types: Vec<DeviceType>,
    /// Workers, registered online.
    pub workers: Vec<WorkerSeed>,
    /// Devices, registered idle.
    pub devices: Vec<DeviceSeed>,
    /// Jobs queued as submitted.
    pub jobs: Vec<JobSeed>,
}

/// A worker entry.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSeed {
    /// Unique hostname.
    pub hostname: String,
    /// Maximum number of busy devices, 0 for unlimited.
    #[serde(default)]
    pub job_limit: u32,
    /// Administrative health.
    #[serde(default = "default_worker_health")]
    pub health: WorkerHealth,
}

const fn default_worker_health() -> WorkerHealth {
    WorkerHealth::Active
}

/// A device entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSeed {
    /// Unique hostname.
    pub hostname: String,
    /// Device type name.
    pub device_type: String,
    /// Owning worker hostname.
    pub worker: String,
    /// Capability labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Initial health.
    #[serde(default = "default_device_health")]
    pub health: DeviceHealth,
}

const fn default_device_health() -> DeviceHealth {
    DeviceHealth::Unknown
}

/// A queued job entry.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSeed {
    /// Submitting user.
    pub submitter: String,
    /// Requested device type.
    pub device_type: String,
    /// Job body.
    pub definition: String,
    /// Priority.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Required tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Multi-node group.
    #[serde(default)]
    pub target_group: Option<String>,
    /// Role slot within the group.
    #[serde(default)]
    pub sub_id: String,
    /// Queue timeout in seconds.
    #[serde(default)]
    pub queue_timeout: Option<u64>,
}

const fn default_priority() -> i32 {
    priority::MEDIUM
}

impl FleetSeed {
    /// Parses a seed document.
    pub fn from_yaml(text: &str) -> SchedulerResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads and parses a seed file.
    pub fn load(path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Loads the seed into a store.
    pub async fn apply(&self, store: &MemoryFleetStore) -> SchedulerResult<()> {
        for device_type in &self.device_types {
            store.add_device_type(device_type.clone()).await;
        }
        for seed in &self.workers {
            let mut worker = Worker::new(&seed.hostname);
            worker.job_limit = seed.job_limit;
            worker.health = seed.health;
            store.add_worker(worker).await;
        }
        for seed in &self.devices {
            let mut device = Device::new(&seed.hostname, &seed.device_type, &seed.worker);
            device.tags.clone_from(&seed.tags);
            device.health = seed.health;
            store.add_device(device).await?;
        }
        for seed in &self.jobs {
            let mut job = TestJob::new(&seed.submitter, &seed.device_type, &seed.definition)
                .with_priority(seed.priority)
                .with_tags(seed.tags.iter().cloned());
            if let Some(ref group) = seed.target_group {
                job = job.in_group(group, &seed.sub_id);
            }
            job.queue_timeout = seed.queue_timeout;
            store.submit_job(job).await?;
        }
        Ok(())
    }
}
