//! Test fixtures for scheduler integration tests.

use testbay_scheduler::{Device, DeviceHealth, DeviceType, HealthDenominator, TestJob, Worker};

/// Health-check body registered for device types under test.
pub const HEALTH_CHECK: &str = "job_name: health-check\nactions:\n  - boot: {}\n";

/// Body of an ordinary single-node job.
pub const SMOKE_JOB: &str = "job_name: smoke\nactions:\n  - test: {}\n";

/// Device dictionary extending a device type template.
pub fn dictionary(device_type: &str) -> String {
    format!("extends: {device_type}.jinja2\n")
}

/// Device dictionary with network interfaces carrying the given tags.
pub fn dictionary_with_interfaces(device_type: &str, interfaces: &[(&str, &[&str])]) -> String {
    let mut text = format!("extends: {device_type}.jinja2\nparameters:\n  interfaces:\n");
    for (name, tags) in interfaces {
        text.push_str(&format!("    {name}:\n      tags: [{}]\n", tags.join(", ")));
    }
    text
}

/// Device dictionary restricting submissions to the given users.
pub fn dictionary_with_submitters(device_type: &str, submitters: &[&str]) -> String {
    format!(
        "extends: {device_type}.jinja2\nsubmitters: [{}]\n",
        submitters.join(", ")
    )
}

/// Device type with health checks every `jobs` ordinary jobs.
pub fn per_job_type(name: &str, jobs: u32) -> DeviceType {
    let mut device_type = DeviceType::new(name);
    device_type.health_frequency = jobs;
    device_type.health_denominator = HealthDenominator::PerJob;
    device_type
}

/// Device type with health checks every `hours` hours.
pub fn per_hour_type(name: &str, hours: u32) -> DeviceType {
    let mut device_type = DeviceType::new(name);
    device_type.health_frequency = hours;
    device_type.health_denominator = HealthDenominator::PerHour;
    device_type
}

/// Device type without health checks.
pub fn unchecked_type(name: &str) -> DeviceType {
    let mut device_type = DeviceType::new(name);
    device_type.disable_health_check = true;
    device_type
}

/// Worker with a job limit, 0 for unlimited.
pub fn worker(hostname: &str, job_limit: u32) -> Worker {
    let mut worker = Worker::new(hostname);
    worker.job_limit = job_limit;
    worker
}

/// Builder for test devices.
pub struct DeviceBuilder {
    device: Device,
}

impl DeviceBuilder {
    /// Creates an idle device of unknown health.
    pub fn new(hostname: &str, device_type: &str, worker: &str) -> Self {
        Self {
            device: Device::new(hostname, device_type, worker),
        }
    }

    /// Sets the device's health.
    pub fn with_health(mut self, health: DeviceHealth) -> Self {
        self.device.health = health;
        self
    }

    /// Marks the device as healthy.
    pub fn good(self) -> Self {
        self.with_health(DeviceHealth::Good)
    }

    /// Adds tags to the device.
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.device
            .tags
            .extend(tags.iter().map(|t| (*t).to_owned()));
        self
    }

    /// Builds the device.
    pub fn build(self) -> Device {
        self.device
    }
}

/// Ordinary single-node job.
pub fn job(device_type: &str) -> TestJob {
    TestJob::new("alice", device_type, SMOKE_JOB)
}

/// Multi-node sub-job with a role.
pub fn multinode_job(
    device_type: &str,
    group: &str,
    sub_id: &str,
    role: &str,
    essential: bool,
) -> TestJob {
    let definition = format!(
        "job_name: {group}-{role}\n\
         protocols:\n  lava-multinode:\n    role: {role}\n    essential: {essential}\n"
    );
    TestJob::new("alice", device_type, definition).in_group(group, sub_id)
}

/// Multi-node placeholder that connects to a sibling instead of a device.
pub fn dynamic_connection(device_type: &str, group: &str, sub_id: &str, role: &str) -> TestJob {
    let definition = format!(
        "job_name: {group}-{role}\nconnection: ssh\n\
         protocols:\n  lava-multinode:\n    role: {role}\n"
    );
    TestJob::new("alice", device_type, definition).in_group(group, sub_id)
}

/// Single-node job requesting VLANs, each needing interfaces with the given
/// tags.
pub fn vlan_job(device_type: &str, vlans: &[(&str, &[&str])]) -> TestJob {
    let mut definition = "job_name: vlan\nprotocols:\n  lava-vland:\n".to_owned();
    for (name, tags) in vlans {
        definition.push_str(&format!("    {name}:\n      tags: [{}]\n", tags.join(", ")));
    }
    TestJob::new("alice", device_type, definition)
}
