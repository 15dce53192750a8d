//! Health-check pass.
//!
//! For every visible device type, each idle device that may be assessed
//! either receives a health check or is offered to the matching pass. A
//! device that cannot be checked is marked BAD and the pass moves on.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::capacity::WorkerLoad;
use crate::definition::JobDefinition;
use crate::error::SchedulerResult;
use crate::model::{Device, DeviceHealth, DeviceState, DeviceType, HealthDenominator, TestJob};
use crate::scheduler::{AvailableDevices, Scheduler};
use crate::store::{DeviceFilter, DeviceTypeFilter, JobFilter, UnitOfWork};
use crate::transitions;

/// Reason recorded when a device configuration fails validation.
pub const INVALID_CONFIGURATION: &str = "Invalid device configuration";

/// Reason recorded when a health check cannot be built or scheduled.
pub const INVALID_HEALTH_CHECK: &str = "Invalid health check";

/// Result of the health-check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckPass {
    /// Devices offered to the matching pass, keyed by device type.
    pub available: AvailableDevices,
    /// Devices that received a health check, keyed by device type.
    pub scheduled: BTreeMap<String, Vec<String>>,
}

enum DeviceOutcome {
    Skipped,
    Available,
    Checked { worker: String },
}

/// Returns true when a GOOD device needs a new health check.
async fn health_check_due(
    uow: &mut UnitOfWork,
    device_type: &DeviceType,
    device: &Device,
    now: DateTime<Utc>,
) -> SchedulerResult<bool> {
    if matches!(device.health, DeviceHealth::Unknown | DeviceHealth::Looping) {
        return Ok(true);
    }
    let Some(last_id) = device.last_health_report_job else {
        return Ok(true);
    };
    let Some(last) = uow.job(last_id).await? else {
        return Ok(true);
    };

    let frequency = device_type.health_frequency;
    match device_type.health_denominator {
        HealthDenominator::PerJob => {
            let filter = JobFilter::new()
                .on_device(device.hostname.as_str())
                .with_health_check(false)
                .started_since(last.submit_time);
            let count = uow.count_jobs(&filter).await?;
            Ok(count >= usize::try_from(frequency).unwrap_or(usize::MAX))
        }
        HealthDenominator::PerHour => Ok(last
            .submit_time
            .checked_add_signed(Duration::hours(i64::from(frequency)))
            .map_or(false, |due| now >= due)),
    }
}

impl Scheduler {
    /// Injects due health checks and lists the devices available for
    /// ordinary jobs.
    ///
    /// `device_types_with_activity` narrows the visible types considered;
    /// an empty set means all of them.
    pub async fn schedule_health_checks(
        &self,
        load: &mut WorkerLoad,
        device_types_with_activity: &BTreeSet<String>,
        workers: &[String],
        now: DateTime<Utc>,
    ) -> SchedulerResult<HealthCheckPass> {
        let mut filter = DeviceTypeFilter::new().visible();
        if !device_types_with_activity.is_empty() {
            filter = filter.with_names(device_types_with_activity.iter().cloned());
        }
        let device_types = {
            let mut uow = self.begin().await?;
            let result = uow.device_types(&filter).await;
            self.settle(uow, result).await?
        };

        let mut pass = HealthCheckPass::default();
        let mut disabled = Vec::new();
        for device_type in &device_types {
            let (available, scheduled) = if device_type.health_checks_enabled() {
                self.health_checks_for_device_type(load, device_type, workers, now)
                    .await?
            } else {
                disabled.push(device_type.name.as_str());
                let idle = self
                    .idle_devices(device_type, workers, &DeviceHealth::SCHEDULABLE)
                    .await?;
                (idle, Vec::new())
            };
            if !scheduled.is_empty() {
                pass.scheduled.insert(device_type.name.clone(), scheduled);
            }
            pass.available.insert(device_type.name.clone(), available);
        }
        if !disabled.is_empty() {
            debug!(device_types = ?disabled, "health checks disabled");
        }
        Ok(pass)
    }

    async fn idle_devices(
        &self,
        device_type: &DeviceType,
        workers: &[String],
        health: &[DeviceHealth],
    ) -> SchedulerResult<Vec<String>> {
        let filter = DeviceFilter::new()
            .with_device_type(device_type.name.as_str())
            .with_state(DeviceState::Idle)
            .with_health_in(health)
            .with_workers(workers.iter().cloned());
        let mut uow = self.begin().await?;
        let result = uow.devices(&filter).await;
        let devices = self.settle(uow, result).await?;
        Ok(devices.into_iter().map(|d| d.hostname).collect())
    }

    async fn health_checks_for_device_type(
        &self,
        load: &mut WorkerLoad,
        device_type: &DeviceType,
        workers: &[String],
        now: DateTime<Utc>,
    ) -> SchedulerResult<(Vec<String>, Vec<String>)> {
        let candidates = self
            .idle_devices(device_type, workers, &DeviceHealth::CHECKABLE)
            .await?;

        let mut available = Vec::new();
        let mut scheduled = Vec::new();
        for hostname in candidates {
            let mut uow = self.begin().await?;
            let result = self
                .health_check_device(&mut uow, load, device_type, &hostname, workers, now)
                .await;
            match self.settle(uow, result).await {
                Ok(DeviceOutcome::Available) => available.push(hostname),
                Ok(DeviceOutcome::Checked { worker }) => {
                    load.record_assignment(&worker);
                    info!(device = %hostname, "health check scheduled");
                    scheduled.push(hostname);
                }
                Ok(DeviceOutcome::Skipped) => {}
                Err(err) => {
                    error!(device = %hostname, error = %err, "unable to schedule health check");
                    self.mark_bad(&hostname, INVALID_HEALTH_CHECK).await?;
                }
            }
        }
        Ok((available, scheduled))
    }

    async fn health_check_device(
        &self,
        uow: &mut UnitOfWork,
        load: &WorkerLoad,
        device_type: &DeviceType,
        hostname: &str,
        workers: &[String],
        now: DateTime<Utc>,
    ) -> SchedulerResult<DeviceOutcome> {
        let Some(device) = uow.device(hostname).await? else {
            return Ok(DeviceOutcome::Skipped);
        };
        if device.state != DeviceState::Idle
            || !DeviceHealth::CHECKABLE.contains(&device.health)
            || !workers.contains(&device.worker_host)
        {
            return Ok(DeviceOutcome::Skipped);
        }
        if load.overused(&device.worker_host) {
            debug!(
                device = %hostname,
                worker = %device.worker_host,
                "skip health check, worker at job limit"
            );
            return Ok(DeviceOutcome::Skipped);
        }

        let Some(body) = self.policy.health_check(&device) else {
            return Ok(DeviceOutcome::Available);
        };
        if !health_check_due(uow, device_type, &device, now).await? {
            return Ok(DeviceOutcome::Available);
        }

        debug!(
            device = %hostname,
            state = %device.state,
            health = %device.health,
            "health check due"
        );
        if !self.policy.is_valid(&device) {
            transitions::set_device_health(
                uow,
                hostname,
                DeviceHealth::Bad,
                &self.system_actor,
                Some(INVALID_CONFIGURATION),
            )
            .await?;
            return Ok(DeviceOutcome::Skipped);
        }

        JobDefinition::parse(&body)?;
        let mut job = TestJob::new(self.system_actor.as_str(), device_type.name.as_str(), body);
        job.health_check = true;
        job.submit_time = now;
        let job_id = uow.insert_job(job).await?;
        let _ = transitions::go_state_scheduled(uow, job_id, Some(hostname)).await?;
        Ok(DeviceOutcome::Checked {
            worker: device.worker_host,
        })
    }

    /// Marks a device BAD in its own unit of work.
    pub(crate) async fn mark_bad(&self, hostname: &str, reason: &str) -> SchedulerResult<()> {
        let mut uow = self.begin().await?;
        let result = transitions::set_device_health(
            &mut uow,
            hostname,
            DeviceHealth::Bad,
            &self.system_actor,
            Some(reason),
        )
        .await;
        let _ = self.settle(uow, result).await?;
        Ok(())
    }
}
