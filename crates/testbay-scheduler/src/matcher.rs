//! Job matching pass and multi-node reconciliation.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use crate::capacity::WorkerLoad;
use crate::definition::{self, JobDefinition};
use crate::error::SchedulerResult;
use crate::health::INVALID_CONFIGURATION;
use crate::model::{Device, DeviceHealth, DeviceState, JobState, TestJob};
use crate::scheduler::{Assignment, AvailableDevices, Scheduler};
use crate::store::{DeviceFilter, JobFilter, UnitOfWork};
use crate::transitions;

/// Orders candidates: priority descending, then submit time, sub id and id
/// ascending.
pub fn sort_candidates(jobs: &mut [TestJob]) {
    jobs.sort_by(|a, b| {
        (Reverse(a.priority), a.submit_time, &a.sub_id, a.id)
            .cmp(&(Reverse(b.priority), b.submit_time, &b.sub_id, b.id))
    });
}

impl Scheduler {
    /// Assigns submitted jobs to the available devices, one device per unit
    /// of work, visiting devices in random order.
    pub async fn schedule_jobs(
        &self,
        load: &mut WorkerLoad,
        available: &AvailableDevices,
        workers: &[String],
    ) -> SchedulerResult<Vec<Assignment>> {
        let mut assignments = Vec::new();
        for (device_type, hostnames) in available {
            if hostnames.is_empty() || !self.has_queued_jobs(device_type).await? {
                continue;
            }

            let filter = DeviceFilter::new()
                .with_device_type(device_type.as_str())
                .with_state(DeviceState::Idle)
                .with_health_in(&DeviceHealth::SCHEDULABLE)
                .with_workers(workers.iter().cloned());
            let mut devices: Vec<String> = {
                let mut uow = self.begin().await?;
                let result = uow.devices(&filter).await;
                self.settle(uow, result).await?
            }
            .into_iter()
            .map(|d| d.hostname)
            .filter(|h| hostnames.contains(h))
            .collect();
            self.shuffle(&mut devices);

            for hostname in devices {
                let mut uow = self.begin().await?;
                let result = self
                    .schedule_device(&mut uow, load, &hostname, hostnames, workers)
                    .await;
                match self.settle(uow, result).await {
                    Ok(Some((assignment, worker))) => {
                        load.record_assignment(&worker);
                        assignments.push(assignment);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(device = %hostname, error = %err, "unable to schedule device");
                    }
                }
            }
        }
        Ok(assignments)
    }

    async fn has_queued_jobs(&self, device_type: &str) -> SchedulerResult<bool> {
        let filter = JobFilter::new()
            .with_state(JobState::Submitted)
            .with_device_type(device_type)
            .unplaced();
        let mut uow = self.begin().await?;
        let result = uow.count_jobs(&filter).await;
        Ok(self.settle(uow, result).await? > 0)
    }

    async fn schedule_device(
        &self,
        uow: &mut UnitOfWork,
        load: &WorkerLoad,
        hostname: &str,
        available: &[String],
        workers: &[String],
    ) -> SchedulerResult<Option<(Assignment, String)>> {
        let Some(device) = uow.device(hostname).await? else {
            return Ok(None);
        };
        if device.state != DeviceState::Idle
            || !device.health.accepts_jobs()
            || !workers.contains(&device.worker_host)
            || !available.contains(&device.hostname)
        {
            return Ok(None);
        }
        if load.overused(&device.worker_host) {
            debug!(
                device = %hostname,
                worker = %device.worker_host,
                "skip device, worker at job limit"
            );
            return Ok(None);
        }
        if !self.policy.is_valid(&device) {
            transitions::set_device_health(
                uow,
                hostname,
                DeviceHealth::Bad,
                &self.system_actor,
                Some(INVALID_CONFIGURATION),
            )
            .await?;
            return Ok(None);
        }

        let Some(job) = self.pick_job(uow, &device).await? else {
            return Ok(None);
        };
        let multinode = job.is_multinode();
        if multinode {
            let _ = transitions::go_state_scheduling(uow, job.id, hostname).await?;
        } else {
            let _ = transitions::go_state_scheduled(uow, job.id, Some(hostname)).await?;
        }
        info!(device = %hostname, job_id = job.id, multinode, "job assigned");
        Ok(Some((
            Assignment {
                job_id: job.id,
                device: device.hostname,
                multinode,
            },
            device.worker_host,
        )))
    }

    async fn pick_job(
        &self,
        uow: &mut UnitOfWork,
        device: &Device,
    ) -> SchedulerResult<Option<TestJob>> {
        let filter = JobFilter::new()
            .with_state(JobState::Submitted)
            .with_device_type(device.device_type.as_str())
            .unplaced();
        let mut candidates: Vec<TestJob> = uow
            .jobs(&filter)
            .await?
            .into_iter()
            .filter(|j| device.satisfies_tags(&j.tags) && !j.is_dynamic_connection())
            .collect();
        sort_candidates(&mut candidates);

        for job in candidates {
            if !self.policy.can_submit(&job, device) {
                continue;
            }
            if definition::references_protocol(&job.definition, definition::VLAND) {
                let Ok(parsed) = JobDefinition::parse(&job.definition) else {
                    warn!(job_id = job.id, "unparseable job definition");
                    continue;
                };
                if parsed.has_protocol(definition::VLAND)
                    && !self.policy.match_protocol_interface(device, &parsed)
                {
                    continue;
                }
            }
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Releases multi-node groups whose members are all reserved, writing
    /// the device-to-role map into every member first. Returns the released
    /// group names.
    pub async fn transition_multinode_jobs(&self) -> SchedulerResult<Vec<String>> {
        let groups: BTreeSet<String> = {
            let mut uow = self.begin().await?;
            let result = uow
                .jobs(&JobFilter::new().with_state(JobState::Scheduling))
                .await;
            self.settle(uow, result).await?
        }
        .into_iter()
        .filter_map(|j| j.target_group)
        .collect();

        let mut released = Vec::new();
        for group in groups {
            let mut uow = self.begin().await?;
            let result = release_group(&mut uow, &group).await;
            match self.settle(uow, result).await {
                Ok(true) => {
                    debug!(%group, "multinode group scheduled");
                    released.push(group);
                }
                Ok(false) => {}
                Err(err) => error!(%group, error = %err, "unable to release multinode group"),
            }
        }
        Ok(released)
    }
}

async fn release_group(uow: &mut UnitOfWork, group: &str) -> SchedulerResult<bool> {
    let members = uow.jobs(&JobFilter::new().in_group(group)).await?;
    let ready = members
        .iter()
        .all(|j| j.state == JobState::Scheduling || j.is_dynamic_connection());
    if !ready {
        return Ok(false);
    }

    let roles: BTreeMap<String, String> = members
        .iter()
        .filter(|j| !j.is_dynamic_connection())
        .filter_map(|j| Some((j.actual_device.clone()?, j.device_role()?)))
        .collect();

    for mut member in members {
        let mut parsed = JobDefinition::parse(&member.definition)?;
        parsed.set_multinode_roles(&roles);
        member.definition = parsed.to_yaml()?;
        uow.save_job(&member).await?;
        let _ = transitions::go_state_scheduled(uow, member.id, None).await?;
    }
    Ok(true)
}
