//! Store-backed state transitions.
//!
//! Each function reads the rows it needs through the unit of work (locking
//! them), applies the pure transition from [`crate::machine`], persists the
//! rows that changed and queues the matching events and audit entries. They
//! are safe to call without any outer lock because every precondition is
//! re-checked on the locked rows.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{change_message, AuditEntry, FleetEvent};
use crate::machine::{self, JobAction, Transition};
use crate::model::{
    Device, DeviceHealth, JobHealth, JobId, TestJob, Worker, WorkerHealth, WorkerState,
};
use crate::store::{DeviceFilter, JobFilter, UnitOfWork, WorkerFilter};

async fn require_job(uow: &mut UnitOfWork, id: JobId) -> SchedulerResult<TestJob> {
    uow.job(id).await?.ok_or(SchedulerError::JobNotFound(id))
}

async fn require_device(uow: &mut UnitOfWork, hostname: &str) -> SchedulerResult<Device> {
    uow.device(hostname)
        .await?
        .ok_or_else(|| SchedulerError::DeviceNotFound(hostname.to_owned()))
}

async fn require_worker(uow: &mut UnitOfWork, hostname: &str) -> SchedulerResult<Worker> {
    uow.worker(hostname)
        .await?
        .ok_or_else(|| SchedulerError::WorkerNotFound(hostname.to_owned()))
}

async fn current_device(uow: &mut UnitOfWork, job: &TestJob) -> SchedulerResult<Option<Device>> {
    match job.actual_device.as_deref() {
        Some(hostname) => Ok(Some(require_device(uow, hostname).await?)),
        None => Ok(None),
    }
}

async fn save_job(uow: &mut UnitOfWork, job: &TestJob) -> SchedulerResult<()> {
    uow.save_job(job).await?;
    uow.emit(FleetEvent::job(job));
    Ok(())
}

async fn save_device(uow: &mut UnitOfWork, device: &Device) -> SchedulerResult<()> {
    uow.save_device(device).await?;
    uow.emit(FleetEvent::device(device));
    Ok(())
}

async fn save_worker(uow: &mut UnitOfWork, worker: &Worker) -> SchedulerResult<()> {
    uow.save_worker(worker).await?;
    uow.emit(FleetEvent::worker(worker));
    Ok(())
}

async fn place(
    uow: &mut UnitOfWork,
    job_id: JobId,
    hostname: &str,
    action: JobAction,
) -> SchedulerResult<Transition> {
    let mut job = require_job(uow, job_id).await?;
    let mut device = require_device(uow, hostname).await?;

    let transition = machine::place(&mut job, &mut device, action)?;
    if transition.applied() {
        save_device(uow, &device).await?;
        save_job(uow, &job).await?;
        debug!(job_id, device = %hostname, state = %job.state, "job placed");
    }
    Ok(transition)
}

/// Reserves an idle device for a multi-node sub-job.
pub async fn go_state_scheduling(
    uow: &mut UnitOfWork,
    job_id: JobId,
    hostname: &str,
) -> SchedulerResult<Transition> {
    place(uow, job_id, hostname, JobAction::Reserve).await
}

/// Schedules a job.
///
/// With a device, a submitted single-node job is placed on it. Without one,
/// a reserved multi-node sub-job (or a device-less placeholder) is released
/// to its dispatcher.
pub async fn go_state_scheduled(
    uow: &mut UnitOfWork,
    job_id: JobId,
    hostname: Option<&str>,
) -> SchedulerResult<Transition> {
    if let Some(hostname) = hostname {
        return place(uow, job_id, hostname, JobAction::Schedule).await;
    }

    let mut job = require_job(uow, job_id).await?;
    let device = current_device(uow, &job).await?;
    let transition = machine::confirm(&mut job, device.as_ref())?;
    if transition.applied() {
        save_job(uow, &job).await?;
        debug!(job_id, "job scheduled");
    }
    Ok(transition)
}

/// Marks a scheduled job as started by its dispatcher.
pub async fn go_state_running(
    uow: &mut UnitOfWork,
    job_id: JobId,
    now: DateTime<Utc>,
) -> SchedulerResult<Transition> {
    let mut job = require_job(uow, job_id).await?;
    let mut device = current_device(uow, &job).await?;

    let transition = machine::start(&mut job, device.as_mut(), now)?;
    if transition.applied() {
        if let Some(ref device) = device {
            save_device(uow, device).await?;
        }
        save_job(uow, &job).await?;
        debug!(job_id, "job running");
    }
    Ok(transition)
}

/// Moves every other member of the job's group to CANCELING.
///
/// Queued members are expired rather than canceled; they never reach a
/// dispatcher and are closed by the reaper.
async fn cancel_siblings(uow: &mut UnitOfWork, job: &TestJob) -> SchedulerResult<()> {
    let Some(group) = job.target_group.as_deref() else {
        return Ok(());
    };
    let siblings = uow.jobs(&JobFilter::new().in_group(group)).await?;
    for mut sibling in siblings.into_iter().filter(|s| s.id != job.id) {
        let applied =
            machine::expire(&mut sibling).applied() || machine::cancel(&mut sibling).applied();
        if applied {
            save_job(uow, &sibling).await?;
            info!(job_id = sibling.id, cause = job.id, group, "sibling canceled");
        }
    }
    Ok(())
}

/// Requests cancellation of a placed job.
///
/// Canceling an essential multi-node sub-job also cancels its siblings.
pub async fn go_state_canceling(
    uow: &mut UnitOfWork,
    job_id: JobId,
) -> SchedulerResult<Transition> {
    let mut job = require_job(uow, job_id).await?;
    let transition = machine::cancel(&mut job);
    if transition.applied() {
        save_job(uow, &job).await?;
        info!(job_id, "job canceling");
        if job.essential_role() {
            cancel_siblings(uow, &job).await?;
        }
    }
    Ok(transition)
}

/// Cancels a submitted job that waited too long, together with every
/// sibling sub-job still queued or placed.
pub async fn expire(uow: &mut UnitOfWork, job_id: JobId) -> SchedulerResult<Transition> {
    let mut job = require_job(uow, job_id).await?;
    let transition = machine::expire(&mut job);
    if !transition.applied() {
        return Ok(transition);
    }
    save_job(uow, &job).await?;
    info!(job_id, "job expired in queue");
    cancel_siblings(uow, &job).await?;
    Ok(transition)
}

fn health_check_reason(job: &TestJob, before: DeviceHealth) -> Option<String> {
    match before {
        DeviceHealth::Looping => (job.health == JobHealth::Incomplete)
            .then(|| format!("Looping health-check [{}] failed", job.id)),
        DeviceHealth::Good | DeviceHealth::Unknown | DeviceHealth::Bad => {
            let outcome = match job.health {
                JobHealth::Complete => "completed",
                JobHealth::Incomplete => "failed",
                JobHealth::Canceled => "canceled",
                JobHealth::Unknown => return None,
            };
            Some(format!("health-check [{}] {outcome}", job.id))
        }
        DeviceHealth::Maintenance | DeviceHealth::Retired => None,
    }
}

/// Ends a job, releases its device and applies a health-check verdict.
///
/// An essential multi-node sub-job that ends INCOMPLETE cancels its
/// siblings.
pub async fn go_state_finished(
    uow: &mut UnitOfWork,
    job_id: JobId,
    health: JobHealth,
    infrastructure_error: bool,
    actor: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<Transition> {
    let mut job = require_job(uow, job_id).await?;
    let mut device = current_device(uow, &job).await?;
    let health_before = device.as_ref().map(|d| d.health);

    let transition = machine::finish(&mut job, device.as_mut(), health, infrastructure_error, now)?;
    if !transition.applied() {
        return Ok(transition);
    }

    if let Some(ref device) = device {
        save_device(uow, device).await?;
        if let (true, Some(before)) = (job.health_check, health_before) {
            if let Some(reason) = health_check_reason(&job, before) {
                let message = change_message(before, device.health, Some(&reason));
                uow.audit(AuditEntry::device(&device.hostname, actor, message));
            }
            if device.health == DeviceHealth::Bad {
                warn!(device = %device.hostname, job_id, "health check failed");
            }
        }
    }
    save_job(uow, &job).await?;
    info!(job_id, health = %job.health, infrastructure_error, "job finished");

    if job.health == JobHealth::Incomplete && job.essential_role() {
        cancel_siblings(uow, &job).await?;
    }
    Ok(transition)
}

/// Sets a device's health explicitly. This is the only way out of LOOPING.
pub async fn set_device_health(
    uow: &mut UnitOfWork,
    hostname: &str,
    health: DeviceHealth,
    actor: &str,
    reason: Option<&str>,
) -> SchedulerResult<Transition> {
    let mut device = require_device(uow, hostname).await?;
    if device.health == health {
        return Ok(Transition::Unchanged);
    }
    let message = change_message(device.health, health, reason);
    device.health = health;
    save_device(uow, &device).await?;
    uow.audit(AuditEntry::device(hostname, actor, message));
    if health == DeviceHealth::Bad {
        warn!(device = %hostname, reason = reason.unwrap_or_default(), "device marked bad");
    }
    Ok(Transition::Applied)
}

fn lowercase(health: WorkerHealth) -> String {
    health.to_string().to_lowercase()
}

/// Changes a worker's health and cascades it to the worker's devices.
pub async fn set_worker_health(
    uow: &mut UnitOfWork,
    hostname: &str,
    health: WorkerHealth,
    actor: &str,
) -> SchedulerResult<Transition> {
    let mut worker = require_worker(uow, hostname).await?;
    if worker.health == health {
        return Ok(Transition::Unchanged);
    }
    if !machine::worker_health_transition(worker.health, health) {
        return Err(SchedulerError::transition("worker", worker.health, "set health"));
    }

    let message = change_message(worker.health, health, None);
    worker.health = health;
    save_worker(uow, &worker).await?;
    uow.audit(AuditEntry::worker(hostname, actor, message));
    info!(worker = %hostname, %health, "worker health changed");

    let reason = format!("worker going {}", lowercase(health));
    let devices = uow
        .devices(&DeviceFilter::new().with_workers([hostname]))
        .await?;
    for mut device in devices {
        let Some(next) = machine::device_health_for_worker(health, device.health) else {
            continue;
        };
        let message = change_message(device.health, next, Some(&reason));
        device.health = next;
        save_device(uow, &device).await?;
        uow.audit(AuditEntry::device(&device.hostname, actor, message));
    }
    Ok(Transition::Applied)
}

/// Changes a worker's connectivity.
pub async fn set_worker_state(
    uow: &mut UnitOfWork,
    hostname: &str,
    state: WorkerState,
    actor: &str,
) -> SchedulerResult<Transition> {
    let mut worker = require_worker(uow, hostname).await?;
    if !machine::worker_state_transition(worker.state, state) {
        return Ok(Transition::Unchanged);
    }
    let message = change_message(worker.state, state, None);
    worker.state = state;
    save_worker(uow, &worker).await?;
    uow.audit(AuditEntry::worker(hostname, actor, message));
    info!(worker = %hostname, %state, "worker state changed");
    Ok(Transition::Applied)
}

/// Records a ping from a worker's dispatcher, bringing it back online.
pub async fn record_worker_ping(
    uow: &mut UnitOfWork,
    hostname: &str,
    at: DateTime<Utc>,
    actor: &str,
) -> SchedulerResult<()> {
    let mut worker = require_worker(uow, hostname).await?;
    worker.last_ping = at;
    uow.save_worker(&worker).await?;
    if worker.state == WorkerState::Offline {
        // Event emitted by the state change.
        let _ = set_worker_state(uow, hostname, WorkerState::Online, actor).await?;
    }
    Ok(())
}

/// Moves online workers that stopped pinging offline and returns the
/// hostnames of the workers that are online and active.
pub async fn check_workers(
    uow: &mut UnitOfWork,
    now: DateTime<Utc>,
    ping_timeout: Duration,
    actor: &str,
) -> SchedulerResult<Vec<String>> {
    let online = uow
        .workers(&WorkerFilter::new().with_state(WorkerState::Online))
        .await?;
    for worker in online.iter().filter(|w| w.last_ping < now - ping_timeout) {
        warn!(worker = %worker.hostname, last_ping = %worker.last_ping, "worker stopped pinging");
        let _ = set_worker_state(uow, &worker.hostname, WorkerState::Offline, actor).await?;
    }

    Ok(uow
        .workers(
            &WorkerFilter::new()
                .with_state(WorkerState::Online)
                .with_health(WorkerHealth::Active),
        )
        .await?
        .into_iter()
        .map(|w| w.hostname)
        .collect())
}
