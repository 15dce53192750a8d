//! Transition tables and pure row transitions.
//!
//! Every legal state change of a job, device or worker is listed in one of
//! the tables below. The functions in this module apply a table entry to
//! in-memory rows and never touch the store; [`crate::transitions`] wraps them
//! with locking, persistence and cascades.
//!
//! A transition whose precondition no longer holds is a no-op and returns
//! [`Transition::Unchanged`]. A transition that is illegal returns
//! [`SchedulerError::StateTransition`] and leaves every row untouched: all
//! checks run before the first mutation.

use chrono::{DateTime, Utc};

use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{
    Device, DeviceHealth, DeviceState, JobHealth, JobState, TestJob, WorkerHealth, WorkerState,
};

/// Whether a transition changed anything.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Rows were modified.
    Applied,
    /// Preconditions did not hold; rows are untouched.
    Unchanged,
}

impl Transition {
    /// Returns true when rows were modified.
    #[must_use]
    pub const fn applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Actions that move a job through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobAction {
    /// Hold a device while the multi-node group is placed.
    Reserve,
    /// Place a single-node job on a device.
    Schedule,
    /// Release a reserved multi-node sub-job (or a placeholder) to its dispatcher.
    Confirm,
    /// The dispatcher started the job.
    Start,
    /// Cancellation requested for a placed job.
    Cancel,
    /// The job timed out in the queue.
    Expire,
    /// The job ended.
    Finish,
}

impl JobAction {
    /// Action name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Schedule => "schedule",
            Self::Confirm => "confirm",
            Self::Start => "start",
            Self::Cancel => "cancel",
            Self::Expire => "expire",
            Self::Finish => "finish",
        }
    }
}

/// Legal job transitions: (from, action, to).
pub const JOB_TRANSITIONS: &[(JobState, JobAction, JobState)] = &[
    (JobState::Submitted, JobAction::Reserve, JobState::Scheduling),
    (JobState::Submitted, JobAction::Schedule, JobState::Scheduled),
    (JobState::Submitted, JobAction::Confirm, JobState::Scheduled),
    (JobState::Scheduling, JobAction::Confirm, JobState::Scheduled),
    (JobState::Scheduled, JobAction::Start, JobState::Running),
    (JobState::Scheduling, JobAction::Cancel, JobState::Canceling),
    (JobState::Scheduled, JobAction::Cancel, JobState::Canceling),
    (JobState::Running, JobAction::Cancel, JobState::Canceling),
    (JobState::Submitted, JobAction::Expire, JobState::Canceling),
    (JobState::Scheduled, JobAction::Finish, JobState::Finished),
    (JobState::Running, JobAction::Finish, JobState::Finished),
    (JobState::Canceling, JobAction::Finish, JobState::Finished),
];

/// Looks up the job state reached by `action` from `from`.
#[must_use]
pub fn job_transition(from: JobState, action: JobAction) -> Option<JobState> {
    JOB_TRANSITIONS
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
}

/// Actions that change device occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAction {
    /// A job claims the device.
    Reserve,
    /// The claiming job started.
    Start,
    /// The job ended.
    Release,
}

impl DeviceAction {
    /// Action name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Start => "start",
            Self::Release => "release",
        }
    }
}

/// Legal device transitions: (from, action, to).
pub const DEVICE_TRANSITIONS: &[(DeviceState, DeviceAction, DeviceState)] = &[
    (DeviceState::Idle, DeviceAction::Reserve, DeviceState::Reserved),
    (DeviceState::Reserved, DeviceAction::Start, DeviceState::Running),
    (DeviceState::Reserved, DeviceAction::Release, DeviceState::Idle),
    (DeviceState::Running, DeviceAction::Release, DeviceState::Idle),
];

/// Looks up the device state reached by `action` from `from`.
#[must_use]
pub fn device_transition(from: DeviceState, action: DeviceAction) -> Option<DeviceState> {
    DEVICE_TRANSITIONS
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
}

fn require_device_transition(
    device: &Device,
    action: DeviceAction,
) -> SchedulerResult<DeviceState> {
    device_transition(device.state, action)
        .ok_or_else(|| SchedulerError::transition("device", device.state, action.as_str()))
}

/// Legal worker connectivity transitions.
pub const WORKER_STATE_TRANSITIONS: &[(WorkerState, WorkerState)] = &[
    (WorkerState::Offline, WorkerState::Online),
    (WorkerState::Online, WorkerState::Offline),
];

/// Legal worker health transitions. Every pair of distinct healths is reachable.
pub const WORKER_HEALTH_TRANSITIONS: &[(WorkerHealth, WorkerHealth)] = &[
    (WorkerHealth::Active, WorkerHealth::Maintenance),
    (WorkerHealth::Active, WorkerHealth::Retired),
    (WorkerHealth::Maintenance, WorkerHealth::Active),
    (WorkerHealth::Maintenance, WorkerHealth::Retired),
    (WorkerHealth::Retired, WorkerHealth::Active),
    (WorkerHealth::Retired, WorkerHealth::Maintenance),
];

/// Returns true when the worker may move between the two states.
#[must_use]
pub fn worker_state_transition(from: WorkerState, to: WorkerState) -> bool {
    WORKER_STATE_TRANSITIONS.contains(&(from, to))
}

/// Returns true when the worker may move between the two healths.
#[must_use]
pub fn worker_health_transition(from: WorkerHealth, to: WorkerHealth) -> bool {
    WORKER_HEALTH_TRANSITIONS.contains(&(from, to))
}

/// Device health forced by a worker health change, if any.
#[must_use]
pub const fn device_health_for_worker(
    worker: WorkerHealth,
    device: DeviceHealth,
) -> Option<DeviceHealth> {
    match (worker, device) {
        (WorkerHealth::Active, DeviceHealth::Maintenance) => Some(DeviceHealth::Unknown),
        (WorkerHealth::Maintenance, DeviceHealth::Retired | DeviceHealth::Maintenance) => None,
        (WorkerHealth::Maintenance, _) => Some(DeviceHealth::Maintenance),
        (WorkerHealth::Retired, DeviceHealth::Bad | DeviceHealth::Retired) => None,
        (WorkerHealth::Retired, _) => Some(DeviceHealth::Retired),
        (WorkerHealth::Active, _) => None,
    }
}

/// Device health after a job on it finished with `job_health`.
///
/// Only health checks assess a device. Looping devices stay looping until an
/// admin overrides them, and admin-held healths are never touched.
#[must_use]
pub const fn device_health_after_job(
    current: DeviceHealth,
    health_check: bool,
    job_health: JobHealth,
) -> DeviceHealth {
    if !health_check {
        return current;
    }
    match current {
        DeviceHealth::Good | DeviceHealth::Unknown | DeviceHealth::Bad => match job_health {
            JobHealth::Complete => DeviceHealth::Good,
            JobHealth::Incomplete | JobHealth::Canceled => DeviceHealth::Bad,
            JobHealth::Unknown => current,
        },
        DeviceHealth::Looping | DeviceHealth::Maintenance | DeviceHealth::Retired => current,
    }
}

/// Places a submitted job on an idle device, as `Reserve` (multi-node) or
/// `Schedule` (single-node).
///
/// A job already holding this device is left alone. Otherwise a busy device
/// is an error, and a job past SUBMITTED is a no-op.
pub fn place(
    job: &mut TestJob,
    device: &mut Device,
    action: JobAction,
) -> SchedulerResult<Transition> {
    debug_assert!(matches!(action, JobAction::Reserve | JobAction::Schedule));

    let target = job_transition(job.state, action);
    if target.is_none() && job.actual_device.as_deref() == Some(device.hostname.as_str()) {
        return Ok(Transition::Unchanged);
    }
    let device_state = require_device_transition(device, DeviceAction::Reserve)?;
    let Some(job_state) = target else {
        return Ok(Transition::Unchanged);
    };

    device.state = device_state;
    job.state = job_state;
    job.actual_device = Some(device.hostname.clone());
    Ok(Transition::Applied)
}

/// Releases a reserved multi-node sub-job, or a device-less placeholder, to
/// its dispatcher.
pub fn confirm(job: &mut TestJob, device: Option<&Device>) -> SchedulerResult<Transition> {
    let Some(target) = job_transition(job.state, JobAction::Confirm) else {
        return Ok(Transition::Unchanged);
    };
    let dynamic = job.is_dynamic_connection();
    if !dynamic {
        if job.state == JobState::Submitted {
            return Err(SchedulerError::transition("job", job.state, JobAction::Confirm.as_str()));
        }
        match device {
            Some(device) if device.state == DeviceState::Reserved => {}
            Some(device) => {
                return Err(SchedulerError::transition(
                    "device",
                    device.state,
                    JobAction::Confirm.as_str(),
                ))
            }
            None => {
                return Err(SchedulerError::Internal(format!(
                    "job {} has no device to confirm",
                    job.id
                )))
            }
        }
    }
    job.state = target;
    Ok(Transition::Applied)
}

/// The dispatcher started the job.
pub fn start(
    job: &mut TestJob,
    device: Option<&mut Device>,
    now: DateTime<Utc>,
) -> SchedulerResult<Transition> {
    let Some(target) = job_transition(job.state, JobAction::Start) else {
        return Ok(Transition::Unchanged);
    };
    let device_state = match device.as_deref() {
        Some(device) => Some(require_device_transition(device, DeviceAction::Start)?),
        None => None,
    };

    if let (Some(device), Some(state)) = (device, device_state) {
        device.state = state;
    }
    job.state = target;
    job.start_time = Some(now);
    Ok(Transition::Applied)
}

/// Requests cancellation of a placed job.
pub fn cancel(job: &mut TestJob) -> Transition {
    match job_transition(job.state, JobAction::Cancel) {
        Some(target) => {
            job.state = target;
            Transition::Applied
        }
        None => Transition::Unchanged,
    }
}

/// Cancels a job that is still waiting in the queue.
pub fn expire(job: &mut TestJob) -> Transition {
    match job_transition(job.state, JobAction::Expire) {
        Some(target) => {
            job.state = target;
            Transition::Applied
        }
        None => Transition::Unchanged,
    }
}

/// Ends a job and releases its device.
///
/// A job that was canceling always finishes as CANCELED. Health checks
/// record themselves on the device and assess its health; the
/// infrastructure-error flag is carried for ordinary jobs but never changes
/// device health.
pub fn finish(
    job: &mut TestJob,
    device: Option<&mut Device>,
    health: JobHealth,
    _infrastructure_error: bool,
    now: DateTime<Utc>,
) -> SchedulerResult<Transition> {
    let Some(target) = job_transition(job.state, JobAction::Finish) else {
        return Ok(Transition::Unchanged);
    };
    if health == JobHealth::Unknown {
        return Err(SchedulerError::InvalidHealth(job.id));
    }
    let device_state = match device.as_deref() {
        Some(device) => Some(require_device_transition(device, DeviceAction::Release)?),
        None => None,
    };

    job.health = if job.state == JobState::Canceling {
        JobHealth::Canceled
    } else {
        health
    };
    job.state = target;
    job.start_time.get_or_insert(now);
    job.end_time = Some(now);

    if let (Some(device), Some(state)) = (device, device_state) {
        device.state = state;
        device.health = device_health_after_job(device.health, job.health_check, job.health);
        if job.health_check {
            device.last_health_report_job = Some(job.id);
        }
    }
    Ok(Transition::Applied)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("panda-01", "panda", "worker-1")
    }

    fn job() -> TestJob {
        let mut job = TestJob::new("alice", "panda", "job_name: smoke\n");
        job.id = 7;
        job
    }

    #[test]
    fn job_table_only_moves_forward() {
        for (from, _, to) in JOB_TRANSITIONS {
            assert!(from < to, "{from} -> {to} moves backwards");
        }
    }

    #[test]
    fn finished_is_terminal() {
        for action in [
            JobAction::Reserve,
            JobAction::Schedule,
            JobAction::Confirm,
            JobAction::Start,
            JobAction::Cancel,
            JobAction::Expire,
            JobAction::Finish,
        ] {
            assert_eq!(job_transition(JobState::Finished, action), None);
        }
    }

    #[test]
    fn device_table() {
        assert_eq!(
            device_transition(DeviceState::Idle, DeviceAction::Reserve),
            Some(DeviceState::Reserved)
        );
        assert_eq!(device_transition(DeviceState::Reserved, DeviceAction::Reserve), None);
        assert_eq!(device_transition(DeviceState::Running, DeviceAction::Reserve), None);
        assert_eq!(device_transition(DeviceState::Idle, DeviceAction::Release), None);
    }

    #[test]
    fn worker_tables() {
        assert!(worker_state_transition(WorkerState::Offline, WorkerState::Online));
        assert!(!worker_state_transition(WorkerState::Online, WorkerState::Online));
        for from in [WorkerHealth::Active, WorkerHealth::Maintenance, WorkerHealth::Retired] {
            for to in [WorkerHealth::Active, WorkerHealth::Maintenance, WorkerHealth::Retired] {
                assert_eq!(worker_health_transition(from, to), from != to);
            }
        }
    }

    #[test]
    fn schedule_reserves_idle_device() {
        let mut job = job();
        let mut device = device();

        let t = place(&mut job, &mut device, JobAction::Schedule).unwrap();
        assert_eq!(t, Transition::Applied);
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.actual_device.as_deref(), Some("panda-01"));
        assert_eq!(device.state, DeviceState::Reserved);
    }

    #[test]
    fn reserve_moves_to_scheduling() {
        let mut job = job();
        let mut device = device();

        place(&mut job, &mut device, JobAction::Reserve).unwrap();
        assert_eq!(job.state, JobState::Scheduling);
        assert_eq!(device.state, DeviceState::Reserved);
    }

    #[test]
    fn placing_on_busy_device_is_invalid_and_untouched() {
        let mut job = job();
        let mut device = device();
        device.state = DeviceState::Running;
        let (job_before, device_before) = (job.clone(), device.clone());

        let err = place(&mut job, &mut device, JobAction::Schedule).unwrap_err();
        assert!(err.is_transition());
        assert_eq!(job, job_before);
        assert_eq!(device, device_before);
    }

    #[test]
    fn placing_a_placed_job_again_is_a_no_op() {
        let mut job = job();
        let mut device = device();
        place(&mut job, &mut device, JobAction::Schedule).unwrap();
        let (job_before, device_before) = (job.clone(), device.clone());

        let t = place(&mut job, &mut device, JobAction::Schedule).unwrap();
        assert_eq!(t, Transition::Unchanged);
        assert_eq!(job, job_before);
        assert_eq!(device, device_before);
    }

    #[test]
    fn placing_a_running_job_on_an_idle_device_is_a_no_op() {
        let mut job = job();
        job.state = JobState::Running;
        job.actual_device = Some("panda-02".to_owned());
        let mut device = device();

        let t = place(&mut job, &mut device, JobAction::Schedule).unwrap();
        assert_eq!(t, Transition::Unchanged);
        assert_eq!(device.state, DeviceState::Idle);
    }

    #[test]
    fn start_requires_scheduled() {
        let now = Utc::now();
        let mut job = job();
        let mut device = device();
        assert_eq!(start(&mut job, Some(&mut device), now).unwrap(), Transition::Unchanged);

        place(&mut job, &mut device, JobAction::Schedule).unwrap();
        assert_eq!(start(&mut job, Some(&mut device), now).unwrap(), Transition::Applied);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.start_time, Some(now));
        assert_eq!(device.state, DeviceState::Running);
    }

    #[test]
    fn cancel_preconditions() {
        let mut submitted = job();
        assert_eq!(cancel(&mut submitted), Transition::Unchanged);
        assert_eq!(submitted.state, JobState::Submitted);

        for state in [JobState::Scheduling, JobState::Scheduled, JobState::Running] {
            let mut job = job();
            job.state = state;
            assert_eq!(cancel(&mut job), Transition::Applied);
            assert_eq!(job.state, JobState::Canceling);
        }

        let mut canceling = job();
        canceling.state = JobState::Canceling;
        assert_eq!(cancel(&mut canceling), Transition::Unchanged);
    }

    #[test]
    fn expire_only_from_submitted() {
        let mut job = job();
        assert_eq!(expire(&mut job), Transition::Applied);
        assert_eq!(job.state, JobState::Canceling);
        assert_eq!(expire(&mut job), Transition::Unchanged);
    }

    #[test]
    fn finish_releases_device_and_closes_interval() {
        let now = Utc::now();
        let mut job = job();
        let mut device = device();
        place(&mut job, &mut device, JobAction::Schedule).unwrap();

        let t = finish(&mut job, Some(&mut device), JobHealth::Incomplete, false, now).unwrap();
        assert_eq!(t, Transition::Applied);
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.health, JobHealth::Incomplete);
        assert_eq!(job.start_time, Some(now));
        assert_eq!(job.end_time, Some(now));
        assert_eq!(device.state, DeviceState::Idle);
        assert_eq!(device.health, DeviceHealth::Unknown);
    }

    #[test]
    fn finish_with_unknown_health_is_invalid() {
        let mut job = job();
        job.state = JobState::Running;
        let before = job.clone();
        let err = finish(&mut job, None, JobHealth::Unknown, false, Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidHealth(7)));
        assert_eq!(job, before);
    }

    #[test]
    fn finish_is_a_no_op_for_submitted_and_finished() {
        let mut job = job();
        assert_eq!(
            finish(&mut job, None, JobHealth::Complete, false, Utc::now()).unwrap(),
            Transition::Unchanged
        );
        job.state = JobState::Finished;
        assert_eq!(
            finish(&mut job, None, JobHealth::Unknown, false, Utc::now()).unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn canceling_job_finishes_canceled() {
        let mut job = job();
        job.state = JobState::Canceling;
        finish(&mut job, None, JobHealth::Complete, false, Utc::now()).unwrap();
        assert_eq!(job.health, JobHealth::Canceled);
    }

    #[test]
    fn health_check_outcomes() {
        use DeviceHealth::*;
        assert_eq!(device_health_after_job(Unknown, true, JobHealth::Complete), Good);
        assert_eq!(device_health_after_job(Good, true, JobHealth::Incomplete), Bad);
        assert_eq!(device_health_after_job(Bad, true, JobHealth::Complete), Good);
        assert_eq!(device_health_after_job(Good, true, JobHealth::Canceled), Bad);
        assert_eq!(device_health_after_job(Looping, true, JobHealth::Incomplete), Looping);
        assert_eq!(device_health_after_job(Looping, true, JobHealth::Complete), Looping);
        assert_eq!(device_health_after_job(Maintenance, true, JobHealth::Complete), Maintenance);
    }

    #[test]
    fn ordinary_jobs_never_assess_devices() {
        use DeviceHealth::*;
        for health in [Good, Unknown, Looping, Bad] {
            assert_eq!(device_health_after_job(health, false, JobHealth::Incomplete), health);
            assert_eq!(device_health_after_job(health, false, JobHealth::Complete), health);
        }
    }

    #[test]
    fn infrastructure_error_only_downgrades_health_checks() {
        let now = Utc::now();

        let mut job = job();
        let mut device = device();
        device.health = DeviceHealth::Good;
        place(&mut job, &mut device, JobAction::Schedule).unwrap();
        finish(&mut job, Some(&mut device), JobHealth::Incomplete, true, now).unwrap();
        assert_eq!(device.health, DeviceHealth::Good);
        assert_eq!(device.last_health_report_job, None);

        let mut check = self::job();
        check.health_check = true;
        let mut device = self::device();
        device.health = DeviceHealth::Good;
        place(&mut check, &mut device, JobAction::Schedule).unwrap();
        finish(&mut check, Some(&mut device), JobHealth::Incomplete, true, now).unwrap();
        assert_eq!(device.health, DeviceHealth::Bad);
        assert_eq!(device.last_health_report_job, Some(7));
    }

    #[test]
    fn worker_cascade() {
        use DeviceHealth::*;
        assert_eq!(device_health_for_worker(WorkerHealth::Active, Maintenance), Some(Unknown));
        assert_eq!(device_health_for_worker(WorkerHealth::Active, Good), None);
        assert_eq!(device_health_for_worker(WorkerHealth::Active, Looping), None);
        assert_eq!(device_health_for_worker(WorkerHealth::Maintenance, Good), Some(Maintenance));
        assert_eq!(device_health_for_worker(WorkerHealth::Maintenance, Bad), Some(Maintenance));
        assert_eq!(device_health_for_worker(WorkerHealth::Maintenance, Retired), None);
        assert_eq!(device_health_for_worker(WorkerHealth::Retired, Good), Some(Retired));
        assert_eq!(device_health_for_worker(WorkerHealth::Retired, Maintenance), Some(Retired));
        assert_eq!(device_health_for_worker(WorkerHealth::Retired, Bad), None);
    }

    #[test]
    fn confirm_requires_reserved_device() {
        let mut job = job().in_group("g", "0");
        let mut device = device();
        place(&mut job, &mut device, JobAction::Reserve).unwrap();

        assert_eq!(confirm(&mut job, Some(&device)).unwrap(), Transition::Applied);
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(confirm(&mut job, Some(&device)).unwrap(), Transition::Unchanged);
    }

    #[test]
    fn confirm_placeholder_without_device() {
        let mut job = TestJob::new("alice", "panda", "connection: ssh\nhost_role: server\n")
            .in_group("g", "1");
        assert_eq!(confirm(&mut job, None).unwrap(), Transition::Applied);
        assert_eq!(job.state, JobState::Scheduled);
    }

    #[test]
    fn confirm_unplaced_physical_job_is_invalid() {
        let mut job = job().in_group("g", "0");
        let err = confirm(&mut job, None).unwrap_err();
        assert!(err.is_transition());
        assert_eq!(job.state, JobState::Submitted);
    }
}
