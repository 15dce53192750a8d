//! Queue-timeout reaper.
//!
//! Also closes cancellations that never reached a device, since no
//! dispatcher will ever report them.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};

use crate::error::SchedulerResult;
use crate::model::{JobHealth, JobId, JobState, TestJob};
use crate::scheduler::Scheduler;
use crate::store::JobFilter;
use crate::transitions;

/// Returns true when a submitted job has waited past its queue timeout.
#[must_use]
pub fn queue_timeout_elapsed(job: &TestJob, now: DateTime<Utc>) -> bool {
    let Some(timeout) = job.queue_timeout else {
        return false;
    };
    let Ok(secs) = i64::try_from(timeout) else {
        return false;
    };
    Duration::try_seconds(secs)
        .and_then(|t| job.submit_time.checked_add_signed(t))
        .map_or(false, |deadline| now > deadline)
}

impl Scheduler {
    /// Cancels submitted jobs whose queue timeout elapsed, cascading to
    /// their multi-node siblings. Returns the expired job ids.
    pub async fn check_queue_timeouts(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<JobId>> {
        let overdue: Vec<JobId> = {
            let mut uow = self.begin().await?;
            let result = uow
                .jobs(&JobFilter::new().with_state(JobState::Submitted))
                .await;
            self.settle(uow, result).await?
        }
        .into_iter()
        .filter(|j| queue_timeout_elapsed(j, now))
        .map(|j| j.id)
        .collect();

        let mut expired = Vec::new();
        for job_id in overdue {
            let mut uow = self.begin().await?;
            let result = transitions::expire(&mut uow, job_id).await;
            match self.settle(uow, result).await {
                Ok(transition) if transition.applied() => expired.push(job_id),
                Ok(_) => {}
                Err(err) => error!(job_id, error = %err, "unable to expire job"),
            }
        }
        if !expired.is_empty() {
            info!(jobs = ?expired, "queue timeouts reached");
        }
        Ok(expired)
    }

    /// Finishes CANCELING jobs that never held a device.
    pub async fn close_abandoned_cancellations(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<JobId>> {
        let abandoned: Vec<JobId> = {
            let mut uow = self.begin().await?;
            let result = uow
                .jobs(&JobFilter::new().with_state(JobState::Canceling).unplaced())
                .await;
            self.settle(uow, result).await?
        }
        .into_iter()
        .map(|j| j.id)
        .collect();

        let mut closed = Vec::new();
        for job_id in abandoned {
            let mut uow = self.begin().await?;
            let result = transitions::go_state_finished(
                &mut uow,
                job_id,
                JobHealth::Canceled,
                false,
                &self.system_actor,
                now,
            )
            .await;
            match self.settle(uow, result).await {
                Ok(transition) if transition.applied() => closed.push(job_id),
                Ok(_) => {}
                Err(err) => error!(job_id, error = %err, "unable to close canceled job"),
            }
        }
        Ok(closed)
    }
}
