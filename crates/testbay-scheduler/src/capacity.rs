//! Per-worker job-limit accounting for one tick.

use std::collections::HashMap;

use crate::error::SchedulerResult;
use crate::store::{DeviceFilter, FleetTransaction, WorkerFilter};

/// Job limit and current load of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerSummary {
    /// Maximum number of busy devices, 0 for unlimited.
    pub limit: u32,
    /// Devices currently reserved or running.
    pub busy: u32,
}

impl WorkerSummary {
    /// Returns true when the worker cannot take another job.
    #[must_use]
    pub const fn overused(&self) -> bool {
        self.limit > 0 && self.busy >= self.limit
    }
}

/// Load of every worker considered in a tick.
///
/// Built once at the start of the tick and updated in place as jobs are
/// assigned, so the health-check and matching passes share one view.
#[derive(Debug, Clone, Default)]
pub struct WorkerLoad {
    workers: HashMap<String, WorkerSummary>,
}

impl WorkerLoad {
    /// Reads limits and busy counts for the given workers.
    pub async fn snapshot(
        tx: &mut dyn FleetTransaction,
        hostnames: &[String],
    ) -> SchedulerResult<Self> {
        let mut workers: HashMap<String, WorkerSummary> = tx
            .workers(&WorkerFilter::new())
            .await?
            .into_iter()
            .filter(|w| hostnames.contains(&w.hostname))
            .map(|w| {
                (
                    w.hostname,
                    WorkerSummary {
                        limit: w.job_limit,
                        busy: 0,
                    },
                )
            })
            .collect();

        let devices = tx
            .devices(&DeviceFilter::new().with_workers(hostnames.iter().cloned()))
            .await?;
        for device in devices.iter().filter(|d| d.state.is_busy()) {
            if let Some(summary) = workers.get_mut(&device.worker_host) {
                summary.busy += 1;
            }
        }
        Ok(Self { workers })
    }

    /// Summary of one worker.
    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<WorkerSummary> {
        self.workers.get(hostname).copied()
    }

    /// Returns true when the worker cannot take another job. Workers outside
    /// the snapshot never can.
    #[must_use]
    pub fn overused(&self, hostname: &str) -> bool {
        self.workers.get(hostname).map_or(true, WorkerSummary::overused)
    }

    /// Records a job assigned to one of the worker's devices.
    pub fn record_assignment(&mut self, hostname: &str) {
        if let Some(summary) = self.workers.get_mut(hostname) {
            summary.busy += 1;
        }
    }
}
