//! Rollout scheduler: claims due rollouts and drives the executor.

use std::fmt;
use std::time::Duration;

use fleetroll_rollout::{RolloutExecutor, RolloutResult};
use fleetroll_state::{epoch_millis, RolloutId, RolloutStatus, StateStore};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// One batch job of the control loop, named by the status it processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerJob {
    Creating,
    Starting,
    Ready,
    Running,
}

impl SchedulerJob {
    /// Jobs in the order one tick runs them.
    pub const ALL: [SchedulerJob; 4] = [
        SchedulerJob::Creating,
        SchedulerJob::Starting,
        SchedulerJob::Ready,
        SchedulerJob::Running,
    ];

    pub fn status(self) -> RolloutStatus {
        match self {
            Self::Creating => RolloutStatus::Creating,
            Self::Starting => RolloutStatus::Starting,
            Self::Ready => RolloutStatus::Ready,
            Self::Running => RolloutStatus::Running,
        }
    }
}

impl fmt::Display for SchedulerJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status())
    }
}

/// What one job did during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job: SchedulerJob,
    /// Rows the claim update stamped.
    pub claimed: usize,
    /// Claimed rollouts processed without error.
    pub processed: usize,
    pub failed: Vec<RolloutId>,
}

#[derive(Clone)]
pub struct RolloutScheduler {
    store: StateStore,
    executor: RolloutExecutor,
    interval: Duration,
    claim_delay: Duration,
}

impl RolloutScheduler {
    pub fn new(executor: RolloutExecutor, interval: Duration, claim_delay: Duration) -> Self {
        Self {
            store: executor.store().clone(),
            executor,
            interval,
            claim_delay,
        }
    }

    /// Claim the rollouts in the job's status that are due at `now` and
    /// process them.
    ///
    /// A rollout is due when its last check is at least `delay` old. A
    /// failure while processing one rollout is logged and does not stop the
    /// others.
    pub fn check_rollouts(
        &self,
        job: SchedulerJob,
        now: u64,
        delay: Duration,
    ) -> SchedulerResult<JobReport> {
        let status = job.status();
        let delay_ms = delay.as_millis() as u64;
        let claimed = self.store.claim_rollouts(status, now, delay_ms)?;
        let mut report = JobReport {
            job,
            claimed,
            processed: 0,
            failed: Vec::new(),
        };
        if claimed == 0 {
            return Ok(report);
        }

        let batch = self.store.rollouts_checked_at(status, now)?;
        debug!(%job, claimed, batch = batch.len(), "rollouts claimed");
        for rollout in batch {
            match self.dispatch(job, rollout.id, now) {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    error!(%job, rollout = rollout.id, error = %e, "rollout processing failed");
                    report.failed.push(rollout.id);
                }
            }
        }
        Ok(report)
    }

    fn dispatch(&self, job: SchedulerJob, id: RolloutId, now: u64) -> RolloutResult<()> {
        match job {
            SchedulerJob::Creating => self.executor.handle_creating(id),
            SchedulerJob::Starting => self.executor.handle_starting(id),
            SchedulerJob::Ready => self.executor.handle_ready(id, now),
            SchedulerJob::Running => self.executor.handle_running(id),
        }
    }

    pub fn check_creating_rollouts(&self, now: u64, delay: Duration) -> SchedulerResult<JobReport> {
        self.check_rollouts(SchedulerJob::Creating, now, delay)
    }

    pub fn check_starting_rollouts(&self, now: u64, delay: Duration) -> SchedulerResult<JobReport> {
        self.check_rollouts(SchedulerJob::Starting, now, delay)
    }

    pub fn check_ready_rollouts(&self, now: u64, delay: Duration) -> SchedulerResult<JobReport> {
        self.check_rollouts(SchedulerJob::Ready, now, delay)
    }

    pub fn check_running_rollouts(&self, now: u64, delay: Duration) -> SchedulerResult<JobReport> {
        self.check_rollouts(SchedulerJob::Running, now, delay)
    }

    /// Run every job once with the configured claim delay.
    ///
    /// A job whose claim fails is logged and skipped; the remaining jobs
    /// still run.
    pub fn tick(&self, now: u64) -> Vec<JobReport> {
        let mut reports = Vec::with_capacity(SchedulerJob::ALL.len());
        for job in SchedulerJob::ALL {
            match self.check_rollouts(job, now, self.claim_delay) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(%job, error = %e, "claim failed, skipping job this tick"),
            }
        }
        reports
    }

    /// [`tick`](Self::tick) on the blocking thread pool; store access is synchronous.
    pub async fn tick_blocking(&self, now: u64) -> SchedulerResult<Vec<JobReport>> {
        let scheduler = self.clone();
        tokio::task::spawn_blocking(move || scheduler.tick(now))
            .await
            .map_err(|e| SchedulerError::Task(e.to_string()))
    }

    /// Tick every interval until `shutdown` changes.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            claim_delay_ms = self.claim_delay.as_millis() as u64,
            "rollout scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.tick_blocking(epoch_millis()).await {
                        Ok(reports) => {
                            let claimed: usize = reports.iter().map(|r| r.claimed).sum();
                            if claimed > 0 {
                                debug!(claimed, "scheduler tick complete");
                            }
                        }
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }
    }
}
