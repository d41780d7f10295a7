//! Scheduler driver: one invocation = one claim/execute/reschedule cycle.
//!
//! ```text
//! Idle → ReclaimingStale → Claiming → Executing(i)… → Rescheduling → Idle
//! ```
//!
//! Invocations may overlap (a late timer firing while a previous cycle is
//! still running, or several processes sharing one database). Nothing here
//! coordinates them; the store's conditional updates do.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use altq_core::{DomainError, Job, QueueConfig, Reschedule, RetryPolicy, Transition};

use super::executor::{JobExecutor, execute_guarded};
use super::store::{JobStore, StoreError};
use super::timer::Timer;

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "index")]
pub enum CyclePhase {
    Idle,
    ReclaimingStale,
    Claiming,
    Executing(usize),
    Rescheduling,
}

/// Summary of one driver invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    /// Stale leases reverted to Pending before claiming.
    pub reclaimed: u64,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Outcomes that could not be written because the lease was gone.
    pub lease_lost: usize,
    /// Outcomes that could not be written because of a store error.
    pub write_errors: usize,
    /// Claimed jobs left Processing after a rate-limit signal.
    pub abandoned: usize,
    /// Abandoned jobs whose claim was refunded to their retry budget.
    pub refunded: usize,
    pub purged: u64,
    pub rate_limited: bool,
    pub reschedule: Reschedule,
    pub phases: Vec<CyclePhase>,
}

impl CycleReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            reclaimed: 0,
            claimed: 0,
            completed: 0,
            retried: 0,
            failed: 0,
            deferred: 0,
            lease_lost: 0,
            write_errors: 0,
            abandoned: 0,
            refunded: 0,
            purged: 0,
            rate_limited: false,
            reschedule: Reschedule::Idle,
            phases: vec![CyclePhase::Idle],
        }
    }

    fn enter(&mut self, phase: CyclePhase) {
        self.phases.push(phase);
    }

    fn record(&mut self, transition: &Transition) {
        match transition {
            Transition::Complete => self.completed += 1,
            Transition::Retry { .. } => self.retried += 1,
            Transition::Fail { .. } => self.failed += 1,
            Transition::Defer { .. } => self.deferred += 1,
        }
    }

    /// Jobs whose outcome was written.
    pub fn executed(&self) -> usize {
        self.completed + self.retried + self.failed + self.deferred
    }
}

/// Errors that abort a cycle before any job ran.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid queue configuration: {0}")]
    Config(#[source] DomainError),
    #[error("failed to reclaim stale leases: {0}")]
    Reclaim(#[source] StoreError),
    #[error("failed to claim batch: {0}")]
    Claim(#[source] StoreError),
}

/// Cron-triggered scheduler.
pub struct SchedulerDriver<S, E, T> {
    store: Arc<S>,
    executor: Arc<E>,
    timer: Arc<T>,
}

impl<S, E, T> SchedulerDriver<S, E, T>
where
    S: JobStore,
    E: JobExecutor,
    T: Timer,
{
    pub fn new(store: Arc<S>, executor: Arc<E>, timer: Arc<T>) -> Self {
        Self {
            store,
            executor,
            timer,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn timer(&self) -> &Arc<T> {
        &self.timer
    }

    /// Run one full cycle with the given configuration.
    pub async fn run_cycle(&self, config: &QueueConfig) -> Result<CycleReport, DriverError> {
        let run_id = Uuid::now_v7();
        let span = info_span!("queue_cycle", run_id = %run_id, batch_size = config.batch_size);
        self.cycle(run_id, config).instrument(span).await
    }

    async fn cycle(&self, run_id: Uuid, config: &QueueConfig) -> Result<CycleReport, DriverError> {
        config.validate().map_err(DriverError::Config)?;
        let policy = RetryPolicy::from_config(config);
        let mut report = CycleReport::new(run_id);

        report.enter(CyclePhase::ReclaimingStale);
        report.reclaimed = self
            .store
            .reset_stale(config.stale_timeout, Utc::now())
            .await
            .map_err(DriverError::Reclaim)?;
        if report.reclaimed > 0 {
            info!(reclaimed = report.reclaimed, "reclaimed stale leases");
        }

        report.enter(CyclePhase::Claiming);
        let jobs = self
            .store
            .claim_batch(config.batch_size, Utc::now())
            .await
            .map_err(DriverError::Claim)?;
        report.claimed = jobs.len();

        if jobs.is_empty() {
            debug!("no pending jobs");
        }

        for (index, job) in jobs.iter().enumerate() {
            report.enter(CyclePhase::Executing(index));

            let outcome = execute_guarded(self.executor.clone(), job).await;
            let transition = policy.resolve(job, &outcome);

            match self.store.apply(job, &transition, Utc::now()).await {
                Ok(updated) => {
                    report.record(&transition);
                    debug!(
                        job_id = %updated.id,
                        subject = %updated.subject,
                        attempts = updated.attempts,
                        status = %updated.status,
                        transition = transition.label(),
                        "applied outcome"
                    );
                    if let Transition::Fail { error } = &transition {
                        warn!(job_id = %updated.id, subject = %updated.subject, error = %error, "job failed");
                    }
                }
                Err(StoreError::LeaseLost(id)) => {
                    report.lease_lost += 1;
                    warn!(job_id = %id, "lease lost before outcome was written; dropping outcome");
                }
                Err(e) => {
                    report.write_errors += 1;
                    warn!(job_id = %job.id, error = %e, "failed to apply outcome");
                }
            }

            if transition.is_deferral() {
                report.rate_limited = true;
                report.abandoned = jobs.len() - index - 1;
                warn!(
                    job_id = %job.id,
                    abandoned = report.abandoned,
                    "upstream rate limit reached; stopping batch"
                );
                report.refunded = self.defer_abandoned(&jobs[index + 1..]).await;
                break;
            }
        }

        report.enter(CyclePhase::Rescheduling);
        let (pending, processing) = match self.store.stats(Utc::now()).await {
            Ok(stats) => (stats.pending, stats.processing),
            Err(e) => {
                warn!(error = %e, "failed to read queue stats; assuming work remains");
                (1, 0)
            }
        };
        report.reschedule = policy.reschedule(report.rate_limited, pending, processing);
        self.apply_reschedule(report.reschedule);

        report.purged = self.purge(config.purge_age).await;
        report.enter(CyclePhase::Idle);

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                deferred = report.deferred,
                reschedule = ?report.reschedule,
                "cycle finished"
            );
        } else {
            debug!(reschedule = ?report.reschedule, "cycle finished");
        }
        Ok(report)
    }

    /// Refund the claims of jobs a rate limit kept from running. They stay
    /// Processing and come back through the stale reclaim.
    async fn defer_abandoned(&self, jobs: &[Job]) -> usize {
        let mut refunded = 0;
        for job in jobs {
            match self.store.defer_lease(job).await {
                Ok(_) => refunded += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to defer abandoned lease"),
            }
        }
        refunded
    }

    fn apply_reschedule(&self, decision: Reschedule) {
        match decision {
            Reschedule::Cooldown(delay) => self.timer.reschedule(delay),
            Reschedule::After(delay) => {
                self.timer.schedule(delay);
            }
            Reschedule::Idle => {}
        }
    }

    async fn purge(&self, max_age: Duration) -> u64 {
        match self.store.purge_completed(max_age, Utc::now()).await {
            Ok(purged) => {
                if purged > 0 {
                    debug!(purged, "purged completed jobs");
                }
                purged
            }
            Err(e) => {
                warn!(error = %e, "failed to purge completed jobs");
                0
            }
        }
    }
}
