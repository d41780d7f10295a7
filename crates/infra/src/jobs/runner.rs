//! Background runner: waits on the single-shot timer and runs one driver
//! cycle per firing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use altq_core::{DomainResult, QueueConfig};

use super::driver::{CycleReport, SchedulerDriver};
use super::executor::JobExecutor;
use super::store::JobStore;
use super::timer::{SingleShotTimer, Timer};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct QueueRunnerConfig {
    /// Name for logging
    pub name: String,
    pub queue: QueueConfig,
    /// Arm the timer on start so work left from a previous process is picked up.
    pub arm_on_start: bool,
}

impl Default for QueueRunnerConfig {
    fn default() -> Self {
        Self {
            name: "queue-runner".to_string(),
            queue: QueueConfig::default(),
            arm_on_start: true,
        }
    }
}

impl QueueRunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_arm_on_start(mut self, arm: bool) -> Self {
        self.arm_on_start = arm;
        self
    }
}

/// Cumulative runner statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStats {
    pub cycles: u64,
    pub cycles_failed: u64,
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_deferred: u64,
    pub last_run_id: Option<Uuid>,
    pub uptime_secs: u64,
}

impl RunnerStats {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.jobs_claimed += report.claimed as u64;
        self.jobs_completed += report.completed as u64;
        self.jobs_retried += report.retried as u64;
        self.jobs_failed += report.failed as u64;
        self.jobs_deferred += report.deferred as u64;
        self.last_run_id = Some(report.run_id);
    }
}

/// Handle to control a running queue runner.
#[derive(Debug)]
pub struct RunnerHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl RunnerHandle {
    /// Request graceful shutdown and wait for the current cycle to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "queue runner task ended abnormally");
            }
        }
    }

    /// Get current runner statistics.
    pub fn stats(&self) -> RunnerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Drives a [`SchedulerDriver`] from an in-process [`SingleShotTimer`].
pub struct QueueRunner<S, E> {
    driver: Arc<SchedulerDriver<S, E, SingleShotTimer>>,
    config: QueueRunnerConfig,
}

impl<S, E> QueueRunner<S, E>
where
    S: JobStore,
    E: JobExecutor,
{
    /// Fails if the queue configuration does not validate.
    pub fn new(
        driver: Arc<SchedulerDriver<S, E, SingleShotTimer>>,
        config: QueueRunnerConfig,
    ) -> DomainResult<Self> {
        config.queue.validate()?;
        Ok(Self { driver, config })
    }

    /// Spawn the runner on the current tokio runtime.
    pub fn spawn(self) -> RunnerHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(RunnerStats::default()));

        let join = tokio::spawn(run_loop(self.driver, self.config, shutdown.clone(), stats.clone()));

        RunnerHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }
}

async fn run_loop<S, E>(
    driver: Arc<SchedulerDriver<S, E, SingleShotTimer>>,
    config: QueueRunnerConfig,
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<RunnerStats>>,
) where
    S: JobStore,
    E: JobExecutor,
{
    info!(runner = %config.name, "queue runner started");
    let started = Instant::now();
    let timer = driver.timer().clone();

    if config.arm_on_start {
        timer.schedule(config.queue.enqueue_delay);
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = timer.fired() => {
                let result = driver.run_cycle(&config.queue).await;

                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.uptime_secs = started.elapsed().as_secs();
                match result {
                    Ok(report) => s.absorb(&report),
                    Err(e) => {
                        s.cycles += 1;
                        s.cycles_failed += 1;
                        drop(s);
                        error!(runner = %config.name, error = %e, "queue cycle failed");
                        timer.schedule(config.queue.retry_interval);
                    }
                }
            }
        }
    }

    info!(runner = %config.name, "queue runner stopped");
}
