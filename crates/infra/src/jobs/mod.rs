//! Durable work queue with leasing, bounded retries, and rate-limit backoff.
//!
//! ## Design
//!
//! - One row per job; at most one open (Pending/Processing) job per subject
//! - Claims are atomic conditional updates, so overlapping scheduler
//!   invocations never lease the same job
//! - Abandoned leases are reclaimed by a timeout, not by heartbeats
//! - A rate-limit signal stops the batch and pushes the next run out by a
//!   long cooldown
//! - Completed rows are purged by age; Failed rows stay until an operator acts
//!
//! ## Components
//!
//! - `JobStore`: persistence and leasing (in-memory or SQLite)
//! - `JobExecutor`: the work itself, supplied by the embedding application
//! - `SchedulerDriver`: one reclaim/claim/execute/reschedule cycle
//! - `QueueRunner`: drives cycles from an in-process single-shot timer
//! - `JobQueue`: enqueue/inspect/retry/clear for callers

pub mod driver;
pub mod executor;
pub mod queue;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod timer;

pub use driver::{CyclePhase, CycleReport, DriverError, SchedulerDriver};
pub use executor::{JobExecutor, execute_guarded};
pub use queue::JobQueue;
pub use runner::{QueueRunner, QueueRunnerConfig, RunnerHandle, RunnerStats};
pub use sqlite::SqliteJobStore;
pub use store::{EnqueueResult, InMemoryJobStore, JobStore, StoreError};
pub use timer::{SingleShotTimer, Timer};
