//! `altq-core` — work queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! job rows and their lifecycle, executor outcomes, the retry/backoff policy
//! and queue configuration.

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod outcome;
pub mod policy;
pub mod stats;

pub use config::QueueConfig;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, SubjectId};
pub use job::{Job, JobSource, JobStatus};
pub use outcome::ExecutionOutcome;
pub use policy::{Reschedule, RetryPolicy, Transition, summarize_error};
pub use stats::QueueStats;
