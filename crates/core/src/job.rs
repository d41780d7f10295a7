//! Job rows and their lifecycle.
//!
//! A [`Job`] moves through a small state machine:
//!
//! ```text
//! Pending ──claim──▶ Processing ──complete──▶ Completed
//!    ▲                   │ ──fail──────▶ Failed ──operator retry──┐
//!    └──retry/defer/stale┘                                        │
//!    ▲────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation goes through a method here so the row invariants can be
//! checked in one place, regardless of which store persists the row.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, SubjectId};
use crate::policy::Transition;

/// Maximum length of a persisted source key.
pub const MAX_SOURCE_LEN: usize = 50;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Leased by a scheduler invocation.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; kept until retried or cleared.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Pending and Processing jobs count as "open" for their subject.
    pub fn is_open(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Where a job came from. Informational only; never affects scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum JobSource {
    /// Queued automatically (e.g. on upload hooks).
    #[default]
    Auto,
    /// Queued right after a media upload.
    Upload,
    /// Queued by an operator for a single subject.
    Manual,
    /// Queued in bulk for subjects missing output.
    Bulk,
    /// Queued in bulk to regenerate existing output.
    BulkRegenerate,
    /// Any other caller-supplied key, sanitized.
    Other(String),
}

impl JobSource {
    /// Build a source from an arbitrary caller-supplied key.
    ///
    /// The key is lowercased and reduced to `[a-z0-9_-]`, then capped at
    /// [`MAX_SOURCE_LEN`] characters. An empty result falls back to `Auto`.
    pub fn from_key(raw: &str) -> Self {
        let key: String = raw
            .chars()
            .flat_map(char::to_lowercase)
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
            .take(MAX_SOURCE_LEN)
            .collect();

        match key.as_str() {
            "" | "auto" => JobSource::Auto,
            "upload" => JobSource::Upload,
            "manual" => JobSource::Manual,
            "bulk" => JobSource::Bulk,
            "bulk-regenerate" => JobSource::BulkRegenerate,
            _ => JobSource::Other(key),
        }
    }

    pub fn as_key(&self) -> &str {
        match self {
            JobSource::Auto => "auto",
            JobSource::Upload => "upload",
            JobSource::Manual => "manual",
            JobSource::Bulk => "bulk",
            JobSource::BulkRegenerate => "bulk-regenerate",
            JobSource::Other(key) => key,
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// A single unit of queued work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub subject: SubjectId,
    pub status: JobStatus,
    pub source: JobSource,
    /// Number of times this job has been claimed.
    pub attempts: u32,
    /// Number of claims that ended in a rate-limit deferral.
    pub deferrals: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly enqueued job.
    pub fn pending(id: JobId, subject: SubjectId, source: JobSource, now: DateTime<Utc>) -> Self {
        Self {
            id,
            subject,
            status: JobStatus::Pending,
            source,
            attempts: 0,
            deferrals: 0,
            last_error: None,
            enqueued_at: now,
            locked_at: None,
            completed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Attempts charged against the retry budget.
    ///
    /// Rate-limited claims are excluded: the quota is shared by the whole
    /// queue and says nothing about this particular job.
    pub fn charged_attempts(&self) -> u32 {
        self.attempts.saturating_sub(self.deferrals)
    }

    /// Whether the lease on a Processing job is older than `timeout`.
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.locked_at) {
            (JobStatus::Processing, Some(locked_at)) => locked_at < threshold(now, timeout),
            _ => false,
        }
    }

    /// Pending → Processing. Takes the lease and counts an attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Pending, "claim")?;
        self.status = JobStatus::Processing;
        self.locked_at = Some(now);
        self.attempts = self.attempts.saturating_add(1);
        Ok(())
    }

    /// Apply a policy decision to a Processing job.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(JobStatus::Processing, "apply outcome to")?;
        self.locked_at = None;

        match transition {
            Transition::Complete => {
                self.status = JobStatus::Completed;
                self.completed_at = Some(now);
                self.last_error = None;
            }
            Transition::Fail { error } => {
                self.status = JobStatus::Failed;
                self.completed_at = Some(now);
                self.last_error = Some(error.clone());
            }
            Transition::Retry { error } => {
                self.status = JobStatus::Pending;
                self.last_error = Some(error.clone());
            }
            Transition::Defer { error } => {
                self.status = JobStatus::Pending;
                self.last_error = Some(error.clone());
                self.deferrals = self.deferrals.saturating_add(1);
            }
        }
        Ok(())
    }

    /// Record that a claimed job was never executed because its batch stopped
    /// on a rate limit. The job stays Processing until its lease goes stale;
    /// the claim it used is not charged against the retry budget.
    pub fn defer_lease(&mut self) -> DomainResult<()> {
        self.expect_status(JobStatus::Processing, "defer")?;
        if self.deferrals >= self.attempts {
            return Err(DomainError::invalid_transition(format!(
                "lease on job {} was already deferred",
                self.id
            )));
        }
        self.deferrals += 1;
        Ok(())
    }

    /// Processing → Pending after the lease timed out.
    ///
    /// Attempts and the last error are left as they are.
    pub fn release_stale(&mut self) -> DomainResult<()> {
        self.expect_status(JobStatus::Processing, "release")?;
        self.status = JobStatus::Pending;
        self.locked_at = None;
        Ok(())
    }

    /// Failed → Pending on operator request, with a fresh retry budget.
    pub fn reset_for_retry(&mut self) -> DomainResult<()> {
        self.expect_status(JobStatus::Failed, "retry")?;
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.deferrals = 0;
        self.last_error = None;
        self.locked_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Check the row-level invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.locked_at.is_some() != (self.status == JobStatus::Processing) {
            return Err(DomainError::invariant(format!(
                "job {}: locked_at must be set iff processing (status {})",
                self.id, self.status
            )));
        }
        if self.completed_at.is_some() != self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {}: completed_at must be set iff terminal (status {})",
                self.id, self.status
            )));
        }
        if self.deferrals > self.attempts {
            return Err(DomainError::invariant(format!(
                "job {}: {} deferrals exceed {} attempts",
                self.id, self.deferrals, self.attempts
            )));
        }
        Ok(())
    }

    fn expect_status(&self, expected: JobStatus, action: &str) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} job {} in status {} (expected {expected})",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// `now - age`, saturating at the minimum representable time.
pub fn threshold(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
