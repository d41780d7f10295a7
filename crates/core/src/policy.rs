//! Retry/backoff policy.
//!
//! Pure functions only: given a claimed job and what the executor reported,
//! decide the job's next state; given how a cycle ended, decide when the
//! driver should run again.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{QueueConfig, clamp_stale_timeout};
use crate::job::Job;
use crate::outcome::ExecutionOutcome;

/// Longest error summary kept on a job, in words.
pub const MAX_ERROR_WORDS: usize = 120;

/// State change to apply to a Processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transition")]
pub enum Transition {
    /// → Completed.
    Complete,
    /// → Pending; counts against the retry budget.
    Retry { error: String },
    /// → Failed.
    Fail { error: String },
    /// → Pending without charging the budget; the whole queue should cool down.
    Defer { error: String },
}

impl Transition {
    pub fn is_deferral(&self) -> bool {
        matches!(self, Transition::Defer { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Transition::Complete => None,
            Transition::Retry { error } | Transition::Fail { error } | Transition::Defer { error } => {
                Some(error)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Transition::Complete => "complete",
            Transition::Retry { .. } => "retry",
            Transition::Fail { .. } => "fail",
            Transition::Defer { .. } => "defer",
        }
    }
}

/// When the driver should run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "delay")]
pub enum Reschedule {
    /// Replace any armed run with one after the long cooldown.
    Cooldown(Duration),
    /// Arm a run after the short delay unless one is already armed.
    After(Duration),
    /// Leave the timer alone; the next enqueue re-arms it.
    Idle,
}

impl Reschedule {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Reschedule::Cooldown(d) | Reschedule::After(d) => Some(*d),
            Reschedule::Idle => None,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Charged attempts after which a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// Delay before the next invocation while work remains.
    pub retry_interval: Duration,
    /// Delay before the next invocation after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
    /// Age at which a Processing lease may be reclaimed.
    pub stale_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_interval: config.retry_interval,
            rate_limit_cooldown: config.rate_limit_cooldown,
            stale_timeout: clamp_stale_timeout(config.stale_timeout),
        }
    }

    /// Whether another retryable failure would still leave budget.
    ///
    /// `charged` is the number of charged attempts including the one that
    /// just failed.
    pub fn should_retry(&self, charged: u32) -> bool {
        charged < self.max_attempts
    }

    /// Map an execution outcome for a claimed job onto its next state.
    pub fn resolve<T>(&self, job: &Job, outcome: &ExecutionOutcome<T>) -> Transition {
        match outcome {
            ExecutionOutcome::Success(_) => Transition::Complete,
            ExecutionOutcome::TerminalFailure(msg) => Transition::Fail {
                error: summarize_error(msg),
            },
            ExecutionOutcome::RetryableFailure(msg) => {
                let error = summarize_error(msg);
                if self.should_retry(job.charged_attempts()) {
                    Transition::Retry { error }
                } else {
                    Transition::Fail { error }
                }
            }
            ExecutionOutcome::RateLimited(msg) => Transition::Defer {
                error: summarize_error(msg),
            },
        }
    }

    /// Decide how the driver re-arms itself after a batch.
    ///
    /// Leases still held with nothing Pending keep the driver armed until
    /// they can be reclaimed; otherwise work left by a dead invocation would
    /// wait for the next enqueue.
    pub fn reschedule(&self, rate_limited: bool, pending: u64, processing: u64) -> Reschedule {
        if rate_limited {
            Reschedule::Cooldown(self.rate_limit_cooldown)
        } else if pending > 0 {
            Reschedule::After(self.retry_interval)
        } else if processing > 0 {
            Reschedule::After(self.retry_interval.max(self.stale_timeout))
        } else {
            Reschedule::Idle
        }
    }
}

/// Normalize an error message for storage: markup stripped, whitespace
/// collapsed, capped at [`MAX_ERROR_WORDS`] words.
pub fn summarize_error(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return "unknown error".to_string();
    }
    if words.len() > MAX_ERROR_WORDS {
        let mut summary = words[..MAX_ERROR_WORDS].join(" ");
        summary.push('…');
        summary
    } else {
        words.join(" ")
    }
}
