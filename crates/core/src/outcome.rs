//! Result of executing a single job.

use serde::{Deserialize, Serialize};

/// What the executor reports for one job.
///
/// `T` is whatever the executor produces on success (e.g. the generated
/// text). The queue itself never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum ExecutionOutcome<T> {
    /// The work item was handled.
    Success(T),
    /// Transient failure (network, 5xx, timeout); worth retrying.
    RetryableFailure(String),
    /// The shared upstream quota is exhausted.
    RateLimited(String),
    /// Permanent failure for this work item.
    TerminalFailure(String),
}

impl<T> ExecutionOutcome<T> {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::RetryableFailure(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::TerminalFailure(msg.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RetryableFailure(_) => "retryable_failure",
            Self::RateLimited(_) => "rate_limited",
            Self::TerminalFailure(_) => "terminal_failure",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::RetryableFailure(msg) | Self::RateLimited(msg) | Self::TerminalFailure(msg) => {
                Some(msg)
            }
        }
    }
}
