//! Queue counters.

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Point-in-time job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Completions within the trailing 24 hours.
    pub completed_recent: u64,
}

impl QueueStats {
    /// Whether there is anything left for the scheduler to do.
    pub fn has_jobs(&self) -> bool {
        self.pending + self.processing > 0
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    /// Add `n` rows in `status` to the matching counter.
    pub fn record(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        };
        *slot += n;
    }
}
