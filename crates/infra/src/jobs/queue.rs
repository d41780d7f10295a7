//! Caller-facing queue operations: enqueue, inspect, retry, clear.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use altq_core::config::{DEFAULT_FAILURE_LIMIT, DEFAULT_RECENT_LIMIT};
use altq_core::{DomainResult, Job, JobId, JobSource, QueueConfig, QueueStats, SubjectId};

use super::store::{EnqueueResult, JobStore, StoreError};
use super::timer::Timer;

/// Queue facade over a store and the scheduler's timer.
///
/// Write operations that create runnable work also arm the timer, so the
/// scheduler wakes up without anyone polling.
pub struct JobQueue<S, T> {
    store: Arc<S>,
    timer: Arc<T>,
    config: QueueConfig,
}

impl<S, T> Clone for JobQueue<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            timer: self.timer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: JobStore, T: Timer> JobQueue<S, T> {
    /// Fails if `config` does not validate.
    pub fn new(store: Arc<S>, timer: Arc<T>, config: QueueConfig) -> DomainResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            timer,
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a subject for processing. No-op if it already has an open job.
    ///
    /// The timer is armed either way.
    pub async fn enqueue(
        &self,
        subject: SubjectId,
        source: JobSource,
    ) -> Result<EnqueueResult, StoreError> {
        let result = self.store.enqueue(subject, &source, Utc::now()).await?;
        match result {
            EnqueueResult::Created(id) => {
                debug!(job_id = %id, subject = %subject, source = %source, "job enqueued")
            }
            EnqueueResult::AlreadyOpen => {
                debug!(subject = %subject, "subject already queued")
            }
        }
        self.timer.schedule(self.config.enqueue_delay);
        Ok(result)
    }

    /// Queue many subjects; returns the number of jobs created.
    pub async fn enqueue_many(
        &self,
        subjects: &[SubjectId],
        source: JobSource,
    ) -> Result<usize, StoreError> {
        if subjects.is_empty() {
            return Ok(0);
        }
        let created = self.store.enqueue_many(subjects, &source, Utc::now()).await?;
        info!(requested = subjects.len(), created, source = %source, "bulk enqueue");
        self.timer.schedule(self.config.enqueue_delay);
        Ok(created)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.store.stats(Utc::now()).await
    }

    /// Most recent jobs, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.store.recent(limit).await
    }

    /// The default-sized recent listing.
    pub async fn recent_default(&self) -> Result<Vec<Job>, StoreError> {
        self.store.recent(DEFAULT_RECENT_LIMIT).await
    }

    /// Most recent failures, newest first.
    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.store.recent_failures(limit).await
    }

    /// The default-sized failure listing.
    pub async fn failures(&self) -> Result<Vec<Job>, StoreError> {
        self.store.recent_failures(DEFAULT_FAILURE_LIMIT).await
    }

    /// Put one Failed job back in the queue with a fresh retry budget.
    pub async fn retry_job(&self, id: JobId) -> Result<Job, StoreError> {
        let job = self.store.retry_job(id).await?;
        info!(job_id = %id, subject = %job.subject, "job requeued by operator");
        self.timer.schedule(self.config.enqueue_delay);
        Ok(job)
    }

    /// Put every retryable Failed job back in the queue.
    pub async fn retry_failed(&self) -> Result<u64, StoreError> {
        let reverted = self.store.retry_failed().await?;
        info!(reverted, "failed jobs requeued by operator");
        if reverted > 0 {
            self.timer.schedule(self.config.enqueue_delay);
        }
        Ok(reverted)
    }

    /// Delete every Completed job now.
    pub async fn clear_completed(&self) -> Result<u64, StoreError> {
        let removed = self.store.clear_completed().await?;
        info!(removed, "cleared completed jobs");
        Ok(removed)
    }

    /// Delete Completed jobs older than `max_age`.
    pub async fn purge_completed(&self, max_age: Duration) -> Result<u64, StoreError> {
        self.store.purge_completed(max_age, Utc::now()).await
    }
}
