//! Job storage implementations.
//!
//! Every operation that reads and then writes a row happens atomically with
//! respect to other callers: the in-memory store holds one lock for the whole
//! check-and-write, the SQLite store issues a single conditional statement.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use altq_core::config::{RECENT_WINDOW, clamp_purge_age, clamp_stale_timeout};
use altq_core::job::threshold;
use altq_core::{DomainError, Job, JobId, JobSource, JobStatus, QueueStats, SubjectId, Transition};

/// Result of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "job_id")]
pub enum EnqueueResult {
    /// A new Pending job was created.
    Created(JobId),
    /// The subject already had an open job; nothing was written.
    AlreadyOpen,
}

impl EnqueueResult {
    pub fn created(&self) -> Option<JobId> {
        match self {
            EnqueueResult::Created(id) => Some(*id),
            EnqueueResult::AlreadyOpen => None,
        }
    }
}

/// Job store abstraction.
///
/// `now` is always supplied by the caller so that time-dependent behavior
/// (leases, purges, recent counters) is deterministic under test.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a Pending job unless the subject already has an open one.
    async fn enqueue(
        &self,
        subject: SubjectId,
        source: &JobSource,
        now: DateTime<Utc>,
    ) -> Result<EnqueueResult, StoreError>;

    /// Enqueue each subject; returns how many jobs were created.
    async fn enqueue_many(
        &self,
        subjects: &[SubjectId],
        source: &JobSource,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut created = 0;
        for subject in subjects {
            if let EnqueueResult::Created(_) = self.enqueue(*subject, source, now).await? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Lease up to `limit` of the oldest Pending jobs.
    ///
    /// Returned jobs are Processing, have `locked_at = now`, one more attempt,
    /// and are ordered oldest-enqueued first. Concurrent callers never receive
    /// the same job.
    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Revert Processing jobs whose lease is older than `timeout` to Pending.
    ///
    /// Timeouts below one minute are raised to one minute.
    async fn reset_stale(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Write a policy decision for a job previously returned by
    /// [`JobStore::claim_batch`].
    ///
    /// The claimed attempt number is the lease token: if the job has been
    /// reclaimed (and possibly re-claimed) since, nothing is written and
    /// [`StoreError::LeaseLost`] is returned.
    async fn apply(
        &self,
        lease: &Job,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Mark a claimed job as skipped because its batch stopped on a rate
    /// limit. The job stays Processing (a later reclaim returns it to
    /// Pending) but the claim no longer counts against its retry budget.
    ///
    /// Returns [`StoreError::LeaseLost`] if the lease is gone or was already
    /// deferred.
    async fn defer_lease(&self, lease: &Job) -> Result<Job, StoreError>;

    /// Counts per status, plus completions within the last 24 hours.
    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError>;

    /// Most recent jobs, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Most recent Failed jobs, newest first.
    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Revert one Failed job to Pending with a fresh retry budget.
    async fn retry_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Revert every retryable Failed job to Pending; returns how many.
    ///
    /// Only the newest Failed row per subject is considered, and only when the
    /// subject has no open job.
    async fn retry_failed(&self) -> Result<u64, StoreError>;

    /// Delete every Completed job.
    async fn clear_completed(&self) -> Result<u64, StoreError>;

    /// Delete Completed jobs that finished more than `max_age` ago.
    ///
    /// Ages below five minutes are raised to five minutes. Failed jobs are
    /// never purged.
    async fn purge_completed(&self, max_age: Duration, now: DateTime<Utc>)
    -> Result<u64, StoreError>;
}

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    UnexpectedStatus {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("subject {0} already has an open job")]
    OpenJobExists(SubjectId),
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to decode job row: {0}")]
    Decode(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: Mutex<Table>,
}

#[derive(Debug, Default)]
struct Table {
    jobs: BTreeMap<JobId, Job>,
    last_id: i64,
}

impl Table {
    fn open_job_for(&self, subject: SubjectId) -> Option<&Job> {
        self.jobs
            .values()
            .find(|job| job.subject == subject && job.is_open())
    }

    fn newest_first<'a>(
        &'a self,
        filter: impl Fn(&Job) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Job> + 'a {
        self.jobs.values().rev().filter(move |job| filter(*job))
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite a stored row. Intended for tests that need to stage
    /// arbitrary states (e.g. backdated leases).
    pub fn put(&self, job: Job) {
        let mut table = self.table();
        table.last_id = table.last_id.max(job.id.as_i64());
        table.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        subject: SubjectId,
        source: &JobSource,
        now: DateTime<Utc>,
    ) -> Result<EnqueueResult, StoreError> {
        let mut table = self.table();
        if table.open_job_for(subject).is_some() {
            return Ok(EnqueueResult::AlreadyOpen);
        }

        table.last_id += 1;
        let id = JobId::from_raw(table.last_id);
        table
            .jobs
            .insert(id, Job::pending(id, subject, source.clone(), now));
        Ok(EnqueueResult::Created(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.table().jobs.get(&id).cloned())
    }

    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut table = self.table();

        let mut candidates: Vec<(DateTime<Utc>, JobId)> = table
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| (job.enqueued_at, job.id))
            .collect();
        candidates.sort_unstable();
        candidates.truncate(limit.max(1));

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(job) = table.jobs.get_mut(&id) {
                job.claim(now)?;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn reset_stale(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let timeout = clamp_stale_timeout(timeout);
        let mut table = self.table();

        let mut released = 0;
        for job in table.jobs.values_mut() {
            if job.is_stale(timeout, now) {
                job.release_stale()?;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn apply(
        &self,
        lease: &Job,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut table = self.table();
        let job = table
            .jobs
            .get_mut(&lease.id)
            .ok_or(StoreError::NotFound(lease.id))?;

        if job.status != JobStatus::Processing || job.attempts != lease.attempts {
            return Err(StoreError::LeaseLost(lease.id));
        }
        job.apply(transition, now)?;
        Ok(job.clone())
    }

    async fn defer_lease(&self, lease: &Job) -> Result<Job, StoreError> {
        let mut table = self.table();
        let job = table
            .jobs
            .get_mut(&lease.id)
            .ok_or(StoreError::NotFound(lease.id))?;

        if job.status != JobStatus::Processing
            || job.attempts != lease.attempts
            || job.deferrals >= job.attempts
        {
            return Err(StoreError::LeaseLost(lease.id));
        }
        job.defer_lease()?;
        Ok(job.clone())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let since = threshold(now, RECENT_WINDOW);
        let table = self.table();

        let mut stats = QueueStats::default();
        for job in table.jobs.values() {
            stats.record(job.status, 1);
            if job.status == JobStatus::Completed && job.completed_at.is_some_and(|at| at >= since) {
                stats.completed_recent += 1;
            }
        }
        Ok(stats)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let table = self.table();
        Ok(table.newest_first(|_| true).take(limit.max(1)).cloned().collect())
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let table = self.table();
        Ok(table
            .newest_first(|job| job.status == JobStatus::Failed)
            .take(limit.max(1))
            .cloned()
            .collect())
    }

    async fn retry_job(&self, id: JobId) -> Result<Job, StoreError> {
        let mut table = self.table();
        let (subject, status) = match table.jobs.get(&id) {
            Some(job) => (job.subject, job.status),
            None => return Err(StoreError::NotFound(id)),
        };
        if status != JobStatus::Failed {
            return Err(StoreError::UnexpectedStatus {
                id,
                expected: JobStatus::Failed,
                actual: status,
            });
        }
        if table.open_job_for(subject).is_some() {
            return Err(StoreError::OpenJobExists(subject));
        }

        let job = table.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.reset_for_retry()?;
        Ok(job.clone())
    }

    async fn retry_failed(&self) -> Result<u64, StoreError> {
        let mut table = self.table();

        let open: HashSet<SubjectId> = table
            .jobs
            .values()
            .filter(|job| job.is_open())
            .map(|job| job.subject)
            .collect();

        let mut newest_failed: HashMap<SubjectId, JobId> = HashMap::new();
        for job in table.newest_first(|job| job.status == JobStatus::Failed) {
            if !open.contains(&job.subject) {
                newest_failed.entry(job.subject).or_insert(job.id);
            }
        }

        let mut reverted = 0;
        for id in newest_failed.into_values() {
            if let Some(job) = table.jobs.get_mut(&id) {
                job.reset_for_retry()?;
                reverted += 1;
            }
        }
        Ok(reverted)
    }

    async fn clear_completed(&self) -> Result<u64, StoreError> {
        let mut table = self.table();
        let before = table.jobs.len();
        table.jobs.retain(|_, job| job.status != JobStatus::Completed);
        Ok((before - table.jobs.len()) as u64)
    }

    async fn purge_completed(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = threshold(now, clamp_purge_age(max_age));
        let mut table = self.table();
        let before = table.jobs.len();
        table.jobs.retain(|_, job| {
            !(job.status == JobStatus::Completed && job.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - table.jobs.len()) as u64)
    }
}
