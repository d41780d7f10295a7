//! SQLite-backed job store.
//!
//! Jobs live in a single `queue_jobs` table. Every state change is one
//! conditional statement, so overlapping scheduler invocations (separate
//! processes sharing the database file, or tasks sharing a pool) can never
//! lease the same row twice.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (UTC, microsecond
//! precision) so that lexical comparison in SQL matches chronological order.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use altq_core::config::{RECENT_WINDOW, clamp_purge_age, clamp_stale_timeout};
use altq_core::job::threshold;
use altq_core::{Job, JobId, JobSource, JobStatus, QueueStats, SubjectId, Transition};

use super::store::{EnqueueResult, JobStore, StoreError};

const JOB_COLUMNS: &str = "id, subject_id, status, attempts, deferrals, source, last_error, \
                           enqueued_at, locked_at, completed_at";

/// SQLite-backed job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    ///
    /// File databases use WAL journaling and a busy timeout so concurrent
    /// writers wait for each other instead of failing.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::from_pool(pool).await
    }

    /// A private in-memory database, mainly for tests.
    ///
    /// Uses a single long-lived connection: the database disappears as soon
    /// as its last connection closes.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and make sure the schema exists.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id    INTEGER NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                attempts      INTEGER NOT NULL DEFAULT 0,
                deferrals     INTEGER NOT NULL DEFAULT 0,
                source        TEXT NOT NULL DEFAULT 'auto',
                last_error    TEXT NULL,
                enqueued_at   TEXT NOT NULL,
                locked_at     TEXT NULL,
                completed_at  TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create queue_jobs table", e))?;

        for (name, ddl) in [
            (
                "status index",
                "CREATE INDEX IF NOT EXISTS idx_queue_jobs_status ON queue_jobs(status, enqueued_at)",
            ),
            (
                "subject index",
                "CREATE INDEX IF NOT EXISTS idx_queue_jobs_subject ON queue_jobs(subject_id, status)",
            ),
            (
                "open subject index",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_open_subject \
                 ON queue_jobs(subject_id) WHERE status IN ('pending', 'processing')",
            ),
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(name, e))?;
        }

        Ok(())
    }

    async fn fetch_one_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_job).transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, source), fields(subject = %subject, source = %source), err)]
    async fn enqueue(
        &self,
        subject: SubjectId,
        source: &JobSource,
        now: DateTime<Utc>,
    ) -> Result<EnqueueResult, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO queue_jobs (subject_id, status, attempts, deferrals, source, enqueued_at)
            SELECT ?1, 'pending', 0, 0, ?2, ?3
            WHERE NOT EXISTS (
                SELECT 1 FROM queue_jobs
                WHERE subject_id = ?1
                  AND status IN ('pending', 'processing')
            )
            RETURNING id
            "#,
        )
        .bind(subject.as_i64())
        .bind(source.as_key())
        .bind(encode_ts(now))
        .fetch_optional(&self.pool)
        .await;

        match inserted {
            Ok(Some(row)) => {
                let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("enqueue", e))?;
                Ok(EnqueueResult::Created(JobId::from_raw(id)))
            }
            Ok(None) => Ok(EnqueueResult::AlreadyOpen),
            // Lost a race against a concurrent enqueue on another connection.
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(EnqueueResult::AlreadyOpen)
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch_one_job(id).await
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET status = 'processing',
                locked_at = ?1,
                attempts = attempts + 1
            WHERE status = 'pending'
              AND id IN (
                  SELECT id FROM queue_jobs
                  WHERE status = 'pending'
                  ORDER BY enqueued_at ASC, id ASC
                  LIMIT ?2
              )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(encode_ts(now))
            .bind(limit.max(1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        jobs.sort_by(|a, b| (a.enqueued_at, a.id).cmp(&(b.enqueued_at, b.id)));
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn reset_stale(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = threshold(now, clamp_stale_timeout(timeout));

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                locked_at = NULL
            WHERE status = 'processing'
              AND locked_at < ?1
            "#,
        )
        .bind(encode_ts(cutoff))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stale", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(
        skip(self, lease, transition),
        fields(job_id = %lease.id, attempts = lease.attempts, transition = transition.label()),
        err
    )]
    async fn apply(
        &self,
        lease: &Job,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut next = lease.clone();
        next.apply(transition, now)?;

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = ?1,
                deferrals = ?2,
                last_error = ?3,
                locked_at = NULL,
                completed_at = ?4
            WHERE id = ?5
              AND status = 'processing'
              AND attempts = ?6
            "#,
        )
        .bind(next.status.as_str())
        .bind(i64::from(next.deferrals))
        .bind(next.last_error.as_deref())
        .bind(next.completed_at.map(encode_ts))
        .bind(lease.id.as_i64())
        .bind(i64::from(lease.attempts))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("apply", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(lease.id));
        }
        Ok(next)
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.id, attempts = lease.attempts), err)]
    async fn defer_lease(&self, lease: &Job) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET deferrals = deferrals + 1
            WHERE id = ?1
              AND status = 'processing'
              AND attempts = ?2
              AND deferrals < attempts
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(lease.id.as_i64())
            .bind(i64::from(lease.attempts))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("defer_lease", e))?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(StoreError::LeaseLost(lease.id)),
        }
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM queue_jobs
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let status = JobStatus::from_str(&status).map_err(|e| StoreError::Decode(e.to_string()))?;
            stats.record(status, u64::try_from(total).unwrap_or_default());
        }

        let recent: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM queue_jobs
            WHERE status = 'completed'
              AND completed_at >= ?1
            "#,
        )
        .bind(encode_ts(threshold(now, RECENT_WINDOW)))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;
        stats.completed_recent = u64::try_from(recent).unwrap_or_default();

        Ok(stats)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs ORDER BY id DESC LIMIT ?1");
        let rows = sqlx::query(&sql)
            .bind(limit.max(1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("recent", e))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE status = 'failed' ORDER BY id DESC LIMIT ?1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit.max(1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("recent_failures", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_job(&self, id: JobId) -> Result<Job, StoreError> {
        let current = self.fetch_one_job(id).await?.ok_or(StoreError::NotFound(id))?;
        if current.status != JobStatus::Failed {
            return Err(StoreError::UnexpectedStatus {
                id,
                expected: JobStatus::Failed,
                actual: current.status,
            });
        }

        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                attempts = 0,
                deferrals = 0,
                last_error = NULL,
                locked_at = NULL,
                completed_at = NULL
            WHERE id = ?1
              AND status = 'failed'
              AND NOT EXISTS (
                  SELECT 1 FROM queue_jobs AS open_job
                  WHERE open_job.subject_id = queue_jobs.subject_id
                    AND open_job.status IN ('pending', 'processing')
              )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("retry_job", e))?;

        match row {
            Some(row) => row_to_job(&row),
            None => match self.fetch_one_job(id).await? {
                None => Err(StoreError::NotFound(id)),
                Some(job) if job.status == JobStatus::Failed => {
                    Err(StoreError::OpenJobExists(job.subject))
                }
                Some(job) => Err(StoreError::UnexpectedStatus {
                    id,
                    expected: JobStatus::Failed,
                    actual: job.status,
                }),
            },
        }
    }

    #[instrument(skip(self), err)]
    async fn retry_failed(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                attempts = 0,
                deferrals = 0,
                last_error = NULL,
                locked_at = NULL,
                completed_at = NULL
            WHERE status = 'failed'
              AND id = (
                  SELECT MAX(failed.id) FROM queue_jobs AS failed
                  WHERE failed.subject_id = queue_jobs.subject_id
                    AND failed.status = 'failed'
              )
              AND NOT EXISTS (
                  SELECT 1 FROM queue_jobs AS open_job
                  WHERE open_job.subject_id = queue_jobs.subject_id
                    AND open_job.status IN ('pending', 'processing')
              )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_failed", e))?;

        Ok(result.rows_affected())
    }

    async fn clear_completed(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE status = 'completed'")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_completed", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn purge_completed(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = threshold(now, clamp_purge_age(max_age));

        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE status = 'completed'
              AND completed_at < ?1
            "#,
        )
        .bind(encode_ts(cutoff))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_completed", e))?;

        Ok(result.rows_affected())
    }
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp {raw:?}: {e}")))
}

fn decode_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(decode_ts).transpose()
}

fn decode_count(column: &str, raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Decode(format!("{column} out of range: {raw}")))
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let get_err = |e| map_sqlx_error("decode row", e);

    let id: i64 = row.try_get("id").map_err(get_err)?;
    let subject_id: i64 = row.try_get("subject_id").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(get_err)?;
    let deferrals: i64 = row.try_get("deferrals").map_err(get_err)?;
    let source: String = row.try_get("source").map_err(get_err)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(get_err)?;
    let enqueued_at: String = row.try_get("enqueued_at").map_err(get_err)?;
    let locked_at: Option<String> = row.try_get("locked_at").map_err(get_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(get_err)?;

    Ok(Job {
        id: JobId::from_raw(id),
        subject: SubjectId::new(subject_id).map_err(|e| StoreError::Decode(e.to_string()))?,
        status: JobStatus::from_str(&status).map_err(|e| StoreError::Decode(e.to_string()))?,
        source: JobSource::from_key(&source),
        attempts: decode_count("attempts", attempts)?,
        deferrals: decode_count("deferrals", deferrals)?,
        last_error,
        enqueued_at: decode_ts(&enqueued_at)?,
        locked_at: decode_opt_ts(locked_at)?,
        completed_at: decode_opt_ts(completed_at)?,
    })
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    StoreError::Database {
        operation,
        source: err,
    }
}
