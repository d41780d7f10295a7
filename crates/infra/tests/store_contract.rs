//! Behavior every `JobStore` must share, run against both implementations.

mod common;

use std::time::Duration;

use altq_core::{Job, JobId, JobSource, JobStatus, Transition};
use altq_infra::jobs::{EnqueueResult, InMemoryJobStore, JobStore, SqliteJobStore, StoreError};

use common::{secs, subject, t0};

/// Enqueue, claim and apply `transition` for a subject. Expects no other
/// Pending jobs to be older than the new one.
async fn finish<S: JobStore>(store: &S, n: i64, transition: Transition, at: chrono::DateTime<chrono::Utc>) -> Job {
    store.enqueue(subject(n), &JobSource::Auto, at).await.unwrap();
    let lease = store.claim_batch(1, at).await.unwrap().remove(0);
    assert_eq!(lease.subject, subject(n));
    store.apply(&lease, &transition, at).await.unwrap()
}

fn failed(msg: &str) -> Transition {
    Transition::Fail { error: msg.to_string() }
}

async fn enqueue_is_idempotent_per_subject<S: JobStore>(store: S) {
    let first = store.enqueue(subject(1), &JobSource::Upload, t0()).await.unwrap();
    assert!(matches!(first, EnqueueResult::Created(_)));
    let again = store.enqueue(subject(1), &JobSource::Manual, t0()).await.unwrap();
    assert_eq!(again, EnqueueResult::AlreadyOpen);

    let stats = store.stats(t0()).await.unwrap();
    assert_eq!(stats.pending, 1);

    let lease = store.claim_batch(1, t0()).await.unwrap().remove(0);
    assert_eq!(lease.source, JobSource::Upload);
    assert_eq!(
        store.enqueue(subject(1), &JobSource::Auto, t0()).await.unwrap(),
        EnqueueResult::AlreadyOpen
    );

    store.apply(&lease, &Transition::Complete, t0()).await.unwrap();
    let reopened = store.enqueue(subject(1), &JobSource::Auto, t0()).await.unwrap();
    assert!(matches!(reopened, EnqueueResult::Created(id) if id != lease.id));
}

async fn enqueue_many_counts_new_jobs<S: JobStore>(store: S) {
    store.enqueue(subject(2), &JobSource::Auto, t0()).await.unwrap();
    let created = store
        .enqueue_many(&[subject(1), subject(2), subject(3), subject(3)], &JobSource::Bulk, t0())
        .await
        .unwrap();
    assert_eq!(created, 2);
    assert_eq!(store.stats(t0()).await.unwrap().pending, 3);
}

async fn claim_takes_batch_of_oldest<S: JobStore>(store: S) {
    for n in 1..=5 {
        store
            .enqueue(subject(n), &JobSource::Bulk, t0() + secs(n))
            .await
            .unwrap();
    }

    let now = t0() + secs(60);
    let claimed = store.claim_batch(3, now).await.unwrap();
    assert_eq!(claimed.len(), 3);
    assert_eq!(
        claimed.iter().map(|j| j.subject).collect::<Vec<_>>(),
        vec![subject(1), subject(2), subject(3)]
    );
    for job in &claimed {
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.locked_at, Some(now));
        job.check_invariants().unwrap();
    }

    let stats = store.stats(now).await.unwrap();
    assert_eq!((stats.pending, stats.processing), (2, 3));
}

async fn claim_orders_by_enqueue_time_not_id<S: JobStore>(store: S) {
    store.enqueue(subject(1), &JobSource::Auto, t0() + secs(10)).await.unwrap();
    store.enqueue(subject(2), &JobSource::Auto, t0()).await.unwrap();

    let claimed = store.claim_batch(1, t0() + secs(20)).await.unwrap();
    assert_eq!(claimed[0].subject, subject(2));
}

async fn reset_stale_respects_timeout<S: JobStore>(store: S) {
    store.enqueue(subject(1), &JobSource::Auto, t0()).await.unwrap();
    store.enqueue(subject(2), &JobSource::Auto, t0() + secs(1)).await.unwrap();
    let old = store.claim_batch(1, t0()).await.unwrap().remove(0);
    let young = store.claim_batch(1, t0() + secs(200)).await.unwrap().remove(0);

    let now = t0() + secs(700);
    assert_eq!(store.reset_stale(Duration::from_secs(600), now).await.unwrap(), 1);
    assert_eq!(store.reset_stale(Duration::from_secs(600), now).await.unwrap(), 0);

    let old = store.get(old.id).await.unwrap().unwrap();
    assert_eq!(old.status, JobStatus::Pending);
    assert_eq!(old.attempts, 1);
    assert!(old.locked_at.is_none());

    let young = store.get(young.id).await.unwrap().unwrap();
    assert_eq!(young.status, JobStatus::Processing);
}

async fn reset_stale_never_below_one_minute<S: JobStore>(store: S) {
    store.enqueue(subject(1), &JobSource::Auto, t0()).await.unwrap();
    store.claim_batch(1, t0()).await.unwrap();

    assert_eq!(store.reset_stale(Duration::from_secs(5), t0() + secs(30)).await.unwrap(), 0);
    assert_eq!(store.reset_stale(Duration::from_secs(5), t0() + secs(61)).await.unwrap(), 1);
}

async fn apply_writes_each_transition<S: JobStore>(store: S) {
    let retried = finish(&store, 1, Transition::Retry { error: "503".into() }, t0()).await;
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.last_error.as_deref(), Some("503"));

    let lease = store.claim_batch(1, t0()).await.unwrap().remove(0);
    let deferred = store
        .apply(&lease, &Transition::Defer { error: "quota".into() }, t0())
        .await
        .unwrap();
    assert_eq!((deferred.attempts, deferred.deferrals), (2, 1));

    let stored = store.get(deferred.id).await.unwrap().unwrap();
    assert_eq!(stored, deferred);

    let lease = store.claim_batch(1, t0()).await.unwrap().remove(0);
    let done = store.apply(&lease, &Transition::Complete, t0() + secs(5)).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.completed_at, Some(t0() + secs(5)));
    assert!(done.last_error.is_none());

    let gone = finish(&store, 2, failed("unsupported format"), t0()).await;
    assert_eq!(gone.status, JobStatus::Failed);
    assert_eq!(gone.last_error.as_deref(), Some("unsupported format"));
}

async fn apply_after_reclaim_loses_lease<S: JobStore>(store: S) {
    store.enqueue(subject(1), &JobSource::Auto, t0()).await.unwrap();
    let first = store.claim_batch(1, t0()).await.unwrap().remove(0);

    let later = t0() + secs(900);
    store.reset_stale(Duration::from_secs(600), later).await.unwrap();

    // Reclaimed but not yet re-claimed.
    let err = store.apply(&first, &Transition::Complete, later).await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost(_)));

    let second = store.claim_batch(1, later).await.unwrap().remove(0);
    let err = store.apply(&first, &failed("late"), later).await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost(_)));

    let job = store.apply(&second, &Transition::Complete, later).await.unwrap();
    assert_eq!(job.attempts, 2);
}

async fn purge_removes_only_old_completed<S: JobStore>(store: S) {
    let old = finish(&store, 1, Transition::Complete, t0()).await;
    let fresh = finish(&store, 2, Transition::Complete, t0() + secs(2 * 86_400)).await;
    let failed_job = finish(&store, 3, failed("nope"), t0()).await;
    store.enqueue(subject(4), &JobSource::Auto, t0()).await.unwrap();

    let now = t0() + secs(3 * 86_400);
    let purged = store
        .purge_completed(Duration::from_secs(2 * 86_400), now)
        .await
        .unwrap();
    assert_eq!(purged, 1);

    assert!(store.get(old.id).await.unwrap().is_none());
    assert!(store.get(fresh.id).await.unwrap().is_some());
    assert!(store.get(failed_job.id).await.unwrap().is_some());
    assert_eq!(store.stats(now).await.unwrap().pending, 1);
}

async fn clear_completed_keeps_failures<S: JobStore>(store: S) {
    finish(&store, 1, Transition::Complete, t0()).await;
    finish(&store, 2, Transition::Complete, t0()).await;
    finish(&store, 3, failed("nope"), t0()).await;

    assert_eq!(store.clear_completed().await.unwrap(), 2);
    let stats = store.stats(t0()).await.unwrap();
    assert_eq!((stats.completed, stats.failed), (0, 1));
}

async fn stats_count_recent_completions<S: JobStore>(store: S) {
    let now = t0() + secs(40 * 3600);
    finish(&store, 1, Transition::Complete, now - secs(3600)).await;
    finish(&store, 2, Transition::Complete, now - secs(30 * 3600)).await;
    finish(&store, 3, failed("x"), now).await;

    let stats = store.stats(now).await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.completed_recent, 1);
    assert_eq!(stats.failed, 1);
    assert!(!stats.has_jobs());
}

async fn listings_are_newest_first<S: JobStore>(store: S) {
    let a = finish(&store, 1, failed("a"), t0()).await;
    let b = finish(&store, 2, Transition::Complete, t0()).await;
    let c = finish(&store, 3, failed("c"), t0()).await;

    let recent: Vec<JobId> = store.recent(2).await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(recent, vec![c.id, b.id]);

    let failures: Vec<JobId> = store
        .recent_failures(10)
        .await
        .unwrap()
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(failures, vec![c.id, a.id]);
}

async fn retry_job_resets_failed<S: JobStore>(store: S) {
    let job = finish(&store, 1, failed("bad"), t0()).await;

    let retried = store.retry_job(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.attempts, 0);
    assert!(retried.last_error.is_none());
    assert!(retried.completed_at.is_none());

    assert!(matches!(
        store.retry_job(job.id).await.unwrap_err(),
        StoreError::UnexpectedStatus { actual: JobStatus::Pending, .. }
    ));
    assert!(matches!(
        store.retry_job(JobId::from_raw(9_999)).await.unwrap_err(),
        StoreError::NotFound(_)
    ));
}

async fn retry_job_blocked_by_open_job<S: JobStore>(store: S) {
    let job = finish(&store, 1, failed("bad"), t0()).await;
    store.enqueue(subject(1), &JobSource::Manual, t0()).await.unwrap();

    let err = store.retry_job(job.id).await.unwrap_err();
    assert!(matches!(err, StoreError::OpenJobExists(s) if s == subject(1)));
}

async fn retry_failed_takes_newest_per_subject<S: JobStore>(store: S) {
    let a_old = finish(&store, 1, failed("a1"), t0()).await;
    let a_new = finish(&store, 1, failed("a2"), t0()).await;
    let b = finish(&store, 2, failed("b"), t0()).await;
    let c = finish(&store, 3, failed("c"), t0()).await;
    store.enqueue(subject(3), &JobSource::Auto, t0()).await.unwrap();

    assert_eq!(store.retry_failed().await.unwrap(), 2);

    let status = |job: Option<Job>| job.map(|j| j.status);
    assert_eq!(status(store.get(a_old.id).await.unwrap()), Some(JobStatus::Failed));
    assert_eq!(status(store.get(a_new.id).await.unwrap()), Some(JobStatus::Pending));
    assert_eq!(status(store.get(b.id).await.unwrap()), Some(JobStatus::Pending));
    assert_eq!(status(store.get(c.id).await.unwrap()), Some(JobStatus::Failed));
    assert_eq!(store.stats(t0()).await.unwrap().pending, 3);
}

async fn defer_lease_refunds_the_claim<S: JobStore>(store: S) {
    store.enqueue(subject(1), &JobSource::Bulk, t0()).await.unwrap();
    let lease = store.claim_batch(1, t0()).await.unwrap().remove(0);

    let deferred = store.defer_lease(&lease).await.unwrap();
    assert_eq!(deferred.status, JobStatus::Processing);
    assert_eq!(deferred.attempts, 1);
    assert_eq!(deferred.deferrals, 1);
    assert_eq!(deferred.charged_attempts(), 0);
    assert!(deferred.locked_at.is_some());

    // Once per lease.
    assert!(matches!(
        store.defer_lease(&lease).await.unwrap_err(),
        StoreError::LeaseLost(_)
    ));

    // The skipped job comes back through the normal reclaim path.
    let later = t0() + secs(700);
    assert_eq!(store.reset_stale(Duration::from_secs(600), later).await.unwrap(), 1);
    let second = store.claim_batch(1, later).await.unwrap().remove(0);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.charged_attempts(), 1);

    assert!(matches!(
        store.defer_lease(&lease).await.unwrap_err(),
        StoreError::LeaseLost(_)
    ));
}

macro_rules! store_tests {
    ($($name:ident),* $(,)?) => {
        mod in_memory {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(InMemoryJobStore::new()).await;
                }
            )*
        }

        mod sqlite {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(SqliteJobStore::in_memory().await.unwrap()).await;
                }
            )*
        }
    };
}

store_tests!(
    enqueue_is_idempotent_per_subject,
    enqueue_many_counts_new_jobs,
    claim_takes_batch_of_oldest,
    claim_orders_by_enqueue_time_not_id,
    reset_stale_respects_timeout,
    reset_stale_never_below_one_minute,
    apply_writes_each_transition,
    apply_after_reclaim_loses_lease,
    purge_removes_only_old_completed,
    clear_completed_keeps_failures,
    stats_count_recent_completions,
    listings_are_newest_first,
    retry_job_resets_failed,
    retry_job_blocked_by_open_job,
    retry_failed_takes_newest_per_subject,
    defer_lease_refunds_the_claim,
);
