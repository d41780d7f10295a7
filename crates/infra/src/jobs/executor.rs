//! Job executor seam.
//!
//! The queue does not know what a job *does*; it hands the subject and source
//! to a [`JobExecutor`] and interprets the [`ExecutionOutcome`] it returns.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use altq_core::{ExecutionOutcome, Job, JobSource, SubjectId};

/// Performs the actual work for one job.
///
/// Implementations classify their own failures. Returning `Err` (or
/// panicking) is treated as a terminal failure for that job only.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    type Output: Send + fmt::Debug + 'static;

    async fn execute(
        &self,
        subject: SubjectId,
        source: &JobSource,
    ) -> anyhow::Result<ExecutionOutcome<Self::Output>>;
}

/// Run the executor for `job`, converting errors and panics into
/// [`ExecutionOutcome::TerminalFailure`].
///
/// The call runs on its own task so that a panic unwinds there and not
/// through the scheduler cycle.
pub async fn execute_guarded<E: JobExecutor>(
    executor: Arc<E>,
    job: &Job,
) -> ExecutionOutcome<E::Output> {
    let subject = job.subject;
    let source = job.source.clone();
    let task = tokio::spawn(async move { executor.execute(subject, &source).await });

    match task.await {
        Ok(Ok(outcome)) => {
            debug!(job_id = %job.id, outcome = outcome.kind(), "executor returned");
            outcome
        }
        Ok(Err(e)) => {
            error!(job_id = %job.id, subject = %subject, error = %e, "executor error");
            ExecutionOutcome::TerminalFailure(format!("{e:#}"))
        }
        Err(join_err) if join_err.is_panic() => {
            let msg = panic_message(join_err.into_panic());
            error!(job_id = %job.id, subject = %subject, panic = %msg, "executor panicked");
            ExecutionOutcome::TerminalFailure(format!("executor panicked: {msg}"))
        }
        Err(join_err) => {
            error!(job_id = %job.id, subject = %subject, error = %join_err, "executor task cancelled");
            ExecutionOutcome::TerminalFailure(format!("executor task cancelled: {join_err}"))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
