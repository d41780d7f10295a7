#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use altq_core::{ExecutionOutcome, JobSource, SubjectId};
use altq_infra::jobs::JobExecutor;
use altq_observability::{LogConfig, LogFormat};

/// Route test logs through the shared subscriber (`RUST_LOG` still applies).
pub fn init_logging() {
    altq_observability::init_with(&LogConfig {
        format: LogFormat::Pretty,
        default_filter: "warn".to_string(),
    });
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub fn subject(n: i64) -> SubjectId {
    SubjectId::new(n).unwrap()
}

/// What the scripted executor does for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ok,
    Retryable,
    RateLimited,
    Terminal,
    Error,
    Panic,
}

/// Executor that replays a per-subject script. Subjects without a script (or
/// with an exhausted one) succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<SubjectId, VecDeque<Step>>>,
    calls: Mutex<Vec<SubjectId>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, subject: SubjectId, steps: &[Step]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(subject, steps.iter().copied().collect());
        self
    }

    pub fn calls(&self) -> Vec<SubjectId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    type Output = String;

    async fn execute(
        &self,
        subject: SubjectId,
        _source: &JobSource,
    ) -> anyhow::Result<ExecutionOutcome<String>> {
        self.calls.lock().unwrap().push(subject);
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&subject)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok);

        match step {
            Step::Ok => Ok(ExecutionOutcome::Success(format!("description of {subject}"))),
            Step::Retryable => Ok(ExecutionOutcome::retryable("upstream returned 503")),
            Step::RateLimited => Ok(ExecutionOutcome::rate_limited("monthly limit reached")),
            Step::Terminal => Ok(ExecutionOutcome::terminal("attachment is not an image")),
            Step::Error => Err(anyhow::anyhow!("invalid response body")),
            Step::Panic => panic!("executor bug"),
        }
    }
}
