//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Leases younger than this are never reclaimed, whatever the caller asks.
pub const MIN_STALE_TIMEOUT: Duration = Duration::from_secs(60);
/// Completed rows younger than this are never purged.
pub const MIN_PURGE_AGE: Duration = Duration::from_secs(300);
/// Lower bound for any timer arming request.
pub const MIN_SCHEDULE_DELAY: Duration = Duration::from_secs(5);
/// Window used for the "completed recently" counter.
pub const RECENT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Default size of the recent-jobs listing.
pub const DEFAULT_RECENT_LIMIT: usize = 20;
/// Default size of the recent-failures listing.
pub const DEFAULT_FAILURE_LIMIT: usize = 10;

/// Tunables for the queue, passed explicitly into every driver invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs claimed per driver invocation.
    pub batch_size: usize,
    /// Charged attempts after which a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// Age after which a Processing lease is considered abandoned.
    pub stale_timeout: Duration,
    /// Delay before the next invocation while work is still pending.
    pub retry_interval: Duration,
    /// Delay before the next invocation after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
    /// Delay armed by enqueue and operator retries.
    pub enqueue_delay: Duration,
    /// Age after which Completed rows are purged.
    pub purge_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_attempts: 3,
            stale_timeout: Duration::from_secs(600),
            retry_interval: Duration::from_secs(45),
            rate_limit_cooldown: Duration::from_secs(60 * 60),
            enqueue_delay: Duration::from_secs(30),
            purge_age: Duration::from_secs(2 * 24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub fn with_purge_age(mut self, age: Duration) -> Self {
        self.purge_age = age;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.batch_size == 0 {
            return Err(DomainError::validation("batch_size must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be greater than 0"));
        }
        if self.rate_limit_cooldown < self.retry_interval {
            return Err(DomainError::validation(
                "rate_limit_cooldown must not be shorter than retry_interval",
            ));
        }
        Ok(())
    }

    /// Load from `ALTQ_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unparsable values keep the default;
    /// a combination that fails [`QueueConfig::validate`] is discarded whole.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            read_parsed(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };

        let config = Self {
            batch_size: read_parsed(&lookup, "ALTQ_BATCH_SIZE", defaults.batch_size)
                .unwrap_or(defaults.batch_size),
            max_attempts: read_parsed(&lookup, "ALTQ_MAX_ATTEMPTS", defaults.max_attempts)
                .unwrap_or(defaults.max_attempts),
            stale_timeout: secs("ALTQ_STALE_TIMEOUT_SECS", defaults.stale_timeout),
            retry_interval: secs("ALTQ_RETRY_INTERVAL_SECS", defaults.retry_interval),
            rate_limit_cooldown: secs("ALTQ_RATE_LIMIT_COOLDOWN_SECS", defaults.rate_limit_cooldown),
            enqueue_delay: secs("ALTQ_ENQUEUE_DELAY_SECS", defaults.enqueue_delay),
            purge_age: secs("ALTQ_PURGE_AGE_SECS", defaults.purge_age),
        };

        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                tracing::warn!(error = %e, "ALTQ_* settings rejected; using defaults");
                defaults
            }
        }
    }
}

fn read_parsed<V>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: V) -> Option<V>
where
    V: std::str::FromStr + std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<V>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("{key}={raw:?} is not valid; using default {default}");
            None
        }
    }
}

pub fn clamp_stale_timeout(timeout: Duration) -> Duration {
    timeout.max(MIN_STALE_TIMEOUT)
}

pub fn clamp_purge_age(age: Duration) -> Duration {
    age.max(MIN_PURGE_AGE)
}

pub fn clamp_schedule_delay(delay: Duration) -> Duration {
    delay.max(MIN_SCHEDULE_DELAY)
}
