//! Self-rescheduling trigger for the scheduler driver.
//!
//! Mirrors a host cron facility that holds at most one pending single-shot
//! event: `schedule` only arms when nothing is armed, `reschedule` replaces
//! whatever is armed.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use altq_core::config::{MIN_SCHEDULE_DELAY, clamp_schedule_delay};

/// Timer seam used by the driver and the queue facade.
pub trait Timer: Send + Sync + 'static {
    /// Arm a run after `delay` unless one is already armed.
    ///
    /// Returns `true` when this call armed the timer.
    fn schedule(&self, delay: Duration) -> bool;

    /// Arm a run after `delay`, replacing any armed run.
    fn reschedule(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    at: Instant,
    delay: Duration,
}

/// In-process single-shot timer.
#[derive(Debug)]
pub struct SingleShotTimer {
    armed: Mutex<Option<Armed>>,
    notify: Notify,
    min_delay: Duration,
}

impl Default for SingleShotTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleShotTimer {
    pub fn new() -> Self {
        Self {
            armed: Mutex::new(None),
            notify: Notify::new(),
            min_delay: MIN_SCHEDULE_DELAY,
        }
    }

    /// Lower bound applied to every arming request. Never below the
    /// queue-wide minimum.
    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = clamp_schedule_delay(min_delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self, delay: Duration) -> Armed {
        let delay = delay.max(self.min_delay);
        Armed {
            at: Instant::now() + delay,
            delay,
        }
    }

    /// Delay requested by the currently armed run, if any.
    pub fn armed_delay(&self) -> Option<Duration> {
        self.state().map(|armed| armed.delay)
    }

    pub fn is_armed(&self) -> bool {
        self.state().is_some()
    }

    /// Disarm without firing.
    pub fn cancel(&self) {
        self.state().take();
        self.notify.notify_one();
    }

    /// Wait until the armed run is due, then disarm it.
    ///
    /// Waits indefinitely while nothing is armed. Intended for a single
    /// waiter; safe to cancel (the armed run is only consumed on return).
    pub async fn fired(&self) {
        loop {
            let armed = *self.state();
            match armed {
                None => self.notify.notified().await,
                Some(current) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(current.at) => {
                            let mut state = self.state();
                            if *state == Some(current) {
                                *state = None;
                                return;
                            }
                        }
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }
}

impl Timer for SingleShotTimer {
    fn schedule(&self, delay: Duration) -> bool {
        let mut state = self.state();
        if state.is_some() {
            return false;
        }
        *state = Some(self.arm(delay));
        drop(state);
        self.notify.notify_one();
        true
    }

    fn reschedule(&self, delay: Duration) {
        *self.state() = Some(self.arm(delay));
        self.notify.notify_one();
    }
}
