//! Retry strategies: decide when a failed task runs next.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::domain::FailedTask;

/// Computes the next run instant for a task that just failed.
///
/// `None` means "ready at once". A strategy is a pure function of the task's
/// current state; the engine does not assume monotonicity across calls.
pub trait RetryStrategy: Send + Sync {
    fn next_run_time(&self, task: &FailedTask) -> Option<DateTime<Utc>>;
}

/// Retry as soon as the worker gets to the task. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateStrategy;

impl RetryStrategy for ImmediateStrategy {
    fn next_run_time(&self, _task: &FailedTask) -> Option<DateTime<Utc>> {
        None
    }
}

/// Retry a fixed interval after each failure.
#[derive(Debug, Clone, Copy)]
pub struct FixedIntervalStrategy {
    interval: Duration,
}

impl FixedIntervalStrategy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl RetryStrategy for FixedIntervalStrategy {
    fn next_run_time(&self, _task: &FailedTask) -> Option<DateTime<Utc>> {
        Some(Utc::now() + self.interval)
    }
}

/// Exponential backoff: `base * multiplier^retry_count`, capped at
/// `max_delay`, with up to 10% random jitter when enabled.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }

    fn delay_for(&self, retry_count: u32) -> Duration {
        // The exponent is clamped so the growth curve cannot overflow f64
        // into infinity before the cap applies.
        let exponent = retry_count.min(64) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_run_time(&self, task: &FailedTask) -> Option<DateTime<Utc>> {
        let mut delay = self.delay_for(task.retry_count);
        if self.jitter && !delay.is_zero() {
            let spread = rand::thread_rng().gen_range(0.0..0.1);
            delay += delay.mul_f64(spread);
        }
        Some(Utc::now() + delay)
    }
}
