//! Retry with backoff on the orchestration's logical clock.
//!
//! Delays are taken with durable timers, so a retrying orchestration can be unloaded between
//! attempts and replays to the same decisions.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::TaskError;
use crate::logging::RETRY_TARGET;
use crate::orchestration::context::OrchestrationContext;

/// Time source and timer primitive used by [`RetryInterceptor`].
pub trait DeterministicClock: Send + Sync {
    fn current_utc_date_time(&self) -> DateTime<Utc>;

    fn create_timer(&self, fire_at: DateTime<Utc>) -> BoxFuture<'static, Result<(), TaskError>>;
}

impl DeterministicClock for OrchestrationContext {
    fn current_utc_date_time(&self) -> DateTime<Utc> {
        OrchestrationContext::current_utc_date_time(self)
    }

    fn create_timer(&self, fire_at: DateTime<Utc>) -> BoxFuture<'static, Result<(), TaskError>> {
        Box::pin(OrchestrationContext::create_timer(self, fire_at))
    }
}

pub type RetryPredicate = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    pub first_retry_interval: Duration,
    pub max_number_of_attempts: u32,
    pub backoff_coefficient: f64,
    pub max_retry_interval: Duration,
    /// Overall budget measured from the first attempt.
    pub retry_timeout: Option<Duration>,
    /// Decides whether a retriable failure is retried. Defaults to always.
    pub handle: Option<RetryPredicate>,
    /// Schedules one extra zero-delay timer once attempts are exhausted. Histories written by
    /// earlier versions contain this timer and only replay with it enabled.
    pub legacy_final_timer: bool,
}

impl RetryOptions {
    /// Panics if `first_retry_interval` is zero.
    pub fn new(first_retry_interval: Duration, max_number_of_attempts: u32) -> Self {
        assert!(!first_retry_interval.is_zero(), "first_retry_interval must be positive");
        Self {
            first_retry_interval,
            max_number_of_attempts,
            backoff_coefficient: 1.0,
            max_retry_interval: Duration::MAX,
            retry_timeout: None,
            handle: None,
            legacy_final_timer: true,
        }
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    pub fn with_handle(mut self, handle: impl Fn(&TaskError) -> bool + Send + Sync + 'static) -> Self {
        self.handle = Some(Arc::new(handle));
        self
    }

    pub fn with_legacy_final_timer(mut self, enabled: bool) -> Self {
        self.legacy_final_timer = enabled;
        self
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("first_retry_interval", &self.first_retry_interval)
            .field("max_number_of_attempts", &self.max_number_of_attempts)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("max_retry_interval", &self.max_retry_interval)
            .field("retry_timeout", &self.retry_timeout)
            .field("has_handle", &self.handle.is_some())
            .field("legacy_final_timer", &self.legacy_final_timer)
            .finish()
    }
}

pub struct RetryInterceptor<C: DeterministicClock> {
    clock: C,
    options: RetryOptions,
}

impl<C: DeterministicClock> RetryInterceptor<C> {
    pub fn new(clock: C, options: RetryOptions) -> Self {
        Self { clock, options }
    }

    /// Runs `call` until it succeeds, fails non-retriably, or runs out of attempts, and
    /// returns the last error in the latter two cases.
    pub async fn invoke<T, F, Fut>(&self, mut call: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let first_attempt = self.clock.current_utc_date_time();
        let mut last_error = TaskError::Canceled;
        let mut exhausted = false;

        for attempt in 0..self.options.max_number_of_attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = e,
            }

            if attempt + 1 >= self.options.max_number_of_attempts {
                exhausted = true;
                break;
            }
            let delay = self.compute_next_delay(attempt, first_attempt, &last_error);
            if delay.is_zero() {
                break;
            }

            let retry_at = self.clock.current_utc_date_time() + to_chrono(delay);
            debug!(
                target: RETRY_TARGET,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "retrying after failure"
            );
            self.clock.create_timer(retry_at).await?;
        }

        if exhausted && self.options.legacy_final_timer {
            self.clock.create_timer(self.clock.current_utc_date_time()).await?;
        }
        Err(last_error)
    }

    /// Delay before the attempt after `attempt` (0-based); zero means stop.
    pub fn compute_next_delay(&self, attempt: u32, first_attempt: DateTime<Utc>, failure: &TaskError) -> Duration {
        if failure.is_non_retriable() {
            return Duration::ZERO;
        }
        if let Some(handle) = &self.options.handle {
            if !handle(failure) {
                return Duration::ZERO;
            }
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.options.first_retry_interval.as_secs_f64() * 1000.0 * self.options.backoff_coefficient.powi(exponent);
        let mut delay = if millis.is_finite() && millis >= 0.0 {
            Duration::from_secs_f64(millis / 1000.0).min(self.options.max_retry_interval)
        } else {
            self.options.max_retry_interval
        };

        if let Some(timeout) = self.options.retry_timeout {
            let now = self.clock.current_utc_date_time();
            let deadline = first_attempt + to_chrono(timeout);
            if now >= deadline {
                return Duration::ZERO;
            }
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            delay = delay.min(remaining);
        }
        delay
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
