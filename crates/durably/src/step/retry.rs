//! Retry schedules for `step_retry`
//!
//! Supports exponential, fibonacci and fixed backoff with jitter, a maximum
//! attempt count, and a retry predicate over the typed error. Suspension
//! signals and cancellation are never retried regardless of the predicate.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::workflow::WorkflowError;

type RetryPredicate = Arc<dyn Fn(&WorkflowError) -> bool + Send + Sync>;

/// Backoff growth strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same interval between every attempt
    Fixed,

    /// Interval doubles each retry
    Exponential,

    /// Interval follows the fibonacci sequence
    Fibonacci,
}

/// Retry configuration for a single step
///
/// The wire form carries everything but the predicate (a function cannot be
/// serialized; deserialized schedules retry every retryable error).
///
/// # Example
///
/// ```
/// use durably::RetrySchedule;
/// use std::time::Duration;
///
/// let schedule = RetrySchedule::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_millis(100))
///     .with_max_interval(Duration::from_secs(10));
///
/// // First retry after ~100ms, then ~200ms, ~400ms, ...
/// ```
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct RetrySchedule {
    /// Growth strategy for intervals between attempts
    pub backoff: Backoff,

    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on the delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Jitter factor (0.0-1.0); 0.1 means plus or minus 10%
    pub jitter: f64,

    #[serde(skip)]
    retry_if: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetrySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySchedule")
            .field("backoff", &self.backoff)
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("max_interval", &self.max_interval)
            .field("jitter", &self.jitter)
            .field("retry_if", &self.retry_if.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetrySchedule {
    /// Exponential backoff with sensible defaults: 3 attempts, 1s initial,
    /// 60s cap, 10% jitter
    pub fn exponential() -> Self {
        Self {
            backoff: Backoff::Exponential,
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            jitter: 0.1,
            retry_if: None,
        }
    }

    /// Fibonacci backoff with the same defaults as [`exponential`](Self::exponential)
    pub fn fibonacci() -> Self {
        Self {
            backoff: Backoff::Fibonacci,
            ..Self::exponential()
        }
    }

    /// Fixed interval between attempts, no jitter
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Fixed,
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            jitter: 0.0,
            retry_if: None,
        }
    }

    /// A schedule that never retries
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first retry
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the cap on delays between retries
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Restrict retries to errors matching the predicate
    pub fn retry_if(
        mut self,
        predicate: impl Fn(&WorkflowError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Delay before the given attempt (1-based; attempt 1 has no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = match self.backoff {
            Backoff::Fixed => self.initial_interval.as_secs_f64(),
            Backoff::Exponential => {
                self.initial_interval.as_secs_f64() * 2f64.powi(retry_num as i32 - 1)
            }
            Backoff::Fibonacci => self.initial_interval.as_secs_f64() * fib(retry_num) as f64,
        };
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            let offset = rng.gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another attempt may run after a failure
    pub fn should_retry(&self, error: &WorkflowError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if error.is_suspension() || error.is_cancellation() {
            return false;
        }
        match &self.retry_if {
            Some(predicate) => predicate(error),
            None => true,
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Fibonacci number for retry index (1-based: 1, 1, 2, 3, 5, ...)
fn fib(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let schedule = RetrySchedule::exponential().with_jitter(0.0);

        assert_eq!(schedule.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(schedule.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(schedule.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(schedule.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_fibonacci_delays() {
        let schedule = RetrySchedule::fibonacci()
            .with_jitter(0.0)
            .with_max_attempts(10);

        assert_eq!(schedule.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(schedule.delay_for_attempt(3), Duration::from_secs(1));
        assert_eq!(schedule.delay_for_attempt(4), Duration::from_secs(2));
        assert_eq!(schedule.delay_for_attempt(5), Duration::from_secs(3));
        assert_eq!(schedule.delay_for_attempt(6), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_delays() {
        let schedule = RetrySchedule::fixed(Duration::from_secs(5), 4);
        assert_eq!(schedule.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(schedule.delay_for_attempt(4), Duration::from_secs(5));
    }

    #[test]
    fn test_max_interval_cap() {
        let schedule = RetrySchedule::exponential()
            .with_jitter(0.0)
            .with_max_interval(Duration::from_secs(3))
            .with_max_attempts(10);

        assert_eq!(schedule.delay_for_attempt(8), Duration::from_secs(3));
    }

    #[test]
    fn test_attempt_budget() {
        let schedule = RetrySchedule::exponential().with_max_attempts(2);
        let err = WorkflowError::step("Flaky");

        assert!(schedule.should_retry(&err, 1));
        assert!(!schedule.should_retry(&err, 2));
    }

    #[test]
    fn test_predicate_limits_retries() {
        let schedule = RetrySchedule::exponential()
            .with_max_attempts(5)
            .retry_if(|e| matches!(e, WorkflowError::Step { error, .. } if error == "Flaky"));

        assert!(schedule.should_retry(&WorkflowError::step("Flaky"), 1));
        assert!(!schedule.should_retry(&WorkflowError::step("Fatal"), 1));
    }

    #[test]
    fn test_never_retries_suspension_or_cancellation() {
        let schedule = RetrySchedule::exponential().with_max_attempts(5);

        assert!(!schedule.should_retry(&WorkflowError::pending_approval("gate"), 1));
        assert!(!schedule.should_retry(
            &WorkflowError::Cancelled {
                reason: None,
                last_step_key: None
            },
            1
        ));
    }

    #[test]
    fn test_serialization_drops_predicate() {
        let schedule = RetrySchedule::fibonacci()
            .with_max_attempts(7)
            .with_initial_interval(Duration::from_millis(250))
            .retry_if(|_| false);

        let encoded = serde_json::to_string(&schedule).unwrap();
        let parsed: RetrySchedule = serde_json::from_str(&encoded).unwrap();

        assert_eq!(parsed.backoff, Backoff::Fibonacci);
        assert_eq!(parsed.max_attempts, 7);
        assert_eq!(parsed.initial_interval, Duration::from_millis(250));
        // The predicate does not survive the wire
        assert!(parsed.should_retry(&WorkflowError::step("Any"), 1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let schedule = RetrySchedule::exponential().with_jitter(0.5);

        for _ in 0..50 {
            let delay = schedule.delay_for_attempt(2).as_secs_f64();
            assert!((0.5..=1.5).contains(&delay), "delay out of band: {delay}");
        }
    }
}
