//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::{duration_millis, option_duration_millis};

/// Default number of attempts (including the initial one)
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(1000);

/// Shape of the delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles after every failed attempt
    Exponential,
}

/// Delay function applied between attempts
///
/// Serialized as `{"type": "exponential", "delay": 1000}` so that stored
/// job instances stay readable by operators.
///
/// # Example
///
/// ```
/// use laneq::Backoff;
/// use std::time::Duration;
///
/// let backoff = Backoff::exponential(Duration::from_secs(1));
///
/// assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(1));
/// assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(2));
/// assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    /// Fixed or exponential
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay (the delay before the first retry)
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    #[serde(default)]
    pub jitter: f64,

    /// Upper bound for a single delay
    #[serde(
        default,
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF_DELAY)
    }
}

impl Backoff {
    /// Exponential backoff starting at `delay`, no jitter
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
            jitter: 0.0,
            max_delay: None,
        }
    }

    /// Constant delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
            jitter: 0.0,
            max_delay: None,
        }
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Cap every computed delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Calculate the delay before a given attempt number (1-based)
    ///
    /// Attempt 1 is the initial delivery and has no delay. For exponential
    /// backoff the delay before attempt `k + 1` is `delay * 2^(k - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // First retry is after attempt 1
        let base = match self.kind {
            BackoffKind::Fixed => self.delay.as_secs_f64(),
            BackoffKind::Exponential => {
                let exponent = (retry_num - 1).min(i32::MAX as u32) as i32;
                self.delay.as_secs_f64() * 2f64.powi(exponent)
            }
        };
        let capped = match self.max_delay {
            Some(max) => base.min(max.as_secs_f64()),
            None => base,
        };

        // Apply jitter
        let jitter_range = capped * self.jitter;
        let jittered = if jitter_range > 0.0 && jitter_range.is_finite() {
            let mut rng = rand::thread_rng();
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(Duration::MAX)
    }
}

/// Attempts plus backoff, the default policy attached to a job definition
///
/// # Example
///
/// ```
/// use laneq::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_attempts(5)
///     .with_backoff(Backoff::fixed(Duration::from_secs(10)));
///
/// assert!(policy.has_attempts_remaining(4));
/// assert!(!policy.has_attempts_remaining(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub attempts: u32,

    /// Delay function between attempts
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::fixed(Duration::ZERO),
        }
    }

    /// Set the maximum number of attempts
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the backoff
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.attempts
    }

    /// Delay before the given attempt number (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff.kind, BackoffKind::Exponential);
        assert_eq!(policy.backoff.delay, Duration::from_millis(1000));
        assert_eq!(policy.backoff.jitter, 0.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_exponential_delays() {
        let backoff = Backoff::exponential(Duration::from_millis(1000));

        // Attempt 1 (initial) has no delay
        assert_eq!(backoff.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(4000));
    }

    #[test]
    fn test_fixed_interval() {
        let backoff = Backoff::fixed(Duration::from_secs(5));

        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[test]
    fn test_max_delay_cap() {
        let backoff =
            Backoff::exponential(Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));

        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = Backoff::exponential(Duration::from_millis(1000)).with_jitter(0.1);

        for _ in 0..100 {
            let delay = backoff.delay_for_attempt(3);
            assert!(delay >= Duration::from_millis(1800), "{delay:?}");
            assert!(delay <= Duration::from_millis(2200), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_with_zero_delay() {
        let backoff = Backoff::fixed(Duration::ZERO).with_jitter(0.5);
        assert_eq!(backoff.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::default().with_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_wire_format() {
        let backoff = Backoff::exponential(Duration::from_millis(1000));
        let json = serde_json::to_value(&backoff).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "exponential", "delay": 1000, "jitter": 0.0})
        );

        let parsed: Backoff =
            serde_json::from_value(serde_json::json!({"type": "fixed", "delay": 250})).unwrap();
        assert_eq!(parsed, Backoff::fixed(Duration::from_millis(250)));
    }
}
