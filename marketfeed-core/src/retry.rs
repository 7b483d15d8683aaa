//! Bounded retry with monotonic backoff.
//!
//! Failures are classified by the error type itself ([`Classify`]): only
//! retryable failures consume the retry budget, fatal ones return at once.
//! A throttle signal (HTTP 429) additionally waits the policy's escalated
//! throttle delay before the next attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// How an error should be treated by the retry executor.
pub trait Classify {
    /// Transient failure: timeout, connection reset, rate limit.
    fn is_retryable(&self) -> bool;

    /// Explicit "slow down" signal from the remote side.
    fn is_throttle(&self) -> bool {
        false
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base * 2^(retry-1)`, capped at `max`.
    Doubling { base_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Doubling {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (1-based). Non-decreasing in `retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Doubling { base_ms, max_ms } => {
                let shift = retry.saturating_sub(1).min(32);
                let ms = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(ms.min(max_ms.max(base_ms)))
            }
        }
    }
}

/// Retry budget and schedule for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Extra wait before retrying after a throttle signal.
    pub throttle_wait_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            throttle_wait_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_throttle_wait(mut self, wait: Duration) -> Self {
        self.throttle_wait_ms = wait.as_millis() as u64;
        self
    }
}

/// Blocking sleep, abstracted so tests can run with zero wall-clock time.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Result of a retried operation together with the number of attempts made.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails fatally, or the retry budget is spent.
///
/// `op` receives the 1-based attempt number. On give-up the last error is
/// returned, so callers can still emit a placeholder record for the item.
pub fn run_with_retry<T, E, F>(policy: &RetryPolicy, sleeper: &dyn Sleeper, mut op: F) -> Attempted<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                let mut delay = policy.backoff.delay_for(attempt);
                if e.is_throttle() {
                    delay += Duration::from_millis(policy.throttle_wait_ms);
                }
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                sleeper.sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                debug!(attempt, error = %e, "giving up");
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records requested sleeps instead of sleeping.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[derive(Debug)]
    enum TestError {
        Timeout,
        Throttled,
        Malformed,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Classify for TestError {
        fn is_retryable(&self) -> bool {
            !matches!(self, TestError::Malformed)
        }
        fn is_throttle(&self) -> bool {
            matches!(self, TestError::Throttled)
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Backoff::Doubling {
                base_ms: 100,
                max_ms: 1_000,
            },
            throttle_wait_ms: 0,
        }
    }

    #[test]
    fn succeeds_after_two_transient_failures() {
        let sleeper = RecordingSleeper::default();
        let out = run_with_retry(&policy(3), &sleeper, |attempt| {
            if attempt < 3 {
                Err(TestError::Timeout)
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(out.result.unwrap(), 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn fatal_error_returns_immediately() {
        let sleeper = RecordingSleeper::default();
        let out: Attempted<(), _> = run_with_retry(&policy(3), &sleeper, |_| Err(TestError::Malformed));
        assert!(matches!(out.result, Err(TestError::Malformed)));
        assert_eq!(out.attempts, 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn gives_up_after_budget() {
        let sleeper = RecordingSleeper::default();
        let out: Attempted<(), _> = run_with_retry(&policy(2), &sleeper, |_| Err(TestError::Timeout));
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 3);
        assert_eq!(sleeper.slept.lock().unwrap().len(), 2);
    }

    #[test]
    fn throttle_adds_escalated_wait() {
        let sleeper = RecordingSleeper::default();
        let p = policy(1).with_throttle_wait(Duration::from_secs(10));
        let out: Attempted<(), _> = run_with_retry(&p, &sleeper, |_| Err(TestError::Throttled));
        assert_eq!(out.attempts, 2);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(10_100)]
        );
    }

    #[test]
    fn doubling_backoff_is_capped_and_monotonic() {
        let b = Backoff::Doubling {
            base_ms: 500,
            max_ms: 3_000,
        };
        let delays: Vec<_> = (1..=8).map(|r| b.delay_for(r)).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[2], Duration::from_millis(2_000));
        assert_eq!(delays[7], Duration::from_millis(3_000));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn fixed_backoff_constant() {
        let b = Backoff::Fixed { delay_ms: 250 };
        assert_eq!(b.delay_for(1), b.delay_for(5));
    }

    proptest::proptest! {
        /// Backoff never decreases, whatever the parameters.
        #[test]
        fn backoff_non_decreasing(base in 0u64..10_000, max in 0u64..100_000, retry in 1u32..64) {
            let b = Backoff::Doubling { base_ms: base, max_ms: max };
            proptest::prop_assert!(b.delay_for(retry) <= b.delay_for(retry + 1));
        }
    }
}
