//! Pluggable retry pacing for connection recovery.
//!
//! A policy is a pure decision function: the caller supplies the attempt
//! count and the last failure, the policy answers whether to try again and
//! how long to wait first. Randomness may perturb the wait (jitter) but never
//! the boolean.

use std::{fmt, time::Duration};

use rand::Rng;

use crate::{connection::ConnectionError, transport::TransportError};

/// Outcome of one retry decision. Produced fresh per call, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made.
    pub should_retry: bool,
    /// How long to wait before that attempt.
    pub delay: Duration,
}

impl RetryDecision {
    /// Retry after `delay`.
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }

    /// Stop retrying.
    pub fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decides whether and when a failed connection should be retried.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Decide for attempt number `attempt` (zero-based count of attempts
    /// already made), given the most recent failure.
    fn decide(&self, attempt: u32, last_error: Option<&ConnectionError>) -> RetryDecision;
}

/// Policy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _attempt: u32, _last_error: Option<&ConnectionError>) -> RetryDecision {
        RetryDecision::give_up()
    }
}

/// Exponential backoff with uniformly jittered growth.
///
/// The wait for attempt `n` is
/// `min(min_backoff + (2^n - 1) * U[0.8, 1.2) * delta_backoff, max_backoff)`,
/// which grows exponentially while the jitter keeps a fleet of devices
/// recovering from the same outage from reconnecting in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffWithJitter {
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    delta_backoff: Duration,
    first_attempt_fast: bool,
}

impl ExponentialBackoffWithJitter {
    /// Build a policy. Fails when `max_attempts` is zero.
    pub fn new(
        max_attempts: u32,
        min_backoff: Duration,
        max_backoff: Duration,
        delta_backoff: Duration,
        first_attempt_fast: bool,
    ) -> Result<Self, TransportError> {
        if max_attempts == 0 {
            return Err(TransportError::InvalidArgument(
                "max_attempts must be greater than zero",
            ));
        }
        Ok(Self {
            max_attempts,
            min_backoff,
            max_backoff,
            delta_backoff,
            first_attempt_fast,
        })
    }
}

impl Default for ExponentialBackoffWithJitter {
    /// Effectively unlimited attempts, 100 ms..10 s window, immediate first
    /// retry.
    fn default() -> Self {
        Self {
            max_attempts: u32::MAX,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            delta_backoff: Duration::from_millis(100),
            first_attempt_fast: true,
        }
    }
}

impl RetryPolicy for ExponentialBackoffWithJitter {
    fn decide(&self, attempt: u32, _last_error: Option<&ConnectionError>) -> RetryDecision {
        if attempt == 0 && self.first_attempt_fast {
            return RetryDecision::retry_after(Duration::ZERO);
        }
        if attempt >= self.max_attempts {
            return RetryDecision::give_up();
        }

        let delta = self.delta_backoff.as_secs_f64();
        let lo = delta * 0.8;
        let hi = delta * 1.2;
        let jitter = if hi > lo {
            rand::thread_rng().gen_range(0.0..(hi - lo))
        } else {
            0.0
        };
        // 2^attempt - 1, saturating well past the point where max_backoff
        // caps the result anyway.
        let growth = if attempt >= 63 {
            u64::MAX as f64
        } else {
            ((1u64 << attempt) - 1) as f64
        };
        let wait = self.min_backoff.as_secs_f64() + growth * (jitter + lo);
        let wait = wait.min(self.max_backoff.as_secs_f64());
        RetryDecision::retry_after(Duration::from_secs_f64(wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_always_gives_up() {
        let policy = NoRetry;
        for attempt in [0, 1, 7] {
            let decision = policy.decide(attempt, None);
            assert!(!decision.should_retry);
        }
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let result = ExponentialBackoffWithJitter::new(
            0,
            Duration::from_millis(10),
            Duration::from_secs(1),
            Duration::from_millis(10),
            true,
        );
        assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
    }

    #[test]
    fn first_attempt_fast_is_immediate() {
        let policy = ExponentialBackoffWithJitter::default();
        let err = ConnectionError::Lost("network down".into());
        for last_error in [None, Some(&err)] {
            let decision = policy.decide(0, last_error);
            assert!(decision.should_retry);
            assert_eq!(decision.delay, Duration::ZERO);
        }
    }

    #[test]
    fn attempts_at_or_past_limit_give_up() {
        let policy = ExponentialBackoffWithJitter::new(
            3,
            Duration::from_millis(10),
            Duration::from_secs(1),
            Duration::from_millis(10),
            true,
        )
        .unwrap();
        assert!(policy.decide(2, None).should_retry);
        assert!(!policy.decide(3, None).should_retry);
        assert!(!policy.decide(100, None).should_retry);
    }

    #[test]
    fn backoff_grows_monotonically_and_stays_bounded() {
        let min = Duration::from_millis(50);
        let max = Duration::from_secs(5);
        let policy = ExponentialBackoffWithJitter::new(
            1000,
            min,
            max,
            Duration::from_millis(20),
            false,
        )
        .unwrap();

        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let decision = policy.decide(attempt, None);
            assert!(decision.should_retry);
            assert!(decision.delay >= min);
            assert!(decision.delay <= max);
            // The jitter band is narrow enough that the worst draw for
            // attempt n+1 still exceeds the best draw for attempt n.
            assert!(
                decision.delay >= previous.min(max),
                "attempt {attempt}: {:?} < {previous:?}",
                decision.delay
            );
            previous = decision.delay;
        }
    }

    #[test]
    fn jitter_never_flips_the_decision() {
        let policy = ExponentialBackoffWithJitter::new(
            5,
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_millis(10),
            false,
        )
        .unwrap();
        for _ in 0..200 {
            assert!(policy.decide(4, None).should_retry);
            assert!(!policy.decide(5, None).should_retry);
        }
    }
}
