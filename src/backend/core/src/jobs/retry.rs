//! Retry policies with backoff.
//!
//! Two independent layers use the same [`RetryPolicy`] type:
//!
//! - the executor retries whole handler invocations of a job;
//! - handlers may retry individual work items with [`RetryPolicy::run`],
//!   which knows nothing about job state.
//!
//! Every [`BackoffStrategy`] yields delays that never decrease as the attempt
//! number grows.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Linear increase in delay (initial + increment * retry)
    Linear {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// Exponential increase in delay (initial * multiplier^retry), capped
    Exponential {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear {
                initial_delay,
                increment,
            } => initial_delay.saturating_add(increment.saturating_mul(attempt)),
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if initial_delay.is_zero() {
                    return Duration::ZERO;
                }
                // A multiplier below 1.0 would shrink the delay.
                let factor = multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
                let secs = (initial_delay.as_secs_f64() * factor).min(max_delay.as_secs_f64());
                Duration::try_from_secs_f64(secs).unwrap_or(*max_delay)
            }
        }
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Create an exponential backoff strategy with sensible defaults.
    pub fn exponential() -> Self {
        Self::default()
    }

    /// No delay between attempts.
    pub fn none() -> Self {
        Self::Fixed {
            delay: Duration::ZERO,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of invocations allowed, including the first (1 = no retries)
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Create a policy with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with a specific number of attempts and default backoff.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Check if another attempt may follow the given (1-indexed) failed attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the given (1-indexed) failed attempt.
    pub fn delay_before_retry(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-indexed attempt number. On exhaustion the last
    /// error is returned.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(_) if self.should_retry(attempt) => {
                    let delay = self.delay_before_retry(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
