//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure inference retrying.
use std::cmp;
use std::time;

use rand::Rng;

use crate::inference::FailureKind;

/// Per-document attempt tracking. One of these lives for the duration of a
/// document's trip through the worker and is dropped with it; it is never
/// shared across documents or batches.
#[derive(Debug, Default, Clone)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inference attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }
}

/// What to do with a failed attempt.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RetryDecision {
    Retry { delay: time::Duration },
    GiveUp,
}

#[derive(Clone, Debug)]
/// A retry policy to determine if and when a failed inference attempt should
/// be tried again.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Upper bound on the random jitter added to every computed backoff.
    pub maximum_jitter: time::Duration,
    /// Total number of attempts allowed per document before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Decide whether the attempt recorded in `state` warrants another try,
    /// and with what delay. Deterministic given `(state, failure)` up to the
    /// bounded jitter term; a zero `maximum_jitter` makes it fully so.
    pub fn decide(&self, state: &RetryState, failure: &FailureKind) -> RetryDecision {
        let budget = match failure {
            // Malformed output may be a fluke, but only give it one retry.
            FailureKind::InvalidResponse => cmp::min(self.max_attempts, 2),
            FailureKind::ExhaustedRetries => return RetryDecision::GiveUp,
            _ => self.max_attempts,
        };

        if state.attempts() >= budget {
            return RetryDecision::GiveUp;
        }

        let preferred = match failure {
            FailureKind::RateLimited { retry_after } => *retry_after,
            _ => None,
        };

        RetryDecision::Retry {
            delay: self.retry_interval(state.attempts(), preferred),
        }
    }

    /// Determine the interval for retrying at a given attempt number. An
    /// endpoint-suggested interval wins over the computed backoff whenever it
    /// is larger.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval =
            self.initial_interval * self.backoff_coefficient.pow(attempt.saturating_sub(1));

        let capped_interval = match self.maximum_interval {
            Some(max_interval) => cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        };

        let jittered_interval = capped_interval + self.jitter();

        match preferred_retry_interval {
            Some(preferred) if preferred > jittered_interval => preferred,
            _ => jittered_interval,
        }
    }

    fn jitter(&self) -> time::Duration {
        if self.maximum_jitter.is_zero() {
            return time::Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.maximum_jitter.as_millis() as u64);
        time::Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub maximum_jitter: time::Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            maximum_jitter: time::Duration::ZERO,
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn maximum_jitter(mut self, jitter: time::Duration) -> RetryPolicyBuilder {
        self.maximum_jitter = jitter;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = max_attempts;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            maximum_jitter: self.maximum_jitter,
            max_attempts: self.max_attempts,
        }
    }
}
