// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Computes whether a failed message gets another attempt and how long it waits
//! before that attempt. The delay itself is enforced by the broker (TTL-backoff
//! wait queue), never by sleeping in process.

use crate::errors::ConfigurationError;
use rand::Rng;
use std::time::Duration;

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_millis(60000);
pub const DEFAULT_COEFFICIENT: f64 = 2.0;
/// Delay applied to every retry when a consumer declares no retry policy.
pub const LEGACY_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub coefficient: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            kind: BackoffKind::Fixed,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            coefficient: DEFAULT_COEFFICIENT,
        }
    }
}

impl Backoff {
    pub fn fixed(interval: Duration) -> Self {
        Backoff {
            kind: BackoffKind::Fixed,
            initial_interval: interval,
            ..Backoff::default()
        }
    }

    pub fn exponential(initial_interval: Duration) -> Self {
        Backoff {
            kind: BackoffKind::Exponential,
            initial_interval,
            ..Backoff::default()
        }
    }

    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max_interval = max;
        self
    }

    pub fn coefficient(mut self, coefficient: f64) -> Self {
        self.coefficient = coefficient;
        self
    }

    /// Delay before the attempt following `attempt_index` prior ones, clamped
    /// to `max_interval`.
    pub fn delay(&self, attempt_index: u32) -> Duration {
        let delay = match self.kind {
            BackoffKind::Fixed => self.initial_interval,
            BackoffKind::Exponential => {
                let exp = i32::try_from(attempt_index).unwrap_or(i32::MAX);
                let millis = self.initial_interval.as_millis() as f64 * self.coefficient.powi(exp);
                let max = self.max_interval.as_millis() as f64;
                if !millis.is_finite() || millis >= max {
                    self.max_interval
                } else {
                    Duration::from_millis(millis.max(0.0) as u64)
                }
            }
        };

        delay.min(self.max_interval)
    }
}

/// Bounded retry configuration of a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, first delivery included. `None` is unbounded.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: None,
            backoff: Backoff::default(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        RetryPolicy::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigurationError::InvalidRetryPolicy(
                "max attempts must be at least 1".to_owned(),
            ));
        }

        if self.backoff.kind == BackoffKind::Exponential
            && (!self.backoff.coefficient.is_finite() || self.backoff.coefficient <= 1.0)
        {
            return Err(ConfigurationError::InvalidRetryPolicy(format!(
                "exponential coefficient must be a finite number > 1, got {}",
                self.backoff.coefficient
            )));
        }

        if self.backoff.max_interval.is_zero() {
            return Err(ConfigurationError::InvalidRetryPolicy(
                "max interval must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}

/// How a consumer retries failed messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RetryMode {
    /// No policy declared: retry forever, every [`LEGACY_RETRY_DELAY`].
    #[default]
    Legacy,
    Bounded(RetryPolicy),
}

impl From<Option<RetryPolicy>> for RetryMode {
    fn from(policy: Option<RetryPolicy>) -> Self {
        match policy {
            Some(policy) => RetryMode::Bounded(policy),
            None => RetryMode::Legacy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn give_up() -> Self {
        RetryDecision {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decides the fate of a message that failed after `attempt_index` prior attempts.
pub fn should_retry(attempt_index: u32, mode: &RetryMode) -> RetryDecision {
    match mode {
        RetryMode::Legacy => RetryDecision {
            retry: true,
            delay: LEGACY_RETRY_DELAY,
        },
        RetryMode::Bounded(policy) => {
            if let Some(max) = policy.max_attempts {
                if attempt_index.saturating_add(1) >= max {
                    return RetryDecision::give_up();
                }
            }

            let delay = policy.backoff.delay(attempt_index);
            let delay = if policy.jitter {
                apply_jitter(delay, &mut rand::rng())
            } else {
                delay
            };

            RetryDecision { retry: true, delay }
        }
    }
}

/// Equal jitter: keeps half of the delay and randomizes the other half, so the
/// result stays within `[delay / 2, delay]` and never above the clamp.
pub(crate) fn apply_jitter<R: Rng>(delay: Duration, rng: &mut R) -> Duration {
    let millis = delay.as_millis() as u64;
    let half = millis / 2;
    Duration::from_millis(half + rng.random_range(0..=millis - half))
}
