// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Outcome Resolution
//!
//! Maps what happened to a delivery (handler result or validation failure) and
//! its current `retry-count` to the action the dispatcher performs on the broker.

use crate::{
    handler::HandlerError,
    retry::{should_retry, RetryMode},
};
use std::time::Duration;

pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

/// Normalized result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    RetryableError(String),
    NonRetryableError(String),
    ValidationFailure(String),
    UnknownError(String),
}

impl From<Result<(), HandlerError>> for HandlerOutcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => HandlerOutcome::Success,
            Err(HandlerError::Retryable(cause)) => HandlerOutcome::RetryableError(cause),
            Err(HandlerError::NonRetryable(cause)) => HandlerOutcome::NonRetryableError(cause),
            Err(HandlerError::Unknown(cause)) => HandlerOutcome::UnknownError(cause),
        }
    }
}

/// What the dispatcher does with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Ack,
    /// Republish with `retry_count` after `delay`, then ack the original.
    RetryWithDelay {
        retry_count: u32,
        delay: Duration,
        cause: String,
    },
    /// Reject without requeue so the broker dead-letters the message.
    DeadLetter { reason: String },
}

/// Resolves `outcome` for a delivery that already went through `retry_count` retries.
pub fn resolve(outcome: HandlerOutcome, retry_count: u32, mode: &RetryMode) -> Action {
    match outcome {
        HandlerOutcome::Success => Action::Ack,
        HandlerOutcome::ValidationFailure(cause) => Action::DeadLetter {
            reason: format!("validation failure: {cause}"),
        },
        HandlerOutcome::NonRetryableError(cause) => Action::DeadLetter {
            reason: format!("non-retryable error: {cause}"),
        },
        HandlerOutcome::RetryableError(cause) | HandlerOutcome::UnknownError(cause) => {
            let decision = should_retry(retry_count, mode);
            if decision.retry {
                Action::RetryWithDelay {
                    retry_count: retry_count.saturating_add(1),
                    delay: decision.delay,
                    cause,
                }
            } else {
                Action::DeadLetter {
                    reason: MAX_ATTEMPTS_EXCEEDED.to_owned(),
                }
            }
        }
    }
}
