// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Handler traits implemented by applications. A consumer is wired either to a
//! [`ConsumerHandler`], invoked once per message, or to a [`BatchHandler`],
//! invoked once per flushed batch. Both return `Result<(), HandlerError>`; the
//! error variant tells the engine whether the failure is worth a retry.
//! A handler that panics is treated as [`HandlerError::Unknown`].

use crate::envelope::DeliveryEnvelope;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt::Display, sync::Arc};
use thiserror::Error;

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure, retried according to the consumer's retry policy.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Permanent failure, dead-lettered without retry.
    #[error("non-retryable error: {0}")]
    NonRetryable(String),

    /// Anything else. Retried, so that a handler bug does not drop messages.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl HandlerError {
    pub fn retryable(cause: impl Display) -> Self {
        HandlerError::Retryable(cause.to_string())
    }

    pub fn non_retryable(cause: impl Display) -> Self {
        HandlerError::NonRetryable(cause.to_string())
    }

    pub fn unknown(cause: impl Display) -> Self {
        HandlerError::Unknown(cause.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::NonRetryable(err.to_string())
    }
}

/// A validated message handed to a handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub msg_type: String,
    /// Payload as accepted by the consumer's validator.
    pub payload: Value,
    pub envelope: DeliveryEnvelope,
}

impl ConsumerMessage {
    pub fn new(queue: &str, payload: Value, envelope: DeliveryEnvelope) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            msg_type: envelope.msg_type.clone().unwrap_or_default(),
            payload,
            envelope,
        }
    }

    /// Deserializes the validated payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn retry_count(&self) -> u32 {
        self.envelope.retry_count()
    }
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Processes a whole batch. The result applies to every message in it.
    async fn exec(&self, ctx: &Context, msgs: &[ConsumerMessage]) -> Result<(), HandlerError>;
}

/// Handler shape bound to a consumer.
#[derive(Clone)]
pub enum Handler {
    Single(Arc<dyn ConsumerHandler>),
    Batch(Arc<dyn BatchHandler>),
}

impl Handler {
    pub fn single(handler: impl ConsumerHandler + 'static) -> Self {
        Handler::Single(Arc::new(handler))
    }

    pub fn batch(handler: impl BatchHandler + 'static) -> Self {
        Handler::Batch(Arc::new(handler))
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Handler::Batch(_))
    }
}
