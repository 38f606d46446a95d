// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Consumer configuration and the processing of a single delivery or of a
//! flushed batch:
//! 1. Validates each payload against the consumer's validator
//! 2. Opens a consumer span from the propagated trace context
//! 3. Invokes the handler, turning panics into unknown errors
//! 4. Resolves the outcome against the retry policy
//! 5. Settles the delivery: ack, republish to the retry route then ack, or
//!    reject without requeue so the broker dead-letters it

use crate::{
    batch::{Batch, DEFAULT_BATCH_TIMEOUT},
    broker::{BrokerChannel, MessageProperties},
    envelope::DeliveryEnvelope,
    errors::{AmqpError, ConfigurationError},
    handler::{BatchHandler, ConsumerHandler, ConsumerMessage, Handler, HandlerError},
    otel,
    outcome::{resolve, Action, HandlerOutcome},
    queue::QueueDefinition,
    retry::{RetryMode, RetryPolicy},
    ttl_backoff::{synthesize, RetryRoute},
    validator::{JsonValidator, PayloadValidator},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Prefetch applied when a consumer does not declare one.
pub const DEFAULT_PREFETCH: u16 = 10;

/// Declarative description of a consumer.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub(crate) queue: String,
    pub(crate) consumer_tag: Option<String>,
    pub(crate) validator: Arc<dyn PayloadValidator>,
    pub(crate) prefetch: Option<u32>,
    pub(crate) batch_size: Option<usize>,
    pub(crate) batch_timeout: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) retry_route: Option<RetryRoute>,
}

impl ConsumerConfig {
    /// Consumer of `queue` accepting any JSON payload, without retry route.
    ///
    /// Such a consumer only validates with a retry route or with a policy
    /// allowing a single attempt.
    pub fn new(queue: &str) -> ConsumerConfig {
        ConsumerConfig {
            queue: queue.to_owned(),
            consumer_tag: None,
            validator: Arc::new(JsonValidator),
            prefetch: None,
            batch_size: None,
            batch_timeout: None,
            retry: None,
            retry_route: None,
        }
    }

    /// Consumer of `def`, retrying through its TTL-backoff wait queue when the
    /// queue asks for one.
    pub fn for_queue(def: &QueueDefinition) -> Result<ConsumerConfig, ConfigurationError> {
        let mut cfg = ConsumerConfig::new(def.name());

        if def.ttl_backoff_options().is_some() {
            cfg.retry_route = Some(synthesize(def)?.retry_route());
        }

        Ok(cfg)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn validator(mut self, validator: impl PayloadValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn retry_route(mut self, route: RetryRoute) -> Self {
        self.retry_route = Some(route);
        self
    }

    /// Checks the configuration against the handler shape it will drive.
    pub(crate) fn validate(&self, handler: &Handler) -> Result<ConsumerSettings, ConfigurationError> {
        let prefetch = match self.prefetch {
            None => None,
            Some(value) => match u16::try_from(value) {
                Ok(v) if v >= 1 => Some(v),
                _ => {
                    return Err(ConfigurationError::InvalidPrefetch {
                        queue: self.queue.clone(),
                        value,
                    })
                }
            },
        };

        if self.batch_size == Some(0) {
            return Err(ConfigurationError::InvalidBatchSize {
                queue: self.queue.clone(),
            });
        }

        if let Some(timeout) = self.batch_timeout {
            if self.batch_size.is_none() {
                return Err(ConfigurationError::BatchTimeoutWithoutSize {
                    queue: self.queue.clone(),
                });
            }
            if timeout.is_zero() {
                return Err(ConfigurationError::InvalidBatchTimeout {
                    queue: self.queue.clone(),
                });
            }
        }

        match (handler.is_batch(), self.batch_size.is_some()) {
            (true, false) => {
                return Err(ConfigurationError::BatchHandlerWithoutBatchSize {
                    queue: self.queue.clone(),
                })
            }
            (false, true) => {
                return Err(ConfigurationError::SingleHandlerWithBatchSize {
                    queue: self.queue.clone(),
                })
            }
            _ => {}
        }

        if let Some(policy) = &self.retry {
            policy.validate()?;
        }

        let batch = self.batch_size.map(|size| BatchSettings {
            size,
            timeout: self.batch_timeout.unwrap_or(DEFAULT_BATCH_TIMEOUT),
        });

        // A batch consumer must be allowed to hold a full batch unacknowledged.
        let prefetch = match (prefetch, &batch) {
            (Some(p), _) => p,
            (None, Some(b)) => u16::try_from(b.size).unwrap_or(u16::MAX),
            (None, None) => DEFAULT_PREFETCH,
        };

        if let Some(b) = &batch {
            if usize::from(prefetch) < b.size {
                warn!(
                    queue = %self.queue,
                    prefetch,
                    batch_size = b.size,
                    "prefetch below batch size, batches will be flushed by timeout"
                );
            }
        }

        // Every retry waits in the ttl-backoff queue; none is redelivered at once.
        let retries = self
            .retry
            .as_ref()
            .map_or(true, |policy| policy.max_attempts != Some(1));
        if retries && self.retry_route.is_none() {
            return Err(ConfigurationError::MissingRetryRoute {
                queue: self.queue.clone(),
            });
        }

        Ok(ConsumerSettings {
            queue: self.queue.clone(),
            consumer_tag: self
                .consumer_tag
                .clone()
                .unwrap_or_else(|| format!("{}-consumer", self.queue)),
            prefetch,
            batch,
            retry: RetryMode::from(self.retry.clone()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchSettings {
    pub(crate) size: usize,
    pub(crate) timeout: Duration,
}

/// Validated consumer configuration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConsumerSettings {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) prefetch: u16,
    pub(crate) batch: Option<BatchSettings>,
    pub(crate) retry: RetryMode,
}

/// Everything needed to process and settle deliveries of one consumer.
pub(crate) struct ConsumerContext {
    broker: Arc<dyn BrokerChannel>,
    queue: String,
    validator: Arc<dyn PayloadValidator>,
    retry: RetryMode,
    retry_route: Option<RetryRoute>,
    tracer: BoxedTracer,
}

impl ConsumerContext {
    pub(crate) fn new(
        broker: Arc<dyn BrokerChannel>,
        cfg: &ConsumerConfig,
        settings: &ConsumerSettings,
    ) -> Self {
        ConsumerContext {
            broker,
            queue: settings.queue.clone(),
            validator: cfg.validator.clone(),
            retry: settings.retry.clone(),
            retry_route: cfg.retry_route.clone(),
            tracer: global::tracer(otel::TRACER_NAME),
        }
    }

    /// Processes one delivery with a single-message handler.
    pub(crate) async fn consume(
        &self,
        handler: &Arc<dyn ConsumerHandler>,
        envelope: DeliveryEnvelope,
    ) -> Result<(), AmqpError> {
        let name = envelope.msg_type.clone().unwrap_or_else(|| self.queue.clone());
        let (ctx, mut span) = otel::new_span(&envelope.headers, &self.tracer, &name);

        debug!(
            queue = %self.queue,
            msg_type = %name,
            retry_count = envelope.retry_count(),
            "received message"
        );

        let outcome = match self.validator.validate(&envelope.payload) {
            Err(err) => {
                warn!(queue = %self.queue, error = err.to_string(), "invalid payload");
                HandlerOutcome::ValidationFailure(err.details)
            }
            Ok(payload) => {
                let msg = ConsumerMessage::new(&self.queue, payload, envelope.clone());
                invoke(handler.exec(&ctx, &msg)).await
            }
        };

        let result = self.settle(&envelope, outcome, &mut span).await;
        span.end();
        result
    }

    /// Processes a flushed batch with a batch handler.
    ///
    /// Payloads failing validation are dead-lettered on their own; the handler
    /// sees the rest and its single result settles each of them.
    pub(crate) async fn consume_batch(
        &self,
        handler: &Arc<dyn BatchHandler>,
        batch: Batch,
    ) -> Result<(), AmqpError> {
        let headers = batch
            .envelopes
            .first()
            .map(|e| e.headers.clone())
            .unwrap_or_default();
        let (ctx, mut span) =
            otel::new_span(&headers, &self.tracer, &format!("{} batch", self.queue));

        debug!(queue = %self.queue, size = batch.len(), "received batch");

        let mut first_err = None;
        let mut msgs = Vec::with_capacity(batch.len());

        for envelope in batch.envelopes {
            match self.validator.validate(&envelope.payload) {
                Ok(payload) => msgs.push(ConsumerMessage::new(&self.queue, payload, envelope)),
                Err(err) => {
                    warn!(queue = %self.queue, error = err.to_string(), "invalid payload in batch");
                    let outcome = HandlerOutcome::ValidationFailure(err.details);
                    if let Err(e) = self.settle(&envelope, outcome, &mut span).await {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        if !msgs.is_empty() {
            let outcome = invoke(handler.exec(&ctx, &msgs)).await;

            for msg in &msgs {
                if let Err(e) = self.settle(&msg.envelope, outcome.clone(), &mut span).await {
                    first_err.get_or_insert(e);
                }
            }
        }

        span.end();
        first_err.map_or(Ok(()), Err)
    }

    async fn settle(
        &self,
        envelope: &DeliveryEnvelope,
        outcome: HandlerOutcome,
        span: &mut BoxedSpan,
    ) -> Result<(), AmqpError> {
        match resolve(outcome, envelope.retry_count(), &self.retry) {
            Action::Ack => {
                debug!("message successfully processed");
                self.ack(envelope, span).await?;
                span.set_status(Status::Ok);
                Ok(())
            }
            Action::RetryWithDelay {
                retry_count,
                delay,
                cause,
            } => {
                warn!(
                    queue = %self.queue,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    cause = %cause,
                    "error whiling handling msg, scheduling retry"
                );
                otel::record_failure(span, &cause);

                if let Err(err) = self.publish_retry(envelope, retry_count, delay, &cause).await {
                    // keep the message on the queue rather than losing it
                    if let Err(e) = self.broker.reject(envelope.tag, true).await {
                        span.record_error(&e);
                    }
                    span.record_error(&err);
                    return Err(err);
                }

                self.ack(envelope, span).await
            }
            Action::DeadLetter { reason } => {
                warn!(
                    queue = %self.queue,
                    retry_count = envelope.retry_count(),
                    reason = %reason,
                    "sending message to dead letter"
                );
                otel::record_failure(span, &reason);

                self.broker.reject(envelope.tag, false).await.map_err(|err| {
                    error!(error = err.to_string(), "error whiling reject msg");
                    span.record_error(&err);
                    err
                })
            }
        }
    }

    async fn ack(&self, envelope: &DeliveryEnvelope, span: &mut BoxedSpan) -> Result<(), AmqpError> {
        self.broker.ack(envelope.tag).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg");
            span.record_error(&err);
            otel::record_failure(span, "error to ack msg");
            err
        })
    }

    async fn publish_retry(
        &self,
        envelope: &DeliveryEnvelope,
        retry_count: u32,
        delay: Duration,
        cause: &str,
    ) -> Result<(), AmqpError> {
        // refused by ConsumerConfig::validate
        let Some(route) = &self.retry_route else {
            error!(queue = %self.queue, "retry requested without retry route");
            return Err(AmqpError::PublishingRetryError(self.queue.clone()));
        };

        let properties = MessageProperties {
            headers: envelope.retry_headers(retry_count, cause),
            expiration: Some(delay),
            ..envelope.properties()
        };

        self.broker
            .publish(&route.exchange, &route.routing_key, &envelope.payload, &properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling publishing retry");
                AmqpError::PublishingRetryError(self.queue.clone())
            })
    }
}

/// Runs a handler future, normalizing its result and any panic.
async fn invoke<F>(fut: F) -> HandlerOutcome
where
    F: Future<Output = Result<(), HandlerError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => HandlerOutcome::from(result),
        Err(panic) => {
            let cause = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_owned());
            error!(cause = %cause, "handler panicked");
            HandlerOutcome::UnknownError(cause)
        }
    }
}
