// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! One dispatcher owns one subscription. It sets the prefetch, subscribes to
//! the queue and routes every delivery either straight to its handler or
//! through a [`BatchAccumulator`], with at most `prefetch` handler invocations
//! in flight.
//!
//! Shutdown stops taking deliveries, flushes a batch still being accumulated,
//! waits for in-flight handlers and finally cancels the subscription.

use crate::{
    batch::{Batch, BatchAccumulator},
    broker::{BrokerChannel, ConsumerEvent, DeliveryStream},
    consumer::{BatchSettings, ConsumerConfig, ConsumerContext, ConsumerSettings},
    envelope::DeliveryEnvelope,
    errors::AmqpError,
    handler::{BatchHandler, ConsumerHandler, Handler},
    shutdown::ShutdownSignal,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

/// Why a dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    Shutdown,
    /// The broker cancelled the consumer.
    Cancelled,
    /// The delivery stream ended.
    StreamClosed,
}

pub struct ConsumerDispatcher {
    broker: Arc<dyn BrokerChannel>,
    settings: ConsumerSettings,
    context: Arc<ConsumerContext>,
    handler: Handler,
}

impl ConsumerDispatcher {
    /// Validates `cfg` against `handler`. Nothing touches the broker until [`Self::run`].
    pub fn new(
        broker: Arc<dyn BrokerChannel>,
        cfg: ConsumerConfig,
        handler: Handler,
    ) -> Result<ConsumerDispatcher, AmqpError> {
        let settings = cfg.validate(&handler)?;
        let context = Arc::new(ConsumerContext::new(broker.clone(), &cfg, &settings));

        Ok(ConsumerDispatcher {
            broker,
            settings,
            context,
            handler,
        })
    }

    pub fn queue(&self) -> &str {
        &self.settings.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.settings.consumer_tag
    }

    /// Consumes until shutdown or until the broker ends the subscription.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<DispatchExit, AmqpError> {
        self.broker.set_prefetch(self.settings.prefetch).await?;

        let stream = self
            .broker
            .subscribe(&self.settings.queue, &self.settings.consumer_tag)
            .await?;

        info!(
            queue = %self.settings.queue,
            prefetch = self.settings.prefetch,
            batch = self.settings.batch.is_some(),
            "consuming"
        );

        let exit = match (&self.handler, self.settings.batch) {
            (Handler::Single(handler), _) => self.dispatch(handler, stream, shutdown).await,
            (Handler::Batch(handler), Some(batch)) => {
                self.dispatch_batches(handler, batch, stream, shutdown).await
            }
            (Handler::Batch(_), None) => {
                // refused by ConsumerConfig::validate
                return Err(AmqpError::InternalError);
            }
        };

        if exit == DispatchExit::Shutdown {
            self.broker.cancel(&self.settings.consumer_tag).await?;
        }

        info!(queue = %self.settings.queue, exit = ?exit, "consumer stopped");
        Ok(exit)
    }

    async fn dispatch(
        &self,
        handler: &Arc<dyn ConsumerHandler>,
        mut stream: DeliveryStream,
        mut shutdown: ShutdownSignal,
    ) -> DispatchExit {
        let permits = Arc::new(Semaphore::new(usize::from(self.settings.prefetch)));
        let mut in_flight = JoinSet::new();

        let exit = loop {
            // Backpressure: no delivery is pulled while `prefetch` handlers run.
            let permit = tokio::select! {
                biased;

                _ = shutdown.wait() => break DispatchExit::Shutdown,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.log_joined(joined);
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break DispatchExit::Shutdown,
                },
            };

            let event = tokio::select! {
                biased;

                _ = shutdown.wait() => break DispatchExit::Shutdown,
                event = stream.next() => event,
            };

            let envelope = match self.classify(event) {
                Ok(envelope) => envelope,
                Err(Some(exit)) => break exit,
                Err(None) => continue,
            };

            let context = self.context.clone();
            let handler = handler.clone();
            in_flight.spawn(async move {
                if let Err(err) = context.consume(&handler, envelope).await {
                    error!(error = err.to_string(), "error consume msg");
                }
                drop(permit);
            });
        };

        self.drain(in_flight).await;
        exit
    }

    async fn dispatch_batches(
        &self,
        handler: &Arc<dyn BatchHandler>,
        batch: BatchSettings,
        mut stream: DeliveryStream,
        mut shutdown: ShutdownSignal,
    ) -> DispatchExit {
        let mut accumulator = BatchAccumulator::new(batch.size, batch.timeout);
        let mut in_flight = JoinSet::new();

        let exit = loop {
            let deadline = accumulator.deadline();

            tokio::select! {
                biased;

                _ = shutdown.wait() => break DispatchExit::Shutdown,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.log_joined(joined);
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    if let Some(flushed) = accumulator.flush_expired(Instant::now()) {
                        debug!(size = flushed.len(), "batch timeout reached");
                        self.spawn_batch(&mut in_flight, handler, flushed);
                    }
                }
                event = stream.next() => match self.classify(event) {
                    Ok(envelope) => {
                        if let Some(full) = accumulator.push(envelope, Instant::now()) {
                            debug!(size = full.len(), "batch size reached");
                            self.spawn_batch(&mut in_flight, handler, full);
                        }
                    }
                    Err(Some(exit)) => break exit,
                    Err(None) => {}
                },
            }
        };

        if let Some(pending) = accumulator.take() {
            info!(
                queue = %self.settings.queue,
                size = pending.len(),
                "flushing incomplete batch on stop"
            );
            self.spawn_batch(&mut in_flight, handler, pending);
        }

        self.drain(in_flight).await;
        exit
    }

    fn spawn_batch(
        &self,
        in_flight: &mut JoinSet<()>,
        handler: &Arc<dyn BatchHandler>,
        batch: Batch,
    ) {
        let context = self.context.clone();
        let handler = handler.clone();
        in_flight.spawn(async move {
            if let Err(err) = context.consume_batch(&handler, batch).await {
                error!(error = err.to_string(), "error consume batch");
            }
        });
    }

    /// Maps a stream item to a delivery, or to the reason the loop must stop.
    ///
    /// `Err(None)` means the item is skipped.
    fn classify(
        &self,
        event: Option<ConsumerEvent>,
    ) -> Result<DeliveryEnvelope, Option<DispatchExit>> {
        match event {
            Some(ConsumerEvent::Delivery(envelope)) => Ok(envelope),
            Some(ConsumerEvent::Cancelled) => {
                warn!(queue = %self.settings.queue, "consumer cancelled by server");
                Err(Some(DispatchExit::Cancelled))
            }
            Some(ConsumerEvent::Failed(err)) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(None)
            }
            None => {
                warn!(queue = %self.settings.queue, "delivery stream closed");
                Err(Some(DispatchExit::StreamClosed))
            }
        }
    }

    fn log_joined(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            error!(error = err.to_string(), queue = %self.settings.queue, "handler task failed");
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if !in_flight.is_empty() {
            info!(
                queue = %self.settings.queue,
                in_flight = in_flight.len(),
                "draining in-flight handlers"
            );
        }

        while let Some(joined) = in_flight.join_next().await {
            self.log_joined(joined);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
