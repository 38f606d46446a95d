// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker shared by the integration tests.
//!
//! Deliveries are fed per queue through an unbounded channel. Every settlement
//! and publish is recorded. With loopback enabled, a message published to a
//! wait queue route (or straight to a queue through the default exchange) is
//! delivered again to its main queue with the published headers, the way the
//! wait queue dead-letters it back after its TTL.

#![allow(dead_code)]

use amqp_worker::{
    broker::{BrokerChannel, ConsumerEvent, DeliveryStream, MessageProperties},
    consumer::ConsumerConfig,
    envelope::{DeliveryEnvelope, DeliveryTag},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    ttl_backoff::WAIT_QUEUE_SUFFIX,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub prefetch: Vec<u16>,
    pub subscribed: Vec<(String, String)>,
    pub cancelled: Vec<String>,
    pub acks: Vec<u64>,
    pub rejects: Vec<(u64, bool)>,
    pub published: Vec<Published>,
}

impl Recorded {
    pub fn settled(&self) -> usize {
        self.acks.len() + self.rejects.len()
    }
}

#[derive(Default)]
pub struct FakeBroker {
    recorded: Mutex<Recorded>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<ConsumerEvent>>>,
    receivers: Mutex<HashMap<String, mpsc::UnboundedReceiver<ConsumerEvent>>>,
    next_tag: AtomicU64,
    loopback: bool,
    fail_publish: bool,
    changed: Notify,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    /// Broker redelivering retries to their main queue.
    pub fn with_loopback() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            loopback: true,
            ..FakeBroker::default()
        })
    }

    /// Broker refusing every publish.
    pub fn failing_publish() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            fail_publish: true,
            ..FakeBroker::default()
        })
    }

    /// Opens the delivery feed of `queue`. Dropping every sender ends the stream.
    pub fn feed(&self, queue: &str) -> mpsc::UnboundedSender<ConsumerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap()
            .insert(queue.to_owned(), tx.clone());
        self.receivers.lock().unwrap().insert(queue.to_owned(), rx);
        tx
    }

    /// Pushes a delivery with a fresh tag and returns that tag.
    pub fn deliver(&self, queue: &str, envelope: DeliveryEnvelope) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = DeliveryEnvelope {
            tag: DeliveryTag(tag),
            ..envelope
        };

        if let Some(tx) = self.senders.lock().unwrap().get(queue) {
            let _ = tx.send(ConsumerEvent::Delivery(envelope));
        }

        tag
    }

    /// Drops the broker side sender so the stream ends once drained.
    pub fn close(&self, queue: &str) {
        self.senders.lock().unwrap().remove(queue);
    }

    pub fn recorded(&self) -> Recorded {
        self.recorded.lock().unwrap().clone()
    }

    /// Waits until `pred` holds on the recorded interactions.
    pub async fn wait_until(&self, pred: impl Fn(&Recorded) -> bool) {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if pred(&self.recorded.lock().unwrap()) {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(WAIT_TIMEOUT, wait)
            .await
            .expect("condition not reached in time");
    }

    fn record(&self, f: impl FnOnce(&mut Recorded)) {
        f(&mut self.recorded.lock().unwrap());
        self.changed.notify_waiters();
    }

    fn redeliver(&self, exchange: &str, routing_key: &str, payload: &[u8], props: &MessageProperties) {
        let queue = if exchange.is_empty() {
            routing_key
        } else {
            match routing_key.strip_suffix(WAIT_QUEUE_SUFFIX) {
                Some(queue) => queue,
                None => return,
            }
        };

        let mut envelope = DeliveryEnvelope::new(DeliveryTag(0), payload.to_vec());
        envelope.headers = props.headers.clone();
        envelope.msg_type = props.msg_type.clone();
        envelope.message_id = props.message_id.clone();
        envelope.content_type = props.content_type.clone();
        envelope.delivery_mode = props.delivery_mode;
        envelope.correlation_id = props.correlation_id.clone();
        envelope.timestamp = props.timestamp;
        self.deliver(queue, envelope);
    }
}

#[async_trait]
impl BrokerChannel for FakeBroker {
    async fn declare_exchange(&self, _def: &ExchangeDefinition) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn declare_queue(&self, _def: &QueueDefinition) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn bind_queue(&self, _binding: &QueueBinding) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn bind_exchange(&self, _binding: &ExchangeBinding) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.record(|r| r.prefetch.push(count));
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let rx = self
            .receivers
            .lock()
            .unwrap()
            .remove(queue)
            .ok_or_else(|| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;

        self.record(|r| r.subscribed.push((queue.to_owned(), consumer_tag.to_owned())));

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.record(|r| r.cancelled.push(consumer_tag.to_owned()));
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), AmqpError> {
        self.record(|r| r.acks.push(tag.0));
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), AmqpError> {
        self.record(|r| r.rejects.push((tag.0, requeue)));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        if self.fail_publish {
            return Err(AmqpError::PublishingError);
        }

        self.record(|r| {
            r.published.push(Published {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload: payload.to_vec(),
                properties: properties.clone(),
            })
        });

        if self.loopback {
            self.redeliver(exchange, routing_key, payload, properties);
        }

        Ok(())
    }
}

/// Consumer of `queue` retrying through `<queue>-dlx` and its wait queue.
pub fn consumer(queue: &str) -> ConsumerConfig {
    let def = QueueDefinition::new(queue)
        .dead_letter(&format!("{queue}-dlx"))
        .with_ttl_backoff();
    ConsumerConfig::for_queue(&def).expect("queue with dead letter exchange")
}

/// A JSON delivery; the tag is assigned by [`FakeBroker::deliver`].
pub fn json(payload: &str) -> DeliveryEnvelope {
    DeliveryEnvelope::new(DeliveryTag(0), payload.as_bytes().to_vec())
}

/// Runs `fut` with the shared test deadline.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT_TIMEOUT, fut)
        .await
        .expect("future did not complete in time")
}
