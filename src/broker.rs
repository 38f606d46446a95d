// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel
//!
//! The narrow set of broker operations the worker relies on. The production
//! implementation is [`crate::channel::AmqpChannel`] over lapin; tests plug in
//! in-memory implementations.

use crate::{
    envelope::{DeliveryEnvelope, DeliveryTag, Headers},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// Something the broker pushed to a subscription.
#[derive(Debug)]
pub enum ConsumerEvent {
    Delivery(DeliveryEnvelope),
    /// The broker cancelled the consumer (queue deleted, node failover...).
    Cancelled,
    /// The subscription reported an error; the stream may continue.
    Failed(AmqpError),
}

pub type DeliveryStream = BoxStream<'static, ConsumerEvent>;

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub headers: Headers,
    pub content_type: Option<String>,
    pub msg_type: Option<String>,
    pub message_id: Option<String>,
    /// 2 for persistent messages
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub timestamp: Option<u64>,
    /// Per-message time to live.
    pub expiration: Option<Duration>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn subscribe(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), AmqpError>;

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;
}
