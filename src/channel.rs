// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels and
//! implements [`BrokerChannel`] on top of a lapin channel, translating the
//! worker's definitions, headers and properties into their AMQP counterparts.

use crate::{
    broker::{BrokerChannel, ConsumerEvent, DeliveryStream, MessageProperties},
    configs::Configs,
    envelope::{DeliveryEnvelope, DeliveryTag, HeaderValue, Headers},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Creates a new AMQP connection and channel from `cfg`.
///
/// The connection is named after the application so it can be told apart in
/// the broker management UI.
pub async fn new_amqp_channel(
    cfg: &Configs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    let conn = match Connection::connect(&cfg.rabbitmq.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// [`BrokerChannel`] backed by a lapin channel.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Arc<Channel>,
}

impl AmqpChannel {
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpChannel> {
        Arc::new(AmqpChannel { channel })
    }

    /// Connects with `cfg` and wraps the resulting channel.
    pub async fn connect(cfg: &Configs) -> Result<(Arc<Connection>, Arc<AmqpChannel>), AmqpError> {
        let (conn, channel) = new_amqp_channel(cfg).await?;
        Ok((conn, AmqpChannel::new(channel)))
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                field_table(&def.params),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                field_table(&def.arguments()),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn bind_exchange(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                AmqpError::BindingExchangeToExchangeError(
                    binding.source.clone(),
                    binding.destination.clone(),
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        let name = queue.to_owned();
        let deliveries = consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(envelope_from_delivery(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), queue = %name, "consumer stream failed");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed();

        Ok(consumer_events(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::ConsumerCancelError(consumer_tag.to_owned())
            })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(tag.0, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }
}

/// Turns lapin deliveries into consumer events.
///
/// lapin ends the stream cleanly when the broker cancels the consumer, which
/// becomes [`ConsumerEvent::Cancelled`]. A stream ending right after an error
/// (lost connection, closed channel) just ends.
fn consumer_events<S>(deliveries: S) -> DeliveryStream
where
    S: Stream<Item = Result<DeliveryEnvelope, AmqpError>> + Send + Unpin + 'static,
{
    stream::unfold((Some(deliveries), false), |(deliveries, failed)| async move {
        let mut deliveries = deliveries?;
        match deliveries.next().await {
            Some(Ok(envelope)) => Some((ConsumerEvent::Delivery(envelope), (Some(deliveries), false))),
            Some(Err(err)) => Some((ConsumerEvent::Failed(err), (Some(deliveries), true))),
            None if failed => None,
            None => Some((ConsumerEvent::Cancelled, (None, false))),
        }
    })
    .boxed()
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(field_table(&props.headers));

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(msg_type) = &props.msg_type {
        basic = basic.with_type(ShortString::from(msg_type.as_str()));
    }
    if let Some(message_id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.as_str()));
    }
    if let Some(delivery_mode) = props.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    if let Some(correlation_id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(timestamp) = props.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(expiration) = props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }

    basic
}

fn field_table(values: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = values
        .iter()
        .map(|(key, value)| (ShortString::from(key.as_str()), amqp_value(value)))
        .collect();

    FieldTable::from(table)
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
    }
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::Float(v) => Some(HeaderValue::Float(f64::from(*v))),
        AMQPValue::Double(v) => Some(HeaderValue::Float(*v)),
        AMQPValue::ShortString(v) => Some(HeaderValue::String(v.to_string())),
        AMQPValue::LongString(v) => Some(HeaderValue::String(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

fn headers_from_properties(props: &BasicProperties) -> Headers {
    props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_value(value).map(|value| (key.to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn envelope_from_delivery(delivery: Delivery) -> DeliveryEnvelope {
    DeliveryEnvelope {
        tag: DeliveryTag(delivery.delivery_tag),
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        msg_type: delivery.properties.kind().as_ref().map(|v| v.to_string()),
        message_id: delivery.properties.message_id().as_ref().map(|v| v.to_string()),
        content_type: delivery.properties.content_type().as_ref().map(|v| v.to_string()),
        delivery_mode: *delivery.properties.delivery_mode(),
        correlation_id: delivery.properties.correlation_id().as_ref().map(|v| v.to_string()),
        timestamp: *delivery.properties.timestamp(),
        redelivered: delivery.redelivered,
        headers: headers_from_properties(&delivery.properties),
        payload: delivery.data,
    }
}
