// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages to exchanges, tagging each with a fresh message id and
//! propagating the caller's OpenTelemetry context in the headers.

use crate::{
    broker::{BrokerChannel, MessageProperties},
    envelope::Headers,
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode of messages written to disk by the broker
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message ready to be published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    /// Target exchange
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: Option<Headers>,
}

impl PublishMessage {
    /// Serializes `payload` as JSON for `exchange` with `key`.
    pub fn json<T: Serialize>(exchange: &str, key: &str, payload: &T) -> Result<Self, AmqpError> {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "error serializing payload");
            AmqpError::PublishingError
        })?;

        Ok(PublishMessage {
            to: exchange.to_owned(),
            key: Some(key.to_owned()),
            data,
            ..PublishMessage::default()
        })
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError>;
}

pub struct RabbitMQPublisher {
    broker: Arc<dyn BrokerChannel>,
}

impl RabbitMQPublisher {
    pub fn new(broker: Arc<dyn BrokerChannel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { broker })
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let mut headers = Headers::new();
        otel::inject_context(ctx, &mut headers);

        if let Some(extra) = &infos.headers {
            headers.extend(extra.clone());
        }

        let properties = MessageProperties {
            headers,
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            msg_type: infos.msg_type.clone(),
            message_id: Some(Uuid::new_v4().to_string()),
            delivery_mode: Some(PERSISTENT_DELIVERY_MODE),
            ..MessageProperties::default()
        };

        let key = infos.key.clone().unwrap_or_default();
        debug!(exchange = %infos.to, key = %key, "publishing message");

        self.broker
            .publish(&infos.to, &key, &infos.data, &properties)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBrokerChannel, envelope::HeaderValue};
    use serde_json::json;

    #[tokio::test]
    async fn publishes_json_with_message_id_and_extra_headers() {
        let mut broker = MockBrokerChannel::new();
        broker
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange == "orders"
                    && key == "order.created"
                    && payload == br#"{"id":1}"#.as_slice()
                    && props.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
                    && props.msg_type.as_deref() == Some("OrderCreated")
                    && props.message_id.is_some()
                    && props.expiration.is_none()
                    && props.delivery_mode == Some(PERSISTENT_DELIVERY_MODE)
                    && props.headers.get("tenant") == Some(&HeaderValue::from("acme"))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let msg = PublishMessage::json("orders", "order.created", &json!({ "id": 1 }))
            .unwrap()
            .msg_type("OrderCreated")
            .headers(Headers::from([("tenant".to_owned(), HeaderValue::from("acme"))]));

        let publisher = RabbitMQPublisher::new(Arc::new(broker));
        publisher.publish(&Context::new(), &msg).await.unwrap();
    }

    #[tokio::test]
    async fn broker_failure_is_returned() {
        let mut broker = MockBrokerChannel::new();
        broker
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));

        let msg = PublishMessage::json("orders", "k", &json!({})).unwrap();
        let publisher = RabbitMQPublisher::new(Arc::new(broker));

        assert_eq!(
            publisher.publish(&Context::new(), &msg).await,
            Err(AmqpError::PublishingError)
        );
    }
}
