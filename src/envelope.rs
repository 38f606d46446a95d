// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Envelope
//!
//! Transport-neutral view of a message handed over by the broker: the raw
//! payload, its headers and the delivery tag used to settle it.

use crate::broker::MessageProperties;
use std::collections::BTreeMap;

/// Header carrying how many times the logical message was already retried.
pub const RETRY_COUNT_HEADER: &str = "retry-count";
/// Header carrying the description of the last failure that caused a retry.
pub const LAST_FAILURE_HEADER: &str = "x-last-failure";

/// A header value that survives a republish.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Opaque token used to ack or reject a delivery on the channel it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// A message received from the broker.
///
/// Owned by the dispatcher that received it; never shared across consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryEnvelope {
    pub tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// 2 for persistent messages
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub timestamp: Option<u64>,
    pub redelivered: bool,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl DeliveryEnvelope {
    pub fn new(tag: DeliveryTag, payload: impl Into<Vec<u8>>) -> Self {
        DeliveryEnvelope {
            tag,
            exchange: String::new(),
            routing_key: String::new(),
            msg_type: None,
            message_id: None,
            content_type: None,
            delivery_mode: None,
            correlation_id: None,
            timestamp: None,
            redelivered: false,
            headers: Headers::default(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    /// Publish properties reproducing this delivery, headers included.
    pub fn properties(&self) -> MessageProperties {
        MessageProperties {
            headers: self.headers.clone(),
            content_type: self.content_type.clone(),
            msg_type: self.msg_type.clone(),
            message_id: self.message_id.clone(),
            delivery_mode: self.delivery_mode,
            correlation_id: self.correlation_id.clone(),
            timestamp: self.timestamp,
            expiration: None,
        }
    }

    /// Number of retries this message already went through.
    ///
    /// Missing, negative or unparsable values count as zero.
    pub fn retry_count(&self) -> u32 {
        match self.headers.get(RETRY_COUNT_HEADER) {
            Some(HeaderValue::Int(v)) => u32::try_from(*v).unwrap_or(0),
            Some(HeaderValue::String(v)) => v.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Headers for the next attempt of this message.
    pub(crate) fn retry_headers(&self, retry_count: u32, cause: &str) -> Headers {
        let mut headers = self.headers.clone();
        headers.insert(RETRY_COUNT_HEADER.to_owned(), HeaderValue::from(retry_count));
        headers.insert(LAST_FAILURE_HEADER.to_owned(), HeaderValue::from(cause));
        headers
    }
}
