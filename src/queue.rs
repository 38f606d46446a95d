// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for declaring RabbitMQ queues and their bindings.
//! Besides the standard options (durability, TTL, length limits) a queue can
//! carry a dead letter exchange and ask for TTL-backoff retry infrastructure,
//! which the topology installer expands with [`crate::ttl_backoff::synthesize`].

use crate::envelope::HeaderValue;
use std::collections::BTreeMap;

/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument for maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument for maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Where the broker routes messages rejected, expired or dropped by a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub exchange: String,
    pub routing_key: Option<String>,
}

/// TTL-backoff retry request attached to a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TtlBackoffOptions {
    /// Durability of the wait queue. Inherits the main queue's when unset.
    pub wait_queue_durable: Option<bool>,
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter: Option<DeadLetterConfig>,
    pub(crate) ttl_backoff: Option<TtlBackoffOptions>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dead_letter_config(&self) -> Option<&DeadLetterConfig> {
        self.dead_letter.as_ref()
    }

    pub fn ttl_backoff_options(&self) -> Option<&TtlBackoffOptions> {
        self.ttl_backoff.as_ref()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes rejected or expired messages to `exchange`.
    ///
    /// Without a routing key the broker keeps the message's original one.
    pub fn dead_letter(mut self, exchange: &str) -> Self {
        self.dead_letter = Some(DeadLetterConfig {
            exchange: exchange.to_owned(),
            routing_key: None,
        });
        self
    }

    /// Routes rejected or expired messages to `exchange` with `key`.
    pub fn dead_letter_with_key(mut self, exchange: &str, key: &str) -> Self {
        self.dead_letter = Some(DeadLetterConfig {
            exchange: exchange.to_owned(),
            routing_key: Some(key.to_owned()),
        });
        self
    }

    /// Requests the wait queue and bindings that delay retried messages.
    ///
    /// Requires a dead letter exchange; the topology installer refuses the
    /// queue otherwise.
    pub fn with_ttl_backoff(mut self) -> Self {
        self.ttl_backoff = Some(TtlBackoffOptions::default());
        self
    }

    /// Same as [`Self::with_ttl_backoff`] with an explicit wait queue durability.
    pub fn with_ttl_backoff_durability(mut self, durable: bool) -> Self {
        self.ttl_backoff = Some(TtlBackoffOptions {
            wait_queue_durable: Some(durable),
        });
        self
    }

    /// Declaration arguments (`x-*`) derived from the definition.
    pub fn arguments(&self) -> BTreeMap<String, HeaderValue> {
        let mut args = BTreeMap::new();

        if let Some(dlx) = &self.dead_letter {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::from(dlx.exchange.as_str()),
            );
            if let Some(key) = &dlx.routing_key {
                args.insert(
                    AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                    HeaderValue::from(key.as_str()),
                );
            }
        }

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::Int(ttl.into()));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::Int(max.into()));
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::Int(max.into()),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
