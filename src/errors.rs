// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Worker
//!
//! This module provides the error types for broker operations and for consumer
//! setup. The `AmqpError` enum represents failures that can occur while talking
//! to the broker (connection, channel, declarations, acknowledgements, publishing),
//! while `ConfigurationError` describes invalid consumer or topology definitions,
//! which are always detected before any subscription is established.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed.
/// Configuration problems are wrapped in [`AmqpError::Configuration`] so that
/// startup paths can bubble them up with `?`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding an exchange to another exchange
    #[error("failure to binding exchange `{0}` to exchange `{1}`")]
    BindingExchangeToExchangeError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error republishing a message to its retry route
    #[error("failure to publish retry for queue `{0}`")]
    PublishingRetryError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Invalid consumer or topology definition
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Invalid definitions detected at setup time.
///
/// These never surface while a message is being processed: a dispatcher or a
/// topology carrying one of these is refused before touching the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("consumer `{queue}`: prefetch must be between 1 and 65535, got {value}")]
    InvalidPrefetch { queue: String, value: u32 },

    #[error("consumer `{queue}`: batch size must be positive")]
    InvalidBatchSize { queue: String },

    #[error("consumer `{queue}`: batch timeout must be positive")]
    InvalidBatchTimeout { queue: String },

    #[error("consumer `{queue}`: batch timeout requires a batch size")]
    BatchTimeoutWithoutSize { queue: String },

    #[error("consumer `{queue}`: a batch handler requires a batch size")]
    BatchHandlerWithoutBatchSize { queue: String },

    #[error("consumer `{queue}`: a batch size requires a batch handler")]
    SingleHandlerWithBatchSize { queue: String },

    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("queue `{0}` has no dead letter exchange, ttl-backoff retry cannot be synthesized")]
    MissingDeadLetterExchange(String),

    #[error("queue `{queue}`: dead letter routing key `{key}` is also a retry routing key")]
    DeadLetterKeyCollision { queue: String, key: String },

    #[error("consumer `{queue}`: retries need a ttl-backoff retry route to be delayed")]
    MissingRetryRoute { queue: String },

    #[error("consumer `{0}` is registered more than once")]
    DuplicatedConsumer(String),
}
