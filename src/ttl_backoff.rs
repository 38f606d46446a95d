// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # TTL-Backoff Retry Infrastructure
//!
//! Derives the extra topology that delays a retried message before it returns
//! to its queue, without relying on a delayed-message broker plugin.
//!
//! ```text
//!  consumer fails ──publish(dlx, "<queue>-wait", expiration = delay)──► <queue>-wait
//!                                                                         │ ttl elapses
//!  <queue> ◄──────────── dlx, routing key "<queue>" ◄─────dead-letter─────┘
//! ```
//!
//! The per-message expiration set by the dispatcher gives each retry its own
//! delay while the wait queue itself stays a plain queue.

use crate::{
    errors::ConfigurationError,
    queue::{QueueBinding, QueueDefinition, TtlBackoffOptions},
};
use tracing::debug;

pub const WAIT_QUEUE_SUFFIX: &str = "-wait";
/// Suffix of the dead letter routing key given to a main queue that sets none.
pub const DEAD_LETTER_KEY_SUFFIX: &str = "-dlq";

/// The main queue together with the wait queue and bindings serving its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWithTtlBackoffInfrastructure {
    pub main_queue: QueueDefinition,
    pub wait_queue: QueueDefinition,
    /// wait queue ← dead letter exchange, keyed by the wait queue name
    pub wait_queue_binding: QueueBinding,
    /// main queue ← dead letter exchange, keyed by the main queue name
    pub main_queue_retry_binding: QueueBinding,
}

impl QueueWithTtlBackoffInfrastructure {
    /// Exchange and routing key a failed message must be published to in order
    /// to wait before its next attempt.
    pub fn retry_route(&self) -> RetryRoute {
        RetryRoute {
            exchange: self.wait_queue_binding.exchange_name.clone(),
            routing_key: self.wait_queue_binding.routing_key.clone(),
        }
    }
}

/// Target of the republish performed for a delayed retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRoute {
    pub exchange: String,
    pub routing_key: String,
}

pub fn wait_queue_name(queue: &str) -> String {
    format!("{queue}{WAIT_QUEUE_SUFFIX}")
}

/// Builds the TTL-backoff infrastructure for `queue`.
///
/// Fails when the queue has no dead letter exchange, before producing anything.
///
/// Messages exhausting their retries are dead-lettered through the same
/// exchange, so their routing key must differ from both retry keys. A main
/// queue without a dead letter routing key gets `<queue>-dlq`; a key equal to
/// `<queue>` or `<queue>-wait` is refused.
pub fn synthesize(
    queue: &QueueDefinition,
) -> Result<QueueWithTtlBackoffInfrastructure, ConfigurationError> {
    let Some(dlx) = queue.dead_letter_config() else {
        return Err(ConfigurationError::MissingDeadLetterExchange(
            queue.name.clone(),
        ));
    };

    let wait_name = wait_queue_name(&queue.name);

    let dead_letter_key = match &dlx.routing_key {
        Some(key) if *key == queue.name || *key == wait_name => {
            return Err(ConfigurationError::DeadLetterKeyCollision {
                queue: queue.name.clone(),
                key: key.clone(),
            });
        }
        Some(key) => key.clone(),
        None => format!("{}{DEAD_LETTER_KEY_SUFFIX}", queue.name),
    };
    let main_queue = queue
        .clone()
        .dead_letter_with_key(&dlx.exchange, &dead_letter_key);

    let options = queue.ttl_backoff.clone().unwrap_or_default();

    // The wait queue is infrastructure: it never carries a retry request itself.
    let mut wait_queue =
        QueueDefinition::new(&wait_name).dead_letter_with_key(&dlx.exchange, &queue.name);
    wait_queue.durable = wait_queue_durability(queue, &options);

    let wait_queue_binding = QueueBinding::new(&wait_name)
        .exchange(&dlx.exchange)
        .routing_key(&wait_name);

    let main_queue_retry_binding = QueueBinding::new(&queue.name)
        .exchange(&dlx.exchange)
        .routing_key(&queue.name);

    debug!(
        queue = %queue.name,
        wait_queue = %wait_name,
        exchange = %dlx.exchange,
        "ttl-backoff infrastructure synthesized"
    );

    Ok(QueueWithTtlBackoffInfrastructure {
        main_queue,
        wait_queue,
        wait_queue_binding,
        main_queue_retry_binding,
    })
}

fn wait_queue_durability(queue: &QueueDefinition, options: &TtlBackoffOptions) -> bool {
    options.wait_queue_durable.unwrap_or(queue.durable)
}
