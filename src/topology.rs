// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module installs exchanges, queues and the bindings between them.
//! Queues declared with TTL-backoff are expanded with their wait queue and
//! retry bindings before anything is sent to the broker, so a queue missing
//! its dead letter exchange fails the installation up front.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over a [`BrokerChannel`]

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    ttl_backoff::synthesize,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds an exchange-to-exchange binding to the topology.
    fn exchange_binding(self, binding: &'tp ExchangeBinding) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Everything the broker will be asked to declare, in order.
#[derive(Debug, Default, PartialEq)]
pub struct InstallPlan {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub exchange_bindings: Vec<ExchangeBinding>,
    pub queue_bindings: Vec<QueueBinding>,
}

pub struct AmqpTopology<'tp> {
    broker: Arc<dyn BrokerChannel>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
    pub(crate) exchanges_binding: Vec<&'tp ExchangeBinding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(broker: Arc<dyn BrokerChannel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            broker,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
            exchanges_binding: vec![],
        }
    }

    /// Expands the registered definitions, synthesizing TTL-backoff infrastructure.
    pub fn plan(&self) -> Result<InstallPlan, AmqpError> {
        let mut plan = InstallPlan {
            exchanges: self.exchanges.iter().map(|d| (*d).clone()).collect(),
            exchange_bindings: self.exchanges_binding.iter().map(|b| (*b).clone()).collect(),
            ..InstallPlan::default()
        };

        let mut retry_bindings = vec![];

        for def in &self.queues {
            if def.ttl_backoff_options().is_none() {
                plan.queues.push((*def).clone());
                continue;
            }

            let infra = synthesize(def)?;
            plan.queues.push(infra.main_queue);
            plan.queues.push(infra.wait_queue);
            retry_bindings.push(infra.wait_queue_binding);
            retry_bindings.push(infra.main_queue_retry_binding);
        }

        plan.queue_bindings = self.queues_binding.iter().map(|b| (*b).clone()).collect();
        plan.queue_bindings.extend(retry_bindings);

        Ok(plan)
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn exchange_binding(mut self, binding: &'tp ExchangeBinding) -> Self {
        self.exchanges_binding.push(binding);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Plans the installation, failing on invalid TTL-backoff queues
    /// 2. Creates all exchanges
    /// 3. Creates all queues (including synthesized wait queues)
    /// 4. Sets up exchange-to-exchange bindings
    /// 5. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        let plan = self.plan()?;

        for exch in &plan.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.broker.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        for queue in &plan.queues {
            debug!("creating queue: {}", queue.name);
            self.broker.declare_queue(queue).await?;
            debug!("queue: {} was created", queue.name);
        }

        for binding in &plan.exchange_bindings {
            debug!(
                "binding exchange: {} to the exchange: {} with the key: {}",
                binding.destination, binding.source, binding.routing_key
            );
            self.broker.bind_exchange(binding).await?;
        }

        for binding in &plan.queue_bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.broker.bind_queue(binding).await?;
        }

        debug!("topology installed");

        Ok(())
    }
}
