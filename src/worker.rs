// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker
//!
//! Owns the dispatchers of every declared consumer. All of them are validated
//! when the worker is built, so a bad consumer definition prevents the whole
//! worker from starting. Once running, each consumer has its own dispatch loop;
//! stopping the worker drains all of them.

use crate::{
    broker::BrokerChannel,
    consumer::ConsumerConfig,
    dispatcher::{ConsumerDispatcher, DispatchExit},
    errors::{AmqpError, ConfigurationError},
    handler::Handler,
    shutdown::{self, ShutdownHandle},
};
use std::{collections::HashSet, sync::Arc};
use tokio::task::JoinSet;
use tracing::{error, info};

pub struct WorkerBuilder {
    broker: Arc<dyn BrokerChannel>,
    consumers: Vec<(ConsumerConfig, Handler)>,
}

impl WorkerBuilder {
    /// Registers a consumer and the handler processing its messages.
    pub fn consumer(mut self, cfg: ConsumerConfig, handler: Handler) -> Self {
        self.consumers.push((cfg, handler));
        self
    }

    pub fn build(self) -> Result<Worker, AmqpError> {
        let mut tags = HashSet::new();
        let mut dispatchers = Vec::with_capacity(self.consumers.len());

        for (cfg, handler) in self.consumers {
            let dispatcher = ConsumerDispatcher::new(self.broker.clone(), cfg, handler)?;

            if !tags.insert(dispatcher.consumer_tag().to_owned()) {
                return Err(ConfigurationError::DuplicatedConsumer(
                    dispatcher.consumer_tag().to_owned(),
                )
                .into());
            }

            dispatchers.push(Arc::new(dispatcher));
        }

        let (shutdown, _) = shutdown::new_pair();

        Ok(Worker {
            dispatchers,
            shutdown,
        })
    }
}

/// Summary of one consumer after the worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerReport {
    pub queue: String,
    pub exit: DispatchExit,
}

pub struct Worker {
    dispatchers: Vec<Arc<ConsumerDispatcher>>,
    shutdown: ShutdownHandle,
}

impl Worker {
    pub fn builder(broker: Arc<dyn BrokerChannel>) -> WorkerBuilder {
        WorkerBuilder {
            broker,
            consumers: vec![],
        }
    }

    pub fn consumers(&self) -> usize {
        self.dispatchers.len()
    }

    /// Asks every dispatcher to drain and stop.
    pub fn stop(&self) {
        info!("stopping worker");
        self.shutdown.trigger();
    }

    /// Runs every consumer until [`Self::stop`] is called or all of them end.
    ///
    /// A consumer failing at runtime stops the others; the first error is returned
    /// once every dispatcher has drained.
    pub async fn run(&self) -> Result<Vec<ConsumerReport>, AmqpError> {
        let mut running = JoinSet::new();

        for dispatcher in &self.dispatchers {
            let dispatcher = dispatcher.clone();
            let signal = self.shutdown.signal();
            running.spawn(async move {
                let queue = dispatcher.queue().to_owned();
                (queue, dispatcher.run(signal).await)
            });
        }

        info!(consumers = self.dispatchers.len(), "worker started");

        let mut reports = Vec::with_capacity(self.dispatchers.len());
        let mut first_err = None;

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((queue, Ok(exit))) => reports.push(ConsumerReport { queue, exit }),
                Ok((queue, Err(err))) => {
                    error!(error = err.to_string(), queue = %queue, "consumer failed");
                    self.shutdown.trigger();
                    first_err.get_or_insert(err);
                }
                Err(err) => {
                    error!(error = err.to_string(), "tokio process error");
                    self.shutdown.trigger();
                    first_err.get_or_insert(AmqpError::InternalError);
                }
            }
        }

        info!("worker stopped");

        match first_err {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }
}
