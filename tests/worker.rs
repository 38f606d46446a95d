// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use amqp_worker::{
    dispatcher::DispatchExit,
    errors::{AmqpError, ConfigurationError},
    handler::{BatchHandler, ConsumerHandler, ConsumerMessage, Handler, HandlerError},
    worker::{ConsumerReport, Worker},
};
use async_trait::async_trait;
use common::{consumer, json, within, FakeBroker};
use opentelemetry::Context;
use std::sync::Arc;

struct Accept;

#[async_trait]
impl ConsumerHandler for Accept {
    async fn exec(&self, _ctx: &Context, _msg: &ConsumerMessage) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for Accept {
    async fn exec(&self, _ctx: &Context, _msgs: &[ConsumerMessage]) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[test]
fn duplicated_consumer_tags_are_rejected() {
    let broker = FakeBroker::new();

    let built = Worker::builder(broker)
        .consumer(consumer("orders"), Handler::single(Accept))
        .consumer(consumer("orders"), Handler::single(Accept))
        .build();

    match built {
        Err(err) => assert_eq!(
            err,
            AmqpError::Configuration(ConfigurationError::DuplicatedConsumer(
                "orders-consumer".to_owned()
            ))
        ),
        Ok(_) => panic!("duplicated consumer accepted"),
    }
}

#[test]
fn invalid_consumer_prevents_the_worker_from_building() {
    let broker = FakeBroker::new();

    let built = Worker::builder(broker)
        .consumer(consumer("orders"), Handler::single(Accept))
        .consumer(consumer("events"), Handler::batch(Accept))
        .build();

    assert!(matches!(
        built,
        Err(AmqpError::Configuration(
            ConfigurationError::BatchHandlerWithoutBatchSize { .. }
        ))
    ));
}

#[tokio::test]
async fn stop_drains_every_consumer() {
    let broker = FakeBroker::new();
    let _orders = broker.feed("orders");
    let _events = broker.feed("events");

    let worker = Worker::builder(broker.clone())
        .consumer(consumer("orders"), Handler::single(Accept))
        .consumer(
            consumer("events").consumer_tag("events-bulk").batch_size(2),
            Handler::batch(Accept),
        )
        .build()
        .unwrap();
    assert_eq!(worker.consumers(), 2);

    let worker = Arc::new(worker);
    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    broker.deliver("orders", json("{}"));
    broker.deliver("events", json("{}"));
    broker.deliver("events", json("{}"));
    broker.wait_until(|r| r.acks.len() == 3).await;

    worker.stop();
    let mut reports = within(running).await.unwrap().unwrap();
    reports.sort_by(|a, b| a.queue.cmp(&b.queue));

    assert_eq!(
        reports,
        vec![
            ConsumerReport {
                queue: "events".to_owned(),
                exit: DispatchExit::Shutdown,
            },
            ConsumerReport {
                queue: "orders".to_owned(),
                exit: DispatchExit::Shutdown,
            },
        ]
    );

    let mut cancelled = broker.recorded().cancelled;
    cancelled.sort();
    assert_eq!(cancelled, vec!["events-bulk".to_owned(), "orders-consumer".to_owned()]);
}

#[tokio::test]
async fn failing_consumer_stops_the_others() {
    let broker = FakeBroker::new();
    let _orders = broker.feed("orders");

    // no feed for "missing": subscribing fails
    let worker = Worker::builder(broker.clone())
        .consumer(consumer("orders"), Handler::single(Accept))
        .consumer(consumer("missing"), Handler::single(Accept))
        .build()
        .unwrap();

    let result = within(worker.run()).await;

    assert_eq!(
        result,
        Err(AmqpError::ConsumerDeclarationError("missing".to_owned()))
    );
    assert_eq!(broker.recorded().cancelled, vec!["orders-consumer".to_owned()]);
}

#[tokio::test]
async fn stop_before_run_returns_immediately() {
    let broker = FakeBroker::new();
    let _orders = broker.feed("orders");

    let worker = Worker::builder(broker.clone())
        .consumer(consumer("orders"), Handler::single(Accept))
        .build()
        .unwrap();

    worker.stop();
    let reports = within(worker.run()).await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].exit, DispatchExit::Shutdown);
}
