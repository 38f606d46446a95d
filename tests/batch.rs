// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use amqp_worker::{
    consumer::ConsumerConfig,
    dispatcher::{ConsumerDispatcher, DispatchExit},
    envelope::{HeaderValue, RETRY_COUNT_HEADER},
    errors::AmqpError,
    handler::{BatchHandler, ConsumerMessage, Handler, HandlerError},
    queue::QueueDefinition,
    retry::RetryPolicy,
    shutdown::{self, ShutdownHandle},
};
use async_trait::async_trait;
use common::{consumer, json, within, FakeBroker};
use opentelemetry::Context;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};

#[derive(Clone, Default)]
struct Recorder {
    batches: Arc<Mutex<Vec<usize>>>,
    fail: bool,
}

impl Recorder {
    fn sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchHandler for Recorder {
    async fn exec(&self, _ctx: &Context, msgs: &[ConsumerMessage]) -> Result<(), HandlerError> {
        self.batches.lock().unwrap().push(msgs.len());
        if self.fail {
            return Err(HandlerError::retryable("bulk insert failed"));
        }
        Ok(())
    }
}

fn start(
    broker: &Arc<FakeBroker>,
    cfg: ConsumerConfig,
    recorder: &Recorder,
) -> (ShutdownHandle, JoinHandle<Result<DispatchExit, AmqpError>>) {
    let dispatcher =
        ConsumerDispatcher::new(broker.clone(), cfg, Handler::batch(recorder.clone())).unwrap();
    let (handle, signal) = shutdown::new_pair();
    let task = tokio::spawn(async move { dispatcher.run(signal).await });
    (handle, task)
}

#[tokio::test(start_paused = true)]
async fn full_batches_flush_by_size_and_the_rest_by_timeout() {
    let broker = FakeBroker::new();
    let _feed = broker.feed("events");
    let recorder = Recorder::default();
    let cfg = consumer("events")
        .batch_size(3)
        .batch_timeout(Duration::from_millis(1000));

    let (handle, task) = start(&broker, cfg, &recorder);
    for _ in 0..7 {
        broker.deliver("events", json("{}"));
    }

    broker.wait_until(|r| r.acks.len() == 7).await;
    handle.trigger();
    within(task).await.unwrap().unwrap();

    assert_eq!(recorder.sizes(), vec![3, 3, 1]);
}

#[tokio::test(start_paused = true)]
async fn partial_batch_is_flushed_when_its_timeout_elapses() {
    let broker = FakeBroker::new();
    let _feed = broker.feed("events");
    let recorder = Recorder::default();
    let cfg = consumer("events")
        .batch_size(5)
        .batch_timeout(Duration::from_millis(500));

    let started = Instant::now();
    let (handle, task) = start(&broker, cfg, &recorder);
    broker.deliver("events", json("{}"));
    broker.deliver("events", json("{}"));

    broker.wait_until(|r| r.acks.len() == 2).await;
    let elapsed = started.elapsed();
    handle.trigger();
    within(task).await.unwrap().unwrap();

    assert_eq!(recorder.sizes(), vec![2]);
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_the_pending_batch_before_cancelling() {
    let broker = FakeBroker::new();
    let _feed = broker.feed("events");
    let recorder = Recorder::default();
    let cfg = consumer("events")
        .batch_size(5)
        .batch_timeout(Duration::from_secs(60));

    let (handle, task) = start(&broker, cfg, &recorder);
    broker.deliver("events", json("{}"));
    broker.deliver("events", json("{}"));

    // lets the dispatcher pull both deliveries
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(recorder.sizes().is_empty());

    handle.trigger();
    assert_eq!(within(task).await.unwrap(), Ok(DispatchExit::Shutdown));

    let recorded = broker.recorded();
    assert_eq!(recorder.sizes(), vec![2]);
    assert_eq!(recorded.acks.len(), 2);
    assert_eq!(recorded.cancelled, vec!["events-consumer".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn invalid_payloads_are_dead_lettered_individually() {
    let broker = FakeBroker::new();
    let _feed = broker.feed("events");
    let recorder = Recorder::default();
    let cfg = consumer("events").batch_size(3);

    let (handle, task) = start(&broker, cfg, &recorder);
    broker.deliver("events", json("{}"));
    broker.deliver("events", json("{broken"));
    broker.deliver("events", json("{}"));

    broker.wait_until(|r| r.settled() == 3).await;
    handle.trigger();
    within(task).await.unwrap().unwrap();

    let recorded = broker.recorded();
    assert_eq!(recorder.sizes(), vec![2]);
    assert_eq!(recorded.rejects, vec![(2, false)]);

    let mut acks = recorded.acks.clone();
    acks.sort_unstable();
    assert_eq!(acks, vec![1, 3]);
}

#[tokio::test(start_paused = true)]
async fn handler_is_skipped_when_no_payload_is_valid() {
    let broker = FakeBroker::new();
    let _feed = broker.feed("events");
    let recorder = Recorder::default();
    let cfg = consumer("events").batch_size(2);

    let (handle, task) = start(&broker, cfg, &recorder);
    broker.deliver("events", json("nope"));
    broker.deliver("events", json("nope"));

    broker.wait_until(|r| r.rejects.len() == 2).await;
    handle.trigger();
    within(task).await.unwrap().unwrap();

    assert!(recorder.sizes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_batch_retries_every_message() {
    let broker = FakeBroker::new();
    let _feed = broker.feed("events");
    let recorder = Recorder {
        fail: true,
        ..Recorder::default()
    };
    let queue = QueueDefinition::new("events")
        .dead_letter("events-dlx")
        .with_ttl_backoff();
    let cfg = ConsumerConfig::for_queue(&queue)
        .unwrap()
        .batch_size(2)
        .retry(RetryPolicy::new().max_attempts(3));

    let (handle, task) = start(&broker, cfg, &recorder);
    broker.deliver("events", json(r#"{"n":1}"#));
    broker.deliver("events", json(r#"{"n":2}"#));

    broker.wait_until(|r| r.acks.len() == 2).await;
    handle.trigger();
    within(task).await.unwrap().unwrap();

    let recorded = broker.recorded();
    assert_eq!(recorded.published.len(), 2);
    for published in &recorded.published {
        assert_eq!(published.routing_key, "events-wait");
        assert_eq!(
            published.properties.headers.get(RETRY_COUNT_HEADER),
            Some(&HeaderValue::Int(1))
        );
    }
}

#[tokio::test(start_paused = true)]
async fn prefetch_defaults_to_batch_size() {
    let broker = FakeBroker::new();
    let feed = broker.feed("events");
    let recorder = Recorder::default();

    let (_handle, task) = start(&broker, consumer("events").batch_size(25), &recorder);
    broker.close("events");
    drop(feed);

    assert_eq!(within(task).await.unwrap(), Ok(DispatchExit::StreamClosed));
    assert_eq!(broker.recorded().prefetch, vec![25]);
}
