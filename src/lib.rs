// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod batch;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod outcome;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod topology;
pub mod ttl_backoff;
pub mod validator;
pub mod worker;
