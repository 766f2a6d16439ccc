// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Retry, delay and dead-letter orchestration for RabbitMQ.
//!
//! Every application queue gets a retry chain built from broker dead-lettering:
//! a failed message is rejected into `<exchange>.retry`, the retry consumer
//! republishes it into a numbered delay queue with a per-message expiration,
//! the expired message flows back to the main exchange, and once the retry
//! budget is spent it lands in `<queue>.dlq`. Retry progress travels in the
//! message headers only.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod headers;
pub mod naming;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod strategy;
pub mod topology;
