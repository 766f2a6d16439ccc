// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Binds application handlers to queues. Consumers are registered through the
//! `ConnectionManager`, so they are subscribed again after every reconnect.

use crate::{
    channel::ConsumeOptions, config::RabbitMQConfigs, connection::ConnectionManager,
    consumer::HandlerDelivery, errors::MessagingError, handler::ConsumerHandler,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_PREFETCH: u16 = 1;

/// A queue paired with the handler of its messages.
#[derive(Clone)]
pub struct RabbitMQDispatcherDefinition {
    pub(crate) queue: String,
    pub(crate) options: ConsumeOptions,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

#[async_trait]
pub trait Dispatcher {
    fn register(self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self;

    /// Starts every registered consumer and returns once they are subscribed.
    async fn consume(&self) -> Result<(), MessagingError>;
}

pub struct RabbitMQDispatcher {
    manager: Arc<ConnectionManager>,
    prefetch: u16,
    pub(crate) dispatchers_def: Vec<RabbitMQDispatcherDefinition>,
}

impl RabbitMQDispatcher {
    /// Dispatcher with a prefetch of 1 per consumer.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        RabbitMQDispatcher {
            manager,
            prefetch: DEFAULT_PREFETCH,
            dispatchers_def: vec![],
        }
    }

    /// Dispatcher using the configured prefetch.
    pub fn from_configs(manager: Arc<ConnectionManager>, cfg: &RabbitMQConfigs) -> Self {
        RabbitMQDispatcher::new(manager).prefetch(cfg.prefetch)
    }

    /// Prefetch applied by `register`; `register_with` takes its own.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Registers `handler` for `queue` with explicit consumer options.
    pub fn register_with(
        mut self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        self.dispatchers_def.push(RabbitMQDispatcherDefinition {
            queue: queue.to_owned(),
            options,
            handler,
        });
        self
    }
}

#[async_trait]
impl Dispatcher for RabbitMQDispatcher {
    fn register(self, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        let options = ConsumeOptions::default().prefetch(self.prefetch);
        self.register_with(queue, options, handler)
    }

    async fn consume(&self) -> Result<(), MessagingError> {
        for def in &self.dispatchers_def {
            let delivery = HandlerDelivery::new(&def.queue, def.handler.clone(), def.options.no_ack);

            self.manager
                .consume(&def.queue, def.options.clone(), Arc::new(delivery))
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), queue = %def.queue, "failure to create the consumer");
                    MessagingError::CreatingConsumerError
                })?;

            info!(queue = %def.queue, "consumer started");
        }

        Ok(())
    }
}
