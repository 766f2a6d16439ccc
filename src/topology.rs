// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Topology
//!
//! Asserts, for every `QueueSpec`, the exchanges, queues and bindings of the
//! retry chain and starts the retry consumer on the retry queue:
//!
//! ```text
//! <ex> --rk--> <q> --reject--> <ex>.retry --rk.<q>.retry--> <q>.retry
//!                                                              | retry consumer
//!        <ex>.delay --rk.<q>.delay.stepN--> <q>.delay.stepN    |
//!                                              | expire       |
//! <ex> <--canonical rk----------------------------+             |
//!                                                              | reject
//! <ex>.dlx --rk.<q>.dlq--> <q>.dlq  <----------------------------+
//! ```
//!
//! The main components are:
//! - `QueueSpec`: per-queue retry configuration supplied at startup
//! - `QueueRuntimeState`: per-queue retry budget read by the retry consumers
//! - `Topology` trait and its `RetryTopology` implementation

use crate::{
    channel::{BrokerChannel, ConsumeOptions},
    config::{Configs, Environment},
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    naming::{ExchangeNames, QueueNames},
    queue::{QueueBinding, QueueDefinition},
    retry::RetryConsumer,
    strategy::{DelayStrategy, FixedIntervalDelayStrategy},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_RETRIES: u32 = 4;
const DEFAULT_DELAY_TIME_MS: u64 = 60_000;
const DEFAULT_RETRY_PREFETCH: u16 = 1;

/// Retry configuration of one application queue.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub(crate) queue: String,
    pub(crate) exchange: String,
    pub(crate) routing_keys: Vec<String>,
    pub(crate) max_retries: u32,
    pub(crate) delay_time_ms: u64,
    pub(crate) delay_strategy: Option<Arc<dyn DelayStrategy>>,
    pub(crate) extra_dlq_queue: Option<String>,
}

impl QueueSpec {
    /// Retry configuration for `queue` fed by `exchange`, with the default retry budget and
    /// no routing key yet.
    pub fn new(queue: &str, exchange: &str) -> QueueSpec {
        QueueSpec {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_keys: vec![],
            max_retries: DEFAULT_MAX_RETRIES,
            delay_time_ms: DEFAULT_DELAY_TIME_MS,
            delay_strategy: None,
            extra_dlq_queue: None,
        }
    }

    /// Adds a binding key. The first key added is the one retried messages
    /// are redelivered with.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    /// Retries before a message is parked; also the number of delay queues.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Interval of the default fixed strategy; ignored once a strategy is set.
    pub fn delay_time_ms(mut self, delay_time_ms: u64) -> Self {
        self.delay_time_ms = delay_time_ms;
        self
    }

    /// Replaces the default fixed interval strategy.
    pub fn delay_strategy(mut self, strategy: Arc<dyn DelayStrategy>) -> Self {
        self.delay_strategy = Some(strategy);
        self
    }

    /// Binds one more queue next to `<queue>.dlq`, receiving the same messages.
    pub fn extra_dlq(mut self, queue: &str) -> Self {
        self.extra_dlq_queue = Some(queue.to_owned());
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    /// Binding keys in the order they were added.
    pub fn keys(&self) -> &[String] {
        &self.routing_keys
    }

    /// Retry budget of the queue.
    pub fn retries(&self) -> u32 {
        self.max_retries
    }

    /// Key retried messages are redelivered with, `None` until one is added.
    pub fn canonical_routing_key(&self) -> Option<&str> {
        self.routing_keys.first().map(String::as_str)
    }

    /// The configured strategy, or a fixed interval of `delay_time_ms` over `max_retries` levels.
    pub fn strategy(&self) -> Arc<dyn DelayStrategy> {
        match &self.delay_strategy {
            Some(strategy) => strategy.clone(),
            None => Arc::new(FixedIntervalDelayStrategy::new(
                self.delay_time_ms,
                self.max_retries,
            )),
        }
    }

    /// Rejects blank queue, exchange or extra dlq names and a spec without routing keys.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue.trim().is_empty() {
            return Err(AmqpError::InvalidQueueSpec("empty queue name".to_owned()));
        }

        if self.exchange.trim().is_empty() {
            return Err(AmqpError::InvalidQueueSpec(format!(
                "queue `{}` has no exchange",
                self.queue
            )));
        }

        if self.routing_keys.is_empty() {
            return Err(AmqpError::InvalidQueueSpec(format!(
                "queue `{}` has no routing key",
                self.queue
            )));
        }

        if matches!(&self.extra_dlq_queue, Some(q) if q.trim().is_empty()) {
            return Err(AmqpError::InvalidQueueSpec(format!(
                "queue `{}` has an empty extra dlq name",
                self.queue
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRuntimeOptions {
    pub max_retries: u32,
}

/// Per-queue options shared by the topology builder and the retry consumers.
///
/// Written during setup only; retry consumers read it.
#[derive(Debug, Clone, Default)]
pub struct QueueRuntimeState {
    queues: Arc<RwLock<HashMap<String, QueueRuntimeOptions>>>,
}

impl QueueRuntimeState {
    /// Records the options of `queue`, replacing earlier ones.
    pub async fn insert(&self, queue: &str, options: QueueRuntimeOptions) {
        self.queues.write().await.insert(queue.to_owned(), options);
    }

    pub async fn get(&self, queue: &str) -> Option<QueueRuntimeOptions> {
        self.queues.read().await.get(queue).copied()
    }

    /// Retry budget of `queue`, `None` when it was never set up.
    pub async fn max_retries(&self, queue: &str) -> Option<u32> {
        self.get(queue).await.map(|o| o.max_retries)
    }

    pub async fn len(&self) -> usize {
        self.queues.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.read().await.is_empty()
    }
}

/// Builds the retry topology of application queues.
#[async_trait]
pub trait Topology {
    /// Asserts the full retry chain of one queue and starts its retry consumer.
    ///
    /// Repeating the call with the same spec re-asserts the same resources
    /// and starts nothing new.
    async fn setup_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError>;

    /// Runs `setup_queue` for every spec, in order, stopping at the first error.
    async fn setup_all(&self, specs: &[QueueSpec]) -> Result<(), AmqpError> {
        for spec in specs {
            self.setup_queue(spec).await?;
        }

        Ok(())
    }
}

pub struct RetryTopology {
    manager: Arc<ConnectionManager>,
    env: Environment,
    prefetch: u16,
    state: QueueRuntimeState,
    created_exchanges: Mutex<HashSet<String>>,
    retry_consumers: Mutex<HashSet<String>>,
}

impl RetryTopology {
    /// Topology for `env` whose retry consumers take one message at a time.
    pub fn new(manager: Arc<ConnectionManager>, env: Environment) -> RetryTopology {
        RetryTopology {
            manager,
            env,
            prefetch: DEFAULT_RETRY_PREFETCH,
            state: QueueRuntimeState::default(),
            created_exchanges: Mutex::new(HashSet::new()),
            retry_consumers: Mutex::new(HashSet::new()),
        }
    }

    /// Topology using the configured environment and consumer prefetch.
    pub fn from_configs(manager: Arc<ConnectionManager>, cfg: &Configs) -> RetryTopology {
        RetryTopology::new(manager, cfg.app.env).prefetch(cfg.rabbitmq.prefetch)
    }

    /// Unacknowledged messages each retry consumer may hold at once.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Retry budgets recorded by `setup_queue`, keyed by application queue.
    pub fn runtime_state(&self) -> QueueRuntimeState {
        self.state.clone()
    }

    async fn install(&self, spec: &QueueSpec) -> Result<(), AmqpError> {
        let channel = self.manager.channel().await?;
        let exchanges = ExchangeNames::for_exchange(&spec.exchange);
        let names = QueueNames::for_queue(&spec.queue);
        let canonical = spec
            .canonical_routing_key()
            .ok_or_else(|| AmqpError::InvalidQueueSpec(spec.queue.clone()))?;

        self.declare_exchanges(channel.as_ref(), &exchanges).await?;

        channel
            .declare_queue(
                &chain_queue(&names.main).dead_letter(&exchanges.retry, &names.retry_routing_key),
            )
            .await?;
        for key in &spec.routing_keys {
            channel
                .bind_queue(&QueueBinding::new(&names.main).exchange(&exchanges.main).routing_key(key))
                .await?;
        }

        for step in 1..=spec.max_retries {
            let delay_queue = names.delay_queue(step);
            channel
                .declare_queue(&chain_queue(&delay_queue).dead_letter(&exchanges.main, canonical))
                .await?;
            channel
                .bind_queue(
                    &QueueBinding::new(&delay_queue)
                        .exchange(&exchanges.delay)
                        .routing_key(&names.delay_routing_key(step)),
                )
                .await?;
        }

        channel
            .declare_queue(
                &chain_queue(&names.retry).dead_letter(&exchanges.dlx, &names.dlq_routing_key),
            )
            .await?;
        channel
            .bind_queue(
                &QueueBinding::new(&names.retry)
                    .exchange(&exchanges.retry)
                    .routing_key(&names.retry_routing_key),
            )
            .await?;

        let parking = std::iter::once(&names.dlq).chain(spec.extra_dlq_queue.as_ref());
        for dlq in parking {
            channel.declare_queue(&chain_queue(dlq)).await?;
            channel
                .bind_queue(
                    &QueueBinding::new(dlq)
                        .exchange(&exchanges.dlx)
                        .routing_key(&names.dlq_routing_key),
                )
                .await?;
        }

        self.state
            .insert(
                &spec.queue,
                QueueRuntimeOptions {
                    max_retries: spec.max_retries,
                },
            )
            .await;

        self.start_retry_consumer(spec, &exchanges, &names).await
    }

    async fn declare_exchanges(
        &self,
        channel: &dyn BrokerChannel,
        exchanges: &ExchangeNames,
    ) -> Result<(), AmqpError> {
        let mut created = self.created_exchanges.lock().await;
        if created.contains(&exchanges.main) {
            debug!(exchange = %exchanges.main, "exchanges already asserted");
            return Ok(());
        }

        for name in exchanges.all() {
            channel
                .declare_exchange(&ExchangeDefinition::new(name).topic().durable())
                .await?;
        }

        created.insert(exchanges.main.clone());
        Ok(())
    }

    async fn start_retry_consumer(
        &self,
        spec: &QueueSpec,
        exchanges: &ExchangeNames,
        names: &QueueNames,
    ) -> Result<(), AmqpError> {
        let mut started = self.retry_consumers.lock().await;
        if started.contains(&names.retry) {
            debug!(queue = %names.retry, "retry consumer already running");
            return Ok(());
        }

        let consumer = RetryConsumer::new(
            &names.retry,
            &exchanges.delay,
            spec.max_retries,
            spec.strategy(),
            self.state.clone(),
        );
        self.manager
            .consume(
                &names.retry,
                ConsumeOptions::default().prefetch(self.prefetch),
                Arc::new(consumer),
            )
            .await?;

        started.insert(names.retry.clone());
        info!(queue = %names.retry, "retry consumer started");
        Ok(())
    }

    /// Drops the resource that failed to assert so the next setup recreates it.
    ///
    /// The broker closed the channel when it refused the assertion, hence the
    /// fresh session first.
    async fn remove_conflicting(&self, conflict: &AmqpError) -> Result<(), AmqpError> {
        self.manager.reconnect_now().await?;
        let channel = self.manager.channel().await?;

        match conflict {
            AmqpError::QueueConflict(queue) => {
                warn!(queue = %queue, "deleting conflicting queue");
                channel.delete_queue(queue, true).await
            }
            AmqpError::ExchangeConflict(exchange) => {
                warn!(exchange = %exchange, "deleting conflicting exchange");
                channel.delete_exchange(exchange).await
            }
            other => Err(other.clone()),
        }
    }
}

/// Every queue of the chain is durable, quorum-typed and never auto-deleted.
fn chain_queue(name: &str) -> QueueDefinition {
    QueueDefinition::new(name).durable().quorum()
}

#[async_trait]
impl Topology for RetryTopology {
    async fn setup_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError> {
        spec.validate()?;
        info!(queue = %spec.queue, exchange = %spec.exchange, "setting up retry topology");

        match self.install(spec).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() && self.env.is_development() => {
                warn!(
                    error = err.to_string(),
                    queue = %spec.queue,
                    "topology conflict in development, recreating"
                );
                self.remove_conflicting(&err).await?;

                self.install(spec).await.inspect_err(|err| {
                    error!(error = err.to_string(), queue = %spec.queue, "failure to recreate topology");
                })
            }
            Err(err) => {
                error!(error = err.to_string(), queue = %spec.queue, "failure to set up topology");
                Err(err)
            }
        }
    }
}
