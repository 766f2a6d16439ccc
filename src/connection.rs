// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! `ConnectionManager` owns the process-wide broker session. It keeps the list
//! of consumers registered during the process lifetime and, whenever a new
//! session is opened, replays that list against the new channel before the
//! channel is handed to anybody else. When the broker closes the connection a
//! supervisor task reconnects with bounded exponential backoff.

use crate::{
    channel::{BrokerChannel, ConsumeOptions, Connector, DeliveryHandler, LapinConnector},
    config::Configs,
    errors::AmqpError,
};
use lapin::BasicProperties;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Connection lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay schedule between reconnect attempts: `min(max, base * 2^attempts)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    /// Schedule starting at `base` and capped at `max`, with no failure recorded.
    pub fn new(base: Duration, max: Duration) -> Self {
        ReconnectBackoff {
            base,
            max,
            attempts: 0,
        }
    }

    /// Delay after `attempts` failed cycles, saturating at `max` on overflow.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Counts one more failed cycle and returns the delay before the next try.
    pub fn record_failure(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay_for(self.attempts)
    }

    /// Forgets the failures once a session is established.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Failed cycles since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff::new(Duration::from_millis(2_000), Duration::from_millis(600_000))
    }
}

/// A consumer to re-subscribe after every reconnect.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub queue: String,
    pub options: ConsumeOptions,
    pub handler: Arc<dyn DeliveryHandler>,
}

struct Inner {
    status: ConnectionStatus,
    channel: Option<Arc<dyn BrokerChannel>>,
    registry: Vec<ConsumerRegistration>,
    /// Bumped whenever a session is installed or discarded; a supervisor
    /// watching an older generation stands down.
    generation: u64,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    backoff: Mutex<ReconnectBackoff>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl ConnectionManager {
    /// Disconnected manager; nothing is opened before `connect`.
    pub fn new(connector: Arc<dyn Connector>, backoff: ReconnectBackoff) -> Arc<Self> {
        Arc::new(ConnectionManager {
            connector,
            inner: Mutex::new(Inner {
                status: ConnectionStatus::Disconnected,
                channel: None,
                registry: vec![],
                generation: 0,
            }),
            backoff: Mutex::new(backoff),
            supervisor: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    /// Manager backed by lapin, using the configured reconnect delays.
    pub fn from_configs(cfg: &Configs) -> Arc<Self> {
        ConnectionManager::new(
            Arc::new(LapinConnector::new(cfg)),
            ReconnectBackoff::new(
                cfg.rabbitmq.reconnect_base_delay(),
                cfg.rabbitmq.reconnect_max_delay(),
            ),
        )
    }

    /// Opens the session if none is open yet.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.status().await == ConnectionStatus::Connected {
            return Ok(());
        }

        info!("connecting to rabbitmq...");
        self.closing.store(false, Ordering::SeqCst);
        let (closed, generation) = self.establish().await?;
        self.backoff.lock().await.reset();
        self.spawn_supervisor(closed, generation).await;
        info!("connected to rabbitmq");

        Ok(())
    }

    /// Discards the current session and opens a new one right away.
    pub async fn reconnect_now(self: &Arc<Self>) -> Result<(), AmqpError> {
        warn!("forcing a new rabbitmq session");
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.status = ConnectionStatus::Disconnected;
            inner.channel.take()
        };

        if let Some(channel) = previous {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "previous session already closed");
            }
        }

        let (closed, generation) = self.establish().await?;
        self.backoff.lock().await.reset();
        self.spawn_supervisor(closed, generation).await;

        Ok(())
    }

    /// Current state of the managed session.
    pub async fn status(&self) -> ConnectionStatus {
        self.inner.lock().await.status
    }

    /// Failed reconnect cycles since the last successful connect.
    pub async fn attempts(&self) -> u32 {
        self.backoff.lock().await.attempts()
    }

    /// The live channel, never one whose consumers are still being replayed.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.inner
            .lock()
            .await
            .channel
            .clone()
            .ok_or(AmqpError::NotConnected)
    }

    /// Publishes on the current channel; fails with `NotConnected` instead of
    /// buffering while the connection is down.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await.inspect_err(|_| {
            error!(exchange, routing_key, "rabbitmq not connected, message not published");
        })?;

        channel
            .publish(exchange, routing_key, payload, properties)
            .await
    }

    /// Registers a consumer for the lifetime of the process.
    ///
    /// The consumer is subscribed right away when connected and re-subscribed,
    /// in registration order, after every reconnect.
    pub async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError> {
        let mut inner = self.inner.lock().await;

        if let Some(channel) = &inner.channel {
            channel.consume(queue, &options, handler.clone()).await?;
        }

        inner.registry.push(ConsumerRegistration {
            queue: queue.to_owned(),
            options,
            handler,
        });
        info!(queue, "consumer registered");

        Ok(())
    }

    /// Queues of the registered consumers, in registration order.
    pub async fn registered_queues(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .registry
            .iter()
            .map(|r| r.queue.clone())
            .collect()
    }

    /// Stops reconnecting and closes the session.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::SeqCst);

        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }

        let channel = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.status = ConnectionStatus::Disconnected;
            inner.channel.take()
        };

        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    async fn establish(&self) -> Result<(UnboundedReceiver<AmqpError>, u64), AmqpError> {
        self.inner.lock().await.status = ConnectionStatus::Connecting;

        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(err) => {
                self.inner.lock().await.status = ConnectionStatus::Disconnected;
                return Err(err);
            }
        };

        let mut inner = self.inner.lock().await;

        if !inner.registry.is_empty() {
            info!(count = inner.registry.len(), "registering consumers again...");
        }
        for registration in &inner.registry {
            debug!(queue = %registration.queue, "registering consumer");
            if let Err(err) = session
                .channel
                .consume(
                    &registration.queue,
                    &registration.options,
                    registration.handler.clone(),
                )
                .await
            {
                error!(
                    error = err.to_string(),
                    queue = %registration.queue,
                    "failure to register consumer again"
                );
            }
        }

        let replaced = inner.channel.replace(session.channel);
        inner.generation += 1;
        inner.status = ConnectionStatus::Connected;
        let generation = inner.generation;
        drop(inner);

        if let Some(channel) = replaced {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "replaced session already closed");
            }
        }

        Ok((session.closed, generation))
    }

    async fn spawn_supervisor(self: &Arc<Self>, closed: UnboundedReceiver<AmqpError>, generation: u64) {
        let handle = tokio::spawn(supervise(Arc::downgrade(self), closed, generation));

        if let Some(previous) = self.supervisor.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Marks the session watched by `generation` as lost. Returns false when
    /// that session was already replaced or the manager is closing.
    async fn mark_disconnected(&self, generation: u64, reason: &str) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return false;
        }

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return false;
        }

        warn!(reason, "rabbitmq connection closed, trying to reconnect...");
        inner.generation += 1;
        inner.status = ConnectionStatus::Disconnected;
        inner.channel = None;

        true
    }

    async fn reconnect_with_backoff(&self) -> Option<(UnboundedReceiver<AmqpError>, u64)> {
        loop {
            let (delay, attempts) = {
                let mut backoff = self.backoff.lock().await;
                let delay = backoff.record_failure();
                (delay, backoff.attempts())
            };

            info!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to rabbitmq"
            );
            tokio::time::sleep(delay).await;

            if self.closing.load(Ordering::SeqCst) {
                return None;
            }

            match self.establish().await {
                Ok(session) => {
                    self.backoff.lock().await.reset();
                    info!("reconnected to rabbitmq");
                    return Some(session);
                }
                Err(err) => error!(error = err.to_string(), attempts, "failure to reconnect"),
            }
        }
    }
}

async fn supervise(
    manager: Weak<ConnectionManager>,
    mut closed: UnboundedReceiver<AmqpError>,
    mut generation: u64,
) {
    loop {
        let reason = match closed.recv().await {
            Some(err) => err.to_string(),
            None => "connection dropped".to_owned(),
        };

        let Some(manager) = manager.upgrade() else {
            return;
        };

        if !manager.mark_disconnected(generation, &reason).await {
            return;
        }

        match manager.reconnect_with_backoff().await {
            Some((next_closed, next_generation)) => {
                closed = next_closed;
                generation = next_generation;
            }
            None => return,
        }
    }
}
