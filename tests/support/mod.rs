// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker covering what the retry chain relies on: exact-key topic
//! routing, the default exchange, queue dead-lettering with the death headers,
//! and per-message expiration driven by `expire_all`.

#![allow(dead_code)]

use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use rabbitmq_retry::{
    channel::{
        BrokerChannel, BrokerSession, ConsumeOptions, Connector, DeliveryHandler, InboundDelivery,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::{AMQP_HEADERS_FIRST_DEATH_QUEUE, AMQP_HEADERS_LAST_DEATH_QUEUE},
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    /// Per-message expiration; cleared when the message is dead-lettered
    pub expiration_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct StoredQueue {
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    messages: VecDeque<StoredMessage>,
}

#[derive(Default)]
struct State {
    exchanges: Vec<String>,
    queues: HashMap<String, StoredQueue>,
    bindings: Vec<(String, String, String)>,
    consumers: Vec<(String, Arc<dyn DeliveryHandler>)>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_tag: u64,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, msg: StoredMessage) {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            self.bindings
                .iter()
                .filter(|(ex, key, _)| ex == exchange && key == routing_key)
                .map(|(_, _, queue)| queue.clone())
                .collect()
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    ..msg.clone()
                });
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, mut msg: StoredMessage) {
        let Some(stored) = self.queues.get(queue) else {
            return;
        };
        let Some(exchange) = stored.dead_letter_exchange.clone() else {
            return;
        };
        let routing_key = stored
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| msg.routing_key.clone());

        let mut headers = msg
            .properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();
        headers
            .entry(ShortString::from(AMQP_HEADERS_FIRST_DEATH_QUEUE))
            .or_insert_with(|| AMQPValue::LongString(LongString::from(queue)));
        headers.insert(
            ShortString::from(AMQP_HEADERS_LAST_DEATH_QUEUE),
            AMQPValue::LongString(LongString::from(queue)),
        );

        msg.properties = msg.properties.with_headers(FieldTable::from(headers));
        msg.expiration_ms = None;
        self.route(&exchange, &routing_key, msg);
    }
}

#[derive(Default)]
pub struct FakeBroker {
    state: Mutex<State>,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub fn connector(self: &Arc<Self>) -> FakeConnector {
        FakeConnector {
            broker: self.clone(),
            open: Mutex::new(vec![]),
        }
    }

    /// Hands the oldest message of `queue` out as an unacknowledged delivery.
    pub fn deliver_next(&self, queue: &str) -> Option<InboundDelivery> {
        let mut state = self.state.lock().unwrap();
        let msg = state.queues.get_mut(queue)?.messages.pop_front()?;

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        state
            .unacked
            .insert(delivery_tag, (queue.to_owned(), msg.clone()));

        Some(InboundDelivery {
            delivery_tag,
            exchange: msg.exchange,
            routing_key: msg.routing_key,
            redelivered: false,
            data: msg.data,
            properties: msg.properties,
        })
    }

    /// Feeds queued messages to registered consumers until none is left.
    pub async fn pump(&self, channel: Arc<dyn BrokerChannel>) -> usize {
        let mut handled = 0;

        loop {
            let next = {
                let state = self.state.lock().unwrap();
                state
                    .consumers
                    .iter()
                    .find(|(queue, _)| {
                        state
                            .queues
                            .get(queue)
                            .is_some_and(|q| !q.messages.is_empty())
                    })
                    .cloned()
            };

            let Some((queue, handler)) = next else {
                return handled;
            };
            let Some(delivery) = self.deliver_next(&queue) else {
                continue;
            };

            let _ = handler.handle(channel.clone(), delivery).await;
            handled += 1;
        }
    }

    /// Lets every message with an expiration expire, returning the queue it
    /// expired from and its expiration.
    pub fn expire_all(&self) -> Vec<(String, u64)> {
        let mut state = self.state.lock().unwrap();
        let mut expired = vec![];

        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();

        for name in names {
            let due: Vec<StoredMessage> = match state.queues.get_mut(&name) {
                Some(queue) => {
                    let (due, kept): (Vec<_>, Vec<_>) = queue
                        .messages
                        .drain(..)
                        .partition(|m| m.expiration_ms.is_some());
                    queue.messages = kept.into();
                    due
                }
                None => continue,
            };

            for msg in due {
                expired.push((name.clone(), msg.expiration_ms.unwrap_or_default()));
                state.dead_letter(&name, msg);
            }
        }

        expired
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(queue)
    }

    pub fn consumers_of(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .filter(|(q, _)| q == queue)
            .count()
    }
}

pub struct FakeConnector {
    broker: Arc<FakeBroker>,
    open: Mutex<Vec<mpsc::UnboundedSender<AmqpError>>>,
}

impl FakeConnector {
    /// Reports the newest session as closed by the broker.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.open.lock().unwrap().last() {
            let _ = tx.send(AmqpError::ConnectionClosed("connection reset".to_owned()));
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<BrokerSession, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.open.lock().unwrap().push(tx);

        Ok(BrokerSession {
            channel: Arc::new(FakeChannel {
                broker: self.broker.clone(),
            }),
            closed: rx,
        })
    }
}

pub struct FakeChannel {
    broker: Arc<FakeBroker>,
}

impl FakeChannel {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.broker.state.lock().unwrap()
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !state.exchanges.iter().any(|e| e == def.name()) {
            state.exchanges.push(def.name().to_owned());
        }
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.state().exchanges.retain(|e| e != name);
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        let dlx = def.dead_letter_exchange().map(str::to_owned);
        let dlrk = def.dead_letter_routing_key().map(str::to_owned);

        match state.queues.get(def.name()) {
            Some(existing)
                if existing.dead_letter_exchange != dlx
                    || existing.dead_letter_routing_key != dlrk =>
            {
                Err(AmqpError::QueueConflict(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    StoredQueue {
                        dead_letter_exchange: dlx,
                        dead_letter_routing_key: dlrk,
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, name: &str, _if_unused: bool) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.queues.remove(name);
        state.bindings.retain(|(_, _, queue)| queue != name);
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !state.queues.contains_key(binding.queue_name()) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
            ));
        }

        let entry = (
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
            binding.queue_name().to_owned(),
        );
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let expiration_ms = properties
            .expiration()
            .as_ref()
            .and_then(|e| e.as_str().parse().ok());

        self.state().route(
            exchange,
            routing_key,
            StoredMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                data: payload.to_vec(),
                properties,
                expiration_ms,
            },
        );
        Ok(())
    }

    async fn prefetch(&self, _count: u16) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: &ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }
        state.consumers.push((queue.to_owned(), handler));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state()
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state();
        let (queue, msg) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;

        if requeue {
            if let Some(stored) = state.queues.get_mut(&queue) {
                stored.messages.push_front(msg);
            }
        } else {
            state.dead_letter(&queue, msg);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}
