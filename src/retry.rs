// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Consumer
//!
//! Consumes `<queue>.retry`, where the broker dead-letters every message
//! rejected by an application consumer. Each message is either rescheduled
//! through a numbered delay queue or rejected for good, in which case the
//! retry queue dead-letters it into the terminal DLQ.

use crate::{
    channel::{BrokerChannel, DeliveryHandler, InboundDelivery},
    errors::AmqpError,
    headers::RetryHeaders,
    naming,
    strategy::{DelayDecision, DelayStrategy},
    topology::QueueRuntimeState,
};
use async_trait::async_trait;
use lapin::types::ShortString;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the retry consumer did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Republished toward a delay queue and acknowledged
    Scheduled {
        origin_queue: String,
        retry_count: u32,
        exchange: String,
        routing_key: String,
        expiration_ms: u64,
    },
    /// Retry budget spent; rejected toward the DLQ
    Exhausted { origin_queue: String, retry_count: u32 },
    /// No origin queue could be recovered from the headers
    Unroutable,
    /// Processing failed; rejected toward the DLQ
    Failed(AmqpError),
}

pub struct RetryConsumer {
    queue: String,
    exchange_delay: String,
    max_retries: u32,
    strategy: Arc<dyn DelayStrategy>,
    state: QueueRuntimeState,
}

impl RetryConsumer {
    /// `max_retries` is used only for origin queues missing from `state`.
    pub fn new(
        queue: &str,
        exchange_delay: &str,
        max_retries: u32,
        strategy: Arc<dyn DelayStrategy>,
        state: QueueRuntimeState,
    ) -> Self {
        RetryConsumer {
            queue: queue.to_owned(),
            exchange_delay: exchange_delay.to_owned(),
            max_retries,
            strategy,
            state,
        }
    }

    /// Retry queue this consumer reads.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Decides and applies the fate of one message. Never returns before the
    /// message was either acknowledged or rejected.
    pub async fn process(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &InboundDelivery,
    ) -> RetryOutcome {
        let mut headers = RetryHeaders::from_properties(&delivery.properties);

        let Some(origin_queue) = headers.origin_queue() else {
            warn!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                "message without origin queue, sending to dlq"
            );
            self.reject(channel, delivery.delivery_tag).await;
            return RetryOutcome::Unroutable;
        };

        match self
            .schedule(channel, delivery, &origin_queue, &mut headers)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // a reject cannot rewrite headers, the error only reaches the log
                error!(
                    error = err.to_string(),
                    queue = %self.queue,
                    origin_queue = %origin_queue,
                    "failure to schedule retry, sending to dlq"
                );
                self.reject(channel, delivery.delivery_tag).await;
                RetryOutcome::Failed(err)
            }
        }
    }

    async fn schedule(
        &self,
        channel: &dyn BrokerChannel,
        delivery: &InboundDelivery,
        origin_queue: &str,
        headers: &mut RetryHeaders,
    ) -> Result<RetryOutcome, AmqpError> {
        let current = headers.retry_count()?;
        let max_retries = self
            .state
            .max_retries(origin_queue)
            .await
            .unwrap_or(self.max_retries);

        if current >= max_retries {
            info!(origin_queue, retry_count = current, max_retries, "retries exhausted");
            self.reject(channel, delivery.delivery_tag).await;
            return Ok(RetryOutcome::Exhausted {
                origin_queue: origin_queue.to_owned(),
                retry_count: current,
            });
        }

        let next = current + 1;
        headers.set_retry_count(next);

        let Some(decision) = self.strategy.decide(origin_queue, next, max_retries) else {
            info!(origin_queue, retry_count = next, "strategy gave up");
            self.reject(channel, delivery.delivery_tag).await;
            return Ok(RetryOutcome::Exhausted {
                origin_queue: origin_queue.to_owned(),
                retry_count: current,
            });
        };

        let (exchange, routing_key) = match &decision {
            DelayDecision::Step { step, .. } => (
                self.exchange_delay.clone(),
                naming::delay_routing_key(origin_queue, *step),
            ),
            DelayDecision::RoutingKey { routing_key, .. } => {
                (self.exchange_delay.clone(), routing_key.clone())
            }
            DelayDecision::TargetQueue { queue, .. } => (String::new(), queue.clone()),
        };
        let expiration_ms = decision.expiration_ms();

        let properties = delivery
            .properties
            .clone()
            .with_headers(headers.clone().into_field_table())
            .with_expiration(ShortString::from(expiration_ms.to_string()));

        channel
            .publish(&exchange, &routing_key, &delivery.data, properties)
            .await?;

        // never reject once the republish went through
        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            error!(
                error = err.to_string(),
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                "failure to ack rescheduled message"
            );
        }

        debug!(
            origin_queue,
            retry_count = next,
            exchange = %exchange,
            routing_key = %routing_key,
            expiration_ms,
            "retry scheduled"
        );

        Ok(RetryOutcome::Scheduled {
            origin_queue: origin_queue.to_owned(),
            retry_count: next,
            exchange,
            routing_key,
            expiration_ms,
        })
    }

    async fn reject(&self, channel: &dyn BrokerChannel, delivery_tag: u64) {
        if let Err(err) = channel.nack(delivery_tag, false).await {
            error!(
                error = err.to_string(),
                queue = %self.queue,
                delivery_tag,
                "failure to reject message"
            );
        }
    }
}

#[async_trait]
impl DeliveryHandler for RetryConsumer {
    async fn handle(
        &self,
        channel: Arc<dyn BrokerChannel>,
        delivery: InboundDelivery,
    ) -> Result<(), AmqpError> {
        match self.process(channel.as_ref(), &delivery).await {
            RetryOutcome::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }
}
