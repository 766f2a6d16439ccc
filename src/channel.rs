// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! The broker is reached through two small traits. A `Connector` opens a
//! session (one connection, one channel) and reports when the broker closes
//! it. A `BrokerChannel` carries every round-trip the retry layer needs:
//! declarations, bindings, publishing, consuming and acknowledgements.
//!
//! `LapinConnector` and `LapinChannel` implement them on top of `lapin`.

use crate::{
    config::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A message received from a queue, detached from the lapin acker.
///
/// Acknowledgement goes through `BrokerChannel::ack` / `nack` with
/// `delivery_tag`, so handlers can be exercised without a broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            data: delivery.data,
            properties: delivery.properties,
        }
    }
}

/// Consumer registration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Empty lets the broker pick a tag
    pub consumer_tag: String,
    pub prefetch: Option<u16>,
    pub no_ack: bool,
}

impl ConsumeOptions {
    /// Options for a consumer registered under `consumer_tag`.
    pub fn new(consumer_tag: &str) -> Self {
        ConsumeOptions {
            consumer_tag: consumer_tag.to_owned(),
            ..Default::default()
        }
    }

    /// Caps the unacknowledged deliveries of the consumer.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Lets the broker consider messages acknowledged once delivered.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }
}

/// Processes deliveries of one consumer.
///
/// Errors are logged by the consumer loop; they never stop it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(
        &self,
        channel: Arc<dyn BrokerChannel>,
        delivery: InboundDelivery,
    ) -> Result<(), AmqpError>;
}

/// Broker operations issued by the retry layer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn delete_queue(&self, name: &str, if_unused: bool) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// An empty `exchange` publishes through the default exchange, so
    /// `routing_key` names the target queue.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Starts consuming `queue`, feeding every delivery to `handler`.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open connection with its channel.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    /// Yields once the broker reports the connection as failed or closed
    pub closed: mpsc::UnboundedReceiver<AmqpError>,
}

/// Opens broker sessions.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BrokerSession, AmqpError>;
}

/// Opens lapin connections from the application configuration.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    /// Connector for the broker described by `cfg`, named after the application.
    pub fn new(cfg: &Configs) -> Self {
        LapinConnector {
            uri: cfg.rabbitmq.uri(),
            connection_name: cfg.app.name.clone(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    /// Connects and opens a confirm channel.
    ///
    /// Connection-level errors reported by lapin after this point are forwarded
    /// to `BrokerSession::closed`.
    async fn connect(&self) -> Result<BrokerSession, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            let _ = closed_tx.send(AmqpError::ConnectionClosed(err.to_string()));
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }
        debug!("channel created");

        Ok(BrokerSession {
            channel: Arc::new(LapinChannel {
                connection: Arc::new(conn),
                channel,
            }),
            closed: closed_rx,
        })
    }
}

/// `BrokerChannel` backed by a lapin channel.
///
/// Holds the connection too, so the connection lives as long as any clone of
/// the channel.
#[derive(Clone)]
pub struct LapinChannel {
    connection: Arc<Connection>,
    channel: Channel,
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                warn!(
                    error = err.to_string(),
                    name = %def.name,
                    "exchange exists with different arguments"
                );
                Err(AmqpError::ExchangeConflict(def.name.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the exchange");
                AmqpError::DeleteExchangeError(name.to_owned())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                warn!(
                    error = err.to_string(),
                    name = %def.name,
                    "queue exists with different arguments"
                );
                Err(AmqpError::QueueConflict(def.name.clone()))
            }
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_unused,
                    if_empty: false,
                    nowait: false,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the queue");
                Err(AmqpError::DeleteQueueError(name.to_owned()))
            }
            Ok(purged) => {
                debug!(name, purged, "queue deleted");
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                AmqpError::PublishingError(err.to_string())
            })?;

        if confirm.is_nack() {
            error!(exchange, routing_key, "broker rejected the message");
            return Err(AmqpError::PublishingError("publisher confirm nack".to_owned()));
        }

        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError> {
        if let Some(prefetch) = options.prefetch {
            self.prefetch(prefetch).await?;
        }

        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let channel: Arc<dyn BrokerChannel> = Arc::new(self.clone());
        let queue = queue.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let handler = handler.clone();
                        let channel = channel.clone();
                        let queue = queue.clone();

                        tokio::spawn(async move {
                            if let Err(err) = handler.handle(channel, delivery.into()).await {
                                error!(error = err.to_string(), queue = %queue, "error consume msg");
                            }
                        });
                    }
                    Err(err) => error!(error = err.to_string(), queue = %queue, "errors consume msg"),
                }
            }

            debug!(queue = %queue, "consumer stream ended");
        });

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.close(200, "Normal shutdown").await {
            warn!(error = err.to_string(), "error closing channel");
        }

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}
