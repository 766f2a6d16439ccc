// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes application messages on the managed connection. Publishing is
//! best-effort: while the connection is down the call fails instead of
//! buffering, and callers needing delivery across a disconnect keep their own
//! outbox.

use crate::{
    connection::ConnectionManager, errors::MessagingError,
    headers::AMQP_HEADERS_APPLICATION_ORIGIN, otel,
};
use async_trait::async_trait;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Typed header value attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
}

impl From<&HeaderValues> for AMQPValue {
    fn from(value: &HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.clone())),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(*v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
        }
    }
}

/// An outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    /// Exchange to publish to
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    /// Producing application, sent as `x-application-origin`
    pub origin: Option<String>,
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl PublishMessage {
    /// Message for exchange `to` under routing key `key`.
    pub fn new(to: &str, key: &str, data: &[u8]) -> Self {
        PublishMessage {
            to: to.to_owned(),
            key: Some(key.to_owned()),
            data: data.to_vec(),
            ..Default::default()
        }
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_owned());
        self
    }

    /// Adds a custom header, replacing any previous value of `key`.
    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value);
        self
    }
}

#[async_trait]
pub trait Publisher {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), MessagingError>;
}

pub struct RabbitMQPublisher {
    manager: Arc<ConnectionManager>,
}

impl RabbitMQPublisher {
    /// Publisher sharing the managed connection.
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { manager })
    }

    /// Serializes `payload` as JSON and publishes it in the current context.
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        origin: &str,
    ) -> Result<(), MessagingError> {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            MessagingError::SerializationError(err.to_string())
        })?;

        let msg = PublishMessage::new(exchange, routing_key, &data).origin(origin);
        self.publish(&Context::current(), &msg).await
    }
}

/// Header table of an outbound message: trace context, custom headers, origin.
pub(crate) fn outbound_headers(ctx: &Context, infos: &PublishMessage) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    otel::inject(ctx, &mut btree);

    if let Some(headers) = &infos.headers {
        for (key, value) in headers {
            btree.insert(ShortString::from(key.clone()), AMQPValue::from(value));
        }
    }

    if let Some(origin) = &infos.origin {
        btree.insert(
            ShortString::from(AMQP_HEADERS_APPLICATION_ORIGIN),
            AMQPValue::LongString(LongString::from(origin.clone())),
        );
    }

    FieldTable::from(btree)
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), MessagingError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(infos.msg_type.clone().unwrap_or_default()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(outbound_headers(ctx, infos));

        let key = infos.key.clone().unwrap_or_default();

        match self
            .manager
            .publish(&infos.to, &key, &infos.data, properties)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = %infos.to,
                    routing_key = %key,
                    "error publishing message"
                );
                Err(MessagingError::PublisherError)
            }
            _ => {
                debug!(exchange = %infos.to, routing_key = %key, "message published");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{BrokerSession, MockBrokerChannel, MockConnector},
        connection::ReconnectBackoff,
        errors::AmqpError,
        headers::RetryHeaders,
    };
    use tokio::sync::mpsc;

    #[derive(Serialize)]
    struct Order {
        id: u32,
    }

    #[test]
    fn outbound_headers_carry_origin_and_custom_values() {
        let msg = PublishMessage::new("app", "rk.orders", b"{}")
            .origin("checkout")
            .header("x-tenant", HeaderValues::LongString("acme".to_owned()))
            .header("x-priority", HeaderValues::LongInt(3));

        let table = outbound_headers(&Context::new(), &msg);
        let headers = table.inner();

        assert_eq!(
            headers.get(AMQP_HEADERS_APPLICATION_ORIGIN),
            Some(&AMQPValue::LongString(LongString::from("checkout")))
        );
        assert_eq!(
            headers.get("x-tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
        assert_eq!(headers.get("x-priority"), Some(&AMQPValue::LongInt(3)));
    }

    #[tokio::test]
    async fn fails_when_not_connected() {
        let manager = ConnectionManager::new(Arc::new(MockConnector::new()), ReconnectBackoff::default());

        let err = RabbitMQPublisher::new(manager)
            .publish_json("app", "rk.orders", &Order { id: 1 }, "checkout")
            .await
            .unwrap_err();

        assert_eq!(err, MessagingError::PublisherError);
    }

    #[tokio::test]
    async fn publishes_json_with_message_metadata() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, routing_key, payload, props| {
                exchange == "app"
                    && routing_key == "rk.orders"
                    && payload == br#"{"id":7}"#
                    && props.content_type().as_ref().map(|c| c.as_str()) == Some(JSON_CONTENT_TYPE)
                    && props.message_id().is_some()
                    && RetryHeaders::from_properties(props)
                        .inner()
                        .get(AMQP_HEADERS_APPLICATION_ORIGIN)
                        .is_some()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = Some(BrokerSession {
            channel: Arc::new(channel),
            closed: rx,
        });
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move || {
            let _open = &tx;
            session.take().ok_or(AmqpError::ChannelError)
        });
        let manager = ConnectionManager::new(Arc::new(connector), ReconnectBackoff::default());
        manager.connect().await.unwrap();

        RabbitMQPublisher::new(manager)
            .publish_json("app", "rk.orders", &Order { id: 7 }, "checkout")
            .await
            .unwrap();
    }
}
