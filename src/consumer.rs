// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application Consumer
//!
//! Bridges broker deliveries to a `ConsumerHandler`. A successful handler run
//! acknowledges the delivery. A failed one rejects it without requeue, so the
//! broker dead-letters it into `<exchange>.retry` and the retry chain takes
//! over; retry bookkeeping never happens here.

use crate::{
    channel::{BrokerChannel, DeliveryHandler, InboundDelivery},
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
};
use async_trait::async_trait;
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tracing::{debug, error, warn};

pub(crate) struct HandlerDelivery {
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    no_ack: bool,
}

impl HandlerDelivery {
    pub(crate) fn new(queue: &str, handler: Arc<dyn ConsumerHandler>, no_ack: bool) -> Self {
        HandlerDelivery {
            queue: queue.to_owned(),
            handler,
            no_ack,
        }
    }
}

#[async_trait]
impl DeliveryHandler for HandlerDelivery {
    async fn handle(
        &self,
        channel: Arc<dyn BrokerChannel>,
        delivery: InboundDelivery,
    ) -> Result<(), AmqpError> {
        let msg_type = delivery
            .properties
            .kind()
            .as_ref()
            .map(|kind| kind.to_string())
            .unwrap_or_default();
        let span_name = if msg_type.is_empty() {
            &self.queue
        } else {
            &msg_type
        };

        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, span_name);

        debug!(
            queue = %self.queue,
            msg_type = %msg_type,
            exchange = %delivery.exchange,
            "message received"
        );

        let msg = ConsumerMessage::new(
            &self.queue,
            &msg_type,
            &delivery.data,
            Some(textual_headers(&delivery.properties)),
        );

        let result = self.handler.exec(&ctx, &msg).await;

        if self.no_ack {
            // the broker acknowledged on delivery
            match &result {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    warn!(error = err.to_string(), queue = %self.queue, "handler failed on an auto-ack consumer");
                    span.record_error(err);
                    span.set_status(Status::error(err.to_string()));
                }
            }
            return Ok(());
        }

        match result {
            Ok(()) => {
                debug!(queue = %self.queue, "message successfully processed");
                channel.ack(delivery.delivery_tag).await.inspect_err(|err| {
                    span.record_error(err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                })?;
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = %self.queue,
                    "error whiling handling msg, sending to retry"
                );
                span.record_error(&err);
                span.set_status(Status::error(err.to_string()));

                channel
                    .nack(delivery.delivery_tag, false)
                    .await
                    .inspect_err(|err| {
                        error!(error = err.to_string(), "error whiling nack msg");
                        span.record_error(err);
                    })
            }
        }
    }
}

/// String and integer headers rendered as text; nested tables are skipped.
fn textual_headers(props: &AMQPProperties) -> HashMap<String, String> {
    let Some(table) = props.headers() else {
        return HashMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                AMQPValue::Boolean(v) => v.to_string(),
                AMQPValue::ShortShortInt(v) => v.to_string(),
                AMQPValue::ShortShortUInt(v) => v.to_string(),
                AMQPValue::ShortInt(v) => v.to_string(),
                AMQPValue::ShortUInt(v) => v.to_string(),
                AMQPValue::LongInt(v) => v.to_string(),
                AMQPValue::LongUInt(v) => v.to_string(),
                AMQPValue::LongLongInt(v) => v.to_string(),
                _ => return None,
            };
            Some((key.to_string(), text))
        })
        .collect()
}
