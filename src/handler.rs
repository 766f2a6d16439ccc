// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application Handlers
//!
//! The contract between application code and the dispatcher. A handler
//! returning an error makes the dispatcher reject the delivery, which hands the
//! message over to the retry chain of its queue.

use crate::errors::MessagingError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// A delivery as seen by application handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerMessage {
    /// Queue the message was consumed from
    pub from: String,
    pub msg_type: String,
    pub data: Vec<u8>,
    /// Textual view of the AMQP headers
    pub headers: Option<HashMap<String, String>>,
}

impl ConsumerMessage {
    pub fn new(
        from: &str,
        msg_type: &str,
        data: &[u8],
        headers: Option<HashMap<String, String>>,
    ) -> Self {
        ConsumerMessage {
            from: from.to_owned(),
            msg_type: msg_type.to_owned(),
            data: data.to_vec(),
            headers,
        }
    }

    /// Deserializes the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| MessagingError::SerializationError(err.to_string()))
    }

    /// Textual header `key`, if the message carried one.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.as_ref()?.get(key).map(String::as_str)
    }
}

/// Processes messages of one queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), MessagingError>;
}
