// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Headers
//!
//! Retry progress lives on the message itself. The broker stamps the
//! dead-lettering headers, the retry consumer maintains the retry count and
//! the last error. Nothing about an individual message is kept in process
//! memory.

use crate::errors::AmqpError;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Queue the message was consumed from when it first failed (broker-set)
pub const AMQP_HEADERS_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
/// Most recent queue that dead-lettered the message (broker-set)
pub const AMQP_HEADERS_LAST_DEATH_QUEUE: &str = "x-last-death-queue";
/// Number of retries already scheduled for the message
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Diagnostic text of the last processing error
pub const AMQP_HEADERS_LAST_ERROR: &str = "x-last-error";
/// Provenance tag of the producing application
pub const AMQP_HEADERS_APPLICATION_SOURCE: &str = "x-application-source";
/// Set by the publisher on the initial publish
pub const AMQP_HEADERS_APPLICATION_ORIGIN: &str = "x-application-origin";
/// Legacy origin header written by older producers
pub const AMQP_HEADERS_ORIGIN_QUEUE: &str = "x-origin-queue";
/// Broker dead-lettering history, most recent entry first
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Queue field inside an `x-death` entry
pub const AMQP_HEADERS_X_DEATH_QUEUE: &str = "queue";

const MAX_LAST_ERROR_LEN: usize = 1024;

/// Mutable view over the header table of one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryHeaders {
    headers: BTreeMap<ShortString, AMQPValue>,
}

impl RetryHeaders {
    /// Wraps an existing header table.
    pub fn new(headers: BTreeMap<ShortString, AMQPValue>) -> Self {
        RetryHeaders { headers }
    }

    /// Copies the headers of a message, empty when it carries none.
    pub fn from_properties(props: &AMQPProperties) -> Self {
        let headers = match props.headers() {
            Some(table) => table.inner().clone(),
            None => BTreeMap::default(),
        };

        RetryHeaders { headers }
    }

    /// Resolves the queue a retried message must return to.
    ///
    /// Looks at `x-last-death-queue` first, then the legacy `x-origin-queue`,
    /// then the newest `x-death` entry for brokers that predate the
    /// last-death headers.
    pub fn origin_queue(&self) -> Option<String> {
        self.string(AMQP_HEADERS_LAST_DEATH_QUEUE)
            .or_else(|| self.string(AMQP_HEADERS_ORIGIN_QUEUE))
            .or_else(|| self.x_death_queue())
    }

    /// Queue the message was first dead-lettered from.
    pub fn first_death_queue(&self) -> Option<String> {
        self.string(AMQP_HEADERS_FIRST_DEATH_QUEUE)
    }

    pub fn last_error(&self) -> Option<String> {
        self.string(AMQP_HEADERS_LAST_ERROR)
    }

    pub fn application_source(&self) -> Option<String> {
        self.string(AMQP_HEADERS_APPLICATION_SOURCE)
    }

    /// Retry count carried by the message, 0 when the header is absent.
    ///
    /// Accepts any integer encoding as well as decimal strings, since
    /// producers in other languages tend to write the count as text.
    pub fn retry_count(&self) -> Result<u32, AmqpError> {
        let Some(value) = self.headers.get(AMQP_HEADERS_RETRY_COUNT) else {
            return Ok(0);
        };

        let count: Option<i64> = match value {
            AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
            AMQPValue::LongInt(v) => Some(i64::from(*v)),
            AMQPValue::LongUInt(v) => Some(i64::from(*v)),
            AMQPValue::LongLongInt(v) => Some(*v),
            AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
            AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            _ => None,
        };

        count
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| AmqpError::InvalidHeader(AMQP_HEADERS_RETRY_COUNT.to_owned()))
    }

    /// Writes the count as a 64-bit signed integer.
    pub fn set_retry_count(&mut self, count: u32) {
        self.headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(count)),
        );
    }

    /// Stores `err`, truncated to a bounded length.
    pub fn set_last_error(&mut self, err: &str) {
        let truncated: String = err.chars().take(MAX_LAST_ERROR_LEN).collect();
        self.headers.insert(
            ShortString::from(AMQP_HEADERS_LAST_ERROR),
            AMQPValue::LongString(LongString::from(truncated)),
        );
    }

    pub fn inner(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.headers
    }

    /// Header table ready to be set on outgoing properties.
    pub fn into_field_table(self) -> FieldTable {
        FieldTable::from(self.headers)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.headers.get(key).and_then(value_as_string)
    }

    fn x_death_queue(&self) -> Option<String> {
        let entries = self.headers.get(AMQP_HEADERS_X_DEATH)?.as_array()?;
        let newest = entries.as_slice().first()?.as_field_table()?;
        newest
            .inner()
            .get(AMQP_HEADERS_X_DEATH_QUEUE)
            .and_then(value_as_string)
    }
}

fn value_as_string(value: &AMQPValue) -> Option<String> {
    let s = match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.to_owned(),
        AMQPValue::ShortString(v) => v.as_str().to_owned(),
        _ => return None,
    };

    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
