// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Retry Orchestration Layer
//!
//! Two error families live here. `AmqpError` covers every broker round-trip made
//! while building topology, consuming the retry queue and keeping the connection
//! alive. `MessagingError` is what application-facing pieces (handlers, the
//! dispatcher and the publisher) return.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Conflict variants are split out from the plain declaration failures because
/// topology setup treats them differently: in development they trigger the
/// delete-and-recreate path, everywhere else they abort setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The broker closed the connection or the channel
    #[error("connection closed by broker `{0}`")]
    ConnectionClosed(String),

    /// No channel is currently available
    #[error("not connected")]
    NotConnected,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// An exchange already exists with different arguments
    #[error("exchange `{0}` already exists with different arguments")]
    ExchangeConflict(String),

    /// Error deleting an exchange
    #[error("failure to delete exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// A queue already exists with different arguments
    #[error("queue `{0}` already exists with different arguments")]
    QueueConflict(String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A retry header could not be interpreted
    #[error("invalid header `{0}`")]
    InvalidHeader(String),

    /// A queue specification is unusable
    #[error("invalid queue spec `{0}`")]
    InvalidQueueSpec(String),
}

impl AmqpError {
    /// Whether the error reports a resource asserted with conflicting arguments.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AmqpError::QueueConflict(_) | AmqpError::ExchangeConflict(_)
        )
    }
}

/// Errors surfaced by application handlers, the dispatcher and the publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error creating a consumer
    #[error("failure to create consumer")]
    CreatingConsumerError,

    /// Error while consuming
    #[error("consumer error `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublisherError,

    /// Error serializing or deserializing a payload
    #[error("serialization error `{0}`")]
    SerializationError(String),

    /// An application handler rejected the message
    #[error("handler error `{0}`")]
    HandlerError(String),
}

impl From<AmqpError> for MessagingError {
    fn from(err: AmqpError) -> Self {
        match err {
            AmqpError::PublishingError(_) | AmqpError::NotConnected => {
                MessagingError::PublisherError
            }
            AmqpError::BindingConsumerError(_) | AmqpError::QoSDeclarationError(_) => {
                MessagingError::CreatingConsumerError
            }
            other => MessagingError::ConsumerError(other.to_string()),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value of the wrong shape
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}
