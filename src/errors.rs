// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Relay
//!
//! Every fallible operation in this crate returns [`AmqpError`]. The variants fall
//! into four families, exposed through the classification helpers:
//!
//! - configuration errors: raised before the broker is touched (missing fields,
//!   unresolved handlers, unknown connections)
//! - provisioning errors: the broker refused a declaration or binding
//! - transport errors: connection, channel, publish and acknowledgement failures
//! - cancellation: a wait was interrupted by a stop signal
//!
//! Handler failures are absent: they never leave the dispatcher.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// A required configuration field is empty or absent
    #[error("`{unit}` is missing required field `{field}`")]
    MissingConfig { unit: String, field: String },

    /// A configuration field holds a value the relay cannot work with
    #[error("`{unit}` has an invalid value for `{field}`: {reason}")]
    InvalidConfig {
        unit: String,
        field: String,
        reason: String,
    },

    /// No handler was registered under the configured identifier
    #[error("no handler registered as `{0}`")]
    UnresolvedHandler(String),

    /// A consumer or producer references a connection that was never provided
    #[error("unknown connection `{0}`")]
    UnknownConnection(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish to `{0}` was not confirmed by the broker")]
    PublishNotConfirmed(String),

    /// Error encoding an outbound payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error decoding an inbound payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A consumer was started twice
    #[error("consumer `{0}` is already running")]
    AlreadyRunning(String),

    /// A wait was interrupted by cancellation
    #[error("operation cancelled")]
    Cancelled,
}

impl AmqpError {
    /// Startup-time misconfiguration, detected before any broker call.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            AmqpError::MissingConfig { .. }
                | AmqpError::InvalidConfig { .. }
                | AmqpError::UnresolvedHandler(_)
                | AmqpError::UnknownConnection(_)
        )
    }

    /// The broker rejected part of a topology.
    pub fn is_provision(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(..)
                | AmqpError::DeclareQueueError(..)
                | AmqpError::BindingExchangeToQueueError(..)
        )
    }

    /// A per-call transport failure, surfaced to the caller and never retried.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError(_)
                | AmqpError::ConsumerError(_)
                | AmqpError::PublishingError(_)
                | AmqpError::PublishNotConfirmed(_)
                | AmqpError::AckMessageError
                | AmqpError::NackMessageError
        )
    }
}
