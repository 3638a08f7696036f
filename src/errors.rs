// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Worker Harness
//!
//! The `AmqpError` enum represents every failure the harness itself can observe:
//! connecting, channel setup, topology declaration, consuming, publishing,
//! acknowledging and closing, plus configuration parsing. Handler failures are
//! deliberately not part of this enum; they never leave the execution unit.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Transport-level failure while establishing the connection
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel was closed before the operation could run
    #[error("channel is closed")]
    ChannelClosed,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error receiving a delivery from a consumer
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error closing the connection
    #[error("failure to close connection: {0}")]
    CloseError(String),

    /// Invalid or unparsable configuration value
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}
