// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Recovery Layer
//!
//! This module provides the error type shared by connections, channels and consumers.
//! Construction errors are returned synchronously to the caller, while failures that
//! happen after construction are handled by the recovery tasks and only surface as a
//! closed entity or a closed delivery stream.

use thiserror::Error;

/// Represents errors that can occur while operating a supervised AMQP resource.
///
/// Variants that wrap a `String` carry the message of the underlying broker-client
/// error, so the cause is not lost when it crosses the recovery boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The connection or channel is closed and cannot serve the request
    #[error("resource is closed")]
    ClosedError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The governing cancellation token fired while the operation was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// Every recovery attempt failed; the resource is permanently closed
    #[error("recovery gave up after {0} attempts: {1}")]
    RetriesExhausted(u32, String),
}
