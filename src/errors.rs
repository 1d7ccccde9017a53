// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers connection and channel management, topology
//! declaration, consumption, publishing and message settlement, as well as the
//! reasons a channel can be lost and the lifecycle errors of the components.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transport failures carry the message reported by the underlying client so
/// that they can be logged, compared in tests and sent to loss subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A binding was requested without naming the exchange
    #[error("binding to exchange but name not specified")]
    MissingExchangeName,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// The delivery was already acknowledged or rejected
    #[error("delivery `{0}` was already settled")]
    AlreadySettled(u64),

    /// Error closing a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// The connection or channel was closed by the broker or the network
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The broker cancelled the consumer
    #[error("consumer `{0}` was cancelled by the broker")]
    ConsumerCancelled(String),

    /// The channel manager was closed and can no longer be used
    #[error("channel manager is closed")]
    ManagerClosed,

    /// The consumer was stopped and can no longer be used
    #[error("consumer was stopped")]
    ConsumerStopped,
}
