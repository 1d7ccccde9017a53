// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ
//!
//! A RabbitMQ client layer that survives broker restarts and network failures.
//! A [`ChannelManager`] keeps one channel alive behind a shared/exclusive lock
//! and reconnects with an exponential backoff; a [`Consumer`] redeclares its
//! topology and restarts its workers after every reconnect; a [`Publisher`]
//! publishes through the same kind of managed channel.

mod otel;

pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod logger;
pub mod options;
pub mod publisher;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use channel::{ChannelManager, LossNotifications};
pub use config::{RabbitMQConfigs, TlsConfigs};
pub use consumer::Consumer;
pub use delivery::Delivery;
pub use dispatcher::ConsumerHandler;
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use logger::{Logger, NoLogger, TracingLogger};
pub use options::{ClientOptions, ConsumeOptions, ConsumerDefinition};
pub use publisher::{HeaderValue, PublishOptions, Publisher};
pub use queue::QueueDefinition;
