// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Contract
//!
//! The channel manager, consumer and publisher only talk to the broker through
//! the traits of this module. [`crate::connection::LapinTransport`] implements
//! them on top of lapin; tests plug in an in-memory broker instead.

use crate::{
    delivery::Delivery, errors::AmqpError, exchange::ExchangeDefinition,
    options::ConsumerDefinition, queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

/// Stream of deliveries produced by `basic_consume`. It ends when the channel
/// it was opened on goes away.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Opens new connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A single logical session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn queue_declare(&self, name: &str, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        no_wait: bool,
        args: &FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Resolves once the channel was closed by the broker or the network, or
    /// its consumer was cancelled, with the reason.
    async fn closed(&self) -> AmqpError;
}
