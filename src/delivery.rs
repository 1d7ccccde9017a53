// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Deliveries
//!
//! A [`Delivery`] is one message handed to a consumer handler. It carries the
//! payload and the broker metadata, and can be settled (acknowledged or
//! rejected) at most once.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions},
    BasicProperties,
};
#[cfg(test)]
use mockall::automock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Path back to the broker used to settle a delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledges the delivery identified by `delivery_tag`.
    ///
    /// # Parameters
    /// * `delivery_tag` - Channel-scoped identifier of the delivery
    /// * `multiple` - Also acknowledges every earlier unsettled delivery
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;
    /// Rejects the delivery identified by `delivery_tag`.
    ///
    /// # Parameters
    /// * `delivery_tag` - Channel-scoped identifier of the delivery
    /// * `multiple` - Also rejects every earlier unsettled delivery
    /// * `requeue` - Asks the broker to deliver the message again
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;
}

/// Settles deliveries received through lapin.
pub(crate) struct LapinAcknowledger(pub(crate) Acker);

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self, _delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(
        &self,
        _delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

/// One message delivered by the broker to a consumer.
pub struct Delivery {
    /// Message payload.
    pub body: Vec<u8>,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Channel-scoped identifier of this delivery.
    pub delivery_tag: u64,
    /// Content headers and properties.
    pub properties: BasicProperties,
    acker: Arc<dyn Acknowledger>,
    settled: AtomicBool,
}

impl Delivery {
    /// Creates an unsettled delivery.
    ///
    /// Deliveries normally come from the broker; this constructor serves custom
    /// transports and handler tests.
    ///
    /// # Parameters
    /// * `delivery_tag` - Channel-scoped identifier of the delivery
    /// * `exchange` - Exchange the message was published to
    /// * `routing_key` - Routing key the message was published with
    /// * `body` - Message payload
    /// * `acker` - Path back to the broker used by [`Delivery::ack`] and [`Delivery::nack`]
    ///
    /// # Returns
    /// A delivery with default properties that was not redelivered
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            body,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            delivery_tag,
            properties: BasicProperties::default(),
            acker,
            settled: AtomicBool::new(false),
        }
    }

    pub(crate) fn from_lapin(delivery: lapin::message::Delivery, auto_ack: bool) -> Self {
        Delivery {
            body: delivery.data,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
            properties: delivery.properties,
            acker: Arc::new(LapinAcknowledger(delivery.acker)),
            settled: AtomicBool::new(auto_ack),
        }
    }

    /// Sets the content headers and properties.
    ///
    /// # Parameters
    /// * `properties` - The message properties
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Sets whether the broker delivered this message before.
    ///
    /// # Parameters
    /// * `redelivered` - The redelivered flag
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Marks the delivery as settled by the broker itself (auto-ack consumers).
    pub fn auto_acked(self) -> Self {
        self.settled.store(true, Ordering::SeqCst);
        self
    }

    /// Whether `ack` or `nack` was already called, or the broker settled the
    /// message on delivery.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acknowledges the delivery.
    ///
    /// # Parameters
    /// * `multiple` - Also acknowledges every earlier unsettled delivery of the channel
    ///
    /// # Returns
    /// Ok(()) on success, [`AmqpError::AlreadySettled`] when the delivery was
    /// already settled, or the broker error
    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.settle()?;
        self.acker.ack(self.delivery_tag, multiple).await
    }

    /// Rejects the delivery.
    ///
    /// # Parameters
    /// * `multiple` - Also rejects every earlier unsettled delivery of the channel
    /// * `requeue` - Asks the broker to deliver the message again
    ///
    /// # Returns
    /// Ok(()) on success, [`AmqpError::AlreadySettled`] when the delivery was
    /// already settled, or the broker error
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.settle()?;
        self.acker.nack(self.delivery_tag, multiple, requeue).await
    }

    fn settle(&self) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn ack_is_sent_once() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .with(eq(42), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        acker.expect_nack().never();

        let delivery = Delivery::new(42, "events", "user.created", b"{}".to_vec(), Arc::new(acker));

        assert_eq!(delivery.ack(false).await, Ok(()));
        assert_eq!(delivery.ack(false).await, Err(AmqpError::AlreadySettled(42)));
        assert_eq!(
            delivery.nack(false, true).await,
            Err(AmqpError::AlreadySettled(42))
        );
    }

    #[tokio::test]
    async fn nack_forwards_requeue() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_nack()
            .with(eq(7), eq(false), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let delivery = Delivery::new(7, "", "jobs", vec![], Arc::new(acker));

        assert!(!delivery.is_settled());
        assert_eq!(delivery.nack(false, true).await, Ok(()));
        assert!(delivery.is_settled());
    }

    #[tokio::test]
    async fn auto_acked_deliveries_never_reach_the_broker() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();

        let delivery = Delivery::new(1, "", "jobs", vec![], Arc::new(acker)).auto_acked();

        assert_eq!(delivery.ack(false).await, Err(AmqpError::AlreadySettled(1)));
    }

    #[tokio::test]
    async fn broker_failure_still_counts_as_settled() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|_, _| Err(AmqpError::AckMessageError("channel closed".to_owned())));

        let delivery = Delivery::new(3, "", "jobs", vec![], Arc::new(acker));

        assert!(matches!(
            delivery.ack(false).await,
            Err(AmqpError::AckMessageError(_))
        ));
        assert!(delivery.is_settled());
    }
}
