// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declaration Options
//!
//! This module provides the queue part of a consume configuration. The queue is
//! declared idempotently on every subscription start, so the same definition is
//! applied after every reconnect.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to select the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its declaration parameters.
///
/// This struct implements the builder pattern. Every flag defaults to `false`
/// and the argument table starts empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a queue definition with default settings.
    ///
    /// # Returns
    /// A transient, shared queue definition that is not auto-deleted
    pub fn new() -> QueueDefinition {
        QueueDefinition::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// Exclusive queues are deleted when the connection closes, so they are
    /// redeclared empty after every reconnect.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists instead of creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Declares the queue without waiting for the broker's confirmation.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Declares a quorum queue. Quorum queues are always durable.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn quorum(mut self) -> Self {
        self.durable = true;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
            AMQPValue::LongString(LongString::from("quorum")),
        );
        self
    }

    /// Sets the message Time-To-Live (TTL).
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds a message may stay in the queue
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// # Parameters
    /// * `max` - Maximum number of ready messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size the queue can hold.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum total size of the ready message bodies, in bytes
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Replaces the queue arguments.
    ///
    /// # Parameters
    /// * `params` - A map of queue arguments
    ///
    /// # Returns
    /// Self for method chaining
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single queue argument.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Builds the argument table sent with `queue.declare`.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = self.params.clone();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        FieldTable::from(args)
    }
}
