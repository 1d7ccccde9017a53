// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Binding Descriptor
//!
//! This module defines the exchange a consumer's queue is bound to. When a
//! consume configuration carries an [`ExchangeDefinition`], the exchange is
//! declared and the queue is bound to it once per routing key every time the
//! subscription is (re)started.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of the exchange a consumer binds its queue to.
///
/// An empty name is accepted here and rejected when the subscription starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is a transient Direct exchange with no arguments.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..ExchangeDefinition::default()
        }
    }

    /// Returns the exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Sets the exchange type to Fanout.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Sets the exchange type to Topic.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Sets the exchange type to Headers.
    ///
    /// Binding arguments decide the routing, see
    /// [`ConsumeOptions::binding_param`](crate::options::ConsumeOptions::binding_param).
    ///
    /// # Returns
    /// Self for method chaining
    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct_delayed(self) -> Self {
        self.delayed("direct")
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout_delayed(self) -> Self {
        self.delayed("fanout")
    }

    fn delayed(mut self, routing: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(routing)),
        );
        self
    }

    /// Replaces the exchange arguments.
    ///
    /// # Parameters
    /// * `params` - A map of exchange arguments
    ///
    /// # Returns
    /// Self for method chaining
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single exchange argument.
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

    /// Sets the exchange to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets the no_wait flag, so the broker does not confirm the declaration.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_exchange_is_a_transient_direct_exchange() {
        let def = ExchangeDefinition::new("events");

        assert_eq!(def.name(), "events");
        assert_eq!(def.kind, ExchangeKind::Direct);
        assert!(!def.durable && !def.delete && !def.internal && !def.no_wait);
    }

    #[test]
    fn delayed_exchange_keeps_the_routing_type() {
        let def = ExchangeDefinition::new("scheduled").fanout_delayed().durable();

        assert_eq!(
            lapin::ExchangeKind::from(&def.kind),
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert_eq!(
            def.arguments().inner().get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("fanout")))
        );
    }

    #[test]
    fn kinds_map_onto_lapin() {
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        );
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::Headers),
            lapin::ExchangeKind::Headers
        );
    }
}
