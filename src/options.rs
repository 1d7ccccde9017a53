// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client and Consume Options
//!
//! Every recognised option is a field of an explicit struct with a documented
//! default. The structs are built with chained setters and are not mutated once
//! handed to the channel manager or the consumer.

use crate::{
    backoff::DEFAULT_RETRY_INTERVAL,
    exchange::ExchangeDefinition,
    logger::{Logger, NoLogger, TracingLogger},
    queue::QueueDefinition,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// Worker count used when a consume configuration asks for less than one.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Options shared by the consumer and the publisher constructors.
///
/// Defaults: no logging, one second base interval for the reconnect backoff.
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) reconnect_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            logger: Arc::new(NoLogger),
            reconnect_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ClientOptions {
    /// Creates client options with the defaults.
    ///
    /// # Returns
    /// Options without logging and with a one second reconnect interval
    pub fn new() -> Self {
        ClientOptions::default()
    }

    /// Enables logging through `tracing` under the `rabbitmq` target.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn logging(mut self) -> Self {
        self.logger = Arc::new(TracingLogger);
        self
    }

    /// Logs through a caller-supplied implementation.
    ///
    /// # Parameters
    /// * `logger` - The logger shared by the manager, the consumer and its workers
    ///
    /// # Returns
    /// Self for method chaining
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Sets the base interval of both recovery loops.
    ///
    /// The k-th attempt waits `interval × 2^(k−1)`.
    ///
    /// # Parameters
    /// * `interval` - Delay before the first attempt
    ///
    /// # Returns
    /// Self for method chaining
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

/// Parameters of `basic.consume`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerDefinition {
    pub(crate) name: String,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ConsumerDefinition {
    /// Creates a consumer definition.
    ///
    /// # Parameters
    /// * `name` - The consumer tag, empty to let the broker pick one
    ///
    /// # Returns
    /// A new consumer definition with manual acknowledgement
    pub fn new(name: &str) -> Self {
        ConsumerDefinition {
            name: name.to_owned(),
            ..ConsumerDefinition::default()
        }
    }

    /// Returns the consumer tag requested from the broker.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Lets the broker consider messages settled as soon as they are delivered.
    ///
    /// The handler's verdict is then ignored.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Requests exclusive access to the queue for this consumer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Not supported by RabbitMQ, forwarded as is.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    /// Does not wait for the broker to confirm the consumer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a single consumer argument.
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

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Configuration of one `start_consuming` call.
///
/// Defaults: transient shared queue, no exchange binding, prefetch 0 (no
/// limit) per consumer, manual acknowledgement, one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    pub(crate) queue: QueueDefinition,
    pub(crate) binding_exchange: Option<ExchangeDefinition>,
    pub(crate) binding_no_wait: bool,
    pub(crate) binding_params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) qos_prefetch: u16,
    pub(crate) qos_global: bool,
    pub(crate) consumer: ConsumerDefinition,
    pub(crate) concurrency: usize,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            queue: QueueDefinition::default(),
            binding_exchange: None,
            binding_no_wait: false,
            binding_params: BTreeMap::default(),
            qos_prefetch: 0,
            qos_global: false,
            consumer: ConsumerDefinition::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ConsumeOptions {
    /// Creates consume options with the defaults.
    ///
    /// # Returns
    /// Options for a transient queue, consumed by one worker with manual acknowledgement
    pub fn new() -> Self {
        ConsumeOptions::default()
    }

    /// Sets how the queue is declared.
    ///
    /// # Parameters
    /// * `queue` - The queue definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = queue;
        self
    }

    /// Declares `exchange` and binds the queue to it once per routing key.
    ///
    /// The exchange name must not be empty, otherwise starting the subscription
    /// fails with [`AmqpError::MissingExchangeName`](crate::errors::AmqpError::MissingExchangeName).
    ///
    /// # Parameters
    /// * `exchange` - The exchange definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn binding_exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.binding_exchange = Some(exchange);
        self
    }

    /// Does not wait for the broker to confirm the bindings.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn binding_no_wait(mut self) -> Self {
        self.binding_no_wait = true;
        self
    }

    /// Adds a single binding argument, used by headers exchanges.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn binding_param(mut self, key: &str, value: AMQPValue) -> Self {
        self.binding_params.insert(ShortString::from(key), value);
        self
    }

    /// Sets the maximum number of unacknowledged deliveries held at once.
    ///
    /// # Parameters
    /// * `prefetch` - The prefetch count, 0 for no limit
    ///
    /// # Returns
    /// Self for method chaining
    pub fn qos_prefetch(mut self, prefetch: u16) -> Self {
        self.qos_prefetch = prefetch;
        self
    }

    /// Applies the prefetch limit to the whole channel instead of per consumer.
    pub fn qos_global(mut self) -> Self {
        self.qos_global = true;
        self
    }

    /// Sets the `basic.consume` parameters.
    ///
    /// # Parameters
    /// * `consumer` - The consumer definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn consumer(mut self, consumer: ConsumerDefinition) -> Self {
        self.consumer = consumer;
        self
    }

    /// Sets the number of workers draining the delivery stream.
    ///
    /// # Parameters
    /// * `concurrency` - Worker count; values below one are replaced by [`DEFAULT_CONCURRENCY`]
    ///
    /// # Returns
    /// Self for method chaining
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub(crate) fn validated(mut self) -> Self {
        if self.concurrency < 1 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        self
    }

    pub(crate) fn binding_arguments(&self) -> FieldTable {
        FieldTable::from(self.binding_params.clone())
    }
}
