// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes through the channel kept by a [`ChannelManager`], so a publish
//! issued during a reconnect waits for the new channel instead of failing. The
//! caller's OpenTelemetry context travels in the message headers.

use crate::{
    channel::ChannelManager,
    config::RabbitMQConfigs,
    connection::LapinTransport,
    errors::AmqpError,
    logger::Logger,
    options::ClientOptions,
    otel::RabbitMQTracePropagator,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const TRANSIENT_DELIVERY_MODE: u8 = 1;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Header values accepted by [`PublishOptions::header`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// String of at most 255 bytes
    ShortString(String),
    /// String of any length
    LongString(String),
    /// Signed 16-bit integer
    Int(i16),
    /// Signed 32-bit integer
    LongInt(i32),
    /// Signed 64-bit integer
    LongLongInt(i64),
    /// Unsigned 16-bit integer
    Uint(u16),
    /// Unsigned 32-bit integer
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(v),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(v),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(v),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(v),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// Per-publish settings.
///
/// Defaults: default exchange, JSON content type, transient delivery, a random
/// message id.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    exchange: String,
    mandatory: bool,
    immediate: bool,
    content_type: String,
    persistent: bool,
    expiration: Option<String>,
    message_id: Option<String>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    kind: Option<String>,
    headers: BTreeMap<ShortString, AMQPValue>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            exchange: String::new(),
            mandatory: false,
            immediate: false,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            persistent: false,
            expiration: None,
            message_id: None,
            correlation_id: None,
            reply_to: None,
            kind: None,
            headers: BTreeMap::new(),
        }
    }
}

impl PublishOptions {
    /// Creates publish options with the defaults.
    ///
    /// # Returns
    /// Options publishing transient JSON messages to the default exchange
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the exchange messages are published to.
    ///
    /// # Parameters
    /// * `exchange` - The exchange name, empty for the default exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Asks the broker to return messages no queue is bound for.
    ///
    /// Returned messages are not handled by this publisher.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Sets the `immediate` flag. RabbitMQ 3.0 and later reject it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Sets the MIME content type.
    ///
    /// # Parameters
    /// * `content_type` - Defaults to [`JSON_CONTENT_TYPE`]
    ///
    /// # Returns
    /// Self for method chaining
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Asks the broker to write the message to disk.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Sets the per-message TTL.
    ///
    /// # Parameters
    /// * `expiration` - Time in milliseconds, as a decimal string
    ///
    /// # Returns
    /// Self for method chaining
    pub fn expiration(mut self, expiration: &str) -> Self {
        self.expiration = Some(expiration.to_owned());
        self
    }

    /// Sets the message id instead of a random v4 UUID.
    ///
    /// # Parameters
    /// * `id` - The message id
    ///
    /// # Returns
    /// Self for method chaining
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Sets the correlation id, usually the message id of the request being answered.
    ///
    /// # Parameters
    /// * `id` - The correlation id
    ///
    /// # Returns
    /// Self for method chaining
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Sets the queue replies should be sent to.
    ///
    /// # Parameters
    /// * `queue` - The reply queue name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    ///
    /// # Parameters
    /// * `kind` - The message type name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Adds a single message header.
    ///
    /// Trace context headers injected at publish time win over headers with the
    /// same name.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - The header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(ShortString::from(key), value.into());
        self
    }

    fn properties(&self, headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        let delivery_mode = if self.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };
        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(headers));

        if let Some(expiration) = &self.expiration {
            properties = properties.with_expiration(ShortString::from(expiration.clone()));
        }
        if let Some(id) = &self.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(queue) = &self.reply_to {
            properties = properties.with_reply_to(ShortString::from(queue.clone()));
        }
        if let Some(kind) = &self.kind {
            properties = properties.with_type(ShortString::from(kind.clone()));
        }
        properties
    }
}

/// Publishes messages to RabbitMQ exchanges.
///
/// The channel manager behind the publisher keeps reconnecting in the
/// background until [`Publisher::close`] is called; dropping the publisher
/// alone leaves the connection open.
pub struct Publisher {
    manager: Arc<ChannelManager>,
    logger: Arc<dyn Logger>,
}

impl Publisher {
    /// Connects to the broker described by `cfg`.
    pub async fn new(cfg: &RabbitMQConfigs, options: ClientOptions) -> Result<Publisher, AmqpError> {
        let transport = Arc::new(LapinTransport::new(cfg, options.logger.clone()));
        let manager = ChannelManager::open(transport, &options).await?;
        Ok(Publisher::with_manager(manager, &options))
    }

    /// Publishes through an already opened channel manager, which may be shared
    /// with a [`Consumer`](crate::consumer::Consumer).
    pub fn with_manager(manager: Arc<ChannelManager>, options: &ClientOptions) -> Publisher {
        Publisher {
            manager,
            logger: options.logger.clone(),
        }
    }

    /// Publishes `payload` once per routing key.
    ///
    /// The caller's trace context is injected into the headers. While the channel
    /// is being reconnected the call waits for the new channel. It stops at the
    /// first routing key the broker refuses.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context for tracing
    /// * `payload` - The message body
    /// * `routing_keys` - One message is published per key, none when empty
    /// * `options` - Exchange, flags and properties of the messages
    ///
    /// # Returns
    /// Ok(()) on success, [`AmqpError::ManagerClosed`] after [`Publisher::close`],
    /// or the publishing error of the broker
    pub async fn publish(
        &self,
        ctx: &Context,
        payload: &[u8],
        routing_keys: &[&str],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let mut headers = options.headers.clone();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
        });

        let channel = self.manager.channel().await?;
        for routing_key in routing_keys {
            channel
                .basic_publish(
                    &options.exchange,
                    routing_key,
                    options.mandatory,
                    options.immediate,
                    payload,
                    options.properties(headers.clone()),
                )
                .await
                .map_err(|err| {
                    self.logger
                        .error(format_args!("error publishing message: {}", err));
                    err
                })?;
        }

        Ok(())
    }

    /// Closes the channel and the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.manager.close().await
    }
}
