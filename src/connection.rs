// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! This module implements the broker transport contract on top of lapin. It
//! establishes plain or TLS connections, opens channels and turns lapin's
//! connection errors and consumer cancellations into the close notification
//! the channel manager waits on.

use crate::{
    config::{RabbitMQConfigs, TlsConfigs},
    delivery::Delivery,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    logger::Logger,
    options::ConsumerDefinition,
    queue::QueueDefinition,
    transport::{BrokerChannel, BrokerConnection, DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::{FieldTable, LongString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::watch;

const REPLY_SUCCESS: u16 = 200;

/// Records the first reason a connection or channel went away.
type CloseSignal = Arc<watch::Sender<Option<AmqpError>>>;

fn signal_close(signal: &watch::Sender<Option<AmqpError>>, reason: AmqpError) {
    signal.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}

/// Dials RabbitMQ with lapin.
///
/// The TLS settings are kept as plain data and turned into a fresh lapin TLS
/// configuration on every dial, since lapin consumes it per connection.
pub struct LapinTransport {
    uri: AMQPUri,
    properties: ConnectionProperties,
    tls: Option<TlsConfigs>,
    logger: Arc<dyn Logger>,
}

impl LapinTransport {
    /// Creates a transport from connection settings.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials and optional TLS section
    /// * `logger` - Receives the connection diagnostics
    ///
    /// # Returns
    /// A TLS transport when `cfg` carries a TLS section, a plain one otherwise
    pub fn new(cfg: &RabbitMQConfigs, logger: Arc<dyn Logger>) -> Self {
        match &cfg.tls {
            Some(tls) => LapinTransport::tls(
                cfg.amqp_uri(),
                &cfg.connection_name,
                tls.ca_cert_chain.clone(),
                logger,
            ),
            None => LapinTransport::plain(cfg.amqp_uri(), &cfg.connection_name, logger),
        }
    }

    /// Plain TCP transport with the credentials carried by `uri`.
    pub fn plain(uri: AMQPUri, connection_name: &str, logger: Arc<dyn Logger>) -> Self {
        LapinTransport {
            uri,
            properties: ConnectionProperties::default()
                .with_connection_name(LongString::from(connection_name)),
            tls: None,
            logger,
        }
    }

    /// TLS transport.
    ///
    /// # Parameters
    /// * `uri` - Broker address, expected to use the `amqps` scheme
    /// * `connection_name` - Name reported to the broker
    /// * `ca_cert_chain` - PEM encoded CA chain, the system roots when `None`
    /// * `logger` - Receives the connection diagnostics
    pub fn tls(
        uri: AMQPUri,
        connection_name: &str,
        ca_cert_chain: Option<String>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        LapinTransport {
            tls: Some(TlsConfigs { ca_cert_chain }),
            ..LapinTransport::plain(uri, connection_name, logger)
        }
    }

    fn tls_config(&self) -> Option<OwnedTLSConfig> {
        self.tls.as_ref().map(|tls| OwnedTLSConfig {
            cert_chain: tls.ca_cert_chain.clone(),
            ..OwnedTLSConfig::default()
        })
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.logger.debug(format_args!("creating amqp connection..."));

        let uri = self.uri.clone();
        let properties = self.properties.clone();
        let connected = match self.tls_config() {
            Some(tls) => Connection::connect_uri_with_config(uri, properties, tls).await,
            None => Connection::connect_uri(uri, properties).await,
        };

        let conn = match connected {
            Ok(c) => Ok(c),
            Err(err) => {
                self.logger.error(format_args!("failure to connect: {}", err));
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        self.logger.debug(format_args!("amqp connected"));

        let (closed, _) = watch::channel(None);
        let closed = Arc::new(closed);
        let signal = closed.clone();
        conn.on_error(move |err| {
            signal_close(&signal, AmqpError::ConnectionClosed(err.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            conn,
            closed,
            logger: self.logger.clone(),
        }))
    }
}

struct LapinConnection {
    conn: Connection,
    closed: CloseSignal,
    logger: Arc<dyn Logger>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.logger.debug(format_args!("creating amqp channel..."));

        match self.conn.create_channel().await {
            Ok(channel) => {
                self.logger.debug(format_args!("channel {} created", channel.id()));
                Ok(Arc::new(LapinChannel {
                    channel,
                    closed: self.closed.clone(),
                    closing: Arc::new(AtomicBool::new(false)),
                }))
            }
            Err(err) => {
                self.logger
                    .error(format_args!("error to create the channel: {}", err));
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
    closed: CloseSignal,
    /// Set when the close was requested by us, so it is not reported as a loss.
    closing: Arc<AtomicBool>,
}

impl LapinChannel {
    /// A failed operation on a channel the broker closed means the channel is
    /// gone even though the connection may still be up.
    fn check_lost(&self) {
        if !self.channel.status().connected() && !self.closing.load(Ordering::SeqCst) {
            signal_close(
                &self.closed,
                AmqpError::ConnectionClosed(format!("channel {} closed", self.channel.id())),
            );
        }
    }
}

struct ConsumeState {
    consumer: lapin::Consumer,
    channel: Channel,
    closed: CloseSignal,
    closing: Arc<AtomicBool>,
    tag: String,
    auto_ack: bool,
}

impl ConsumeState {
    fn report_end(&self, reason: Option<String>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let reason = match reason {
            Some(err) => AmqpError::ConnectionClosed(err),
            None if self.channel.status().connected() => {
                AmqpError::ConsumerCancelled(self.tag.clone())
            }
            None => AmqpError::ConnectionClosed(format!("channel {} closed", self.channel.id())),
        };
        signal_close(&self.closed, reason);
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_declare(&self, name: &str, def: &QueueDefinition) -> Result<(), AmqpError> {
        let declared = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await;

        declared.map(|_| ()).map_err(|_| {
            self.check_lost();
            AmqpError::DeclareQueueError(name.to_owned())
        })
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let declared = self
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await;

        declared.map_err(|_| {
            self.check_lost();
            AmqpError::DeclareExchangeError(def.name.clone())
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        no_wait: bool,
        args: &FieldTable,
    ) -> Result<(), AmqpError> {
        let bound = self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: no_wait },
                args.clone(),
            )
            .await;

        bound.map_err(|_| {
            self.check_lost();
            AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
        })
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        let qos = self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await;

        qos.map_err(|err| {
            self.check_lost();
            AmqpError::QoSDeclarationError(err.to_string())
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &def.name,
                BasicConsumeOptions {
                    no_local: def.no_local,
                    no_ack: def.auto_ack,
                    exclusive: def.exclusive,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Ok(c) => Ok(c),
            Err(_) => {
                self.check_lost();
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
        }?;

        let state = ConsumeState {
            tag: consumer.tag().to_string(),
            consumer,
            channel: self.channel.clone(),
            closed: self.closed.clone(),
            closing: self.closing.clone(),
            auto_ack: def.auto_ack,
        };

        let deliveries = stream::unfold(state, |mut state| async move {
            match state.consumer.next().await {
                Some(Ok(delivery)) => {
                    let delivery = Delivery::from_lapin(delivery, state.auto_ack);
                    Some((delivery, state))
                }
                Some(Err(err)) => {
                    state.report_end(Some(err.to_string()));
                    None
                }
                None => {
                    state.report_end(None);
                    None
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let published = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                payload,
                properties,
            )
            .await;

        published.map(|_| ()).map_err(|err| {
            self.check_lost();
            AmqpError::PublishingError(err.to_string())
        })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::SeqCst);
        self.channel
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }

    async fn closed(&self) -> AmqpError {
        let mut notified = self.closed.subscribe();
        let reason = notified
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| (*reason).clone());

        reason.unwrap_or(AmqpError::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoLogger;
    use lapin::uri::AMQPScheme;

    fn tls_settings() -> RabbitMQConfigs {
        RabbitMQConfigs {
            tls: Some(TlsConfigs {
                ca_cert_chain: Some("-----BEGIN CERTIFICATE-----".to_owned()),
            }),
            ..RabbitMQConfigs::default()
        }
    }

    #[test]
    fn plain_settings_dial_without_tls() {
        let transport = LapinTransport::new(&RabbitMQConfigs::default(), Arc::new(NoLogger));

        assert!(transport.tls_config().is_none());
        assert_eq!(transport.uri.scheme, AMQPScheme::AMQP);
    }

    #[test]
    fn every_dial_gets_its_own_tls_config() {
        let transport = LapinTransport::new(&tls_settings(), Arc::new(NoLogger));

        for _ in 0..2 {
            let tls = transport.tls_config().unwrap();
            assert_eq!(tls.cert_chain.as_deref(), Some("-----BEGIN CERTIFICATE-----"));
            assert!(tls.identity.is_none());
        }
        assert_eq!(transport.uri.scheme, AMQPScheme::AMQPS);
    }
}
