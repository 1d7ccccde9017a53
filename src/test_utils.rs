// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. It records every operation, lets
//! tests inject dial/channel/declare/ack failures and simulates channel losses.

use crate::{
    delivery::{Acknowledger, Delivery},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    options::ConsumerDefinition,
    queue::QueueDefinition,
    transport::{BrokerChannel, BrokerConnection, DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{types::FieldTable, BasicProperties};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack { tag: u64, multiple: bool },
    Nack { tag: u64, multiple: bool, requeue: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) mandatory: bool,
    pub(crate) payload: Vec<u8>,
    pub(crate) properties: BasicProperties,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    dials: AtomicUsize,
    dial_failures: AtomicUsize,
    channel_failures: AtomicUsize,
    queue_declare_failures: AtomicUsize,
    fail_acks: AtomicBool,
    next_tag: AtomicU64,
    ops: Mutex<Vec<String>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    dispositions: Mutex<Vec<Disposition>>,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub(crate) fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(FakeTransport(self.clone()))
    }

    pub(crate) fn fail_next_dials(&self, count: usize) {
        self.dial_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_channels(&self, count: usize) {
        self.channel_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_queue_declares(&self, count: usize) {
        self.queue_declare_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn channels(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub(crate) fn channel(&self, index: usize) -> Arc<FakeChannel> {
        self.channels.lock().unwrap()[index].clone()
    }

    pub(crate) fn current_channel(&self) -> Arc<FakeChannel> {
        self.channels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no channel opened yet")
    }

    pub(crate) fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub(crate) fn dispositions(&self) -> Vec<Disposition> {
        self.dispositions.lock().unwrap().clone()
    }
}

struct FakeTransport(Arc<FakeBroker>);

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.0.dial_failures) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(Arc::new(FakeConnection {
            broker: self.0.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct FakeConnection {
    broker: Arc<FakeBroker>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if take_failure(&self.broker.channel_failures) {
            return Err(AmqpError::ChannelError("channel limit reached".to_owned()));
        }

        let (closed, _) = watch::channel(None);
        let channel = Arc::new(FakeChannel {
            broker: self.broker.clone(),
            ops: Mutex::new(vec![]),
            published: Mutex::new(vec![]),
            consumers: Mutex::new(vec![]),
            closed,
            user_closed: AtomicBool::new(false),
            connection_closed: self.closed.clone(),
        });
        self.broker.channels.lock().unwrap().push(channel.clone());

        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeConsumer {
    queue: String,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

pub(crate) struct FakeChannel {
    broker: Arc<FakeBroker>,
    ops: Mutex<Vec<String>>,
    published: Mutex<Vec<Published>>,
    consumers: Mutex<Vec<FakeConsumer>>,
    closed: watch::Sender<Option<AmqpError>>,
    user_closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl FakeChannel {
    /// Simulates the broker or the network taking the channel away.
    pub(crate) fn kill(&self, reason: AmqpError) {
        self.consumers.lock().unwrap().clear();
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Pushes a message to the first consumer of this channel.
    pub(crate) fn deliver(&self, body: &[u8]) -> u64 {
        let consumers = self.consumers.lock().unwrap();
        let consumer = consumers.first().expect("no consumer on this channel");

        let tag = self.broker.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let acker = Arc::new(FakeAcker(self.broker.clone()));
        let delivery = Delivery::new(tag, "", &consumer.queue, body.to_vec(), acker);
        let delivery = if consumer.auto_ack {
            delivery.auto_acked()
        } else {
            delivery
        };

        consumer
            .sender
            .send(delivery)
            .expect("delivery stream dropped");
        tag
    }

    pub(crate) fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.user_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_closed(&self) -> bool {
        self.connection_closed.load(Ordering::SeqCst)
    }

    fn record(&self, op: String) -> Result<(), AmqpError> {
        if self.is_closed() || self.closed.borrow().is_some() {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        self.ops.lock().unwrap().push(op.clone());
        self.broker.ops.lock().unwrap().push(op);
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn queue_declare(&self, name: &str, _def: &QueueDefinition) -> Result<(), AmqpError> {
        if take_failure(&self.broker.queue_declare_failures) {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }
        self.record(format!("queue_declare {}", name))
            .map_err(|_| AmqpError::DeclareQueueError(name.to_owned()))
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.record(format!("exchange_declare {}", def.name))
            .map_err(|_| AmqpError::DeclareExchangeError(def.name.clone()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _no_wait: bool,
        _args: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.record(format!("queue_bind {} {} {}", queue, exchange, routing_key))
            .map_err(|_| {
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.record(format!("basic_qos {} {}", prefetch_count, global))
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        self.record(format!("basic_consume {} {}", queue, def.name))
            .map_err(|_| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.consumers.lock().unwrap().push(FakeConsumer {
            queue: queue.to_owned(),
            auto_ack: def.auto_ack,
            sender,
        });

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        _immediate: bool,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.record(format!("basic_publish {} {}", exchange, routing_key))
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;
        self.published.lock().unwrap().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
            payload: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.user_closed.store(true, Ordering::SeqCst);
        self.consumers.lock().unwrap().clear();
        if self.closed.borrow().is_some() {
            return Err(AmqpError::CloseError("channel already closed".to_owned()));
        }
        Ok(())
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

struct FakeAcker(Arc<FakeBroker>);

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self, tag: u64, multiple: bool) -> Result<(), AmqpError> {
        if self.0.fail_acks.load(Ordering::SeqCst) {
            return Err(AmqpError::AckMessageError("channel closed".to_owned()));
        }
        self.0
            .dispositions
            .lock()
            .unwrap()
            .push(Disposition::Ack { tag, multiple });
        Ok(())
    }

    async fn nack(&self, tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.0.dispositions.lock().unwrap().push(Disposition::Nack {
            tag,
            multiple,
            requeue,
        });
        Ok(())
    }
}

/// Polls `condition` on the (usually paused) tokio clock until it holds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
