// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module keeps broker subscriptions alive. Starting a subscription
//! declares the queue, optionally declares an exchange and binds the queue to
//! it, sets the prefetch and starts the worker pool. Every time the channel
//! manager reports a reconnect, the whole cycle runs again under an
//! exponential backoff until it succeeds.

use crate::{
    backoff::retry_forever,
    channel::{ChannelManager, LossNotifications},
    config::RabbitMQConfigs,
    connection::LapinTransport,
    dispatcher::{ConsumerHandler, Generation},
    errors::AmqpError,
    logger::Logger,
    options::{ClientOptions, ConsumeOptions},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

/// One `start_consuming` call: what to declare and who handles the deliveries.
struct Subscription {
    manager: Arc<ChannelManager>,
    logger: Arc<dyn Logger>,
    handler: Arc<dyn ConsumerHandler>,
    queue: String,
    routing_keys: Vec<String>,
    options: ConsumeOptions,
    workers: Mutex<WorkerSlot>,
}

/// The running generation, tagged with the channel manager epoch it consumes on.
#[derive(Default)]
struct WorkerSlot {
    current: Option<(u64, Generation)>,
    stopped: bool,
}

struct ActiveSubscription {
    subscription: Arc<Subscription>,
    supervisor: JoinHandle<()>,
}

/// Consumes from queues on a channel kept alive by a [`ChannelManager`].
///
/// Every subscription is restarted by a background task that owns a handle to
/// it, so dropping the consumer leaves the handlers running and the connection
/// open. Call [`Consumer::stop_consuming`] to shut it down.
pub struct Consumer {
    manager: Arc<ChannelManager>,
    logger: Arc<dyn Logger>,
    retry_interval: Duration,
    subscriptions: Mutex<Vec<ActiveSubscription>>,
    stopped: AtomicBool,
}

impl Consumer {
    /// Connects to the broker described by `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials and optional TLS section
    /// * `options` - Logger and base interval of the recovery loops
    ///
    /// # Returns
    /// A consumer, or the error of the first connection or channel opening,
    /// which is not retried
    pub async fn new(cfg: &RabbitMQConfigs, options: ClientOptions) -> Result<Consumer, AmqpError> {
        let transport = Arc::new(LapinTransport::new(cfg, options.logger.clone()));
        let manager = ChannelManager::open(transport, &options).await?;
        Ok(Consumer::with_manager(manager, &options))
    }

    /// Consumes through an already opened channel manager.
    pub fn with_manager(manager: Arc<ChannelManager>, options: &ClientOptions) -> Consumer {
        Consumer {
            manager,
            logger: options.logger.clone(),
            retry_interval: options.reconnect_interval,
            subscriptions: Mutex::new(vec![]),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts `options.concurrency` workers consuming from `queue`.
    ///
    /// Only a failure of this first attempt is returned. Later restarts after
    /// reconnects are retried forever and reported through the logger.
    ///
    /// # Parameters
    /// * `handler` - Decides the fate of every delivery, `true` acknowledges it and
    ///   `false` rejects and requeues it
    /// * `queue` - The queue to declare and consume from
    /// * `routing_keys` - Keys the queue is bound with when an exchange binding is configured
    /// * `options` - Queue, binding, QoS and consumer settings
    ///
    /// # Returns
    /// Ok(()) once the workers run, [`AmqpError::ConsumerStopped`] after
    /// [`Consumer::stop_consuming`], or the error of the first attempt
    pub async fn start_consuming<H>(
        &self,
        handler: H,
        queue: &str,
        routing_keys: &[&str],
        options: ConsumeOptions,
    ) -> Result<(), AmqpError>
    where
        H: ConsumerHandler + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AmqpError::ConsumerStopped);
        }

        let subscription = Arc::new(Subscription {
            manager: self.manager.clone(),
            logger: self.logger.clone(),
            handler: Arc::new(handler),
            queue: queue.to_owned(),
            routing_keys: routing_keys.iter().map(|key| key.to_string()).collect(),
            options: options.validated(),
            workers: Mutex::new(WorkerSlot::default()),
        });

        let notifications = self.manager.subscribe();
        subscription.start().await?;

        let supervisor = tokio::spawn(
            subscription
                .clone()
                .supervise(notifications, self.retry_interval),
        );
        lock(&self.subscriptions).push(ActiveSubscription {
            subscription,
            supervisor,
        });

        Ok(())
    }

    /// Stops every subscription and closes the shared channel and connection.
    ///
    /// The consumer must be discarded afterwards.
    pub async fn stop_consuming(&self) -> Result<(), AmqpError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for active in lock(&self.subscriptions).drain(..) {
            active.supervisor.abort();
            active.subscription.retire();
        }

        self.manager.close().await
    }

    #[cfg(test)]
    fn workers(&self) -> Vec<(usize, usize)> {
        lock(&self.subscriptions)
            .iter()
            .map(|active| {
                lock(&active.subscription.workers)
                    .current
                    .as_ref()
                    .map(|(_, generation)| (generation.workers(), generation.running_workers()))
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl Subscription {
    /// Declares, binds, sets the QoS and consumes, then replaces the worker pool.
    ///
    /// Does nothing when the running generation already consumes on the
    /// current channel, so that several loss notifications queued up during a
    /// backoff never register a second broker consumer on the same channel.
    async fn start(&self) -> Result<(), AmqpError> {
        if lock(&self.workers).stopped {
            return Err(AmqpError::ConsumerStopped);
        }

        let channel = self.manager.channel().await?;
        let epoch = self.manager.epoch();
        if self.consuming_on(epoch) {
            self.logger.debug(format_args!(
                "{} already consumed on the current channel",
                self.queue
            ));
            return Ok(());
        }

        channel.queue_declare(&self.queue, &self.options.queue).await?;

        if let Some(exchange) = &self.options.binding_exchange {
            if exchange.name.is_empty() {
                return Err(AmqpError::MissingExchangeName);
            }

            channel.exchange_declare(exchange).await?;

            let args = self.options.binding_arguments();
            for routing_key in &self.routing_keys {
                channel
                    .queue_bind(
                        &self.queue,
                        &exchange.name,
                        routing_key,
                        self.options.binding_no_wait,
                        &args,
                    )
                    .await?;
            }
        }

        channel
            .basic_qos(self.options.qos_prefetch, self.options.qos_global)
            .await?;

        let deliveries = channel
            .basic_consume(&self.queue, &self.options.consumer)
            .await?;

        let generation = Generation::spawn(
            &self.queue,
            deliveries,
            self.options.concurrency,
            self.options.consumer.auto_ack,
            self.handler.clone(),
            self.logger.clone(),
        );
        self.replace(epoch, generation)?;

        self.logger.info(format_args!(
            "processing messages from {} on {} workers",
            self.queue, self.options.concurrency
        ));
        Ok(())
    }

    /// Restarts the subscription after every reconnect of the channel manager.
    async fn supervise(self: Arc<Self>, mut notifications: LossNotifications, retry: Duration) {
        while let Some(reason) = notifications.recv().await {
            self.logger.warn(format_args!(
                "consume cancel/close handler triggered. err: {}",
                reason
            ));

            retry_forever(retry, self.logger.as_ref(), "start consumer workers", || {
                self.start()
            })
            .await;
        }

        self.logger
            .debug(format_args!("stopped watching for reconnects of {}", self.queue));
    }

    fn consuming_on(&self, epoch: u64) -> bool {
        matches!(&lock(&self.workers).current, Some((running, _)) if *running == epoch)
    }

    /// Installs `generation` in place of the running one, unless the
    /// subscription was stopped meanwhile.
    fn replace(&self, epoch: u64, generation: Generation) -> Result<(), AmqpError> {
        let mut slot = lock(&self.workers);
        if slot.stopped {
            generation.retire();
            return Err(AmqpError::ConsumerStopped);
        }

        if let Some((_, previous)) = slot.current.replace((epoch, generation)) {
            previous.retire();
        }
        Ok(())
    }

    fn retire(&self) {
        let mut slot = lock(&self.workers);
        slot.stopped = true;
        if let Some((_, generation)) = slot.current.take() {
            generation.retire();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
