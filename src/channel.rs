// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module owns the single (connection, channel) pair a consumer or a
//! publisher works with. Users borrow the current channel under a shared lock;
//! a background task waits for the channel to be lost, reconnects with an
//! exponential backoff while holding the exclusive lock, swaps in the new pair
//! and tells every subscriber that a reconnect happened.

use crate::{
    backoff::retry_forever,
    errors::AmqpError,
    logger::Logger,
    options::ClientOptions,
    transport::{BrokerChannel, BrokerConnection, Transport},
};
use futures_util::FutureExt;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, RwLock, RwLockReadGuard},
    task::JoinHandle,
};

/// Receives one event per completed reconnect, carrying the error that caused it.
pub type LossNotifications = mpsc::UnboundedReceiver<AmqpError>;

struct ChannelPair {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Keeps one usable channel to the broker across connection losses.
///
/// The recovery task holds its own reference to the manager, so dropping every
/// handle does not stop it: call [`ChannelManager::close`] to release the
/// connection.
pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    logger: Arc<dyn Logger>,
    reconnect_interval: Duration,
    current: RwLock<ChannelPair>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AmqpError>>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl ChannelManager {
    /// Dials the broker, opens a channel and starts the recovery task.
    ///
    /// A failure to connect here is returned as is; retries only happen for
    /// connections lost after a successful open.
    pub async fn open(
        transport: Arc<dyn Transport>,
        options: &ClientOptions,
    ) -> Result<Arc<ChannelManager>, AmqpError> {
        let pair = connect(transport.as_ref()).await?;
        let channel = pair.channel.clone();

        let manager = Arc::new(ChannelManager {
            transport,
            logger: options.logger.clone(),
            reconnect_interval: options.reconnect_interval,
            current: RwLock::new(pair),
            subscribers: Mutex::new(vec![]),
            recovery: Mutex::new(None),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let recovery = tokio::spawn(manager.clone().recover(channel));
        *lock(&manager.recovery) = Some(recovery);

        Ok(manager)
    }

    /// Borrows the current channel.
    ///
    /// Any number of callers may hold the channel at once. While a reconnect is
    /// in progress this waits until the new channel is installed.
    pub async fn channel(&self) -> Result<RwLockReadGuard<'_, dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ManagerClosed);
        }

        let guard = self.current.read().await;
        if self.is_closed() {
            return Err(AmqpError::ManagerClosed);
        }

        Ok(RwLockReadGuard::map(guard, |pair| pair.channel.as_ref()))
    }

    /// Registers a new listener for reconnect events.
    ///
    /// Every subscriber receives every event. The stream ends when the manager
    /// is closed.
    pub fn subscribe(&self) -> LossNotifications {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            lock(&self.subscribers).push(tx);
        }
        rx
    }

    /// Number of reconnects completed so far.
    ///
    /// The value only changes while the exclusive lock is held, so it
    /// identifies the channel a guard returned by [`ChannelManager::channel`]
    /// points at for as long as the guard lives.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the channel and the connection and stops the recovery task.
    ///
    /// The manager cannot be used afterwards. Closing twice is a no-op. Close
    /// errors are only returned for a pair that was still alive; a pair already
    /// lost to the broker or the network is released silently.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(recovery) = lock(&self.recovery).take() {
            recovery.abort();
        }
        lock(&self.subscribers).clear();

        let pair = self.current.write().await;
        self.logger.info(format_args!("closing amqp channel and connection"));

        let lost = pair.channel.closed().now_or_never();
        let channel = pair.channel.close().await;
        let connection = pair.connection.close().await;

        match (lost, channel.and(connection)) {
            (Some(reason), Err(err)) => {
                self.logger.debug(format_args!(
                    "released lost amqp connection ({}): {}",
                    reason, err
                ));
                Ok(())
            }
            (_, closed) => closed,
        }
    }

    async fn recover(self: Arc<Self>, mut channel: Arc<dyn BrokerChannel>) {
        loop {
            let reason = channel.closed().await;
            if self.is_closed() {
                return;
            }
            self.logger.warn(format_args!(
                "attempting to reconnect to amqp server after close with error: {}",
                reason
            ));

            let mut current = self.current.write().await;
            let pair = retry_forever(
                self.reconnect_interval,
                self.logger.as_ref(),
                "reconnect to amqp server",
                || connect(self.transport.as_ref()),
            )
            .await;

            channel = pair.channel.clone();
            let previous = std::mem::replace(&mut *current, pair);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            drop(current);

            if let Err(err) = previous.connection.close().await {
                self.logger
                    .debug(format_args!("previous connection already gone: {}", err));
            }
            self.logger.info(format_args!("successfully reconnected to amqp server"));

            self.notify(reason);
        }
    }

    fn notify(&self, reason: AmqpError) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(reason.clone()).is_ok());
    }
}

async fn connect(transport: &dyn Transport) -> Result<ChannelPair, AmqpError> {
    let connection = transport.dial().await?;
    let channel = connection.open_channel().await?;
    Ok(ChannelPair {
        connection,
        channel,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
