// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exponential Backoff
//!
//! Both recovery loops of the crate (transport reconnect in the channel manager
//! and subscription restart in the consumer) wait `base × 2^(k−1)` before their
//! k-th attempt and never give up.

use crate::{errors::AmqpError, logger::Logger};
use std::{future::Future, time::Duration};

/// Default base interval of both recovery loops.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Doubling delay sequence without an upper bound.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    next: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration) -> Self {
        ExponentialBackoff { next: base }
    }

    /// Returns the delay to wait before the upcoming attempt and doubles the
    /// following one. Saturates at `Duration::MAX`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2);
        delay
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Runs `attempt` until it succeeds, sleeping before every attempt.
///
/// Failures are reported through `logger` and retried without limit.
pub(crate) async fn retry_forever<T, F, Fut>(
    base: Duration,
    logger: &dyn Logger,
    what: &str,
    mut attempt: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let mut backoff = ExponentialBackoff::new(base);
    loop {
        let delay = backoff.next_delay();
        logger.info(format_args!("waiting {:?} to attempt to {}", delay, what));
        tokio::time::sleep(delay).await;

        match attempt().await {
            Ok(value) => return value,
            Err(err) => logger.error(format_args!("couldn't {}. err: {}", what, err)),
        }
    }
}
