// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatch
//!
//! This module runs the workers of one subscription generation. All workers of
//! a generation drain the same delivery stream, hand every delivery to the
//! user handler and settle it according to the handler's verdict:
//! acknowledged on `true`, rejected and requeued on `false`, left alone when
//! the broker auto-acknowledges.

use crate::{delivery::Delivery, logger::Logger, otel, transport::DeliveryStream};
use async_trait::async_trait;
use futures_util::{stream::Fuse, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

/// Processes deliveries for a consumer.
///
/// Returning `true` acknowledges the delivery, `false` rejects it and asks the
/// broker to requeue it. The result is ignored for auto-ack consumers.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, delivery: &Delivery) -> bool;
}

#[async_trait]
impl<F> ConsumerHandler for F
where
    F: Fn(&Delivery) -> bool + Send + Sync,
{
    async fn exec(&self, delivery: &Delivery) -> bool {
        (self)(delivery)
    }
}

/// Everything a worker needs, shared by all workers of a generation.
struct WorkerContext {
    queue: String,
    auto_ack: bool,
    handler: Arc<dyn ConsumerHandler>,
    logger: Arc<dyn Logger>,
    deliveries: Mutex<Fuse<DeliveryStream>>,
}

/// The worker pool started by one successful declare-and-consume cycle.
///
/// Retiring (or dropping) a generation stops its workers from taking new
/// deliveries; a handler already running is left to finish and settle.
pub(crate) struct Generation {
    retire: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Generation {
    pub(crate) fn spawn(
        queue: &str,
        deliveries: DeliveryStream,
        concurrency: usize,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
        logger: Arc<dyn Logger>,
    ) -> Generation {
        let (retire, _) = watch::channel(false);
        let ctx = Arc::new(WorkerContext {
            queue: queue.to_owned(),
            auto_ack,
            handler,
            logger,
            deliveries: Mutex::new(deliveries.fuse()),
        });

        let workers = (0..concurrency)
            .map(|id| tokio::spawn(work(id, ctx.clone(), retire.subscribe())))
            .collect();

        Generation { retire, workers }
    }

    pub(crate) fn retire(&self) {
        self.retire.send_replace(true);
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn running_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }
}

async fn work(id: usize, ctx: Arc<WorkerContext>, mut retired: watch::Receiver<bool>) {
    let tracer = global::tracer("amqp consumer");

    loop {
        let next = tokio::select! {
            biased;
            _ = retired.changed() => None,
            delivery = next_delivery(&ctx) => delivery,
        };

        let Some(delivery) = next else {
            break;
        };
        process(&ctx, &tracer, &delivery).await;
    }

    ctx.logger
        .debug(format_args!("rabbit consumer worker {} closed", id));
}

async fn next_delivery(ctx: &WorkerContext) -> Option<Delivery> {
    ctx.deliveries.lock().await.next().await
}

async fn process(ctx: &WorkerContext, tracer: &BoxedTracer, delivery: &Delivery) {
    let mut span = otel::new_span(&delivery.properties, tracer, &ctx.queue);

    if ctx.auto_ack {
        ctx.handler.exec(delivery).await;
        span.set_status(Status::Ok);
        return;
    }

    let settled = if ctx.handler.exec(delivery).await {
        delivery.ack(false).await.map_err(|err| {
            ctx.logger.error(format_args!("can't ack message: {}", err));
            err
        })
    } else {
        delivery.nack(false, true).await.map_err(|err| {
            ctx.logger.error(format_args!("can't nack message: {}", err));
            err
        })
    };

    match settled {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to settle message"),
            });
        }
    }
}
